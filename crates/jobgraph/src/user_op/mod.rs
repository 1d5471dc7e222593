//! Per-op-type metadata: declarations, inference callbacks, SBP enumeration and gradients.

mod conf_builder;
mod context;
mod grad;
mod registry;
mod sbp;

pub use conf_builder::UserOpConfBuilder;
pub use context::{
    attr_or_default, BatchAxisContext, InferContext, InputArgModifier, InputArgModifiers,
    SbpContext,
};
pub use grad::{BackwardContext, BackwardOpSink};
pub use registry::{
    default_batch_axis_infer_fn, default_sbp_fn, ArgDef, ArgKind, BatchAxisInferFn,
    GenBackwardOpFn, GetSbpFn, InputArgModifyFn, OpRegistry, OpRegistryBuilder,
    OpTypeDescriptor, OpTypeRegistration, TensorDescInferFn,
};
pub use sbp::{SbpParallel, SbpSignature, SbpSignatureBuilder};
