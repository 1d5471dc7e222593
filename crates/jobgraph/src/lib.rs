pub mod autograd;
pub mod compiler;
pub mod error;
pub mod graph;
pub mod job;
pub mod ops;
pub mod pass;
pub mod tensor;
pub mod user_op;
mod env;

pub use compiler::{CompileOptions, CompileReport, JobCompiler};
pub use error::{
    CompileError, CompileResult, GradientBindingError, GraphBuildError, InferError,
    RegistrationError, ScopeResolutionError,
};
pub use graph::OpGraph;
pub use job::{Job, JobBuilder, JobConfig, LogicalBlobName, OperatorConf, TrainConf};
pub use tensor::{BatchAxis, DataType, Shape, TensorDesc};
pub use user_op::{OpRegistry, OpRegistryBuilder, UserOpConfBuilder};
