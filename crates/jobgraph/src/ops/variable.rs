use crate::error::{InferError, InferResult, RegistrationError};
use crate::tensor::{BatchAxis, DataType, Shape, TensorDesc};
use crate::user_op::{
    BatchAxisContext, InferContext, OpRegistryBuilder, OpTypeRegistration, SbpContext,
    SbpSignature,
};

use super::VARIABLE;

pub const INITIALIZER_CONSTANT: &str = "constant";
pub const INITIALIZER_CONSTANT_INT: &str = "constant_int";
pub const INITIALIZER_ZEROS: &str = "zeros";
/// `split_axis` value of a variable that is not split across devices.
pub const NO_SPLIT_AXIS: i64 = -1;

pub(super) fn register(builder: &mut OpRegistryBuilder) -> Result<(), RegistrationError> {
    builder.register(
        OpTypeRegistration::new(VARIABLE)
            .output("out")
            .attr("data_type", DataType::Float32)
            .attr("initializer", INITIALIZER_CONSTANT)
            .attr("initial_value", 0.0f64)
            .attr("initial_int_value", 0i64)
            .attr("split_axis", NO_SPLIT_AXIS)
            .attr("trainable", true)
            .tensor_desc_infer_fn(infer_tensor_desc)
            .batch_axis_infer_fn(infer_batch_axis)
            .sbp_fn(get_sbp),
    )?;
    Ok(())
}

fn infer_tensor_desc(ctx: &mut InferContext<'_>) -> InferResult<()> {
    let shape: Shape = ctx.attr("shape")?;
    let data_type: DataType = ctx.attr("data_type")?;
    let initializer: String = ctx.attr("initializer")?;
    match initializer.as_str() {
        INITIALIZER_CONSTANT | INITIALIZER_ZEROS => {}
        INITIALIZER_CONSTANT_INT => {
            if !data_type.is_integer() {
                return Err(InferError::shape(format!(
                    "integer initializer requires an integer data type, found {data_type}"
                )));
            }
        }
        other => {
            return Err(InferError::shape(format!("unknown initializer `{other}`")));
        }
    }
    let split_axis: i64 = ctx.attr("split_axis")?;
    if split_axis != NO_SPLIT_AXIS && (split_axis < 0 || split_axis as usize >= shape.rank()) {
        return Err(InferError::shape(format!(
            "split axis {split_axis} is out of range for variable of shape {shape}"
        )));
    }
    ctx.set_output_desc("out", 0, TensorDesc::new(shape, data_type))
}

fn infer_batch_axis(ctx: &mut BatchAxisContext<'_>) -> InferResult<()> {
    ctx.set_output_batch_axis("out", 0, BatchAxis::NONE)
}

fn get_sbp(ctx: &SbpContext<'_>) -> InferResult<Vec<SbpSignature>> {
    let split_axis: i64 = ctx.attr("split_axis")?;
    let signature = if split_axis == NO_SPLIT_AXIS {
        ctx.new_builder().broadcast("out", 0).build()?
    } else {
        ctx.new_builder().split("out", 0, split_axis as usize).build()?
    };
    Ok(vec![signature])
}
