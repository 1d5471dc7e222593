use crate::error::{InferError, InferResult, RegistrationError};
use crate::tensor::{BatchAxis, DataType, Shape, TensorDesc};
use crate::user_op::{
    BatchAxisContext, InferContext, OpRegistryBuilder, OpTypeRegistration, SbpContext,
    SbpSignature,
};

use super::INPUT;

/// Placeholder fed from outside the job (data loader, feed).
pub(super) fn register(builder: &mut OpRegistryBuilder) -> Result<(), RegistrationError> {
    builder.register(
        OpTypeRegistration::new(INPUT)
            .output("out")
            .attr("data_type", DataType::Float32)
            .attr("is_dynamic", false)
            .attr("batch_axis", 0i64)
            .tensor_desc_infer_fn(infer_tensor_desc)
            .batch_axis_infer_fn(infer_batch_axis)
            .sbp_fn(get_sbp),
    )?;
    Ok(())
}

fn batch_axis_attr(raw: i64, rank: usize) -> InferResult<BatchAxis> {
    if raw < 0 {
        return Ok(BatchAxis::NONE);
    }
    let axis = raw as usize;
    if axis >= rank {
        return Err(InferError::batch_axis(format!(
            "batch axis {axis} is out of range for rank {rank}"
        )));
    }
    Ok(BatchAxis::at(axis))
}

fn infer_tensor_desc(ctx: &mut InferContext<'_>) -> InferResult<()> {
    let shape: Shape = ctx.attr("shape")?;
    let data_type: DataType = ctx.attr("data_type")?;
    let is_dynamic: bool = ctx.attr("is_dynamic")?;
    ctx.set_output_desc("out", 0, TensorDesc::new(shape, data_type).dynamic(is_dynamic))
}

fn infer_batch_axis(ctx: &mut BatchAxisContext<'_>) -> InferResult<()> {
    let rank = ctx.output_desc("out", 0)?.shape.rank();
    let axis = batch_axis_attr(ctx.attr("batch_axis")?, rank)?;
    ctx.set_output_batch_axis("out", 0, axis)
}

fn get_sbp(ctx: &SbpContext<'_>) -> InferResult<Vec<SbpSignature>> {
    let rank = ctx.output_desc("out", 0)?.shape.rank();
    let mut signatures = Vec::with_capacity(2);
    if let Some(axis) = batch_axis_attr(ctx.attr("batch_axis")?, rank)?.axis() {
        signatures.push(ctx.new_builder().split("out", 0, axis).build()?);
    }
    signatures.push(ctx.new_builder().build()?);
    Ok(signatures)
}
