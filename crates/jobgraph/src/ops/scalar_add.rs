use crate::error::{GradientBindingError, InferError, InferResult, RegistrationError};
use crate::user_op::{
    BackwardContext, BackwardOpSink, InferContext, OpRegistryBuilder, OpTypeRegistration,
    SbpContext, SbpSignature,
};

use super::{bind_identity_grad, same_rank_split_signatures, SCALAR_ADD};

/// `out = in + operand`, with exactly one of the int / float operands enabled.
pub(super) fn register(builder: &mut OpRegistryBuilder) -> Result<(), RegistrationError> {
    builder
        .register(
            OpTypeRegistration::new(SCALAR_ADD)
                .input("in")
                .output("out")
                .attr("has_int_operand", false)
                .attr("int_operand", 0i64)
                .attr("has_float_operand", false)
                .attr("float_operand", 0.0f64)
                .tensor_desc_infer_fn(infer_tensor_desc)
                .sbp_fn(get_sbp),
        )?
        .register_grad(SCALAR_ADD, gen_grad)?;
    Ok(())
}

fn infer_tensor_desc(ctx: &mut InferContext<'_>) -> InferResult<()> {
    let has_int: bool = ctx.attr("has_int_operand")?;
    let has_float: bool = ctx.attr("has_float_operand")?;
    if has_int == has_float {
        return Err(InferError::shape(
            "exactly one of `has_int_operand` and `has_float_operand` must be set",
        ));
    }
    let desc = ctx.input_desc("in", 0)?.clone();
    if has_float && !desc.data_type.is_float() {
        return Err(InferError::shape(format!(
            "float operand cannot be added to a {} tensor",
            desc.data_type
        )));
    }
    ctx.set_output_desc("out", 0, desc)
}

fn get_sbp(ctx: &SbpContext<'_>) -> InferResult<Vec<SbpSignature>> {
    let rank = ctx.input_desc("in", 0)?.shape.rank();
    same_rank_split_signatures(ctx, rank, false)
}

fn gen_grad(
    ctx: &BackwardContext<'_>,
    sink: &mut BackwardOpSink,
) -> Result<(), GradientBindingError> {
    if ctx.need_gen_grad_for_input("in", 0) {
        let dy = ctx.output_grad("out", 0)?.clone();
        bind_identity_grad(ctx, sink, &dy, "in", 0);
    }
    Ok(())
}
