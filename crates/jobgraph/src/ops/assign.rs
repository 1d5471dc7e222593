use crate::error::{InferError, InferResult, RegistrationError};
use crate::user_op::{
    InferContext, InputArgModifiers, OpRegistryBuilder, OpTypeRegistration, SbpContext,
    SbpSignature,
};

use super::{same_rank_split_signatures, ASSIGN};

/// Writes `value` into the variable slot referenced by `ref`. Has no outputs.
pub(super) fn register(builder: &mut OpRegistryBuilder) -> Result<(), RegistrationError> {
    builder.register(
        OpTypeRegistration::new(ASSIGN)
            .input("ref")
            .input("value")
            .tensor_desc_infer_fn(infer_tensor_desc)
            .sbp_fn(get_sbp)
            .input_arg_modify_fn(no_grad_through_assign),
    )?;
    Ok(())
}

fn infer_tensor_desc(ctx: &mut InferContext<'_>) -> InferResult<()> {
    let target = ctx.input_desc("ref", 0)?;
    let value = ctx.input_desc("value", 0)?;
    if target.shape != value.shape {
        return Err(InferError::shape(format!(
            "dimension mismatch: `ref` has shape {} but `value` has shape {}",
            target.shape, value.shape
        )));
    }
    if target.data_type != value.data_type {
        return Err(InferError::shape(format!(
            "data type mismatch: `ref` is {} but `value` is {}",
            target.data_type, value.data_type
        )));
    }
    Ok(())
}

fn get_sbp(ctx: &SbpContext<'_>) -> InferResult<Vec<SbpSignature>> {
    let rank = ctx.input_desc("ref", 0)?.shape.rank();
    same_rank_split_signatures(ctx, rank, false)
}

fn no_grad_through_assign(modifiers: &mut InputArgModifiers<'_>) -> InferResult<()> {
    modifiers.get_mut("ref", 0)?.set_requires_grad(false);
    modifiers.get_mut("value", 0)?.set_requires_grad(false);
    Ok(())
}
