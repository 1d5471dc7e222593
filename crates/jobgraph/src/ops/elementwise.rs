//! Shape-preserving ops: `identity`, `add`, `add_n`, `ones_like`.

use crate::error::{GradientBindingError, InferError, InferResult, RegistrationError};
use crate::tensor::TensorDesc;
use crate::user_op::{
    BackwardContext, BackwardOpSink, InferContext, InputArgModifiers, OpRegistryBuilder,
    OpTypeRegistration, SbpContext, SbpSignature,
};

use super::{bind_identity_grad, same_rank_split_signatures, ADD, ADD_N, IDENTITY, ONES_LIKE};

pub(super) fn register(builder: &mut OpRegistryBuilder) -> Result<(), RegistrationError> {
    builder
        .register(
            OpTypeRegistration::new(IDENTITY)
                .input("in")
                .output("out")
                .tensor_desc_infer_fn(infer_unary)
                .sbp_fn(get_unary_sbp),
        )?
        .register(
            OpTypeRegistration::new(ADD)
                .input("x")
                .input("y")
                .output("out")
                .tensor_desc_infer_fn(infer_add)
                .sbp_fn(get_sum_sbp),
        )?
        .register(
            OpTypeRegistration::new(ADD_N)
                .variadic_input("in", 2)
                .output("out")
                .tensor_desc_infer_fn(infer_add_n)
                .sbp_fn(get_sum_sbp),
        )?
        .register(
            OpTypeRegistration::new(ONES_LIKE)
                .input("like")
                .output("out")
                .tensor_desc_infer_fn(infer_ones_like)
                .sbp_fn(get_ones_like_sbp)
                .input_arg_modify_fn(like_is_not_differentiable),
        )?;

    builder
        .register_grad(IDENTITY, gen_identity_grad)?
        .register_grad(ADD, gen_add_grad)?
        .register_grad(ADD_N, gen_add_n_grad)?;
    Ok(())
}

fn infer_unary(ctx: &mut InferContext<'_>) -> InferResult<()> {
    let desc = ctx.input_desc("in", 0)?.clone();
    ctx.set_output_desc("out", 0, desc)
}

fn check_same_desc(
    lhs_name: &str,
    lhs: &TensorDesc,
    rhs_name: &str,
    rhs: &TensorDesc,
) -> InferResult<()> {
    if lhs.shape != rhs.shape {
        return Err(InferError::shape(format!(
            "dimension mismatch: `{lhs_name}` has shape {} but `{rhs_name}` has shape {}",
            lhs.shape, rhs.shape
        )));
    }
    if lhs.data_type != rhs.data_type {
        return Err(InferError::shape(format!(
            "data type mismatch: `{lhs_name}` is {} but `{rhs_name}` is {}",
            lhs.data_type, rhs.data_type
        )));
    }
    Ok(())
}

fn infer_add(ctx: &mut InferContext<'_>) -> InferResult<()> {
    let x = ctx.input_desc("x", 0)?;
    let y = ctx.input_desc("y", 0)?;
    check_same_desc("x_0", x, "y_0", y)?;
    let out = x.clone().dynamic(x.is_dynamic || y.is_dynamic);
    ctx.set_output_desc("out", 0, out)
}

fn infer_add_n(ctx: &mut InferContext<'_>) -> InferResult<()> {
    let first = ctx.input_desc("in", 0)?.clone();
    let mut is_dynamic = first.is_dynamic;
    for index in 1..ctx.input_count("in") {
        let other = ctx.input_desc("in", index)?;
        check_same_desc("in_0", &first, &format!("in_{index}"), other)?;
        is_dynamic |= other.is_dynamic;
    }
    ctx.set_output_desc("out", 0, first.dynamic(is_dynamic))
}

fn infer_ones_like(ctx: &mut InferContext<'_>) -> InferResult<()> {
    let like = ctx.input_desc("like", 0)?.clone();
    ctx.set_output_desc("out", 0, like)
}

fn get_unary_sbp(ctx: &SbpContext<'_>) -> InferResult<Vec<SbpSignature>> {
    let rank = ctx.input_desc("in", 0)?.shape.rank();
    same_rank_split_signatures(ctx, rank, true)
}

fn get_sum_sbp(ctx: &SbpContext<'_>) -> InferResult<Vec<SbpSignature>> {
    let rank = ctx.output_desc("out", 0)?.shape.rank();
    same_rank_split_signatures(ctx, rank, true)
}

fn get_ones_like_sbp(ctx: &SbpContext<'_>) -> InferResult<Vec<SbpSignature>> {
    let rank = ctx.input_desc("like", 0)?.shape.rank();
    same_rank_split_signatures(ctx, rank, false)
}

fn like_is_not_differentiable(modifiers: &mut InputArgModifiers<'_>) -> InferResult<()> {
    modifiers.get_mut("like", 0)?.set_requires_grad(false);
    Ok(())
}

fn gen_identity_grad(
    ctx: &BackwardContext<'_>,
    sink: &mut BackwardOpSink,
) -> Result<(), GradientBindingError> {
    if ctx.need_gen_grad_for_input("in", 0) {
        let dy = ctx.output_grad("out", 0)?.clone();
        bind_identity_grad(ctx, sink, &dy, "in", 0);
    }
    Ok(())
}

fn gen_add_grad(
    ctx: &BackwardContext<'_>,
    sink: &mut BackwardOpSink,
) -> Result<(), GradientBindingError> {
    let dy = ctx.output_grad("out", 0)?.clone();
    for arg in ["x", "y"] {
        if ctx.need_gen_grad_for_input(arg, 0) {
            bind_identity_grad(ctx, sink, &dy, arg, 0);
        }
    }
    Ok(())
}

fn gen_add_n_grad(
    ctx: &BackwardContext<'_>,
    sink: &mut BackwardOpSink,
) -> Result<(), GradientBindingError> {
    let dy = ctx.output_grad("out", 0)?.clone();
    for index in 0..ctx.input_count("in") {
        if ctx.need_gen_grad_for_input("in", index) {
            bind_identity_grad(ctx, sink, &dy, "in", index);
        }
    }
    Ok(())
}
