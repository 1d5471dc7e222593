//! Softmax cross entropy against integer class labels.
//!
//! `prob` only exists to feed the gradient op; its own gradient is never requested.

use crate::error::{GradientBindingError, InferError, InferResult, RegistrationError};
use crate::job::LogicalBlobName;
use crate::tensor::TensorDesc;
use crate::user_op::{
    BackwardContext, BackwardOpSink, BatchAxisContext, InferContext, InputArgModifiers,
    OpRegistryBuilder, OpTypeRegistration, SbpContext, SbpSignature, UserOpConfBuilder,
};

use super::{SPARSE_SOFTMAX_CROSS_ENTROPY, SPARSE_SOFTMAX_CROSS_ENTROPY_GRAD};

pub(super) fn register(builder: &mut OpRegistryBuilder) -> Result<(), RegistrationError> {
    builder
        .register(
            OpTypeRegistration::new(SPARSE_SOFTMAX_CROSS_ENTROPY)
                .input("prediction")
                .input("label")
                .output("prob")
                .output("out")
                .tensor_desc_infer_fn(infer_tensor_desc)
                .batch_axis_infer_fn(infer_batch_axis)
                .sbp_fn(get_sbp)
                .input_arg_modify_fn(label_is_not_differentiable),
        )?
        .register(
            OpTypeRegistration::new(SPARSE_SOFTMAX_CROSS_ENTROPY_GRAD)
                .input("dy")
                .input("label")
                .input("prob")
                .output("prediction_diff")
                .tensor_desc_infer_fn(infer_grad_tensor_desc)
                .batch_axis_infer_fn(infer_grad_batch_axis)
                .sbp_fn(get_sbp),
        )?
        .register_grad(SPARSE_SOFTMAX_CROSS_ENTROPY, gen_grad)?;
    Ok(())
}

/// Shared by the forward op (`prediction`) and its gradient op (`prob`).
fn check_logits_and_label(
    logits_name: &str,
    logits: &TensorDesc,
    label: &TensorDesc,
) -> InferResult<()> {
    if !label.data_type.is_index() {
        return Err(InferError::shape(format!(
            "`label` must have an index data type, found {}",
            label.data_type
        )));
    }
    if logits.is_dynamic != label.is_dynamic {
        return Err(InferError::shape(format!(
            "`{logits_name}` and `label` must agree on being dynamic"
        )));
    }
    let logits_rank = logits.shape.rank();
    if logits_rank < 2 {
        return Err(InferError::shape(format!(
            "`{logits_name}` must have rank >= 2, found shape {}",
            logits.shape
        )));
    }
    let num_out_axes = logits_rank - 1;
    if label.shape.rank() != num_out_axes {
        return Err(InferError::shape(format!(
            "rank mismatch: `label` must have rank {num_out_axes}, found shape {}",
            label.shape
        )));
    }
    for axis in 0..num_out_axes {
        if logits.shape.dims()[axis] != label.shape.dims()[axis] {
            return Err(InferError::shape(format!(
                "dimension mismatch at axis {axis}: `{logits_name}` has shape {} but `label` has shape {}",
                logits.shape, label.shape
            )));
        }
    }
    Ok(())
}

fn infer_tensor_desc(ctx: &mut InferContext<'_>) -> InferResult<()> {
    let prediction = ctx.input_desc("prediction", 0)?.clone();
    let label = ctx.input_desc("label", 0)?;
    check_logits_and_label("prediction", &prediction, label)?;
    let out = prediction.with_shape(label.shape.clone());
    ctx.set_output_desc("prob", 0, prediction)?;
    ctx.set_output_desc("out", 0, out)
}

fn infer_batch_axis(ctx: &mut BatchAxisContext<'_>) -> InferResult<()> {
    let prediction = ctx.input_batch_axis("prediction", 0)?;
    let label = ctx.input_batch_axis("label", 0)?;
    ctx.set_output_batch_axis("prob", 0, prediction)?;
    ctx.set_output_batch_axis("out", 0, label)
}

fn get_sbp(ctx: &SbpContext<'_>) -> InferResult<Vec<SbpSignature>> {
    Ok(vec![ctx.new_builder().split_all(0).build()?])
}

fn label_is_not_differentiable(modifiers: &mut InputArgModifiers<'_>) -> InferResult<()> {
    modifiers.get_mut("label", 0)?.set_requires_grad(false);
    Ok(())
}

fn infer_grad_tensor_desc(ctx: &mut InferContext<'_>) -> InferResult<()> {
    let prob = ctx.input_desc("prob", 0)?.clone();
    let label = ctx.input_desc("label", 0)?;
    let dy = ctx.input_desc("dy", 0)?;
    check_logits_and_label("prob", &prob, label)?;
    if dy.shape != label.shape {
        return Err(InferError::shape(format!(
            "dimension mismatch: `dy` has shape {} but `label` has shape {}",
            dy.shape, label.shape
        )));
    }
    if dy.data_type != prob.data_type {
        return Err(InferError::shape(format!(
            "data type mismatch: `dy` is {} but `prob` is {}",
            dy.data_type, prob.data_type
        )));
    }
    ctx.set_output_desc("prediction_diff", 0, prob)
}

fn infer_grad_batch_axis(ctx: &mut BatchAxisContext<'_>) -> InferResult<()> {
    let prob = ctx.input_batch_axis("prob", 0)?;
    ctx.set_output_batch_axis("prediction_diff", 0, prob)
}

fn gen_grad(
    ctx: &BackwardContext<'_>,
    sink: &mut BackwardOpSink,
) -> Result<(), GradientBindingError> {
    if !ctx.need_gen_grad_for_input("prediction", 0) {
        return Ok(());
    }
    let name = format!("{}_grad", ctx.op_name());
    let grad_op = UserOpConfBuilder::new(name.clone())
        .op(SPARSE_SOFTMAX_CROSS_ENTROPY_GRAD)
        .input("prob", ctx.output("prob", 0)?.clone())
        .input("label", ctx.input("label", 0)?.clone())
        .input("dy", ctx.output_grad("out", 0)?.clone())
        .output("prediction_diff")
        .scope_symbol_id(ctx.op().scope_symbol_id())
        .build();
    sink.bind_input_grad(
        LogicalBlobName::new(name, "prediction_diff", 0),
        "prediction",
        0,
    );
    sink.add_op(grad_op);
    Ok(())
}
