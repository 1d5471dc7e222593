use crate::error::{GradientBindingError, InferError, InferResult, RegistrationError};
use crate::job::LogicalBlobName;
use crate::tensor::{BatchAxis, TensorDesc};
use crate::user_op::{
    BackwardContext, BackwardOpSink, BatchAxisContext, InferContext, OpRegistryBuilder,
    OpTypeRegistration, SbpContext, SbpSignature, UserOpConfBuilder,
};

use super::MATMUL;

/// `out = op(a) · op(b)` for rank-2 operands, `op` transposing when the matching attr is set.
pub(super) fn register(builder: &mut OpRegistryBuilder) -> Result<(), RegistrationError> {
    builder
        .register(
            OpTypeRegistration::new(MATMUL)
                .input("a")
                .input("b")
                .output("out")
                .attr("transpose_a", false)
                .attr("transpose_b", false)
                .tensor_desc_infer_fn(infer_tensor_desc)
                .batch_axis_infer_fn(infer_batch_axis)
                .sbp_fn(get_sbp),
        )?
        .register_grad(MATMUL, gen_grad)?;
    Ok(())
}

/// Axes of `a` and `b` holding `m`, `k` and `n` once transposes are applied.
struct MatmulAxes {
    a_m: usize,
    a_k: usize,
    b_k: usize,
    b_n: usize,
}

impl MatmulAxes {
    fn new(transpose_a: bool, transpose_b: bool) -> Self {
        let (a_m, a_k) = if transpose_a { (1, 0) } else { (0, 1) };
        let (b_k, b_n) = if transpose_b { (1, 0) } else { (0, 1) };
        Self { a_m, a_k, b_k, b_n }
    }
}

fn check_rank2(name: &str, desc: &TensorDesc) -> InferResult<()> {
    if desc.shape.rank() != 2 {
        return Err(InferError::shape(format!(
            "`{name}` must have rank 2, found shape {}",
            desc.shape
        )));
    }
    Ok(())
}

fn infer_tensor_desc(ctx: &mut InferContext<'_>) -> InferResult<()> {
    let axes = MatmulAxes::new(ctx.attr("transpose_a")?, ctx.attr("transpose_b")?);
    let a = ctx.input_desc("a", 0)?;
    let b = ctx.input_desc("b", 0)?;
    check_rank2("a", a)?;
    check_rank2("b", b)?;
    if a.data_type != b.data_type {
        return Err(InferError::shape(format!(
            "data type mismatch: `a` is {} but `b` is {}",
            a.data_type, b.data_type
        )));
    }
    let a_dims = a.shape.dims();
    let b_dims = b.shape.dims();
    if a_dims[axes.a_k] != b_dims[axes.b_k] {
        return Err(InferError::shape(format!(
            "dimension mismatch: reduction extent {} of `a` differs from {} of `b`",
            a_dims[axes.a_k], b_dims[axes.b_k]
        )));
    }
    let out = a
        .with_shape(vec![a_dims[axes.a_m], b_dims[axes.b_n]])
        .dynamic(a.is_dynamic || b.is_dynamic);
    ctx.set_output_desc("out", 0, out)
}

fn infer_batch_axis(ctx: &mut BatchAxisContext<'_>) -> InferResult<()> {
    let axes = MatmulAxes::new(ctx.attr("transpose_a")?, ctx.attr("transpose_b")?);
    let a_axis = ctx.input_batch_axis("a", 0)?;
    let b_axis = ctx.input_batch_axis("b", 0)?;
    // A batch axis on the reduction dimension is summed away.
    let out = if a_axis.axis() == Some(axes.a_m) {
        BatchAxis::at(0)
    } else if b_axis.axis() == Some(axes.b_n) {
        BatchAxis::at(1)
    } else {
        BatchAxis::NONE
    };
    ctx.set_output_batch_axis("out", 0, out)
}

fn get_sbp(ctx: &SbpContext<'_>) -> InferResult<Vec<SbpSignature>> {
    let axes = MatmulAxes::new(ctx.attr("transpose_a")?, ctx.attr("transpose_b")?);
    Ok(vec![
        ctx.new_builder()
            .split("a", 0, axes.a_m)
            .broadcast("b", 0)
            .split("out", 0, 0)
            .build()?,
        ctx.new_builder()
            .broadcast("a", 0)
            .split("b", 0, axes.b_n)
            .split("out", 0, 1)
            .build()?,
        ctx.new_builder()
            .split("a", 0, axes.a_k)
            .split("b", 0, axes.b_k)
            .partial_sum("out", 0)
            .build()?,
    ])
}

fn emit_matmul(
    ctx: &BackwardContext<'_>,
    sink: &mut BackwardOpSink,
    arg: &str,
    (a, b): (&LogicalBlobName, &LogicalBlobName),
    (transpose_a, transpose_b): (bool, bool),
) {
    let name = format!("{}_grad_{}", ctx.op_name(), arg);
    let grad_op = UserOpConfBuilder::new(name.clone())
        .op(MATMUL)
        .input("a", a.clone())
        .input("b", b.clone())
        .output("out")
        .attr("transpose_a", transpose_a)
        .attr("transpose_b", transpose_b)
        .scope_symbol_id(ctx.op().scope_symbol_id())
        .build();
    sink.bind_input_grad(LogicalBlobName::new(name, "out", 0), arg, 0);
    sink.add_op(grad_op);
}

fn gen_grad(
    ctx: &BackwardContext<'_>,
    sink: &mut BackwardOpSink,
) -> Result<(), GradientBindingError> {
    let transpose_a = ctx.attr::<bool>("transpose_a").unwrap_or(false);
    let transpose_b = ctx.attr::<bool>("transpose_b").unwrap_or(false);
    let dy = ctx.output_grad("out", 0)?;
    let a = ctx.input("a", 0)?;
    let b = ctx.input("b", 0)?;

    if ctx.need_gen_grad_for_input("a", 0) {
        if transpose_a {
            emit_matmul(ctx, sink, "a", (b, dy), (transpose_b, true));
        } else {
            emit_matmul(ctx, sink, "a", (dy, b), (false, !transpose_b));
        }
    }
    if ctx.need_gen_grad_for_input("b", 0) {
        if transpose_b {
            emit_matmul(ctx, sink, "b", (dy, a), (true, transpose_a));
        } else {
            emit_matmul(ctx, sink, "b", (a, dy), (!transpose_a, false));
        }
    }
    Ok(())
}
