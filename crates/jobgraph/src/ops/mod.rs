//! Built-in op types.
//!
//! The rewrite passes synthesize ops of these types, so any registry used with the default
//! passes must contain them.

mod assign;
mod elementwise;
mod input;
mod matmul;
mod scalar_add;
mod sparse_softmax_cross_entropy;
mod variable;

use crate::error::{InferResult, RegistrationError};
use crate::job::LogicalBlobName;
use crate::user_op::{
    BackwardContext, BackwardOpSink, OpRegistryBuilder, SbpContext, SbpSignature,
    UserOpConfBuilder,
};

pub const VARIABLE: &str = "variable";
pub const INPUT: &str = "input";
pub const IDENTITY: &str = "identity";
pub const SCALAR_ADD: &str = "scalar_add";
pub const ASSIGN: &str = "assign";
pub const ADD: &str = "add";
pub const ADD_N: &str = "add_n";
pub const ONES_LIKE: &str = "ones_like";
pub const MATMUL: &str = "matmul";
pub const SPARSE_SOFTMAX_CROSS_ENTROPY: &str = "sparse_softmax_cross_entropy";
pub const SPARSE_SOFTMAX_CROSS_ENTROPY_GRAD: &str = "sparse_softmax_cross_entropy_grad";

pub use variable::{
    INITIALIZER_CONSTANT, INITIALIZER_CONSTANT_INT, INITIALIZER_ZEROS, NO_SPLIT_AXIS,
};

/// Registers every built-in op type together with its gradient function.
pub fn register_builtin_ops(builder: &mut OpRegistryBuilder) -> Result<(), RegistrationError> {
    variable::register(builder)?;
    input::register(builder)?;
    elementwise::register(builder)?;
    scalar_add::register(builder)?;
    assign::register(builder)?;
    matmul::register(builder)?;
    sparse_softmax_cross_entropy::register(builder)?;
    Ok(())
}

/// Signatures for ops whose every slot has the same rank: split along each axis, then
/// all-broadcast.
fn same_rank_split_signatures(
    ctx: &SbpContext<'_>,
    rank: usize,
    with_partial_sum: bool,
) -> InferResult<Vec<SbpSignature>> {
    let mut signatures = Vec::with_capacity(rank + 2);
    for axis in 0..rank {
        signatures.push(ctx.new_builder().split_all(axis).build()?);
    }
    if with_partial_sum {
        let mut builder = ctx.new_builder();
        for arg in ctx.input_args().chain(ctx.output_args()) {
            builder = builder.partial_sum(&arg.name, arg.index);
        }
        signatures.push(builder.build()?);
    }
    signatures.push(ctx.new_builder().build()?);
    Ok(signatures)
}

/// Passes `dy` through an identity op and binds it to the input slot.
fn bind_identity_grad(
    ctx: &BackwardContext<'_>,
    sink: &mut BackwardOpSink,
    dy: &LogicalBlobName,
    arg: &str,
    index: usize,
) {
    let name = format!("{}_grad_{}_{}", ctx.op_name(), arg, index);
    let grad_op = UserOpConfBuilder::new(name.clone())
        .op(IDENTITY)
        .input("in", dy.clone())
        .output("out")
        .scope_symbol_id(ctx.op().scope_symbol_id())
        .build();
    sink.bind_input_grad(LogicalBlobName::new(name, "out", 0), arg, index);
    sink.add_op(grad_op);
}
