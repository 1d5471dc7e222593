//! Views handed to gradient functions.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::GradientBindingError;
use crate::job::{AttrType, LogicalBlobName, OpArg, OperatorConf};
use crate::tensor::TensorDesc;

/// Read access to a forward op, its logical descriptors and its output gradients.
pub struct BackwardContext<'a> {
    op: &'a OperatorConf,
    input_descs: &'a BTreeMap<OpArg, TensorDesc>,
    output_descs: &'a BTreeMap<OpArg, TensorDesc>,
    required: &'a BTreeSet<OpArg>,
    output_grads: &'a BTreeMap<OpArg, LogicalBlobName>,
}

impl<'a> BackwardContext<'a> {
    pub(crate) fn new(
        op: &'a OperatorConf,
        input_descs: &'a BTreeMap<OpArg, TensorDesc>,
        output_descs: &'a BTreeMap<OpArg, TensorDesc>,
        required: &'a BTreeSet<OpArg>,
        output_grads: &'a BTreeMap<OpArg, LogicalBlobName>,
    ) -> Self {
        Self {
            op,
            input_descs,
            output_descs,
            required,
            output_grads,
        }
    }

    pub fn op(&self) -> &OperatorConf {
        self.op
    }

    pub fn op_name(&self) -> &str {
        self.op.name()
    }

    pub fn attr<T: AttrType>(&self, name: &str) -> Option<T> {
        self.op.attr(name).and_then(T::from_attr)
    }

    pub fn input(&self, arg: &str, index: usize) -> Result<&LogicalBlobName, GradientBindingError> {
        self.op
            .input(arg, index)
            .ok_or_else(|| self.unknown_input(arg, index))
    }

    pub fn output(&self, arg: &str, index: usize) -> Result<&LogicalBlobName, GradientBindingError> {
        self.op
            .output(arg, index)
            .ok_or_else(|| self.missing_output_grad(arg, index))
    }

    pub fn input_desc(&self, arg: &str, index: usize) -> Option<&TensorDesc> {
        self.input_descs.get(&OpArg::new(arg, index))
    }

    pub fn output_desc(&self, arg: &str, index: usize) -> Option<&TensorDesc> {
        self.output_descs.get(&OpArg::new(arg, index))
    }

    pub fn input_count(&self, arg: &str) -> usize {
        self.op.input_count(arg)
    }

    /// Whether a gradient must be produced and bound for this input.
    pub fn need_gen_grad_for_input(&self, arg: &str, index: usize) -> bool {
        self.required.contains(&OpArg::new(arg, index))
    }

    pub fn has_output_grad(&self, arg: &str, index: usize) -> bool {
        self.output_grads.contains_key(&OpArg::new(arg, index))
    }

    /// Gradient blob of an output; fails when no consumer produced one.
    pub fn output_grad(
        &self,
        arg: &str,
        index: usize,
    ) -> Result<&LogicalBlobName, GradientBindingError> {
        self.output_grads
            .get(&OpArg::new(arg, index))
            .ok_or_else(|| self.missing_output_grad(arg, index))
    }

    fn unknown_input(&self, arg: &str, index: usize) -> GradientBindingError {
        GradientBindingError::UnknownInput {
            op: self.op.name().to_string(),
            arg: arg.to_string(),
            index,
        }
    }

    fn missing_output_grad(&self, arg: &str, index: usize) -> GradientBindingError {
        GradientBindingError::MissingOutputGrad {
            op: self.op.name().to_string(),
            arg: arg.to_string(),
            index,
        }
    }
}

/// Collects backward ops and gradient bindings emitted for one forward op.
#[derive(Debug, Default)]
pub struct BackwardOpSink {
    ops: Vec<OperatorConf>,
    bindings: Vec<(OpArg, LogicalBlobName)>,
}

impl BackwardOpSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn add_op(&mut self, op: OperatorConf) {
        self.ops.push(op);
    }

    /// Declares `grad` as the gradient of the forward input slot `(arg, index)`.
    pub fn bind_input_grad(&mut self, grad: LogicalBlobName, arg: &str, index: usize) {
        self.bindings.push((OpArg::new(arg, index), grad));
    }

    pub(crate) fn into_parts(self) -> (Vec<OperatorConf>, Vec<(OpArg, LogicalBlobName)>) {
        (self.ops, self.bindings)
    }
}
