//! Views handed to registry callbacks during logical inference.

use std::collections::BTreeMap;

use crate::error::{InferError, InferResult};
use crate::job::{AttrType, OpArg, OperatorConf};
use crate::tensor::{BatchAxis, TensorDesc};
use crate::user_op::registry::OpTypeDescriptor;
use crate::user_op::sbp::SbpSignatureBuilder;

fn typed_attr<T: AttrType>(
    op: &OperatorConf,
    descriptor: &OpTypeDescriptor,
    name: &str,
) -> InferResult<T> {
    let value = op
        .attr(name)
        .or_else(|| descriptor.attr_default(name))
        .ok_or_else(|| InferError::MissingAttr {
            name: name.to_string(),
        })?;
    T::from_attr(value).ok_or_else(|| InferError::AttrType {
        name: name.to_string(),
        expected: T::KIND,
        found: value.kind(),
    })
}

fn lookup<'m, V>(map: &'m BTreeMap<OpArg, V>, arg: &str, index: usize) -> InferResult<&'m V> {
    map.get(&OpArg::new(arg, index))
        .ok_or_else(|| InferError::UnknownArg {
            arg: arg.to_string(),
            index,
        })
}

/// Shape / dtype inference view of one op.
pub struct InferContext<'a> {
    op: &'a OperatorConf,
    descriptor: &'a OpTypeDescriptor,
    inputs: &'a BTreeMap<OpArg, TensorDesc>,
    outputs: BTreeMap<OpArg, Option<TensorDesc>>,
}

impl<'a> InferContext<'a> {
    pub(crate) fn new(
        op: &'a OperatorConf,
        descriptor: &'a OpTypeDescriptor,
        inputs: &'a BTreeMap<OpArg, TensorDesc>,
    ) -> Self {
        let outputs = op.outputs().map(|(arg, _)| (arg, None)).collect();
        Self {
            op,
            descriptor,
            inputs,
            outputs,
        }
    }

    pub fn op_name(&self) -> &str {
        self.op.name()
    }

    pub fn attr<T: AttrType>(&self, name: &str) -> InferResult<T> {
        typed_attr(self.op, self.descriptor, name)
    }

    pub fn input_count(&self, arg: &str) -> usize {
        self.op.input_count(arg)
    }

    pub fn output_count(&self, arg: &str) -> usize {
        self.op.output_count(arg)
    }

    pub fn input_desc(&self, arg: &str, index: usize) -> InferResult<&TensorDesc> {
        lookup(self.inputs, arg, index)
    }

    pub fn output_desc(&self, arg: &str, index: usize) -> Option<&TensorDesc> {
        self.outputs
            .get(&OpArg::new(arg, index))
            .and_then(Option::as_ref)
    }

    pub fn set_output_desc(&mut self, arg: &str, index: usize, desc: TensorDesc) -> InferResult<()> {
        let slot = self
            .outputs
            .get_mut(&OpArg::new(arg, index))
            .ok_or_else(|| InferError::UnknownArg {
                arg: arg.to_string(),
                index,
            })?;
        *slot = Some(desc);
        Ok(())
    }

    /// Collects the inferred outputs; every output slot must have been set.
    pub(crate) fn finish(self) -> InferResult<BTreeMap<OpArg, TensorDesc>> {
        let mut resolved = BTreeMap::new();
        for (arg, desc) in self.outputs {
            let desc = desc.ok_or_else(|| {
                InferError::shape(format!("output `{arg}` was not inferred"))
            })?;
            resolved.insert(arg, desc);
        }
        Ok(resolved)
    }
}

/// Batch axis propagation view of one op.
pub struct BatchAxisContext<'a> {
    op: &'a OperatorConf,
    descriptor: &'a OpTypeDescriptor,
    input_descs: &'a BTreeMap<OpArg, TensorDesc>,
    output_descs: &'a BTreeMap<OpArg, TensorDesc>,
    inputs: &'a BTreeMap<OpArg, BatchAxis>,
    outputs: BTreeMap<OpArg, BatchAxis>,
}

impl<'a> BatchAxisContext<'a> {
    pub(crate) fn new(
        op: &'a OperatorConf,
        descriptor: &'a OpTypeDescriptor,
        input_descs: &'a BTreeMap<OpArg, TensorDesc>,
        output_descs: &'a BTreeMap<OpArg, TensorDesc>,
        inputs: &'a BTreeMap<OpArg, BatchAxis>,
    ) -> Self {
        let outputs = op.outputs().map(|(arg, _)| (arg, BatchAxis::NONE)).collect();
        Self {
            op,
            descriptor,
            input_descs,
            output_descs,
            inputs,
            outputs,
        }
    }

    pub fn op_name(&self) -> &str {
        self.op.name()
    }

    pub fn attr<T: AttrType>(&self, name: &str) -> InferResult<T> {
        typed_attr(self.op, self.descriptor, name)
    }

    pub fn input_batch_axis(&self, arg: &str, index: usize) -> InferResult<BatchAxis> {
        lookup(self.inputs, arg, index).copied()
    }

    pub fn input_desc(&self, arg: &str, index: usize) -> InferResult<&TensorDesc> {
        lookup(self.input_descs, arg, index)
    }

    pub fn output_desc(&self, arg: &str, index: usize) -> InferResult<&TensorDesc> {
        lookup(self.output_descs, arg, index)
    }

    /// Input slots with their batch axes, in argument-name order.
    pub fn input_batch_axes(&self) -> impl Iterator<Item = (&OpArg, BatchAxis)> {
        self.inputs.iter().map(|(arg, axis)| (arg, *axis))
    }

    pub fn output_args(&self) -> Vec<OpArg> {
        self.outputs.keys().cloned().collect()
    }

    pub fn set_output_batch_axis(
        &mut self,
        arg: &str,
        index: usize,
        axis: BatchAxis,
    ) -> InferResult<()> {
        let key = OpArg::new(arg, index);
        let rank = lookup(self.output_descs, arg, index)?.shape.rank();
        if let Some(dim) = axis.axis() {
            if dim >= rank {
                return Err(InferError::batch_axis(format!(
                    "batch axis {dim} is out of range for output `{key}` of rank {rank}"
                )));
            }
        }
        self.outputs.insert(key, axis);
        Ok(())
    }

    pub(crate) fn finish(self) -> BTreeMap<OpArg, BatchAxis> {
        self.outputs
    }
}

/// Enumeration view used to declare legal SBP signatures.
pub struct SbpContext<'a> {
    op: &'a OperatorConf,
    descriptor: &'a OpTypeDescriptor,
    input_descs: &'a BTreeMap<OpArg, TensorDesc>,
    output_descs: &'a BTreeMap<OpArg, TensorDesc>,
}

impl<'a> SbpContext<'a> {
    pub(crate) fn new(
        op: &'a OperatorConf,
        descriptor: &'a OpTypeDescriptor,
        input_descs: &'a BTreeMap<OpArg, TensorDesc>,
        output_descs: &'a BTreeMap<OpArg, TensorDesc>,
    ) -> Self {
        Self {
            op,
            descriptor,
            input_descs,
            output_descs,
        }
    }

    pub fn op_name(&self) -> &str {
        self.op.name()
    }

    pub fn attr<T: AttrType>(&self, name: &str) -> InferResult<T> {
        typed_attr(self.op, self.descriptor, name)
    }

    pub fn input_desc(&self, arg: &str, index: usize) -> InferResult<&TensorDesc> {
        lookup(self.input_descs, arg, index)
    }

    pub fn output_desc(&self, arg: &str, index: usize) -> InferResult<&TensorDesc> {
        lookup(self.output_descs, arg, index)
    }

    pub fn input_args(&self) -> impl Iterator<Item = &OpArg> {
        self.input_descs.keys()
    }

    pub fn output_args(&self) -> impl Iterator<Item = &OpArg> {
        self.output_descs.keys()
    }

    /// Starts a signature covering every input and output slot of the op.
    pub fn new_builder(&self) -> SbpSignatureBuilder {
        let slots = self
            .input_descs
            .iter()
            .chain(self.output_descs.iter())
            .map(|(arg, desc)| (arg.clone(), desc.shape.rank()))
            .collect();
        SbpSignatureBuilder::new(slots)
    }
}

/// Per-input gradient switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputArgModifier {
    requires_grad: bool,
}

impl Default for InputArgModifier {
    fn default() -> Self {
        Self {
            requires_grad: true,
        }
    }
}

impl InputArgModifier {
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
    }
}

/// Modifiers for all input slots of one op.
pub struct InputArgModifiers<'a> {
    op: &'a OperatorConf,
    modifiers: BTreeMap<OpArg, InputArgModifier>,
}

impl<'a> InputArgModifiers<'a> {
    pub(crate) fn new(op: &'a OperatorConf) -> Self {
        let modifiers = op
            .inputs()
            .map(|(arg, _)| (arg, InputArgModifier::default()))
            .collect();
        Self { op, modifiers }
    }

    pub fn op(&self) -> &OperatorConf {
        self.op
    }

    pub fn get_mut(&mut self, arg: &str, index: usize) -> InferResult<&mut InputArgModifier> {
        self.modifiers
            .get_mut(&OpArg::new(arg, index))
            .ok_or_else(|| InferError::UnknownArg {
                arg: arg.to_string(),
                index,
            })
    }

    pub(crate) fn finish(self) -> BTreeMap<OpArg, InputArgModifier> {
        self.modifiers
    }
}

/// Resolved attribute lookups for callers outside a context (e.g. passes).
pub fn attr_or_default<T: AttrType>(
    op: &OperatorConf,
    descriptor: &OpTypeDescriptor,
    name: &str,
) -> InferResult<T> {
    typed_attr(op, descriptor, name)
}
