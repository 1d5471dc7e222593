//! Op-type registry.
//!
//! Registrations happen once, on an [`OpRegistryBuilder`], while the process starts up.
//! [`OpRegistryBuilder::finish`] consumes the builder and yields an [`OpRegistry`] that has no
//! mutating API, so lookups from concurrent compilations need no locking.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crate::error::{GradientBindingError, InferError, InferResult, RegistrationError};
use crate::job::{AttrValue, OperatorConf};
use crate::tensor::BatchAxis;
use crate::user_op::context::{BatchAxisContext, InferContext, InputArgModifiers, SbpContext};
use crate::user_op::grad::{BackwardContext, BackwardOpSink};
use crate::user_op::sbp::SbpSignature;

/// Maps input descriptors and attributes to output descriptors.
pub type TensorDescInferFn = fn(&mut InferContext<'_>) -> InferResult<()>;
/// Propagates batch axes from inputs to outputs.
pub type BatchAxisInferFn = fn(&mut BatchAxisContext<'_>) -> InferResult<()>;
/// Enumerates the legal SBP signatures of an op.
pub type GetSbpFn = fn(&SbpContext<'_>) -> InferResult<Vec<SbpSignature>>;
/// Marks inputs that never receive gradients.
pub type InputArgModifyFn = fn(&mut InputArgModifiers<'_>) -> InferResult<()>;
/// Emits the backward ops of one forward op and binds them to its inputs.
pub type GenBackwardOpFn =
    fn(&BackwardContext<'_>, &mut BackwardOpSink) -> Result<(), GradientBindingError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Exactly one slot.
    Single,
    /// Zero or one slot.
    Optional,
    /// At least `min` slots.
    Variadic { min: usize },
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgKind::Single => f.write_str("exactly 1"),
            ArgKind::Optional => f.write_str("at most 1"),
            ArgKind::Variadic { min } => write!(f, "at least {min}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgDef {
    pub name: String,
    pub kind: ArgKind,
}

impl ArgDef {
    fn accepts(&self, count: usize) -> bool {
        match self.kind {
            ArgKind::Single => count == 1,
            ArgKind::Optional => count <= 1,
            ArgKind::Variadic { min } => count >= min,
        }
    }
}

/// Registration record of one op type. Immutable once registered.
#[derive(Clone)]
pub struct OpTypeDescriptor {
    name: String,
    inputs: Vec<ArgDef>,
    outputs: Vec<ArgDef>,
    attr_defaults: BTreeMap<String, AttrValue>,
    tensor_desc_infer_fn: TensorDescInferFn,
    batch_axis_infer_fn: BatchAxisInferFn,
    sbp_fn: GetSbpFn,
    input_arg_modify_fn: Option<InputArgModifyFn>,
    grad_fn: Option<GenBackwardOpFn>,
}

impl fmt::Debug for OpTypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpTypeDescriptor")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("attr_defaults", &self.attr_defaults)
            .field("has_input_arg_modify_fn", &self.input_arg_modify_fn.is_some())
            .field("has_grad_fn", &self.grad_fn.is_some())
            .finish()
    }
}

impl OpTypeDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[ArgDef] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ArgDef] {
        &self.outputs
    }

    pub fn attr_default(&self, name: &str) -> Option<&AttrValue> {
        self.attr_defaults.get(name)
    }

    pub fn tensor_desc_infer_fn(&self) -> TensorDescInferFn {
        self.tensor_desc_infer_fn
    }

    pub fn batch_axis_infer_fn(&self) -> BatchAxisInferFn {
        self.batch_axis_infer_fn
    }

    pub fn sbp_fn(&self) -> GetSbpFn {
        self.sbp_fn
    }

    pub fn input_arg_modify_fn(&self) -> Option<InputArgModifyFn> {
        self.input_arg_modify_fn
    }

    pub fn grad_fn(&self) -> Option<GenBackwardOpFn> {
        self.grad_fn
    }

    /// Checks the argument bindings of `op` against this declaration.
    pub fn check_conf(&self, op: &OperatorConf) -> InferResult<()> {
        check_args("input", &self.inputs, op.input_arg_names(), |arg| {
            op.input_count(arg)
        })?;
        check_args("output", &self.outputs, op.output_arg_names(), |arg| {
            op.output_count(arg)
        })
    }
}

fn check_args<'a>(
    direction: &'static str,
    declared: &[ArgDef],
    bound: impl Iterator<Item = &'a str>,
    count_of: impl Fn(&str) -> usize,
) -> InferResult<()> {
    for arg in bound {
        if !declared.iter().any(|def| def.name == arg) {
            return Err(InferError::UndeclaredArg {
                direction,
                arg: arg.to_string(),
            });
        }
    }
    for def in declared {
        let found = count_of(&def.name);
        if !def.accepts(found) {
            return Err(InferError::ArgCount {
                direction,
                arg: def.name.clone(),
                expected: def.kind,
                found,
            });
        }
    }
    Ok(())
}

/// Fluent declaration of an op type, turned into an [`OpTypeDescriptor`] on registration.
#[must_use]
pub struct OpTypeRegistration {
    name: String,
    inputs: Vec<ArgDef>,
    outputs: Vec<ArgDef>,
    attr_defaults: BTreeMap<String, AttrValue>,
    tensor_desc_infer_fn: Option<TensorDescInferFn>,
    batch_axis_infer_fn: Option<BatchAxisInferFn>,
    sbp_fn: Option<GetSbpFn>,
    input_arg_modify_fn: Option<InputArgModifyFn>,
}

impl OpTypeRegistration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attr_defaults: BTreeMap::new(),
            tensor_desc_infer_fn: None,
            batch_axis_infer_fn: None,
            sbp_fn: None,
            input_arg_modify_fn: None,
        }
    }

    pub fn input(self, name: &str) -> Self {
        self.with_input(name, ArgKind::Single)
    }

    pub fn optional_input(self, name: &str) -> Self {
        self.with_input(name, ArgKind::Optional)
    }

    pub fn variadic_input(self, name: &str, min: usize) -> Self {
        self.with_input(name, ArgKind::Variadic { min })
    }

    pub fn output(mut self, name: &str) -> Self {
        self.outputs.push(ArgDef {
            name: name.to_string(),
            kind: ArgKind::Single,
        });
        self
    }

    pub fn attr(mut self, name: &str, default: impl Into<AttrValue>) -> Self {
        self.attr_defaults.insert(name.to_string(), default.into());
        self
    }

    pub fn tensor_desc_infer_fn(mut self, f: TensorDescInferFn) -> Self {
        self.tensor_desc_infer_fn = Some(f);
        self
    }

    pub fn batch_axis_infer_fn(mut self, f: BatchAxisInferFn) -> Self {
        self.batch_axis_infer_fn = Some(f);
        self
    }

    pub fn sbp_fn(mut self, f: GetSbpFn) -> Self {
        self.sbp_fn = Some(f);
        self
    }

    pub fn input_arg_modify_fn(mut self, f: InputArgModifyFn) -> Self {
        self.input_arg_modify_fn = Some(f);
        self
    }

    fn with_input(mut self, name: &str, kind: ArgKind) -> Self {
        self.inputs.push(ArgDef {
            name: name.to_string(),
            kind,
        });
        self
    }

    fn into_descriptor(self) -> Result<OpTypeDescriptor, RegistrationError> {
        let invalid = |reason: String| RegistrationError::InvalidDeclaration {
            name: self.name.clone(),
            reason,
        };
        if self.name.is_empty() {
            return Err(invalid("op type name is empty".to_string()));
        }
        let mut seen = BTreeSet::new();
        for def in self.inputs.iter().chain(self.outputs.iter()) {
            if !seen.insert(def.name.as_str()) {
                return Err(invalid(format!("argument `{}` declared twice", def.name)));
            }
        }
        let tensor_desc_infer_fn = self
            .tensor_desc_infer_fn
            .ok_or_else(|| invalid("missing tensor desc infer fn".to_string()))?;
        Ok(OpTypeDescriptor {
            name: self.name,
            inputs: self.inputs,
            outputs: self.outputs,
            attr_defaults: self.attr_defaults,
            tensor_desc_infer_fn,
            batch_axis_infer_fn: self
                .batch_axis_infer_fn
                .unwrap_or(default_batch_axis_infer_fn),
            sbp_fn: self.sbp_fn.unwrap_or(default_sbp_fn),
            input_arg_modify_fn: self.input_arg_modify_fn,
            grad_fn: None,
        })
    }
}

/// Merges the batch axes of all inputs and assigns the result to every output.
pub fn default_batch_axis_infer_fn(ctx: &mut BatchAxisContext<'_>) -> InferResult<()> {
    let mut merged = BatchAxis::NONE;
    for (arg, axis) in ctx.input_batch_axes() {
        merged = merged.merge(axis).ok_or_else(|| {
            InferError::batch_axis(format!(
                "input `{arg}` has batch axis {axis} but other inputs have {merged}"
            ))
        })?;
    }
    for arg in ctx.output_args() {
        ctx.set_output_batch_axis(&arg.name, arg.index, merged)?;
    }
    Ok(())
}

/// Every slot broadcast.
pub fn default_sbp_fn(ctx: &SbpContext<'_>) -> InferResult<Vec<SbpSignature>> {
    Ok(vec![ctx.new_builder().build()?])
}

/// Mutable registry used during process start-up.
#[derive(Default)]
pub struct OpRegistryBuilder {
    ops: HashMap<String, OpTypeDescriptor>,
}

impl OpRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pre-populated with the op types this crate ships.
    pub fn with_builtin_ops() -> Result<Self, RegistrationError> {
        let mut builder = Self::new();
        crate::ops::register_builtin_ops(&mut builder)?;
        Ok(builder)
    }

    pub fn register(
        &mut self,
        registration: OpTypeRegistration,
    ) -> Result<&mut Self, RegistrationError> {
        let descriptor = registration.into_descriptor()?;
        if self.ops.contains_key(descriptor.name()) {
            return Err(RegistrationError::DuplicateOpType {
                name: descriptor.name().to_string(),
            });
        }
        tracing::trace!(op_type = descriptor.name(), "registered op type");
        self.ops.insert(descriptor.name().to_string(), descriptor);
        Ok(self)
    }

    /// Attaches the gradient function of an already registered op type.
    pub fn register_grad(
        &mut self,
        op_type: &str,
        grad_fn: GenBackwardOpFn,
    ) -> Result<&mut Self, RegistrationError> {
        let descriptor =
            self.ops
                .get_mut(op_type)
                .ok_or_else(|| RegistrationError::OpTypeNotFound {
                    name: op_type.to_string(),
                })?;
        if descriptor.grad_fn.is_some() {
            return Err(RegistrationError::DuplicateGradient {
                name: op_type.to_string(),
            });
        }
        descriptor.grad_fn = Some(grad_fn);
        Ok(self)
    }

    pub fn contains(&self, op_type: &str) -> bool {
        self.ops.contains_key(op_type)
    }

    pub fn finish(self) -> OpRegistry {
        OpRegistry { ops: self.ops }
    }
}

/// Frozen op-type table shared by every compilation in the process.
#[derive(Debug)]
pub struct OpRegistry {
    ops: HashMap<String, OpTypeDescriptor>,
}

impl OpRegistry {
    /// Registry holding exactly the built-in op types.
    pub fn builtin() -> Result<Self, RegistrationError> {
        Ok(OpRegistryBuilder::with_builtin_ops()?.finish())
    }

    pub fn lookup(&self, op_type: &str) -> Result<&OpTypeDescriptor, RegistrationError> {
        self.ops
            .get(op_type)
            .ok_or_else(|| RegistrationError::OpTypeNotFound {
                name: op_type.to_string(),
            })
    }

    pub fn contains(&self, op_type: &str) -> bool {
        self.ops.contains_key(op_type)
    }

    /// Registered op-type names, sorted.
    pub fn op_type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.ops.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
