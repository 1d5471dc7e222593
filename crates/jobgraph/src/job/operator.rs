use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::GraphBuildError;
use crate::job::LogicalBlobName;
use crate::tensor::{DataType, Shape};

/// One slot of a (possibly variadic) input or output argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpArg {
    pub name: String,
    pub index: usize,
}

impl OpArg {
    pub fn new(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }
}

impl fmt::Display for OpArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.name, self.index)
    }
}

/// Typed attribute value attached to an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    Bool(bool),
    Int64(i64),
    Double(f64),
    String(String),
    Shape(Shape),
    DataType(DataType),
    ListInt64(Vec<i64>),
}

impl AttrValue {
    pub fn kind(&self) -> &'static str {
        match self {
            AttrValue::Bool(_) => "bool",
            AttrValue::Int64(_) => "int64",
            AttrValue::Double(_) => "double",
            AttrValue::String(_) => "string",
            AttrValue::Shape(_) => "shape",
            AttrValue::DataType(_) => "data_type",
            AttrValue::ListInt64(_) => "list_int64",
        }
    }
}

/// Conversion from an [`AttrValue`] into a concrete Rust type.
pub trait AttrType: Sized {
    const KIND: &'static str;

    fn from_attr(value: &AttrValue) -> Option<Self>;
}

macro_rules! impl_attr_type {
    ($ty:ty, $variant:ident, $kind:literal) => {
        impl AttrType for $ty {
            const KIND: &'static str = $kind;

            fn from_attr(value: &AttrValue) -> Option<Self> {
                match value {
                    AttrValue::$variant(inner) => Some(inner.clone()),
                    _ => None,
                }
            }
        }

        impl From<$ty> for AttrValue {
            fn from(value: $ty) -> Self {
                AttrValue::$variant(value)
            }
        }
    };
}

impl_attr_type!(bool, Bool, "bool");
impl_attr_type!(i64, Int64, "int64");
impl_attr_type!(f64, Double, "double");
impl_attr_type!(String, String, "string");
impl_attr_type!(Shape, Shape, "shape");
impl_attr_type!(DataType, DataType, "data_type");
impl_attr_type!(Vec<i64>, ListInt64, "list_int64");

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::String(value.to_string())
    }
}

/// Frozen operator descriptor.
///
/// Built through [`crate::user_op::UserOpConfBuilder`] (or deserialized) and never mutated once
/// it is part of a [`crate::job::Job`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorConf {
    pub(crate) name: String,
    pub(crate) op_type: String,
    #[serde(default)]
    pub(crate) attrs: BTreeMap<String, AttrValue>,
    #[serde(default)]
    pub(crate) inputs: BTreeMap<String, Vec<LogicalBlobName>>,
    #[serde(default)]
    pub(crate) outputs: BTreeMap<String, Vec<LogicalBlobName>>,
    #[serde(default)]
    pub(crate) scope_symbol_id: Option<i64>,
}

impl OperatorConf {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn attrs(&self) -> &BTreeMap<String, AttrValue> {
        &self.attrs
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    pub fn scope_symbol_id(&self) -> Option<i64> {
        self.scope_symbol_id
    }

    /// Copy of this conf attached to another scope symbol.
    pub fn with_scope_symbol_id(mut self, scope_symbol_id: i64) -> Self {
        self.scope_symbol_id = Some(scope_symbol_id);
        self
    }

    pub fn input(&self, arg: &str, index: usize) -> Option<&LogicalBlobName> {
        self.inputs.get(arg).and_then(|lbns| lbns.get(index))
    }

    pub fn output(&self, arg: &str, index: usize) -> Option<&LogicalBlobName> {
        self.outputs.get(arg).and_then(|lbns| lbns.get(index))
    }

    pub fn input_count(&self, arg: &str) -> usize {
        self.inputs.get(arg).map_or(0, Vec::len)
    }

    pub fn output_count(&self, arg: &str) -> usize {
        self.outputs.get(arg).map_or(0, Vec::len)
    }

    pub fn input_arg_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.keys().map(String::as_str)
    }

    pub fn output_arg_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }

    /// Input slots in argument-name order.
    pub fn inputs(&self) -> impl Iterator<Item = (OpArg, &LogicalBlobName)> {
        flatten_args(&self.inputs)
    }

    /// Output slots in argument-name order.
    pub fn outputs(&self) -> impl Iterator<Item = (OpArg, &LogicalBlobName)> {
        flatten_args(&self.outputs)
    }

    /// Every output slot `arg_i` must be bound to `<op>/<arg>:<i>`.
    pub fn check_output_bindings(&self) -> Result<(), GraphBuildError> {
        for (arg, lbn) in self.outputs() {
            let expected = LogicalBlobName::new(self.name.as_str(), arg.name.as_str(), arg.index);
            if *lbn != expected {
                return Err(GraphBuildError::MisnamedOutput {
                    op: self.name.clone(),
                    arg,
                    lbn: lbn.clone(),
                    expected,
                });
            }
        }
        Ok(())
    }
}

fn flatten_args(
    args: &BTreeMap<String, Vec<LogicalBlobName>>,
) -> impl Iterator<Item = (OpArg, &LogicalBlobName)> {
    args.iter().flat_map(|(name, lbns)| {
        lbns.iter()
            .enumerate()
            .map(move |(index, lbn)| (OpArg::new(name.clone(), index), lbn))
    })
}
