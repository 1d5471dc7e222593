//! Logical tensor descriptors shared by inference callbacks and the op graph.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Element types a logical blob can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    Int8,
    UInt8,
    Int32,
    Int64,
    Float16,
    Float32,
    Float64,
}

impl DataType {
    /// Returns `true` for the dtypes accepted as indices (labels, gather indices).
    pub fn is_index(self) -> bool {
        matches!(self, DataType::Int32 | DataType::Int64)
    }

    /// Returns `true` when the dtype is any signed or unsigned integer.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DataType::Int8 | DataType::UInt8 | DataType::Int32 | DataType::Int64
        )
    }

    /// Returns `true` when the dtype is a floating-point representation.
    pub fn is_float(self) -> bool {
        matches!(
            self,
            DataType::Float16 | DataType::Float32 | DataType::Float64
        )
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Bool => "bool",
            DataType::Int8 => "int8",
            DataType::UInt8 => "uint8",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Float16 => "float16",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        };
        f.write_str(name)
    }
}

/// Logical tensor shape as an ordered list of dimension sizes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    /// Rank-0 shape.
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).copied()
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims)
    }
}

/// Shape, dtype and dynamic flag of a logical blob.
///
/// Every consumer of a blob observes the descriptor inferred for its producer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDesc {
    pub shape: Shape,
    pub data_type: DataType,
    #[serde(default)]
    pub is_dynamic: bool,
}

impl TensorDesc {
    pub fn new(shape: impl Into<Shape>, data_type: DataType) -> Self {
        Self {
            shape: shape.into(),
            data_type,
            is_dynamic: false,
        }
    }

    pub fn dynamic(mut self, is_dynamic: bool) -> Self {
        self.is_dynamic = is_dynamic;
        self
    }

    /// Copy of `self` with the shape replaced.
    pub fn with_shape(&self, shape: impl Into<Shape>) -> Self {
        Self {
            shape: shape.into(),
            data_type: self.data_type,
            is_dynamic: self.is_dynamic,
        }
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor<{}, {}", self.data_type, self.shape)?;
        if self.is_dynamic {
            f.write_str(", dynamic")?;
        }
        f.write_str(">")
    }
}

/// Data-parallel axis of a blob, or none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchAxis(Option<usize>);

impl BatchAxis {
    pub const NONE: BatchAxis = BatchAxis(None);

    pub const fn at(axis: usize) -> Self {
        BatchAxis(Some(axis))
    }

    pub fn axis(self) -> Option<usize> {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0.is_none()
    }

    /// Combines the batch axes of two tensors consumed together.
    ///
    /// Matching axes or a `NONE` side merge; two different axes do not.
    pub fn merge(self, other: BatchAxis) -> Option<BatchAxis> {
        match (self.0, other.0) {
            (None, _) => Some(other),
            (_, None) => Some(self),
            (Some(a), Some(b)) if a == b => Some(self),
            _ => None,
        }
    }
}

impl fmt::Display for BatchAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(axis) => write!(f, "{axis}"),
            None => f.write_str("none"),
        }
    }
}
