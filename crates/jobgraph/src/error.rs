//! Error taxonomy for graph construction, inference, registration and rewriting.
//!
//! Every structural or inference violation aborts the compilation of the job that raised it;
//! nothing here is recovered from silently.

use thiserror::Error;

use crate::job::{LogicalBlobName, OpArg};
use crate::user_op::ArgKind;

/// Malformed job structure detected while building an [`crate::graph::OpGraph`] or adding ops.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphBuildError {
    #[error("blob `{lbn}` consumed by op `{consumer}` has no producer")]
    MissingProducer {
        lbn: LogicalBlobName,
        consumer: String,
    },
    #[error("blob `{lbn}` is produced by both `{first}` and `{second}`")]
    DuplicateProducer {
        lbn: LogicalBlobName,
        first: String,
        second: String,
    },
    #[error("op name `{name}` is used more than once")]
    DuplicateOpName { name: String },
    #[error("malformed logical blob name `{raw}`: {reason}")]
    MalformedLbn { raw: String, reason: &'static str },
    #[error("op `{op}` binds output `{arg}` to `{lbn}`, expected `{expected}`")]
    MisnamedOutput {
        op: String,
        arg: OpArg,
        lbn: LogicalBlobName,
        expected: LogicalBlobName,
    },
    #[error("cycle detected among ops {ops:?}")]
    Cycle { ops: Vec<String> },
}

/// Contract violation raised by an inference callback.
///
/// Callbacks do not know which op they run for; the graph wraps this into
/// [`CompileError::Infer`] with the op name and type attached.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InferError {
    #[error("shape error: {0}")]
    Shape(String),
    #[error("batch axis error: {0}")]
    BatchAxis(String),
    #[error("sbp error: {0}")]
    Sbp(String),
    #[error("unknown argument `{arg}_{index}`")]
    UnknownArg { arg: String, index: usize },
    #[error("{direction} `{arg}` is not declared by the op type")]
    UndeclaredArg { direction: &'static str, arg: String },
    #[error("{direction} `{arg}` expects {expected} binding(s), found {found}")]
    ArgCount {
        direction: &'static str,
        arg: String,
        expected: ArgKind,
        found: usize,
    },
    #[error("missing attribute `{name}`")]
    MissingAttr { name: String },
    #[error("attribute `{name}` expected {expected}, found {found}")]
    AttrType {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
}

impl InferError {
    pub fn shape(message: impl Into<String>) -> Self {
        InferError::Shape(message.into())
    }

    pub fn batch_axis(message: impl Into<String>) -> Self {
        InferError::BatchAxis(message.into())
    }

    pub fn sbp(message: impl Into<String>) -> Self {
        InferError::Sbp(message.into())
    }
}

pub type InferResult<T> = Result<T, InferError>;

/// Startup-time registration failures and lookups of unregistered names.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("op type `{name}` is already registered")]
    DuplicateOpType { name: String },
    #[error("op type `{name}` is not registered")]
    OpTypeNotFound { name: String },
    #[error("op type `{name}` already has a gradient function")]
    DuplicateGradient { name: String },
    #[error("pass `{name}` is already registered")]
    DuplicatePass { name: String },
    #[error("pass `{name}` is not registered")]
    PassNotFound { name: String },
    #[error("op `{op}` of type `{op_type}` needs a gradient but has no gradient function")]
    MissingGradient { op: String, op_type: String },
    #[error("invalid declaration for op type `{name}`: {reason}")]
    InvalidDeclaration { name: String, reason: String },
}

/// Gradient callback did not honor its binding contract.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GradientBindingError {
    #[error("op `{op}` requires a gradient for input `{arg}_{index}` but none was bound")]
    UnboundInput {
        op: String,
        arg: String,
        index: usize,
    },
    #[error("op `{op}` requested the gradient of output `{arg}_{index}` which has none")]
    MissingOutputGrad {
        op: String,
        arg: String,
        index: usize,
    },
    #[error("op `{op}` has no input `{arg}_{index}`")]
    UnknownInput {
        op: String,
        arg: String,
        index: usize,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("scope resolution failed: {message}")]
pub struct ScopeResolutionError {
    pub message: String,
}

impl ScopeResolutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Umbrella error for one compilation.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    GraphBuild(#[from] GraphBuildError),
    #[error("inference failed for op `{op}` ({op_type}): {source}")]
    Infer {
        op: String,
        op_type: String,
        #[source]
        source: InferError,
    },
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    GradientBinding(#[from] GradientBindingError),
    #[error(transparent)]
    ScopeResolution(#[from] ScopeResolutionError),
    #[error("serializing job configuration: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("pass `{pass}` failed: {source}")]
    Pass {
        pass: String,
        #[source]
        source: Box<CompileError>,
    },
}

impl CompileError {
    pub fn infer(op: impl Into<String>, op_type: impl Into<String>, source: InferError) -> Self {
        CompileError::Infer {
            op: op.into(),
            op_type: op_type.into(),
            source,
        }
    }

    /// Strips pass attribution and returns the error that caused the failure.
    pub fn root(&self) -> &CompileError {
        match self {
            CompileError::Pass { source, .. } => source.root(),
            other => other,
        }
    }

    /// The inference error at the root of this failure, if any.
    pub fn infer_error(&self) -> Option<&InferError> {
        match self.root() {
            CompileError::Infer { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type CompileResult<T> = Result<T, CompileError>;
