use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GraphBuildError;

/// Address of a logical blob: the producing op and one of its output arguments.
///
/// Renders as `<op_name>/<blob_name>` for index 0 and `<op_name>/<blob_name>:<index>` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalBlobName {
    op_name: String,
    blob_name: String,
    index: usize,
}

impl LogicalBlobName {
    pub fn new(op_name: impl Into<String>, blob_name: impl Into<String>, index: usize) -> Self {
        Self {
            op_name: op_name.into(),
            blob_name: blob_name.into(),
            index,
        }
    }

    pub fn op_name(&self) -> &str {
        &self.op_name
    }

    pub fn blob_name(&self) -> &str {
        &self.blob_name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn parse(raw: &str) -> Result<Self, GraphBuildError> {
        let malformed = |reason| GraphBuildError::MalformedLbn {
            raw: raw.to_string(),
            reason,
        };
        let (op_name, rest) = raw.rsplit_once('/').ok_or_else(|| malformed("missing `/`"))?;
        if op_name.is_empty() {
            return Err(malformed("empty op name"));
        }
        let (blob_name, index) = match rest.split_once(':') {
            Some((blob, index)) => {
                let index = index
                    .parse::<usize>()
                    .map_err(|_| malformed("index is not a non-negative integer"))?;
                (blob, index)
            }
            None => (rest, 0),
        };
        if blob_name.is_empty() {
            return Err(malformed("empty blob name"));
        }
        Ok(Self::new(op_name, blob_name, index))
    }
}

impl fmt::Display for LogicalBlobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.index == 0 {
            write!(f, "{}/{}", self.op_name, self.blob_name)
        } else {
            write!(f, "{}/{}:{}", self.op_name, self.blob_name, self.index)
        }
    }
}

impl FromStr for LogicalBlobName {
    type Err = GraphBuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogicalBlobName::parse(s)
    }
}

impl Serialize for LogicalBlobName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LogicalBlobName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        LogicalBlobName::parse(&raw).map_err(serde::de::Error::custom)
    }
}
