use std::collections::BTreeMap;

use crate::job::{AttrValue, LogicalBlobName, OperatorConf};

/// Immutable builder producing a frozen [`OperatorConf`].
///
/// Every method consumes the builder and returns an updated copy; output blob names are
/// derived from the op name when [`UserOpConfBuilder::build`] runs.
#[derive(Debug, Clone)]
#[must_use]
pub struct UserOpConfBuilder {
    name: String,
    op_type: String,
    attrs: BTreeMap<String, AttrValue>,
    inputs: BTreeMap<String, Vec<LogicalBlobName>>,
    outputs: BTreeMap<String, usize>,
    scope_symbol_id: Option<i64>,
}

impl UserOpConfBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op_type: String::new(),
            attrs: BTreeMap::new(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            scope_symbol_id: None,
        }
    }

    pub fn op(mut self, op_type: impl Into<String>) -> Self {
        self.op_type = op_type.into();
        self
    }

    /// Appends one slot to input `arg`.
    pub fn input(mut self, arg: &str, lbn: LogicalBlobName) -> Self {
        self.inputs.entry(arg.to_string()).or_default().push(lbn);
        self
    }

    /// Declares output `arg` with a single slot.
    pub fn output(self, arg: &str) -> Self {
        self.outputs(arg, 1)
    }

    pub fn outputs(mut self, arg: &str, count: usize) -> Self {
        self.outputs.insert(arg.to_string(), count);
        self
    }

    pub fn attr(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(name.to_string(), value.into());
        self
    }

    pub fn scope_symbol_id(mut self, scope_symbol_id: Option<i64>) -> Self {
        self.scope_symbol_id = scope_symbol_id;
        self
    }

    pub fn build(self) -> OperatorConf {
        let outputs = self
            .outputs
            .into_iter()
            .map(|(arg, count)| {
                let lbns = (0..count)
                    .map(|index| LogicalBlobName::new(self.name.clone(), arg.clone(), index))
                    .collect();
                (arg, lbns)
            })
            .collect();
        OperatorConf {
            name: self.name,
            op_type: self.op_type,
            attrs: self.attrs,
            inputs: self.inputs,
            outputs,
            scope_symbol_id: self.scope_symbol_id,
        }
    }
}
