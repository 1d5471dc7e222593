//! Job representation: ordered operators, placement and training configuration.
//!
//! A [`Job`] is read through its accessors and mutated only through a [`JobBuilder`].

mod builder;
mod lbn;
mod operator;
mod placement;
mod scope;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub use builder::JobBuilder;
pub use lbn::LogicalBlobName;
pub use operator::{AttrType, AttrValue, OpArg, OperatorConf};
pub use placement::{DeviceTag, ParallelConf};
pub use scope::{ScopeResolver, SequentialScopeResolver};

/// Training-only settings of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainConf {
    /// Blob exposing the current training step, once injected.
    #[serde(default)]
    pub train_step_lbn: Option<LogicalBlobName>,
    /// Blobs whose gradients seed backward generation.
    #[serde(default)]
    pub loss_lbns: Vec<LogicalBlobName>,
    /// Gradient blob per trainable variable op, filled by backward generation.
    #[serde(default)]
    pub variable_grad_lbns: BTreeMap<String, LogicalBlobName>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub job_name: String,
    #[serde(default)]
    pub train_conf: Option<TrainConf>,
    /// Passes switched off for this job regardless of their own enablement.
    #[serde(default)]
    pub disabled_passes: BTreeSet<String>,
}

impl JobConfig {
    pub fn predict(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            train_conf: None,
            disabled_passes: BTreeSet::new(),
        }
    }

    pub fn train(job_name: impl Into<String>, train_conf: TrainConf) -> Self {
        Self {
            job_name: job_name.into(),
            train_conf: Some(train_conf),
            disabled_passes: BTreeSet::new(),
        }
    }

    pub fn is_train(&self) -> bool {
        self.train_conf.is_some()
    }
}

/// Root compilation unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub(crate) job_conf: JobConfig,
    #[serde(default)]
    pub(crate) ops: Vec<OperatorConf>,
    #[serde(default)]
    pub(crate) placement: BTreeMap<String, ParallelConf>,
}

impl Job {
    pub fn new(job_conf: JobConfig) -> Self {
        Self {
            job_conf,
            ops: Vec::new(),
            placement: BTreeMap::new(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn job_conf(&self) -> &JobConfig {
        &self.job_conf
    }

    pub fn job_name(&self) -> &str {
        &self.job_conf.job_name
    }

    pub fn train_conf(&self) -> Option<&TrainConf> {
        self.job_conf.train_conf.as_ref()
    }

    pub fn ops(&self) -> &[OperatorConf] {
        &self.ops
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    pub fn op(&self, name: &str) -> Option<&OperatorConf> {
        self.ops.iter().find(|op| op.name() == name)
    }

    pub fn contains_op(&self, name: &str) -> bool {
        self.op(name).is_some()
    }

    pub fn placement(&self) -> &BTreeMap<String, ParallelConf> {
        &self.placement
    }

    pub fn parallel_conf_of(&self, op_name: &str) -> Option<&ParallelConf> {
        self.placement.get(op_name)
    }
}
