use std::collections::{HashMap, HashSet};

use crate::error::GraphBuildError;
use crate::job::{Job, LogicalBlobName, OperatorConf, ParallelConf, TrainConf};

/// Mutation facade over a [`Job`] used by rewrite passes.
///
/// Holds exclusive access to the job for its lifetime. Each `add_*` call validates the whole
/// batch before touching the job, so a rejected batch leaves the job unchanged.
pub struct JobBuilder<'a> {
    job: &'a mut Job,
    op_index: HashMap<String, usize>,
    producers: HashMap<LogicalBlobName, String>,
}

impl<'a> JobBuilder<'a> {
    pub fn new(job: &'a mut Job) -> Self {
        let mut op_index = HashMap::with_capacity(job.ops.len());
        let mut producers = HashMap::new();
        for (index, op) in job.ops.iter().enumerate() {
            op_index.insert(op.name().to_string(), index);
            for (_, lbn) in op.outputs() {
                producers.insert(lbn.clone(), op.name().to_string());
            }
        }
        Self {
            job,
            op_index,
            producers,
        }
    }

    pub fn job(&self) -> &Job {
        &*self.job
    }

    pub fn contains_op(&self, name: &str) -> bool {
        self.op_index.contains_key(name)
    }

    pub fn op(&self, name: &str) -> Option<&OperatorConf> {
        self.op_index.get(name).map(|&index| &self.job.ops[index])
    }

    pub fn parallel_conf_of(&self, name: &str) -> Option<&ParallelConf> {
        self.job.placement.get(name)
    }

    /// Appends `ops` in order, all placed on `parallel_conf`.
    pub fn add_ops(
        &mut self,
        parallel_conf: &ParallelConf,
        ops: Vec<OperatorConf>,
    ) -> Result<(), GraphBuildError> {
        self.validate_batch(&ops)?;
        for op in ops {
            self.job
                .placement
                .insert(op.name().to_string(), parallel_conf.clone());
            self.push(op);
        }
        Ok(())
    }

    /// Appends a single op, placed on `parallel_conf` when one is given.
    pub fn add_op(
        &mut self,
        op: OperatorConf,
        parallel_conf: Option<&ParallelConf>,
    ) -> Result<(), GraphBuildError> {
        self.validate_batch(std::slice::from_ref(&op))?;
        if let Some(parallel_conf) = parallel_conf {
            self.job
                .placement
                .insert(op.name().to_string(), parallel_conf.clone());
        }
        self.push(op);
        Ok(())
    }

    /// Training configuration of the job, created on first access.
    pub fn mut_train_conf(&mut self) -> &mut TrainConf {
        self.job.job_conf.train_conf.get_or_insert_with(TrainConf::default)
    }

    pub fn set_train_step_lbn(&mut self, lbn: LogicalBlobName) {
        self.mut_train_conf().train_step_lbn = Some(lbn);
    }

    fn validate_batch(&self, ops: &[OperatorConf]) -> Result<(), GraphBuildError> {
        let mut batch_names: HashSet<&str> = HashSet::with_capacity(ops.len());
        let mut batch_producers: HashMap<&LogicalBlobName, &str> = HashMap::new();
        for op in ops {
            if self.op_index.contains_key(op.name()) || !batch_names.insert(op.name()) {
                return Err(GraphBuildError::DuplicateOpName {
                    name: op.name().to_string(),
                });
            }
            op.check_output_bindings()?;
            for (_, lbn) in op.outputs() {
                let existing = self
                    .producers
                    .get(lbn)
                    .map(String::as_str)
                    .or_else(|| batch_producers.get(lbn).copied());
                if let Some(first) = existing {
                    return Err(GraphBuildError::DuplicateProducer {
                        lbn: lbn.clone(),
                        first: first.to_string(),
                        second: op.name().to_string(),
                    });
                }
                batch_producers.insert(lbn, op.name());
            }
        }
        Ok(())
    }

    fn push(&mut self, op: OperatorConf) {
        tracing::trace!(op = op.name(), op_type = op.op_type(), "adding op to job");
        for (_, lbn) in op.outputs() {
            self.producers.insert(lbn.clone(), op.name().to_string());
        }
        self.op_index.insert(op.name().to_string(), self.job.ops.len());
        self.job.ops.push(op);
    }
}
