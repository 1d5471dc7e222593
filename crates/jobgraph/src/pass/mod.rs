//! Job rewrite passes and the driver that applies them once per compilation.

mod auto_train_step;
mod generate_backward;

use std::fmt;
use std::sync::Arc;

use crate::compiler::CompileOptions;
use crate::error::{CompileError, CompileResult, RegistrationError};
use crate::graph::OpGraph;
use crate::job::{Job, ScopeResolver};
use crate::user_op::OpRegistry;

pub use auto_train_step::AutoTrainStep;
pub use generate_backward::GenerateBackward;

/// Services a pass may call while rewriting a job.
#[derive(Clone, Copy)]
pub struct PassContext<'a> {
    pub registry: &'a OpRegistry,
    pub scope_resolver: &'a dyn ScopeResolver,
    pub options: &'a CompileOptions,
}

impl<'a> PassContext<'a> {
    pub fn new(
        registry: &'a OpRegistry,
        scope_resolver: &'a dyn ScopeResolver,
        options: &'a CompileOptions,
    ) -> Self {
        Self {
            registry,
            scope_resolver,
            options,
        }
    }
}

/// Named rewrite unit.
///
/// `apply` must be idempotent: when the pass's post-condition already holds on `job` it
/// returns without mutating anything.
pub trait JobPass: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reads job-level configuration only.
    fn is_enabled(&self, job: &Job) -> bool;

    /// `graph` is the inferred graph of `job` as it was when the pass started.
    fn apply(&self, graph: &OpGraph, job: &mut Job, ctx: &PassContext<'_>) -> CompileResult<()>;
}

/// Mutable pass table used during process start-up.
#[derive(Default)]
pub struct PassRegistryBuilder {
    passes: Vec<Arc<dyn JobPass>>,
}

impl PassRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder holding the default pipeline: backward generation, then train-step injection.
    pub fn with_default_passes() -> Result<Self, RegistrationError> {
        let mut builder = Self::new();
        builder
            .register(Arc::new(GenerateBackward))?
            .register(Arc::new(AutoTrainStep))?;
        Ok(builder)
    }

    /// Appends `pass`; passes run in registration order.
    pub fn register(&mut self, pass: Arc<dyn JobPass>) -> Result<&mut Self, RegistrationError> {
        if self.passes.iter().any(|known| known.name() == pass.name()) {
            return Err(RegistrationError::DuplicatePass {
                name: pass.name().to_string(),
            });
        }
        tracing::trace!(pass = pass.name(), "registered pass");
        self.passes.push(pass);
        Ok(self)
    }

    pub fn finish(self) -> PassRegistry {
        PassRegistry {
            passes: self.passes,
        }
    }
}

/// Frozen, ordered pass table.
pub struct PassRegistry {
    passes: Vec<Arc<dyn JobPass>>,
}

impl PassRegistry {
    pub fn default_passes() -> Result<Self, RegistrationError> {
        Ok(PassRegistryBuilder::with_default_passes()?.finish())
    }

    pub fn lookup(&self, name: &str) -> Result<&Arc<dyn JobPass>, RegistrationError> {
        self.passes
            .iter()
            .find(|pass| pass.name() == name)
            .ok_or_else(|| RegistrationError::PassNotFound {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|pass| pass.name()).collect()
    }

    pub fn passes(&self) -> impl Iterator<Item = &Arc<dyn JobPass>> {
        self.passes.iter()
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}

impl fmt::Debug for PassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    Disabled,
    Applying,
    Applied,
    Failed,
}

impl fmt::Display for PassState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PassState::Disabled => "disabled",
            PassState::Applying => "applying",
            PassState::Applied => "applied",
            PassState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Outcome of one pass in one compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassRecord {
    pub pass: &'static str,
    pub state: PassState,
    pub ops_added: usize,
}

/// Runs every enabled pass exactly once, in registration order, stopping at the first failure.
///
/// A failed run leaves the job partially rewritten; callers discard it.
pub struct PassDriver<'a> {
    passes: &'a PassRegistry,
    ctx: PassContext<'a>,
}

impl<'a> PassDriver<'a> {
    pub fn new(passes: &'a PassRegistry, ctx: PassContext<'a>) -> Self {
        Self { passes, ctx }
    }

    fn is_switched_off(&self, pass: &dyn JobPass, job: &Job) -> bool {
        self.ctx.options.disabled_passes.contains(pass.name())
            || job.job_conf().disabled_passes.contains(pass.name())
            || !pass.is_enabled(job)
    }

    pub fn run(&self, job: &mut Job) -> CompileResult<Vec<PassRecord>> {
        let mut records = Vec::with_capacity(self.passes.len());
        for pass in self.passes.passes() {
            let name = pass.name();
            if self.is_switched_off(pass.as_ref(), job) {
                tracing::debug!(pass = name, state = %PassState::Disabled, "skipping pass");
                records.push(PassRecord {
                    pass: name,
                    state: PassState::Disabled,
                    ops_added: 0,
                });
                continue;
            }

            tracing::debug!(pass = name, state = %PassState::Applying, "applying pass");
            let ops_before = job.op_count();
            if let Err(source) = self.apply_one(pass.as_ref(), job) {
                tracing::debug!(pass = name, state = %PassState::Failed, error = %source, "pass failed");
                return Err(CompileError::Pass {
                    pass: name.to_string(),
                    source: Box::new(source),
                });
            }
            let ops_added = job.op_count().saturating_sub(ops_before);
            if self.ctx.options.log_pass_stats {
                tracing::info!(pass = name, ops_added, total_ops = job.op_count(), "pass applied");
            } else {
                tracing::debug!(pass = name, state = %PassState::Applied, ops_added, "pass applied");
            }
            records.push(PassRecord {
                pass: name,
                state: PassState::Applied,
                ops_added,
            });
        }
        Ok(records)
    }

    fn apply_one(&self, pass: &dyn JobPass, job: &mut Job) -> CompileResult<()> {
        let graph = OpGraph::with_inference(job, self.ctx.registry)?;
        pass.apply(&graph, job, &self.ctx)?;
        if self.ctx.options.validate_after_each_pass {
            OpGraph::with_inference(job, self.ctx.registry)?;
        }
        Ok(())
    }
}
