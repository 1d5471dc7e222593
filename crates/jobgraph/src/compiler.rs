//! Compilation entry point bundling the registries, the scope resolver and the options.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::env;
use crate::error::{CompileResult, RegistrationError};
use crate::graph::OpGraph;
use crate::job::{Job, ScopeResolver, SequentialScopeResolver};
use crate::pass::{PassContext, PassDriver, PassRecord, PassRegistry};
use crate::user_op::OpRegistry;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOptions {
    /// Log per-pass op deltas at `info` instead of `debug`.
    pub log_pass_stats: bool,
    /// Passes skipped for every job, on top of each job's own `disabled_passes`.
    pub disabled_passes: BTreeSet<String>,
    /// Re-run inference on the job after every applied pass.
    pub validate_after_each_pass: bool,
}

impl CompileOptions {
    /// Reads `JOBGRAPH_PASS_STATS`, `JOBGRAPH_DISABLED_PASSES` and `JOBGRAPH_VALIDATE_PASSES`.
    pub fn from_env() -> Self {
        Self::from_lookup(env::process_env)
    }

    /// Same as [`CompileOptions::from_env`] with a caller-provided variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            log_pass_stats: env::flag(&lookup, env::PASS_STATS),
            disabled_passes: env::name_list(&lookup, env::DISABLED_PASSES),
            validate_after_each_pass: env::flag(&lookup, env::VALIDATE_PASSES),
        }
    }

    pub fn disable_pass(mut self, name: impl Into<String>) -> Self {
        self.disabled_passes.insert(name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileReport {
    pub job_name: String,
    pub passes: Vec<PassRecord>,
    pub ops_before: usize,
    pub ops_after: usize,
}

impl CompileReport {
    pub fn ops_added(&self) -> usize {
        self.ops_after.saturating_sub(self.ops_before)
    }

    pub fn record(&self, pass: &str) -> Option<&PassRecord> {
        self.passes.iter().find(|record| record.pass == pass)
    }
}

/// Shared compilation context; one instance serves any number of jobs, concurrently.
#[derive(Clone)]
pub struct JobCompiler {
    registry: Arc<OpRegistry>,
    passes: Arc<PassRegistry>,
    scope_resolver: Arc<dyn ScopeResolver>,
    options: CompileOptions,
}

impl fmt::Debug for JobCompiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobCompiler")
            .field("op_types", &self.registry.len())
            .field("passes", &self.passes)
            .field("options", &self.options)
            .finish()
    }
}

impl JobCompiler {
    pub fn new(
        registry: Arc<OpRegistry>,
        passes: Arc<PassRegistry>,
        scope_resolver: Arc<dyn ScopeResolver>,
    ) -> Self {
        Self {
            registry,
            passes,
            scope_resolver,
            options: CompileOptions::default(),
        }
    }

    /// Built-in ops, default passes, an in-process scope resolver and options from the
    /// environment.
    pub fn builtin() -> Result<Self, RegistrationError> {
        Ok(Self::new(
            Arc::new(OpRegistry::builtin()?),
            Arc::new(PassRegistry::default_passes()?),
            Arc::new(SequentialScopeResolver::default()),
        )
        .with_options(CompileOptions::from_env()))
    }

    pub fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &OpRegistry {
        &self.registry
    }

    pub fn passes(&self) -> &PassRegistry {
        &self.passes
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Rewrites `job` in place and checks that the result still infers.
    ///
    /// On error the job may be partially rewritten and should be discarded.
    pub fn compile(&self, job: &mut Job) -> CompileResult<CompileReport> {
        let ops_before = job.op_count();
        let ctx = PassContext::new(&self.registry, self.scope_resolver.as_ref(), &self.options);
        let passes = PassDriver::new(&self.passes, ctx).run(job)?;
        OpGraph::with_inference(job, &self.registry)?;

        let report = CompileReport {
            job_name: job.job_name().to_string(),
            passes,
            ops_before,
            ops_after: job.op_count(),
        };
        tracing::info!(
            job = %report.job_name,
            ops_before,
            ops_after = report.ops_after,
            "compiled job"
        );
        Ok(report)
    }
}
