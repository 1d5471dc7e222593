use crate::error::CompileResult;
use crate::graph::OpGraph;
use crate::job::{Job, JobBuilder, LogicalBlobName, ParallelConf};
use crate::ops::{
    ASSIGN, IDENTITY, INITIALIZER_CONSTANT_INT, NO_SPLIT_AXIS, SCALAR_ADD, VARIABLE,
};
use crate::tensor::{DataType, Shape};
use crate::user_op::UserOpConfBuilder;

use super::{JobPass, PassContext};

/// Injects a persistent int64 step counter into training jobs.
///
/// Adds a non-trainable variable, an identity exposing its value as the train-step blob, a
/// `scalar_add` computing the next step and an `assign` writing it back. All four run on
/// CPU device `0:0` of the master under one scope symbol.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoTrainStep;

impl AutoTrainStep {
    pub const NAME: &'static str = "AutoTrainStep";

    /// Name of the counter variable; the other three ops append a suffix to it.
    pub fn variable_op_name(job_name: &str) -> String {
        format!("System-Train-TrainStep-{job_name}")
    }
}

impl JobPass for AutoTrainStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn is_enabled(&self, job: &Job) -> bool {
        job.job_conf().is_train()
    }

    fn apply(&self, _graph: &OpGraph, job: &mut Job, ctx: &PassContext<'_>) -> CompileResult<()> {
        if job
            .train_conf()
            .is_some_and(|train_conf| train_conf.train_step_lbn.is_some())
        {
            return Ok(());
        }

        let parallel_conf = ParallelConf::cpu_zero_on_master();
        let scope_symbol_id = ctx.scope_resolver.make_scope_symbol(
            &serde_json::to_string(job.job_conf())?,
            &serde_json::to_string(&parallel_conf)?,
            false,
        )?;

        let variable_name = Self::variable_op_name(job.job_name());
        let variable_lbn = LogicalBlobName::new(variable_name.clone(), "out", 0);
        let variable = UserOpConfBuilder::new(variable_name.clone())
            .op(VARIABLE)
            .output("out")
            .attr("shape", Shape::new(vec![1]))
            .attr("data_type", DataType::Int64)
            .attr("initializer", INITIALIZER_CONSTANT_INT)
            .attr("initial_int_value", 0i64)
            .attr("split_axis", NO_SPLIT_AXIS)
            .attr("trainable", false)
            .scope_symbol_id(Some(scope_symbol_id))
            .build();

        let identity_name = format!("{variable_name}-Identity");
        let train_step_lbn = LogicalBlobName::new(identity_name.clone(), "out", 0);
        let identity = UserOpConfBuilder::new(identity_name)
            .op(IDENTITY)
            .input("in", variable_lbn.clone())
            .output("out")
            .scope_symbol_id(Some(scope_symbol_id))
            .build();

        let scalar_add_name = format!("{variable_name}-ScalarAdd");
        let scalar_add = UserOpConfBuilder::new(scalar_add_name.clone())
            .op(SCALAR_ADD)
            .input("in", train_step_lbn.clone())
            .output("out")
            .attr("has_float_operand", false)
            .attr("float_operand", 0.0f64)
            .attr("has_int_operand", true)
            .attr("int_operand", 1i64)
            .scope_symbol_id(Some(scope_symbol_id))
            .build();

        let assign = UserOpConfBuilder::new(format!("{variable_name}-Assign"))
            .op(ASSIGN)
            .input("ref", variable_lbn)
            .input("value", LogicalBlobName::new(scalar_add_name, "out", 0))
            .scope_symbol_id(Some(scope_symbol_id))
            .build();

        let mut builder = JobBuilder::new(job);
        builder.add_ops(&parallel_conf, vec![variable, identity, scalar_add, assign])?;
        tracing::debug!(%train_step_lbn, scope_symbol_id, "injected train step");
        builder.set_train_step_lbn(train_step_lbn);
        Ok(())
    }
}
