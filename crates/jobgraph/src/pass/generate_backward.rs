use crate::autograd::{initial_diff_op_name, GradientEngine};
use crate::error::CompileResult;
use crate::graph::OpGraph;
use crate::job::{Job, JobBuilder};

use super::{JobPass, PassContext};

/// Appends the backward graph of a training job's losses and records each trainable
/// variable's gradient blob in the train configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenerateBackward;

impl GenerateBackward {
    pub const NAME: &'static str = "GenerateBackward";
}

impl JobPass for GenerateBackward {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn is_enabled(&self, job: &Job) -> bool {
        job.train_conf()
            .is_some_and(|train_conf| !train_conf.loss_lbns.is_empty())
    }

    fn apply(&self, graph: &OpGraph, job: &mut Job, ctx: &PassContext<'_>) -> CompileResult<()> {
        let Some(train_conf) = job.train_conf() else {
            return Ok(());
        };
        let losses = train_conf.loss_lbns.clone();
        let already_generated = !train_conf.variable_grad_lbns.is_empty()
            || losses
                .iter()
                .any(|loss| job.contains_op(&initial_diff_op_name(loss)));
        if already_generated {
            return Ok(());
        }

        let backward = GradientEngine::new(graph, ctx.registry).generate(&losses)?;
        let mut builder = JobBuilder::new(job);
        for backward_op in backward.ops {
            let parallel_conf = builder.parallel_conf_of(&backward_op.forward_op).cloned();
            builder.add_op(backward_op.op, parallel_conf.as_ref())?;
        }
        builder.mut_train_conf().variable_grad_lbns = backward.variable_grads;
        Ok(())
    }
}
