mod job_support;

use job_support::{
    add_op, builtin_registry, classifier_job, input_op, job_with_ops, out, variable_op,
};
use jobgraph::autograd::{initial_diff_op_name, GradientEngine};
use jobgraph::error::{GradientBindingError, InferResult};
use jobgraph::job::{JobConfig, LogicalBlobName, TrainConf};
use jobgraph::ops;
use jobgraph::user_op::{
    BackwardContext, BackwardOpSink, InferContext, OpRegistry, OpRegistryBuilder,
    OpTypeRegistration,
};
use jobgraph::{CompileError, DataType, OpGraph, RegistrationError, UserOpConfBuilder};
use pretty_assertions::assert_eq;

fn op_names(backward: &jobgraph::autograd::BackwardGraph) -> Vec<&str> {
    backward.ops.iter().map(|op| op.op.name()).collect()
}

#[test]
fn classifier_gradient_reaches_the_weight_only() -> anyhow::Result<()> {
    let registry = builtin_registry();
    let job = classifier_job("classify");
    let graph = OpGraph::with_inference(&job, &registry)?;
    let backward = GradientEngine::new(&graph, &registry).generate(&[out("loss")])?;

    assert_eq!(
        op_names(&backward),
        vec![
            initial_diff_op_name(&out("loss")).as_str(),
            "loss_grad",
            "logits_grad_b",
        ]
    );

    let seed = &backward.ops[0];
    assert_eq!(seed.op.op_type(), ops::ONES_LIKE);
    assert_eq!(seed.forward_op, "loss");

    let loss_grad = &backward.ops[1];
    assert_eq!(loss_grad.op.op_type(), ops::SPARSE_SOFTMAX_CROSS_ENTROPY_GRAD);
    assert_eq!(loss_grad.op.input("label", 0), Some(&out("label")));
    assert_eq!(
        loss_grad.op.input("prob", 0),
        Some(&LogicalBlobName::new("loss", "prob", 0))
    );

    let weight_grad = &backward.ops[2];
    assert_eq!(weight_grad.op.op_type(), ops::MATMUL);
    assert_eq!(weight_grad.forward_op, "logits");
    assert_eq!(weight_grad.op.input("a", 0), Some(&out("x")));
    assert_eq!(
        weight_grad.op.input("b", 0),
        Some(&LogicalBlobName::new("loss_grad", "prediction_diff", 0))
    );

    assert_eq!(backward.variable_grads.len(), 1);
    assert_eq!(backward.variable_grads.get("w"), Some(&out("logits_grad_b")));
    Ok(())
}

#[test]
fn no_gradient_op_targets_the_label() -> anyhow::Result<()> {
    let registry = builtin_registry();
    let job = classifier_job("classify");
    let graph = OpGraph::with_inference(&job, &registry)?;
    let backward = GradientEngine::new(&graph, &registry).generate(&[out("loss")])?;
    for op in &backward.ops {
        assert!(
            op.op.outputs().all(|(_, lbn)| lbn.op_name() != "label"),
            "{} writes a label gradient",
            op.op.name()
        );
    }
    assert!(backward.ops.iter().all(|op| op.forward_op != "label"));
    Ok(())
}

#[test]
fn fan_in_gradients_are_summed() -> anyhow::Result<()> {
    let registry = builtin_registry();
    let job = job_with_ops(
        JobConfig::train("fan_in", TrainConf::default()),
        vec![variable_op("v", &[3]), add_op("twice", out("v"), out("v"))],
    );
    let graph = OpGraph::with_inference(&job, &registry)?;
    let backward = GradientEngine::new(&graph, &registry).generate(&[out("twice")])?;

    let sum = backward
        .ops
        .iter()
        .find(|op| op.op.op_type() == ops::ADD_N)
        .expect("two contributions are summed");
    assert_eq!(sum.op.input_count("in"), 2);
    assert_eq!(sum.forward_op, "v");
    let grad = backward.variable_grads.get("v").expect("v has a gradient");
    assert_eq!(grad.op_name(), sum.op.name());
    Ok(())
}

#[test]
fn unreachable_and_frozen_variables_get_no_gradient() -> anyhow::Result<()> {
    let registry = builtin_registry();
    let frozen = UserOpConfBuilder::new("frozen")
        .op(ops::VARIABLE)
        .output("out")
        .attr("shape", jobgraph::Shape::new(vec![3]))
        .attr("trainable", false)
        .build();
    let job = job_with_ops(
        JobConfig::train("partial", TrainConf::default()),
        vec![
            variable_op("used", &[3]),
            variable_op("unused", &[3]),
            frozen,
            add_op("sum", out("used"), out("frozen")),
        ],
    );
    let graph = OpGraph::with_inference(&job, &registry)?;
    let backward = GradientEngine::new(&graph, &registry).generate(&[out("sum")])?;
    assert_eq!(
        backward.variable_grads.keys().collect::<Vec<_>>(),
        vec!["used"]
    );
    assert!(backward
        .ops
        .iter()
        .all(|op| !op.op.name().starts_with("sum_grad_y")));
    Ok(())
}

#[test]
fn loss_without_trainable_dependency_emits_nothing() -> anyhow::Result<()> {
    let registry = builtin_registry();
    let job = job_with_ops(
        JobConfig::train("inputs_only", TrainConf::default()),
        vec![
            input_op("a", &[2], DataType::Float32),
            input_op("b", &[2], DataType::Float32),
            add_op("sum", out("a"), out("b")),
        ],
    );
    let graph = OpGraph::with_inference(&job, &registry)?;
    let backward = GradientEngine::new(&graph, &registry).generate(&[out("sum")])?;
    assert!(backward.ops.is_empty());
    assert!(backward.variable_grads.is_empty());
    Ok(())
}

fn infer_copy(ctx: &mut InferContext<'_>) -> InferResult<()> {
    let desc = ctx.input_desc("in", 0)?.clone();
    ctx.set_output_desc("out", 0, desc)
}

fn forgetful_grad(
    _: &BackwardContext<'_>,
    _: &mut BackwardOpSink,
) -> Result<(), GradientBindingError> {
    Ok(())
}

fn registry_with(op_type: &str, grad: bool) -> OpRegistry {
    let mut builder = OpRegistryBuilder::with_builtin_ops().expect("builtins register");
    builder
        .register(
            OpTypeRegistration::new(op_type)
                .input("in")
                .output("out")
                .tensor_desc_infer_fn(infer_copy),
        )
        .expect("custom op registers");
    if grad {
        builder
            .register_grad(op_type, forgetful_grad)
            .expect("custom grad registers");
    }
    builder.finish()
}

fn custom_job(op_type: &str) -> jobgraph::Job {
    let custom = UserOpConfBuilder::new("custom")
        .op(op_type)
        .input("in", out("v"))
        .output("out")
        .build();
    job_with_ops(
        JobConfig::train("custom", TrainConf::default()),
        vec![variable_op("v", &[2]), custom],
    )
}

#[test]
fn unbound_required_gradient_is_an_error() -> anyhow::Result<()> {
    let registry = registry_with("forgetful", true);
    let job = custom_job("forgetful");
    let graph = OpGraph::with_inference(&job, &registry)?;
    let err = GradientEngine::new(&graph, &registry)
        .generate(&[out("custom")])
        .expect_err("forgetful grad binds nothing");
    match err {
        CompileError::GradientBinding(GradientBindingError::UnboundInput { op, arg, index }) => {
            assert_eq!((op.as_str(), arg.as_str(), index), ("custom", "in", 0));
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[test]
fn op_without_gradient_function_is_an_error() -> anyhow::Result<()> {
    let registry = registry_with("opaque", false);
    let job = custom_job("opaque");
    let graph = OpGraph::with_inference(&job, &registry)?;
    let err = GradientEngine::new(&graph, &registry)
        .generate(&[out("custom")])
        .expect_err("opaque has no gradient");
    assert!(matches!(
        err,
        CompileError::Registration(RegistrationError::MissingGradient { ref op, .. }) if op == "custom"
    ));
    Ok(())
}
