mod job_support;

use job_support::{builtin_registry, out};
use jobgraph::compiler::CompileOptions;
use jobgraph::job::{
    AttrValue, Job, JobConfig, LogicalBlobName, ParallelConf, SequentialScopeResolver, TrainConf,
};
use jobgraph::ops;
use jobgraph::pass::{AutoTrainStep, JobPass, PassContext};
use jobgraph::{DataType, OpGraph, Shape, TensorDesc};
use pretty_assertions::assert_eq;

fn train_job(name: &str) -> Job {
    Job::new(JobConfig::train(name, TrainConf::default()))
}

fn apply(job: &mut Job, resolver: &SequentialScopeResolver) -> anyhow::Result<()> {
    let registry = builtin_registry();
    let options = CompileOptions::default();
    let ctx = PassContext::new(&registry, resolver, &options);
    let graph = OpGraph::with_inference(job, &registry)?;
    AutoTrainStep.apply(&graph, job, &ctx)?;
    Ok(())
}

#[test]
fn empty_training_job_gains_four_ops() -> anyhow::Result<()> {
    let resolver = SequentialScopeResolver::new(7);
    let mut job = train_job("mnist");
    apply(&mut job, &resolver)?;

    let names: Vec<&str> = job.ops().iter().map(|op| op.name()).collect();
    assert_eq!(
        names,
        vec![
            "System-Train-TrainStep-mnist",
            "System-Train-TrainStep-mnist-Identity",
            "System-Train-TrainStep-mnist-ScalarAdd",
            "System-Train-TrainStep-mnist-Assign",
        ]
    );
    let train_step = job
        .train_conf()
        .and_then(|conf| conf.train_step_lbn.clone())
        .expect("train step recorded");
    assert_eq!(
        train_step,
        LogicalBlobName::new("System-Train-TrainStep-mnist-Identity", "out", 0)
    );
    for op in job.ops() {
        assert_eq!(op.scope_symbol_id(), Some(7), "scope of {}", op.name());
        assert_eq!(
            job.parallel_conf_of(op.name()),
            Some(&ParallelConf::cpu_zero_on_master())
        );
    }
    assert_eq!(resolver.len(), 1);
    Ok(())
}

#[test]
fn rerun_adds_nothing() -> anyhow::Result<()> {
    let resolver = SequentialScopeResolver::default();
    let mut job = train_job("mnist");
    apply(&mut job, &resolver)?;
    let after_first = job.clone();

    apply(&mut job, &resolver)?;
    assert_eq!(job.op_count(), 4);
    assert_eq!(job, after_first);
    Ok(())
}

#[test]
fn counter_variable_is_int64_scalar_and_frozen() -> anyhow::Result<()> {
    let resolver = SequentialScopeResolver::default();
    let mut job = train_job("resnet");
    apply(&mut job, &resolver)?;

    let variable = job
        .op("System-Train-TrainStep-resnet")
        .expect("counter variable exists");
    assert_eq!(variable.op_type(), ops::VARIABLE);
    assert_eq!(variable.attr("shape"), Some(&AttrValue::Shape(Shape::new(vec![1]))));
    assert_eq!(
        variable.attr("data_type"),
        Some(&AttrValue::DataType(DataType::Int64))
    );
    assert_eq!(
        variable.attr("initializer"),
        Some(&AttrValue::String(ops::INITIALIZER_CONSTANT_INT.to_string()))
    );
    assert_eq!(variable.attr("trainable"), Some(&AttrValue::Bool(false)));

    let step = job
        .op("System-Train-TrainStep-resnet-ScalarAdd")
        .expect("increment exists");
    assert_eq!(step.attr("int_operand"), Some(&AttrValue::Int64(1)));
    assert_eq!(step.input("in", 0), Some(&out("System-Train-TrainStep-resnet-Identity")));

    let assign = job
        .op("System-Train-TrainStep-resnet-Assign")
        .expect("write-back exists");
    assert_eq!(assign.input("ref", 0), Some(&out("System-Train-TrainStep-resnet")));
    assert_eq!(assign.output_count("out"), 0);

    let graph = OpGraph::with_inference(&job, &builtin_registry())?;
    assert_eq!(
        graph.logical_blob_desc(&out("System-Train-TrainStep-resnet-ScalarAdd")),
        Some(&TensorDesc::new(Shape::new(vec![1]), DataType::Int64))
    );
    Ok(())
}

#[test]
fn existing_train_step_is_left_alone() -> anyhow::Result<()> {
    let resolver = SequentialScopeResolver::default();
    let mut job = Job::new(JobConfig::train(
        "custom",
        TrainConf {
            train_step_lbn: Some(out("my_step")),
            ..TrainConf::default()
        },
    ));
    apply(&mut job, &resolver)?;
    assert_eq!(job.op_count(), 0);
    assert!(resolver.is_empty());
    Ok(())
}

#[test]
fn only_training_jobs_enable_the_pass() {
    assert!(AutoTrainStep.is_enabled(&train_job("t")));
    assert!(!AutoTrainStep.is_enabled(&Job::new(JobConfig::predict("p"))));
}
