mod job_support;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use job_support::{builtin_registry, classifier_job, out};
use jobgraph::error::ScopeResolutionError;
use jobgraph::job::{Job, JobConfig, SequentialScopeResolver};
use jobgraph::pass::{
    AutoTrainStep, GenerateBackward, JobPass, PassContext, PassDriver, PassRecord,
    PassRegistry, PassRegistryBuilder, PassState,
};
use jobgraph::{CompileError, CompileOptions, JobCompiler, OpGraph, RegistrationError};
use pretty_assertions::assert_eq;

struct Failing;

impl JobPass for Failing {
    fn name(&self) -> &'static str {
        "Failing"
    }

    fn is_enabled(&self, _: &Job) -> bool {
        true
    }

    fn apply(&self, _: &OpGraph, _: &mut Job, _: &PassContext<'_>) -> jobgraph::CompileResult<()> {
        Err(ScopeResolutionError::new("resolver offline").into())
    }
}

#[derive(Default)]
struct Counting {
    calls: AtomicUsize,
}

impl JobPass for Counting {
    fn name(&self) -> &'static str {
        "Counting"
    }

    fn is_enabled(&self, _: &Job) -> bool {
        true
    }

    fn apply(&self, _: &OpGraph, _: &mut Job, _: &PassContext<'_>) -> jobgraph::CompileResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn run(
    passes: &PassRegistry,
    options: &CompileOptions,
    job: &mut Job,
) -> jobgraph::CompileResult<Vec<PassRecord>> {
    let registry = builtin_registry();
    let resolver = SequentialScopeResolver::default();
    let ctx = PassContext::new(&registry, &resolver, options);
    PassDriver::new(passes, ctx).run(job)
}

#[test]
fn first_failure_stops_the_pipeline() {
    let counting = Arc::new(Counting::default());
    let mut builder = PassRegistryBuilder::new();
    builder
        .register(Arc::new(Failing))
        .and_then(|builder| builder.register(counting.clone()))
        .expect("distinct names");
    let passes = builder.finish();

    let mut job = Job::new(JobConfig::predict("p"));
    let err = run(&passes, &CompileOptions::default(), &mut job).expect_err("Failing fails");
    match &err {
        CompileError::Pass { pass, .. } => assert_eq!(pass, "Failing"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(err.root(), CompileError::ScopeResolution(_)));
    assert!(err.to_string().contains("resolver offline"), "{err}");
    assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn passes_run_once_in_registration_order() -> anyhow::Result<()> {
    let counting = Arc::new(Counting::default());
    let mut builder = PassRegistryBuilder::with_default_passes()?;
    builder.register(counting.clone())?;
    let passes = builder.finish();
    assert_eq!(
        passes.names(),
        vec![GenerateBackward::NAME, AutoTrainStep::NAME, "Counting"]
    );

    let mut job = Job::new(JobConfig::predict("p"));
    let records = run(&passes, &CompileOptions::default(), &mut job)?;
    let states: Vec<(&str, PassState)> = records.iter().map(|r| (r.pass, r.state)).collect();
    assert_eq!(
        states,
        vec![
            (GenerateBackward::NAME, PassState::Disabled),
            (AutoTrainStep::NAME, PassState::Disabled),
            ("Counting", PassState::Applied),
        ]
    );
    assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn options_and_job_config_can_disable_passes() -> anyhow::Result<()> {
    let passes = PassRegistry::default_passes()?;

    let mut job = classifier_job("opts");
    let options = CompileOptions::default().disable_pass(GenerateBackward::NAME);
    let records = run(&passes, &options, &mut job)?;
    assert_eq!(records[0].state, PassState::Disabled);
    assert_eq!(records[1].state, PassState::Applied);
    assert!(job.train_conf().is_some_and(|conf| conf.variable_grad_lbns.is_empty()));

    let mut job = classifier_job("conf");
    let mut job_conf = job.job_conf().clone();
    job_conf.disabled_passes.insert(AutoTrainStep::NAME.to_string());
    let mut raw = serde_json::to_value(&job)?;
    raw["job_conf"] = serde_json::to_value(&job_conf)?;
    let mut job: Job = serde_json::from_value(raw)?;

    let records = run(&passes, &CompileOptions::default(), &mut job)?;
    assert_eq!(records[0].state, PassState::Applied);
    assert_eq!(records[1].state, PassState::Disabled);
    assert!(job.train_conf().is_some_and(|conf| conf.train_step_lbn.is_none()));
    Ok(())
}

#[test]
fn pass_registry_rejects_duplicates_and_unknown_names() -> anyhow::Result<()> {
    let mut builder = PassRegistryBuilder::with_default_passes()?;
    assert_eq!(
        builder.register(Arc::new(AutoTrainStep)).err(),
        Some(RegistrationError::DuplicatePass {
            name: AutoTrainStep::NAME.to_string()
        })
    );
    let passes = builder.finish();
    assert_eq!(passes.len(), 2);
    assert_eq!(passes.lookup(AutoTrainStep::NAME)?.name(), AutoTrainStep::NAME);
    assert_eq!(
        passes.lookup("FuseAdd").err(),
        Some(RegistrationError::PassNotFound {
            name: "FuseAdd".to_string()
        })
    );
    Ok(())
}

#[test]
fn options_parse_from_variables() {
    let options = CompileOptions::from_lookup(|key| match key {
        "JOBGRAPH_PASS_STATS" => Some("Yes".to_string()),
        "JOBGRAPH_DISABLED_PASSES" => Some(" AutoTrainStep, ,GenerateBackward ".to_string()),
        "JOBGRAPH_VALIDATE_PASSES" => Some("0".to_string()),
        _ => None,
    });
    assert!(options.log_pass_stats);
    assert!(!options.validate_after_each_pass);
    assert_eq!(
        options.disabled_passes,
        BTreeSet::from(["AutoTrainStep".to_string(), "GenerateBackward".to_string()])
    );

    assert_eq!(CompileOptions::from_lookup(|_| None), CompileOptions::default());
}

fn compiler() -> JobCompiler {
    JobCompiler::new(
        Arc::new(builtin_registry()),
        Arc::new(PassRegistry::default_passes().expect("default passes register")),
        Arc::new(SequentialScopeResolver::default()),
    )
    .with_options(CompileOptions {
        validate_after_each_pass: true,
        ..CompileOptions::default()
    })
}

#[test]
fn compiling_a_training_job_adds_backward_and_train_step() -> anyhow::Result<()> {
    let compiler = compiler();
    let mut job = classifier_job("classify");
    let report = compiler.compile(&mut job)?;

    assert_eq!(report.job_name, "classify");
    assert_eq!(report.ops_before, 5);
    assert_eq!(
        report.record(GenerateBackward::NAME).map(|r| (r.state, r.ops_added)),
        Some((PassState::Applied, 3))
    );
    assert_eq!(
        report.record(AutoTrainStep::NAME).map(|r| (r.state, r.ops_added)),
        Some((PassState::Applied, 4))
    );
    assert_eq!(report.ops_added(), 7);

    let train_conf = job.train_conf().expect("training job");
    assert_eq!(
        train_conf.variable_grad_lbns.get("w"),
        Some(&out("logits_grad_b"))
    );
    assert_eq!(
        train_conf.train_step_lbn,
        Some(out("System-Train-TrainStep-classify-Identity"))
    );
    assert_eq!(
        job.parallel_conf_of("loss_grad"),
        job.parallel_conf_of("loss")
    );
    Ok(())
}

#[test]
fn recompiling_is_a_no_op() -> anyhow::Result<()> {
    let compiler = compiler();
    let mut job = classifier_job("classify");
    compiler.compile(&mut job)?;
    let compiled = job.clone();

    let report = compiler.compile(&mut job)?;
    assert_eq!(report.ops_added(), 0);
    assert_eq!(job, compiled);
    Ok(())
}

#[test]
fn predict_jobs_pass_through_unchanged() -> anyhow::Result<()> {
    let mut job = job_support::job_with_ops(
        JobConfig::predict("serve"),
        vec![job_support::input_op("x", &[2], jobgraph::DataType::Float32)],
    );
    let before = job.clone();
    let report = compiler().compile(&mut job)?;
    assert!(report.passes.iter().all(|r| r.state == PassState::Disabled));
    assert_eq!(job, before);
    Ok(())
}

#[test]
fn compiler_serves_jobs_from_many_threads() {
    let compiler = compiler();
    let handles: Vec<_> = (0..4)
        .map(|index| {
            let compiler = compiler.clone();
            std::thread::spawn(move || {
                let mut job = classifier_job(&format!("job{index}"));
                compiler.compile(&mut job).map(|report| report.ops_after)
            })
        })
        .collect();
    for handle in handles {
        let ops_after = handle.join().expect("compile thread").expect("job compiles");
        assert_eq!(ops_after, 12);
    }
}
