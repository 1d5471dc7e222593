mod job_support;

use std::collections::BTreeMap;

use job_support::{builtin_registry, input_op, job_with_ops, matmul_op, out, variable_op};
use jobgraph::error::InferResult;
use jobgraph::job::JobConfig;
use jobgraph::user_op::{
    InferContext, OpRegistryBuilder, OpTypeRegistration, SbpContext, SbpParallel, SbpSignature,
};
use jobgraph::{DataType, InferError, OpGraph, UserOpConfBuilder};
use pretty_assertions::assert_eq;

fn projection() -> OpGraph {
    let job = job_with_ops(
        JobConfig::predict("project"),
        vec![
            input_op("x", &[8, 4], DataType::Float32),
            variable_op("w", &[4, 10]),
            matmul_op("logits", out("x"), out("w")),
        ],
    );
    OpGraph::with_inference(&job, &builtin_registry()).expect("projection infers")
}

fn candidate(graph: &OpGraph, op: &str, index: usize) -> SbpSignature {
    graph.sbp_signatures(op).expect("op is a node")[index].clone()
}

fn sbp_message(graph: &OpGraph, assignment: &BTreeMap<String, SbpSignature>) -> String {
    let err = graph
        .check_sbp_assignment(assignment)
        .expect_err("assignment is inconsistent");
    match err.infer_error() {
        Some(InferError::Sbp(message)) => message.clone(),
        other => panic!("expected an sbp error, got {other:?} from {err}"),
    }
}

#[test]
fn matmul_declares_row_column_and_reduction_splits() {
    let graph = projection();
    let signatures = graph.sbp_signatures("logits").expect("logits is a node");
    let layout: Vec<_> = signatures
        .iter()
        .map(|signature| {
            (
                signature.get("a", 0),
                signature.get("b", 0),
                signature.get("out", 0),
            )
        })
        .collect();
    assert_eq!(
        layout,
        vec![
            (
                Some(SbpParallel::Split(0)),
                Some(SbpParallel::Broadcast),
                Some(SbpParallel::Split(0)),
            ),
            (
                Some(SbpParallel::Broadcast),
                Some(SbpParallel::Split(1)),
                Some(SbpParallel::Split(1)),
            ),
            (
                Some(SbpParallel::Split(1)),
                Some(SbpParallel::Split(0)),
                Some(SbpParallel::PartialSum),
            ),
        ]
    );
}

#[test]
fn input_offers_batch_split_then_broadcast() {
    let graph = projection();
    let signatures = graph.sbp_signatures("x").expect("x is a node");
    let out_sbp: Vec<_> = signatures.iter().map(|s| s.get("out", 0)).collect();
    assert_eq!(
        out_sbp,
        vec![Some(SbpParallel::Split(0)), Some(SbpParallel::Broadcast)]
    );
}

#[test]
fn consistent_data_parallel_assignment_is_accepted() {
    let graph = projection();
    let assignment = BTreeMap::from([
        ("x".to_string(), candidate(&graph, "x", 0)),
        ("w".to_string(), candidate(&graph, "w", 0)),
        ("logits".to_string(), candidate(&graph, "logits", 0)),
    ]);
    graph
        .check_sbp_assignment(&assignment)
        .expect("split rows, broadcast weights");
}

#[test]
fn producer_consumer_mismatch_is_rejected() {
    let graph = projection();
    let assignment = BTreeMap::from([
        ("x".to_string(), candidate(&graph, "x", 1)),
        ("w".to_string(), candidate(&graph, "w", 0)),
        ("logits".to_string(), candidate(&graph, "logits", 0)),
    ]);
    let message = sbp_message(&graph, &assignment);
    assert!(message.contains("consumed as S(0) but produced as B"), "{message}");
}

#[test]
fn undeclared_or_missing_selection_is_rejected() {
    let graph = projection();
    let mut assignment = BTreeMap::from([
        ("x".to_string(), candidate(&graph, "x", 0)),
        ("w".to_string(), candidate(&graph, "x", 0)),
        ("logits".to_string(), candidate(&graph, "logits", 0)),
    ]);
    assert!(sbp_message(&graph, &assignment).contains("not declared legal"));

    assignment.remove("w");
    assert!(sbp_message(&graph, &assignment).contains("no signature selected"));
}

fn infer_copy(ctx: &mut InferContext<'_>) -> InferResult<()> {
    let desc = ctx.input_desc("in", 0)?.clone();
    ctx.set_output_desc("out", 0, desc)
}

fn split_out_on_third_axis(ctx: &SbpContext<'_>) -> InferResult<Vec<SbpSignature>> {
    Ok(vec![ctx.new_builder().split("out", 0, 2).build()?])
}

#[test]
fn split_axis_beyond_slot_rank_is_rejected() {
    let mut builder = OpRegistryBuilder::with_builtin_ops().expect("builtins register");
    builder
        .register(
            OpTypeRegistration::new("overreach")
                .input("in")
                .output("out")
                .tensor_desc_infer_fn(infer_copy)
                .sbp_fn(split_out_on_third_axis),
        )
        .expect("custom op registers");
    let registry = builder.finish();
    let overreach = UserOpConfBuilder::new("wide")
        .op("overreach")
        .input("in", out("x"))
        .output("out")
        .build();
    let job = job_with_ops(
        JobConfig::predict("overreach"),
        vec![input_op("x", &[8, 4], DataType::Float32), overreach],
    );
    let err = OpGraph::with_inference(&job, &registry).expect_err("out has rank 2");
    assert_eq!(
        err.infer_error(),
        Some(&InferError::Sbp(
            "split axis 2 is out of range for `out_0` of rank 2".to_string()
        ))
    );
}
