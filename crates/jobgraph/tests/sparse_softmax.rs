mod job_support;

use job_support::{builtin_registry, input_op, job_with_ops, out, sparse_softmax_op};
use jobgraph::job::{JobConfig, LogicalBlobName, OpArg};
use jobgraph::user_op::SbpParallel;
use jobgraph::{BatchAxis, CompileError, DataType, InferError, OpGraph, Shape, TensorDesc};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;

fn infer_classifier(
    prediction: &[usize],
    label: &[usize],
    label_type: DataType,
) -> Result<OpGraph, CompileError> {
    let job = job_with_ops(
        JobConfig::predict("classify"),
        vec![
            input_op("prediction", prediction, DataType::Float32),
            input_op("label", label, label_type),
            sparse_softmax_op("loss", out("prediction"), out("label")),
        ],
    );
    OpGraph::with_inference(&job, &builtin_registry())
}

fn shape_error(err: &CompileError) -> String {
    match err.infer_error() {
        Some(InferError::Shape(message)) => message.clone(),
        other => panic!("expected a shape error, got {other:?} from {err}"),
    }
}

#[test]
fn matching_label_infers_prob_and_out() {
    let graph = infer_classifier(&[8, 10], &[8], DataType::Int32).expect("shapes agree");
    let prob = LogicalBlobName::new("loss", "prob", 0);
    assert_eq!(
        graph.logical_blob_desc(&prob),
        Some(&TensorDesc::new(Shape::new(vec![8, 10]), DataType::Float32))
    );
    assert_eq!(
        graph.logical_blob_desc(&out("loss")),
        Some(&TensorDesc::new(Shape::new(vec![8]), DataType::Float32))
    );
    assert_eq!(graph.batch_axis(&prob), Some(BatchAxis::at(0)));
    assert_eq!(graph.batch_axis(&out("loss")), Some(BatchAxis::at(0)));
}

#[test]
fn mismatched_leading_dimension_is_rejected() {
    let err = infer_classifier(&[8, 10], &[4], DataType::Int64).expect_err("8 != 4");
    let message = shape_error(&err);
    assert!(message.contains("dimension mismatch"), "{message}");
}

#[test]
fn label_rank_must_be_one_less_than_prediction_rank() {
    let err = infer_classifier(&[8, 10], &[8, 10], DataType::Int64).expect_err("rank 2 label");
    assert!(shape_error(&err).contains("rank"));

    let err = infer_classifier(&[8], &[8], DataType::Int64).expect_err("rank 1 prediction");
    assert!(shape_error(&err).contains("rank >= 2"));
}

#[test]
fn float_label_is_rejected() {
    let err = infer_classifier(&[8, 10], &[8], DataType::Float32).expect_err("float label");
    assert!(shape_error(&err).contains("index data type"));
}

#[test]
fn every_argument_splits_on_the_batch_axis() {
    let graph = infer_classifier(&[8, 10], &[8], DataType::Int64).expect("shapes agree");
    let signatures = graph.sbp_signatures("loss").expect("loss is a node");
    assert_eq!(signatures.len(), 1);
    let signature = &signatures[0];
    assert_eq!(signature.len(), 4);
    assert!(signature
        .iter()
        .all(|(_, sbp)| sbp == SbpParallel::Split(0)));
}

#[test]
fn label_is_not_differentiable() {
    let graph = infer_classifier(&[8, 10], &[8], DataType::Int64).expect("shapes agree");
    let node = graph.node_by_name("loss").expect("loss is a node");
    assert!(node.input_requires_grad(&OpArg::new("prediction", 0)));
    assert!(!node.input_requires_grad(&OpArg::new("label", 0)));
}

proptest! {
    #![proptest_config(ProptestConfig {
        failure_persistence: None,
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn inference_is_deterministic(
        leading in proptest::collection::vec(1usize..6, 1..3),
        classes in 1usize..16,
    ) {
        let mut prediction = leading.clone();
        prediction.push(classes);
        let first = infer_classifier(&prediction, &leading, DataType::Int32).expect("shapes agree");
        let second = infer_classifier(&prediction, &leading, DataType::Int32).expect("shapes agree");
        for blob in ["prob", "out"] {
            let lbn = LogicalBlobName::new("loss", blob, 0);
            prop_assert_eq!(first.logical_blob_desc(&lbn), second.logical_blob_desc(&lbn));
            prop_assert_eq!(first.batch_axis(&lbn), second.batch_axis(&lbn));
        }
        prop_assert_eq!(
            first.logical_blob_desc(&out("loss")).map(|desc| desc.shape.dims().to_vec()),
            Some(leading)
        );
        prop_assert_eq!(first.sbp_signatures("loss"), second.sbp_signatures("loss"));
    }
}
