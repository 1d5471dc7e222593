#![allow(dead_code)]

use jobgraph::job::{
    Job, JobBuilder, JobConfig, LogicalBlobName, OperatorConf, ParallelConf, TrainConf,
};
use jobgraph::ops;
use jobgraph::{DataType, OpRegistry, Shape, UserOpConfBuilder};

pub fn builtin_registry() -> OpRegistry {
    OpRegistry::builtin().expect("built-in ops register")
}

pub fn out(op_name: &str) -> LogicalBlobName {
    LogicalBlobName::new(op_name, "out", 0)
}

pub fn input_op(name: &str, dims: &[usize], data_type: DataType) -> OperatorConf {
    UserOpConfBuilder::new(name)
        .op(ops::INPUT)
        .output("out")
        .attr("shape", Shape::from(dims))
        .attr("data_type", data_type)
        .build()
}

pub fn variable_op(name: &str, dims: &[usize]) -> OperatorConf {
    UserOpConfBuilder::new(name)
        .op(ops::VARIABLE)
        .output("out")
        .attr("shape", Shape::from(dims))
        .build()
}

pub fn identity_op(name: &str, input: LogicalBlobName) -> OperatorConf {
    UserOpConfBuilder::new(name)
        .op(ops::IDENTITY)
        .input("in", input)
        .output("out")
        .build()
}

pub fn add_op(name: &str, x: LogicalBlobName, y: LogicalBlobName) -> OperatorConf {
    UserOpConfBuilder::new(name)
        .op(ops::ADD)
        .input("x", x)
        .input("y", y)
        .output("out")
        .build()
}

pub fn matmul_op(name: &str, a: LogicalBlobName, b: LogicalBlobName) -> OperatorConf {
    UserOpConfBuilder::new(name)
        .op(ops::MATMUL)
        .input("a", a)
        .input("b", b)
        .output("out")
        .build()
}

pub fn sparse_softmax_op(
    name: &str,
    prediction: LogicalBlobName,
    label: LogicalBlobName,
) -> OperatorConf {
    UserOpConfBuilder::new(name)
        .op(ops::SPARSE_SOFTMAX_CROSS_ENTROPY)
        .input("prediction", prediction)
        .input("label", label)
        .output("prob")
        .output("out")
        .build()
}

pub fn job_with_ops(job_conf: JobConfig, ops: Vec<OperatorConf>) -> Job {
    let mut job = Job::new(job_conf);
    JobBuilder::new(&mut job)
        .add_ops(&ParallelConf::cpu_zero_on_master(), ops)
        .expect("fixture ops are well formed");
    job
}

/// `loss = sparse_softmax_cross_entropy(matmul(x, w), label)` with `x: [8, 4]`,
/// `w: [4, 10]` trainable and `label: [8]` int64.
pub fn classifier_job(job_name: &str) -> Job {
    let train_conf = TrainConf {
        loss_lbns: vec![out("loss")],
        ..TrainConf::default()
    };
    job_with_ops(
        JobConfig::train(job_name, train_conf),
        vec![
            input_op("x", &[8, 4], DataType::Float32),
            variable_op("w", &[4, 10]),
            input_op("label", &[8], DataType::Int64),
            matmul_op("logits", out("x"), out("w")),
            sparse_softmax_op("loss", out("logits"), out("label")),
        ],
    )
}

/// Rebinds the `out_0` slot of `op` to `lbn`, bypassing `UserOpConfBuilder`.
pub fn rebind_output(op: OperatorConf, lbn: LogicalBlobName) -> OperatorConf {
    let mut raw = serde_json::to_value(op).expect("op to json");
    raw["outputs"] = serde_json::json!({ "out": [lbn] });
    serde_json::from_value(raw).expect("op from json")
}
