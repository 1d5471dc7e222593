use std::collections::{BTreeMap, HashMap};

use crate::error::{CompileError, CompileResult, GraphBuildError, InferError};
use crate::job::{Job, LogicalBlobName, OpArg, OperatorConf};
use crate::tensor::{BatchAxis, TensorDesc};
use crate::user_op::{
    BatchAxisContext, InferContext, InputArgModifier, InputArgModifiers, OpRegistry,
    SbpContext, SbpParallel, SbpSignature,
};

use super::{OpGraph, OpNode};

/// Everything the registry callbacks produce for one op.
struct NodeFacts {
    input_descs: BTreeMap<OpArg, TensorDesc>,
    output_descs: BTreeMap<OpArg, TensorDesc>,
    output_batch_axes: BTreeMap<OpArg, BatchAxis>,
    sbp_signatures: Vec<SbpSignature>,
    input_modifiers: BTreeMap<OpArg, InputArgModifier>,
}

fn gather<V: Clone>(
    op: &OperatorConf,
    table: &HashMap<LogicalBlobName, V>,
) -> Result<BTreeMap<OpArg, V>, GraphBuildError> {
    op.inputs()
        .map(|(arg, lbn)| {
            table
                .get(lbn)
                .cloned()
                .map(|value| (arg, value))
                .ok_or_else(|| GraphBuildError::MissingProducer {
                    lbn: lbn.clone(),
                    consumer: op.name().to_string(),
                })
        })
        .collect()
}

impl OpGraph {
    /// Builds the graph and runs every op's inference callbacks in topological order.
    ///
    /// Each op is checked against its declaration, then its output descriptors, batch axes,
    /// SBP candidates and input-arg modifiers are derived from its inputs.
    pub fn with_inference(job: &Job, registry: &OpRegistry) -> CompileResult<Self> {
        let mut graph = Self::new(job)?;
        let order = graph.topo_order.clone();
        for id in order {
            let facts = infer_node(
                &graph.nodes[id.0].op,
                registry,
                &graph.blob_descs,
                &graph.batch_axes,
            )?;
            let node = &mut graph.nodes[id.0];
            for (arg, desc) in &facts.output_descs {
                let lbn = LogicalBlobName::new(node.op.name(), arg.name.clone(), arg.index);
                graph.blob_descs.insert(lbn.clone(), desc.clone());
                let axis = facts
                    .output_batch_axes
                    .get(arg)
                    .copied()
                    .unwrap_or(BatchAxis::NONE);
                graph.batch_axes.insert(lbn, axis);
            }
            tracing::trace!(
                op = node.op.name(),
                op_type = node.op.op_type(),
                signatures = facts.sbp_signatures.len(),
                "inferred op"
            );
            node.input_descs = facts.input_descs;
            node.output_descs = facts.output_descs;
            node.sbp_signatures = facts.sbp_signatures;
            node.input_modifiers = facts.input_modifiers;
        }
        graph.inferred = true;
        Ok(graph)
    }

    /// Checks an externally selected signature per op.
    ///
    /// Each selection must be one of the op's declared candidates, and every consumed blob
    /// must carry the same SBP in the consumer's selection as in its producer's.
    pub fn check_sbp_assignment(
        &self,
        assignment: &BTreeMap<String, SbpSignature>,
    ) -> CompileResult<()> {
        self.try_for_each_node(|node| {
            let selected = selected_signature(node, assignment)?;
            if !node.sbp_signatures.contains(selected) {
                return Err(sbp_error(
                    node,
                    format!("selected signature {selected} is not declared legal"),
                ));
            }
            for (arg, lbn) in node.op.inputs() {
                let producer = self.producer_of(lbn).ok_or_else(|| {
                    GraphBuildError::MissingProducer {
                        lbn: lbn.clone(),
                        consumer: node.name().to_string(),
                    }
                })?;
                let produced = selected_signature(producer, assignment)?
                    .get(lbn.blob_name(), lbn.index());
                let consumed = selected.sbp_of(&arg);
                if produced != consumed {
                    return Err(sbp_error(
                        node,
                        format!(
                            "input `{arg}` ({lbn}) is consumed as {} but produced as {} by `{}`",
                            display_sbp(consumed),
                            display_sbp(produced),
                            producer.name()
                        ),
                    ));
                }
            }
            Ok(())
        })
    }
}

fn infer_node(
    op: &OperatorConf,
    registry: &OpRegistry,
    blob_descs: &HashMap<LogicalBlobName, TensorDesc>,
    batch_axes: &HashMap<LogicalBlobName, BatchAxis>,
) -> CompileResult<NodeFacts> {
    let descriptor = registry.lookup(op.op_type())?;
    let wrap = |source: InferError| CompileError::infer(op.name(), op.op_type(), source);
    descriptor.check_conf(op).map_err(wrap)?;

    let input_descs = gather(op, blob_descs)?;
    let mut infer_ctx = InferContext::new(op, descriptor, &input_descs);
    (descriptor.tensor_desc_infer_fn())(&mut infer_ctx).map_err(wrap)?;
    let output_descs = infer_ctx.finish().map_err(wrap)?;

    let input_axes = gather(op, batch_axes)?;
    let mut axis_ctx =
        BatchAxisContext::new(op, descriptor, &input_descs, &output_descs, &input_axes);
    (descriptor.batch_axis_infer_fn())(&mut axis_ctx).map_err(wrap)?;
    let output_batch_axes = axis_ctx.finish();

    let sbp_ctx = SbpContext::new(op, descriptor, &input_descs, &output_descs);
    let sbp_signatures = (descriptor.sbp_fn())(&sbp_ctx).map_err(wrap)?;
    if sbp_signatures.is_empty() {
        return Err(wrap(InferError::sbp("op declares no legal signature")));
    }

    let mut modifiers = InputArgModifiers::new(op);
    if let Some(modify) = descriptor.input_arg_modify_fn() {
        modify(&mut modifiers).map_err(wrap)?;
    }

    Ok(NodeFacts {
        input_descs,
        output_descs,
        output_batch_axes,
        sbp_signatures,
        input_modifiers: modifiers.finish(),
    })
}

fn selected_signature<'s>(
    node: &OpNode,
    assignment: &'s BTreeMap<String, SbpSignature>,
) -> CompileResult<&'s SbpSignature> {
    assignment
        .get(node.name())
        .ok_or_else(|| sbp_error(node, "no signature selected".to_string()))
}

fn sbp_error(node: &OpNode, message: String) -> CompileError {
    CompileError::infer(node.name(), node.op_type(), InferError::Sbp(message))
}

fn display_sbp(sbp: Option<SbpParallel>) -> String {
    sbp.map_or_else(|| "nothing".to_string(), |sbp| sbp.to_string())
}
