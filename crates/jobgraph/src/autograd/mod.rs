//! Backward-op synthesis driven purely by graph structure and registered gradient functions.
//!
//! A blob needs a gradient when it depends on a trainable variable through differentiable
//! edges and some loss depends on it. Gradient functions run in reverse topological order,
//! once per forward op, and only for ops with at least one input that needs a gradient.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::error::{
    CompileError, CompileResult, GradientBindingError, GraphBuildError, RegistrationError,
};
use crate::graph::{OpGraph, OpNode};
use crate::job::{LogicalBlobName, OpArg, OperatorConf};
use crate::ops::{ADD_N, ONES_LIKE, VARIABLE};
use crate::user_op::{
    attr_or_default, BackwardContext, BackwardOpSink, OpRegistry, UserOpConfBuilder,
};

const NAME_PREFIX: &str = "System-AutoGrad";

/// A synthesized op and the forward op whose placement and scope it inherits.
#[derive(Debug, Clone, PartialEq)]
pub struct BackwardOp {
    pub forward_op: String,
    pub op: OperatorConf,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackwardGraph {
    /// In emission order; every op's inputs are produced by the forward graph or an earlier op.
    pub ops: Vec<BackwardOp>,
    /// Gradient blob per trainable variable op reached from a loss.
    pub variable_grads: BTreeMap<String, LogicalBlobName>,
}

/// Name of the op that seeds the gradient of `loss` with ones.
pub fn initial_diff_op_name(loss: &LogicalBlobName) -> String {
    format!(
        "{NAME_PREFIX}-{}-{}_{}-InitialDiff",
        loss.op_name(),
        loss.blob_name(),
        loss.index()
    )
}

fn sum_op_name(lbn: &LogicalBlobName) -> String {
    format!(
        "{NAME_PREFIX}-{}-{}_{}-AddN",
        lbn.op_name(),
        lbn.blob_name(),
        lbn.index()
    )
}

pub struct GradientEngine<'g> {
    graph: &'g OpGraph,
    registry: &'g OpRegistry,
}

/// Mutable state of one backward generation.
#[derive(Default)]
struct Walk {
    ops: Vec<BackwardOp>,
    /// Gradient contributions per forward blob, in arrival order.
    contributions: HashMap<LogicalBlobName, Vec<LogicalBlobName>>,
    /// Contributions already reduced to a single blob.
    resolved: HashMap<LogicalBlobName, LogicalBlobName>,
}

impl<'g> GradientEngine<'g> {
    /// `graph` must have been built with [`OpGraph::with_inference`].
    pub fn new(graph: &'g OpGraph, registry: &'g OpRegistry) -> Self {
        Self { graph, registry }
    }

    /// Builds the backward graph of `losses` with respect to every trainable variable.
    pub fn generate(&self, losses: &[LogicalBlobName]) -> CompileResult<BackwardGraph> {
        let variables = self.trainable_variables()?;
        let requires_grad = self.requires_grad(&variables);
        let needed = self.needed_input_grads(losses, &requires_grad);

        let mut walk = Walk::default();
        for loss in losses {
            if !requires_grad.contains(loss) {
                tracing::debug!(%loss, "loss does not depend on any trainable variable");
                continue;
            }
            self.seed_loss(loss, &mut walk)?;
        }

        for node in self.graph.reverse_topo_nodes() {
            let Some(required) = needed.get(node.name()) else {
                continue;
            };
            self.gen_node_grads(node, required, &mut walk)?;
        }

        let mut variable_grads = BTreeMap::new();
        for name in variables {
            let Some(node) = self.graph.node_by_name(&name) else {
                continue;
            };
            for (_, lbn) in node.op().outputs() {
                if let Some(grad) = self.resolve_grad(lbn, &mut walk)? {
                    variable_grads.insert(name.clone(), grad);
                }
            }
        }

        tracing::debug!(
            losses = losses.len(),
            backward_ops = walk.ops.len(),
            variables = variable_grads.len(),
            "generated backward graph"
        );
        Ok(BackwardGraph {
            ops: walk.ops,
            variable_grads,
        })
    }

    fn trainable_variables(&self) -> CompileResult<Vec<String>> {
        let descriptor = self.registry.lookup(VARIABLE)?;
        let mut variables = Vec::new();
        for node in self.graph.topo_nodes() {
            if node.op_type() != VARIABLE {
                continue;
            }
            let trainable: bool = attr_or_default(node.op(), descriptor, "trainable")
                .map_err(|source| CompileError::infer(node.name(), node.op_type(), source))?;
            if trainable {
                variables.push(node.name().to_string());
            }
        }
        Ok(variables)
    }

    /// Blobs that depend on a trainable variable through differentiable inputs.
    fn requires_grad(&self, variables: &[String]) -> HashSet<LogicalBlobName> {
        let sources: HashSet<&str> = variables.iter().map(String::as_str).collect();
        let mut reached: HashSet<LogicalBlobName> = HashSet::new();
        for node in self.graph.topo_nodes() {
            let propagates = sources.contains(node.name())
                || node
                    .op()
                    .inputs()
                    .any(|(arg, lbn)| node.input_requires_grad(&arg) && reached.contains(lbn));
            if propagates {
                reached.extend(node.op().outputs().map(|(_, lbn)| lbn.clone()));
            }
        }
        reached
    }

    /// Per op, the input slots whose gradient some loss needs.
    fn needed_input_grads(
        &self,
        losses: &[LogicalBlobName],
        requires_grad: &HashSet<LogicalBlobName>,
    ) -> HashMap<String, BTreeSet<OpArg>> {
        let mut reaches_loss: HashSet<&LogicalBlobName> = losses.iter().collect();
        let mut needed: HashMap<String, BTreeSet<OpArg>> = HashMap::new();
        for node in self.graph.reverse_topo_nodes() {
            if !node.op().outputs().any(|(_, lbn)| reaches_loss.contains(lbn)) {
                continue;
            }
            for (arg, lbn) in node.op().inputs() {
                if node.input_requires_grad(&arg) && requires_grad.contains(lbn) {
                    reaches_loss.insert(lbn);
                    needed.entry(node.name().to_string()).or_default().insert(arg);
                }
            }
        }
        needed
    }

    fn seed_loss(&self, loss: &LogicalBlobName, walk: &mut Walk) -> CompileResult<()> {
        let producer = self
            .graph
            .producer_of(loss)
            .ok_or_else(|| GraphBuildError::MissingProducer {
                lbn: loss.clone(),
                consumer: initial_diff_op_name(loss),
            })?;
        let name = initial_diff_op_name(loss);
        let op = UserOpConfBuilder::new(name.clone())
            .op(ONES_LIKE)
            .input("like", loss.clone())
            .output("out")
            .scope_symbol_id(producer.op().scope_symbol_id())
            .build();
        walk.ops.push(BackwardOp {
            forward_op: producer.name().to_string(),
            op,
        });
        walk.contributions
            .entry(loss.clone())
            .or_default()
            .push(LogicalBlobName::new(name, "out", 0));
        Ok(())
    }

    fn gen_node_grads(
        &self,
        node: &OpNode,
        required: &BTreeSet<OpArg>,
        walk: &mut Walk,
    ) -> CompileResult<()> {
        let grad_fn = self
            .registry
            .lookup(node.op_type())?
            .grad_fn()
            .ok_or_else(|| RegistrationError::MissingGradient {
                op: node.name().to_string(),
                op_type: node.op_type().to_string(),
            })?;

        let mut output_grads = BTreeMap::new();
        for (arg, lbn) in node.op().outputs() {
            if let Some(grad) = self.resolve_grad(lbn, walk)? {
                output_grads.insert(arg, grad);
            }
        }

        let ctx = BackwardContext::new(
            node.op(),
            node.input_descs(),
            node.output_descs(),
            required,
            &output_grads,
        );
        let mut sink = BackwardOpSink::new();
        grad_fn(&ctx, &mut sink)?;
        let (ops, bindings) = sink.into_parts();

        let mut bound = BTreeSet::new();
        for (arg, grad) in bindings {
            let lbn = node.op().input(&arg.name, arg.index).ok_or_else(|| {
                GradientBindingError::UnknownInput {
                    op: node.name().to_string(),
                    arg: arg.name.clone(),
                    index: arg.index,
                }
            })?;
            if required.contains(&arg) && bound.insert(arg) {
                walk.contributions.entry(lbn.clone()).or_default().push(grad);
            }
        }
        if let Some(missing) = required.iter().find(|arg| !bound.contains(*arg)) {
            return Err(GradientBindingError::UnboundInput {
                op: node.name().to_string(),
                arg: missing.name.clone(),
                index: missing.index,
            }
            .into());
        }

        tracing::debug!(
            op = node.name(),
            op_type = node.op_type(),
            emitted = ops.len(),
            "generated gradient ops"
        );
        let scope_symbol_id = node.op().scope_symbol_id();
        walk.ops.extend(ops.into_iter().map(|op| {
            let op = match (op.scope_symbol_id(), scope_symbol_id) {
                (None, Some(id)) => op.with_scope_symbol_id(id),
                _ => op,
            };
            BackwardOp {
                forward_op: node.name().to_string(),
                op,
            }
        }));
        Ok(())
    }

    /// Single gradient blob of `lbn`, summing multiple contributions with `add_n` once.
    fn resolve_grad(
        &self,
        lbn: &LogicalBlobName,
        walk: &mut Walk,
    ) -> CompileResult<Option<LogicalBlobName>> {
        if let Some(grad) = walk.resolved.get(lbn) {
            return Ok(Some(grad.clone()));
        }
        let Some(parts) = walk.contributions.get(lbn) else {
            return Ok(None);
        };
        let grad = match parts.as_slice() {
            [] => return Ok(None),
            [single] => single.clone(),
            _ => {
                let producer =
                    self.graph
                        .producer_of(lbn)
                        .ok_or_else(|| GraphBuildError::MissingProducer {
                            lbn: lbn.clone(),
                            consumer: sum_op_name(lbn),
                        })?;
                let name = sum_op_name(lbn);
                let mut builder = UserOpConfBuilder::new(name.clone()).op(ADD_N);
                for part in parts {
                    builder = builder.input("in", part.clone());
                }
                let op = builder
                    .output("out")
                    .scope_symbol_id(producer.op().scope_symbol_id())
                    .build();
                walk.ops.push(BackwardOp {
                    forward_op: producer.name().to_string(),
                    op,
                });
                LogicalBlobName::new(name, "out", 0)
            }
        };
        walk.resolved.insert(lbn.clone(), grad.clone());
        Ok(Some(grad))
    }
}
