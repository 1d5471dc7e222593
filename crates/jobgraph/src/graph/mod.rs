//! Read model of a job: one node per operator, edges from each blob's producer to its consumers.
//!
//! An [`OpGraph`] is a snapshot. Passes that mutate the job rebuild it afterwards.

mod infer;

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

use smallvec::SmallVec;

use crate::error::GraphBuildError;
use crate::job::{Job, LogicalBlobName, OpArg, OperatorConf};
use crate::tensor::{BatchAxis, TensorDesc};
use crate::user_op::{InputArgModifier, SbpSignature};

/// Position of an operator in the job's op list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// One operator plus the logical facts inferred for it.
///
/// The logical maps stay empty on a graph built with [`OpGraph::new`].
#[derive(Debug, Clone)]
pub struct OpNode {
    id: NodeId,
    op: OperatorConf,
    input_descs: BTreeMap<OpArg, TensorDesc>,
    output_descs: BTreeMap<OpArg, TensorDesc>,
    sbp_signatures: Vec<SbpSignature>,
    input_modifiers: BTreeMap<OpArg, InputArgModifier>,
}

impl OpNode {
    fn new(id: NodeId, op: OperatorConf) -> Self {
        Self {
            id,
            op,
            input_descs: BTreeMap::new(),
            output_descs: BTreeMap::new(),
            sbp_signatures: Vec::new(),
            input_modifiers: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn op(&self) -> &OperatorConf {
        &self.op
    }

    pub fn name(&self) -> &str {
        self.op.name()
    }

    pub fn op_type(&self) -> &str {
        self.op.op_type()
    }

    pub fn input_descs(&self) -> &BTreeMap<OpArg, TensorDesc> {
        &self.input_descs
    }

    pub fn output_descs(&self) -> &BTreeMap<OpArg, TensorDesc> {
        &self.output_descs
    }

    pub fn sbp_signatures(&self) -> &[SbpSignature] {
        &self.sbp_signatures
    }

    /// False only for inputs an input-arg modifier marked non-differentiable.
    pub fn input_requires_grad(&self, arg: &OpArg) -> bool {
        self.input_modifiers
            .get(arg)
            .map_or(true, InputArgModifier::requires_grad)
    }
}

#[derive(Debug, Clone)]
pub struct OpGraph {
    nodes: Vec<OpNode>,
    node_of_name: HashMap<String, NodeId>,
    producers: HashMap<LogicalBlobName, NodeId>,
    consumers: HashMap<LogicalBlobName, SmallVec<[NodeId; 4]>>,
    topo_order: Vec<NodeId>,
    blob_descs: HashMap<LogicalBlobName, TensorDesc>,
    batch_axes: HashMap<LogicalBlobName, BatchAxis>,
    inferred: bool,
}

impl OpGraph {
    /// Builds the structural graph and its topological order.
    ///
    /// Fails when an op name repeats, a consumed blob has no producer, a blob has two
    /// producers, or the dependencies form a cycle.
    pub fn new(job: &Job) -> Result<Self, GraphBuildError> {
        let ops = job.ops();
        let mut nodes = Vec::with_capacity(ops.len());
        let mut node_of_name = HashMap::with_capacity(ops.len());
        let mut producers: HashMap<LogicalBlobName, NodeId> = HashMap::new();

        for (index, op) in ops.iter().enumerate() {
            let id = NodeId(index);
            if node_of_name.insert(op.name().to_string(), id).is_some() {
                return Err(GraphBuildError::DuplicateOpName {
                    name: op.name().to_string(),
                });
            }
            op.check_output_bindings()?;
            for (_, lbn) in op.outputs() {
                if let Some(first) = producers.insert(lbn.clone(), id) {
                    return Err(GraphBuildError::DuplicateProducer {
                        lbn: lbn.clone(),
                        first: ops[first.0].name().to_string(),
                        second: op.name().to_string(),
                    });
                }
            }
            nodes.push(OpNode::new(id, op.clone()));
        }

        let mut consumers: HashMap<LogicalBlobName, SmallVec<[NodeId; 4]>> = HashMap::new();
        let mut predecessors: Vec<HashSet<NodeId>> = vec![HashSet::new(); nodes.len()];
        for node in &nodes {
            for (_, lbn) in node.op.inputs() {
                let producer =
                    producers
                        .get(lbn)
                        .copied()
                        .ok_or_else(|| GraphBuildError::MissingProducer {
                            lbn: lbn.clone(),
                            consumer: node.name().to_string(),
                        })?;
                let users = consumers.entry(lbn.clone()).or_default();
                if !users.contains(&node.id) {
                    users.push(node.id);
                }
                predecessors[node.id.0].insert(producer);
            }
        }

        let topo_order = topo_sort(&nodes, &predecessors)?;
        Ok(Self {
            nodes,
            node_of_name,
            producers,
            consumers,
            topo_order,
            blob_descs: HashMap::new(),
            batch_axes: HashMap::new(),
            inferred: false,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether logical descriptors, batch axes and SBP candidates are available.
    pub fn is_inferred(&self) -> bool {
        self.inferred
    }

    pub fn node(&self, id: NodeId) -> &OpNode {
        &self.nodes[id.0]
    }

    pub fn node_by_name(&self, name: &str) -> Option<&OpNode> {
        self.node_of_name.get(name).map(|id| &self.nodes[id.0])
    }

    pub fn producer_of(&self, lbn: &LogicalBlobName) -> Option<&OpNode> {
        self.producers.get(lbn).map(|id| &self.nodes[id.0])
    }

    /// Distinct consumers of `lbn`, in op-list order.
    pub fn consumers_of(&self, lbn: &LogicalBlobName) -> impl Iterator<Item = &OpNode> {
        self.consumers
            .get(lbn)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .map(|id| &self.nodes[id.0])
    }

    pub fn topo_order(&self) -> &[NodeId] {
        &self.topo_order
    }

    /// Producers before consumers; independent ops keep their op-list order.
    pub fn topo_nodes(&self) -> impl DoubleEndedIterator<Item = &OpNode> {
        self.topo_order.iter().map(|id| &self.nodes[id.0])
    }

    pub fn reverse_topo_nodes(&self) -> impl Iterator<Item = &OpNode> {
        self.topo_nodes().rev()
    }

    /// Visits nodes in topological order and stops at the first error.
    pub fn try_for_each_node<E>(
        &self,
        mut visit: impl FnMut(&OpNode) -> Result<(), E>,
    ) -> Result<(), E> {
        for node in self.topo_nodes() {
            visit(node)?;
        }
        Ok(())
    }

    pub fn logical_blob_desc(&self, lbn: &LogicalBlobName) -> Option<&TensorDesc> {
        self.blob_descs.get(lbn)
    }

    pub fn batch_axis(&self, lbn: &LogicalBlobName) -> Option<BatchAxis> {
        self.batch_axes.get(lbn).copied()
    }

    pub fn sbp_signatures(&self, op_name: &str) -> Option<&[SbpSignature]> {
        self.node_by_name(op_name).map(OpNode::sbp_signatures)
    }
}

/// Kahn's algorithm with a min-heap on op-list position as the tie-break.
fn topo_sort(
    nodes: &[OpNode],
    predecessors: &[HashSet<NodeId>],
) -> Result<Vec<NodeId>, GraphBuildError> {
    let mut in_degree: Vec<usize> = predecessors.iter().map(HashSet::len).collect();
    let mut successors: Vec<SmallVec<[NodeId; 4]>> = vec![SmallVec::new(); nodes.len()];
    for (index, preds) in predecessors.iter().enumerate() {
        for pred in preds {
            successors[pred.0].push(NodeId(index));
        }
    }

    let mut ready: BinaryHeap<Reverse<NodeId>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(index, _)| Reverse(NodeId(index)))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id);
        for succ in &successors[id.0] {
            in_degree[succ.0] -= 1;
            if in_degree[succ.0] == 0 {
                ready.push(Reverse(*succ));
            }
        }
    }

    if order.len() != nodes.len() {
        let ops = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree > 0)
            .map(|(index, _)| nodes[index].name().to_string())
            .collect();
        return Err(GraphBuildError::Cycle { ops });
    }
    Ok(order)
}
