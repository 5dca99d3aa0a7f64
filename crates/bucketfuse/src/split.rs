//! Structural splitting of a graph module along bucket boundaries.
//!
//! Splitting repackages one graph as a pipeline of partition submodules
//! named `submod_<i>`, with cross-partition data dependencies materialized
//! as explicit partition inputs and outputs. Numerical semantics are
//! untouched: composing the partitions in index order equals the original
//! graph.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{anyhow, bail, Result};

use crate::bucket::Bucket;
use crate::graph::builder::GraphBuilder;
use crate::graph::{Argument, NodeId, NodeKind};
use crate::module::{ChildModule, GraphModule, Parameter};

/// Flattens a bucket list into a node-to-partition assignment.
pub fn partition_map(buckets: &[Bucket]) -> HashMap<NodeId, usize> {
    let mut assignment = HashMap::new();
    for (index, bucket) in buckets.iter().enumerate() {
        for node in &bucket.nodes {
            assignment.insert(*node, index);
        }
    }
    assignment
}

/// Where a value consumed inside a partition comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// The i-th graph input.
    Input(usize),
    /// A node assigned to the given partition.
    Partition(usize),
}

/// Splits `module` into one submodule per partition index.
///
/// Fails if any eligible node lacks an assignment, or if an assignment would
/// make a value flow from a later partition into an earlier one.
pub fn split_graph(
    module: &GraphModule,
    assignment: &HashMap<NodeId, usize>,
) -> Result<GraphModule> {
    let graph = module.graph();
    let nodes = graph.nodes();

    // Classify every node and check assignment completeness up front.
    let mut origins: Vec<Option<Origin>> = vec![None; nodes.len()];
    let mut partition_count = 0usize;
    let mut input_index = 0usize;
    for node in nodes {
        match &node.kind {
            NodeKind::Placeholder { .. } => {
                origins[node.id.index()] = Some(Origin::Input(input_index));
                input_index += 1;
            }
            NodeKind::Output { .. } => {}
            _ => {
                let partition = *assignment.get(&node.id).ok_or_else(|| {
                    anyhow!(
                        "node %{} ({}) has no bucket assignment",
                        node.id.0,
                        node.kind.label()
                    )
                })?;
                origins[node.id.index()] = Some(Origin::Partition(partition));
                partition_count = partition_count.max(partition + 1);
            }
        }
    }
    if partition_count == 0 {
        bail!("graph has no nodes to partition");
    }

    let mut members: Vec<Vec<NodeId>> = vec![Vec::new(); partition_count];
    for node in nodes {
        if let Some(Origin::Partition(p)) = origins[node.id.index()] {
            members[p].push(node.id);
        }
    }

    // External inputs per partition (first-use order) and the set of values
    // each partition must export for later consumers or the graph result.
    let mut inputs: Vec<Vec<NodeId>> = vec![Vec::new(); partition_count];
    let mut input_seen: Vec<HashSet<NodeId>> = vec![HashSet::new(); partition_count];
    let mut needed: HashSet<NodeId> = HashSet::new();

    for node in nodes {
        let consumer = origins[node.id.index()];
        for arg in node.args.iter().chain(node.kwargs.values()) {
            let Some(referenced) = arg.referenced_node() else {
                continue;
            };
            let produced = origins[referenced.index()];
            match (consumer, produced) {
                (Some(Origin::Partition(p)), Some(Origin::Partition(q))) => {
                    if q > p {
                        bail!(
                            "partition {} consumes %{} produced by later partition {}",
                            p,
                            referenced.0,
                            q
                        );
                    }
                    if q < p {
                        needed.insert(referenced);
                        if input_seen[p].insert(referenced) {
                            inputs[p].push(referenced);
                        }
                    }
                }
                (Some(Origin::Partition(p)), Some(Origin::Input(_))) => {
                    if input_seen[p].insert(referenced) {
                        inputs[p].push(referenced);
                    }
                }
                // The output node keeps partition values alive.
                (None, Some(Origin::Partition(_))) if node.kind.is_output() => {
                    needed.insert(referenced);
                }
                _ => {}
            }
        }
    }

    let outputs: Vec<Vec<NodeId>> = members
        .iter()
        .map(|nodes| {
            nodes
                .iter()
                .copied()
                .filter(|id| needed.contains(id))
                .collect()
        })
        .collect();

    // Materialize each partition as its own graph module.
    let mut parent_children: BTreeMap<String, ChildModule> = BTreeMap::new();
    for p in 0..partition_count {
        let submodule = build_partition(module, p, &inputs[p], &members[p], &outputs[p])?;
        parent_children.insert(format!("submod_{p}"), ChildModule::Graph(Box::new(submodule)));
    }

    // Rebuild the outer graph as a pipeline of partition calls mirroring the
    // original inputs and output contract.
    let mut pb = GraphBuilder::new();
    let mut parent_inputs = Vec::new();
    for node in nodes.iter().take_while(|node| node.kind.is_placeholder()) {
        parent_inputs.push(pb.push_node(
            node.kind.clone(),
            Vec::new(),
            BTreeMap::new(),
            node.meta.clone(),
        ));
    }

    let mut call_ids: Vec<NodeId> = Vec::with_capacity(partition_count);
    for p in 0..partition_count {
        let args = inputs[p]
            .iter()
            .map(|&value| parent_value_ref(value, &origins, &outputs, &parent_inputs, &call_ids))
            .collect::<Result<Vec<_>>>()?;
        call_ids.push(pb.call_module(format!("submod_{p}"), args));
    }

    let original_output = graph
        .output()
        .ok_or_else(|| anyhow!("graph has no output node"))?;
    let out_args = original_output
        .args
        .iter()
        .map(|arg| match arg {
            Argument::Literal(value) => Ok(Argument::Literal(*value)),
            Argument::Node(id) => {
                parent_value_ref(*id, &origins, &outputs, &parent_inputs, &call_ids)
            }
            Argument::TupleElement { node, index } => match origins[node.index()] {
                Some(Origin::Partition(q)) if outputs[q].len() == 1 && outputs[q][0] == *node => {
                    Ok(Argument::TupleElement {
                        node: call_ids[q],
                        index: *index,
                    })
                }
                _ => bail!(
                    "output element %{}[{}] would need nested tuple extraction across a \
                     partition boundary",
                    node.0,
                    index
                ),
            },
        })
        .collect::<Result<Vec<_>>>()?;
    pb.push_node(
        original_output.kind.clone(),
        out_args,
        BTreeMap::new(),
        original_output.meta.clone(),
    );

    GraphModule::new(
        pb.finish().map_err(anyhow::Error::new)?,
        parent_children,
        BTreeMap::new(),
    )
}

/// Builds the graph module for one partition.
fn build_partition(
    module: &GraphModule,
    partition: usize,
    inputs: &[NodeId],
    members: &[NodeId],
    outputs: &[NodeId],
) -> Result<GraphModule> {
    let graph = module.graph();
    let mut builder = GraphBuilder::new();
    let mut local: HashMap<NodeId, NodeId> = HashMap::new();
    let mut children: BTreeMap<String, ChildModule> = BTreeMap::new();
    let mut attrs: BTreeMap<String, Parameter> = BTreeMap::new();

    for &value in inputs {
        let name = match &graph.nodes()[value.index()].kind {
            NodeKind::Placeholder { name } => name.clone(),
            _ => format!("v{}", value.0),
        };
        local.insert(value, builder.placeholder(name));
    }

    for &member in members {
        let node = &graph.nodes()[member.index()];
        let args = node
            .args
            .iter()
            .map(|arg| remap_argument(arg, &local))
            .collect::<Result<Vec<_>>>()?;
        let kwargs = node
            .kwargs
            .iter()
            .map(|(key, arg)| Ok((key.clone(), remap_argument(arg, &local)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        match &node.kind {
            NodeKind::CallModule { target } => {
                if !children.contains_key(target) {
                    let child = module.child(target).ok_or_else(|| {
                        anyhow!("node %{} calls unknown submodule '{}'", node.id.0, target)
                    })?;
                    children.insert(target.clone(), child.clone());
                }
            }
            NodeKind::GetAttr { target } => {
                if !attrs.contains_key(target) {
                    let param = module.attr(target).ok_or_else(|| {
                        anyhow!("node %{} reads unknown attribute '{}'", node.id.0, target)
                    })?;
                    attrs.insert(target.clone(), param.clone());
                }
            }
            _ => {}
        }

        let new_id = builder.push_node(node.kind.clone(), args, kwargs, node.meta.clone());
        local.insert(member, new_id);
    }

    let out_args = outputs
        .iter()
        .map(|id| {
            local
                .get(id)
                .copied()
                .map(Argument::Node)
                .ok_or_else(|| anyhow!("partition {partition} output %{} was not emitted", id.0))
        })
        .collect::<Result<Vec<_>>>()?;
    let as_tuple = out_args.len() != 1;
    builder.output_with_arity(out_args, as_tuple);

    GraphModule::new(
        builder.finish().map_err(anyhow::Error::new)?,
        children,
        attrs,
    )
}

/// Rewrites one argument into a partition's local id space.
fn remap_argument(arg: &Argument, local: &HashMap<NodeId, NodeId>) -> Result<Argument> {
    let mapped = |id: NodeId| {
        local
            .get(&id)
            .copied()
            .ok_or_else(|| anyhow!("value %{} was not carried into the partition", id.0))
    };
    match arg {
        Argument::Node(id) => Ok(Argument::Node(mapped(*id)?)),
        Argument::TupleElement { node, index } => Ok(Argument::TupleElement {
            node: mapped(*node)?,
            index: *index,
        }),
        Argument::Literal(value) => Ok(Argument::Literal(*value)),
    }
}

/// Expresses an original value in the rebuilt outer graph: either a parent
/// placeholder, the single result of an earlier partition call, or one
/// element of its result tuple.
fn parent_value_ref(
    value: NodeId,
    origins: &[Option<Origin>],
    outputs: &[Vec<NodeId>],
    parent_inputs: &[NodeId],
    call_ids: &[NodeId],
) -> Result<Argument> {
    match origins[value.index()] {
        Some(Origin::Input(index)) => Ok(Argument::Node(parent_inputs[index])),
        Some(Origin::Partition(q)) => {
            let position = outputs[q]
                .iter()
                .position(|id| *id == value)
                .ok_or_else(|| {
                    anyhow!("value %{} is not among partition {}'s outputs", value.0, q)
                })?;
            if outputs[q].len() == 1 {
                Ok(Argument::Node(call_ids[q]))
            } else {
                Ok(Argument::TupleElement {
                    node: call_ids[q],
                    index: position,
                })
            }
        }
        None => bail!("value %{} has no producer", value.0),
    }
}
