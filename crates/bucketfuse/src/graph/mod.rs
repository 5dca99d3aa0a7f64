//! Traced computation graph model.
//!
//! Nodes are stored in construction order and identified positionally, so
//! iterating the node list in reverse yields true reverse-construction
//! order, the order the engine uses to approximate gradient readiness
//! during backward. Graphs are single static assignment: an argument may
//! only reference a node that precedes it.
//!
//! Graphs are read-only to the rest of the engine except for two controlled
//! rewrites used while installing compiled partitions:
//! [`Graph::rename_call_module_target`] and [`Graph::force_tuple_output`].

pub mod builder;
pub mod topology;

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{bail, Result};

use crate::ops::TensorOp;

/// Positional identifier of a node within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Reference to another node's value, one element of it, or a literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Node(NodeId),
    TupleElement { node: NodeId, index: usize },
    Literal(f64),
}

impl Argument {
    /// The node this argument depends on, if any.
    pub fn referenced_node(&self) -> Option<NodeId> {
        match self {
            Argument::Node(id) => Some(*id),
            Argument::TupleElement { node, .. } => Some(*node),
            Argument::Literal(_) => None,
        }
    }
}

impl From<NodeId> for Argument {
    fn from(id: NodeId) -> Self {
        Argument::Node(id)
    }
}

/// Closed set of node operation kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Graph input.
    Placeholder { name: String },
    /// Invocation of a tensor operation.
    CallOp(TensorOp),
    /// Invocation of a registered submodule.
    CallModule { target: String },
    /// Read of a registered tensor attribute.
    GetAttr { target: String },
    /// Graph result. `as_tuple` distinguishes a genuine tuple result from a
    /// single bare value; a one-element tuple is a legal, distinct contract.
    Output { as_tuple: bool },
}

impl NodeKind {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, NodeKind::Placeholder { .. })
    }

    pub fn is_output(&self) -> bool {
        matches!(self, NodeKind::Output { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Placeholder { .. } => "placeholder",
            NodeKind::CallOp(_) => "call_op",
            NodeKind::CallModule { .. } => "call_module",
            NodeKind::GetAttr { .. } => "get_attr",
            NodeKind::Output { .. } => "output",
        }
    }
}

/// Single graph node. `meta` carries opaque trace annotations and survives
/// every rewrite unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub args: Vec<Argument>,
    pub kwargs: BTreeMap<String, Argument>,
    pub meta: BTreeMap<String, String>,
}

/// Finalized computation graph. Construct via [`builder::GraphBuilder`].
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub(crate) fn from_nodes(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    /// Nodes in construction order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn placeholder_count(&self) -> usize {
        self.nodes
            .iter()
            .take_while(|node| node.kind.is_placeholder())
            .count()
    }

    pub fn output(&self) -> Option<&Node> {
        self.nodes.iter().find(|node| node.kind.is_output())
    }

    /// Whether the declared result is a tuple; `None` if no output node.
    pub fn output_is_tuple(&self) -> Option<bool> {
        self.output().map(|node| match node.kind {
            NodeKind::Output { as_tuple } => as_tuple,
            _ => unreachable!(),
        })
    }

    /// Controlled rewrite: points a `call_module` node at a different child.
    pub fn rename_call_module_target(
        &mut self,
        id: NodeId,
        new_target: impl Into<String>,
    ) -> Result<()> {
        let node = self
            .nodes
            .get_mut(id.index())
            .ok_or_else(|| anyhow::anyhow!("no node %{}", id.0))?;
        match &mut node.kind {
            NodeKind::CallModule { target } => {
                *target = new_target.into();
                Ok(())
            }
            other => bail!(
                "cannot rename target of %{}: expected call_module, found {}",
                id.0,
                other.label()
            ),
        }
    }

    /// Controlled rewrite: coerces a bare single result into a one-element
    /// tuple. Returns `true` when the declaration changed, `false` when the
    /// result was already a tuple.
    pub fn force_tuple_output(&mut self) -> Result<bool> {
        let node = self
            .nodes
            .iter_mut()
            .find(|node| node.kind.is_output())
            .ok_or_else(|| anyhow::anyhow!("graph has no output node"))?;
        match &mut node.kind {
            NodeKind::Output { as_tuple } => {
                if *as_tuple {
                    Ok(false)
                } else {
                    *as_tuple = true;
                    Ok(true)
                }
            }
            _ => unreachable!(),
        }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph {{")?;
        for node in &self.nodes {
            let args = node
                .args
                .iter()
                .map(format_argument)
                .collect::<Vec<_>>()
                .join(", ");
            match &node.kind {
                NodeKind::Placeholder { name } => {
                    writeln!(f, "  %{} = placeholder \"{}\"", node.id.0, name)?;
                }
                NodeKind::CallOp(op) => {
                    writeln!(f, "  %{} = {}({})", node.id.0, op.name(), args)?;
                }
                NodeKind::CallModule { target } => {
                    writeln!(f, "  %{} = call_module {}({})", node.id.0, target, args)?;
                }
                NodeKind::GetAttr { target } => {
                    writeln!(f, "  %{} = get_attr {}", node.id.0, target)?;
                }
                NodeKind::Output { as_tuple } => {
                    if *as_tuple {
                        writeln!(f, "  output tuple({args})")?;
                    } else {
                        writeln!(f, "  output {args}")?;
                    }
                }
            }
        }
        write!(f, "}}")
    }
}

fn format_argument(arg: &Argument) -> String {
    match arg {
        Argument::Node(id) => format!("%{}", id.0),
        Argument::TupleElement { node, index } => format!("%{}[{}]", node.0, index),
        Argument::Literal(value) => format!("{value}"),
    }
}
