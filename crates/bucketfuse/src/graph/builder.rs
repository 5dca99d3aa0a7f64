//! Programmatic graph construction, the shape a tracer hands us.

use std::collections::BTreeMap;

use super::topology::{validate_graph, TopologyError};
use super::{Argument, Graph, Node, NodeId, NodeKind};
use crate::ops::TensorOp;

/// Appends nodes in construction order and validates the finished graph.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn placeholder(&mut self, name: impl Into<String>) -> NodeId {
        self.push(
            NodeKind::Placeholder { name: name.into() },
            Vec::new(),
            BTreeMap::new(),
        )
    }

    pub fn call_op(&mut self, op: TensorOp, args: Vec<Argument>) -> NodeId {
        self.push(NodeKind::CallOp(op), args, BTreeMap::new())
    }

    pub fn call_module(&mut self, target: impl Into<String>, args: Vec<Argument>) -> NodeId {
        self.push(
            NodeKind::CallModule {
                target: target.into(),
            },
            args,
            BTreeMap::new(),
        )
    }

    pub fn get_attr(&mut self, target: impl Into<String>) -> NodeId {
        self.push(
            NodeKind::GetAttr {
                target: target.into(),
            },
            Vec::new(),
            BTreeMap::new(),
        )
    }

    /// Declares the graph result. A single argument yields a bare value;
    /// any other arity yields a tuple.
    pub fn output(&mut self, args: Vec<Argument>) -> NodeId {
        let as_tuple = args.len() != 1;
        self.output_with_arity(args, as_tuple)
    }

    /// Declares the result with an explicit tuple-ness, used when mirroring
    /// an existing graph's contract.
    pub fn output_with_arity(&mut self, args: Vec<Argument>, as_tuple: bool) -> NodeId {
        self.push(NodeKind::Output { as_tuple }, args, BTreeMap::new())
    }

    /// Attaches an opaque annotation to an already-emitted node.
    pub fn set_meta(&mut self, id: NodeId, key: impl Into<String>, value: impl Into<String>) {
        if let Some(node) = self.nodes.get_mut(id.index()) {
            node.meta.insert(key.into(), value.into());
        }
    }

    /// Re-emits a node verbatim (kind, kwargs, metadata) with rewired
    /// arguments; used when carrying nodes into a new graph.
    pub(crate) fn push_node(
        &mut self,
        kind: NodeKind,
        args: Vec<Argument>,
        kwargs: BTreeMap<String, Argument>,
        meta: BTreeMap<String, String>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            id,
            kind,
            args,
            kwargs,
            meta,
        });
        id
    }

    pub fn finish(self) -> Result<Graph, TopologyError> {
        let graph = Graph::from_nodes(self.nodes);
        validate_graph(&graph)?;
        Ok(graph)
    }

    fn push(
        &mut self,
        kind: NodeKind,
        args: Vec<Argument>,
        kwargs: BTreeMap<String, Argument>,
    ) -> NodeId {
        self.push_node(kind, args, kwargs, BTreeMap::new())
    }
}
