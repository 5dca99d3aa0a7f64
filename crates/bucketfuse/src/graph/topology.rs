//! Structural validation of graphs before any bucketing work begins.

use std::fmt;

use super::{Graph, NodeKind};

/// Malformed-graph conditions, each carrying the offending node id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// An argument references a node that does not precede its consumer
    /// (covers both forward references and cycles in SSA form).
    ForwardReference { node: u32, operand: u32 },
    MissingOutput,
    OutputNotLast { node: u32 },
    PlaceholderAfterBody { node: u32 },
    PlaceholderWithArgs { node: u32 },
    NonPositionalId { node: u32, position: usize },
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyError::ForwardReference { node, operand } => write!(
                f,
                "node %{node} references %{operand}, which does not precede it"
            ),
            TopologyError::MissingOutput => write!(f, "graph has no output node"),
            TopologyError::OutputNotLast { node } => {
                write!(f, "output node %{node} is not the last node")
            }
            TopologyError::PlaceholderAfterBody { node } => {
                write!(f, "placeholder %{node} appears after non-placeholder nodes")
            }
            TopologyError::PlaceholderWithArgs { node } => {
                write!(f, "placeholder %{node} must not take arguments")
            }
            TopologyError::NonPositionalId { node, position } => {
                write!(f, "node id %{node} does not match its position {position}")
            }
        }
    }
}

impl std::error::Error for TopologyError {}

/// Checks the SSA and layout invariants: positional ids, placeholders as a
/// prefix, exactly one output as the final node, and backward-only argument
/// references.
pub fn validate_graph(graph: &Graph) -> Result<(), TopologyError> {
    let mut in_body = false;
    let mut output_seen: Option<u32> = None;

    for (position, node) in graph.nodes().iter().enumerate() {
        if node.id.index() != position {
            return Err(TopologyError::NonPositionalId {
                node: node.id.0,
                position,
            });
        }

        if let Some(output) = output_seen {
            return Err(TopologyError::OutputNotLast { node: output });
        }

        match &node.kind {
            NodeKind::Placeholder { .. } => {
                if in_body {
                    return Err(TopologyError::PlaceholderAfterBody { node: node.id.0 });
                }
                if !node.args.is_empty() || !node.kwargs.is_empty() {
                    return Err(TopologyError::PlaceholderWithArgs { node: node.id.0 });
                }
            }
            NodeKind::Output { .. } => {
                in_body = true;
                output_seen = Some(node.id.0);
            }
            _ => in_body = true,
        }

        for arg in node.args.iter().chain(node.kwargs.values()) {
            if let Some(referenced) = arg.referenced_node() {
                if referenced.index() >= position {
                    return Err(TopologyError::ForwardReference {
                        node: node.id.0,
                        operand: referenced.0,
                    });
                }
            }
        }
    }

    if output_seen.is_none() {
        return Err(TopologyError::MissingOutput);
    }

    Ok(())
}
