//! Gradient-synchronization bucket assignment.
//!
//! The forward graph is scanned in reverse construction order, which
//! approximates the order gradients become ready during backward. Parameter
//! byte sizes accumulate into the front bucket until a cap is reached, at
//! which point a fresh bucket is prepended. Index 0 of the returned list is
//! therefore always the most recently opened bucket, the one nearest the
//! graph's inputs, and ascending indices follow forward execution order,
//! which is what the splitter relies on.

use anyhow::{anyhow, Result};

use crate::graph::{NodeId, NodeKind};
use crate::module::{GraphModule, ParamId};

/// One synchronization unit: accumulated size, member parameters, and every
/// graph node assigned to it.
#[derive(Debug, Clone, Default)]
pub struct Bucket {
    /// Sum of byte sizes of gradient-requiring, non-exempt parameters.
    pub size_bytes: usize,
    /// Qualified parameter names in accumulation order, for diagnostics.
    pub param_names: Vec<String>,
    /// Parameter identities, for membership assertions in tests.
    pub param_ids: Vec<ParamId>,
    /// Every node assigned to this bucket, parameters or not.
    pub nodes: Vec<NodeId>,
}

/// Assigns every non-placeholder, non-output node to exactly one bucket.
///
/// The cap check happens before a node's own contribution is added: a new
/// front bucket opens once the current front has reached `bucket_bytes_cap`,
/// or, while only one bucket exists, `first_bucket_cap`. A single oversized
/// parameter therefore lands in the bucket that was open when it was visited,
/// and the overshoot is bounded by that one parameter.
pub fn build_buckets(
    module: &GraphModule,
    bucket_bytes_cap: usize,
    first_bucket_cap: usize,
) -> Result<Vec<Bucket>> {
    let mut buckets = vec![Bucket::default()];

    for node in module.graph().nodes().iter().rev() {
        if node.kind.is_placeholder() || node.kind.is_output() {
            continue;
        }

        if buckets[0].size_bytes >= bucket_bytes_cap
            || (buckets.len() == 1 && buckets[0].size_bytes >= first_bucket_cap)
        {
            buckets.insert(0, Bucket::default());
        }

        match &node.kind {
            NodeKind::CallModule { target } => {
                let child = module.child(target).ok_or_else(|| {
                    anyhow!(
                        "node %{} calls unknown submodule '{}' while building buckets",
                        node.id.0,
                        target
                    )
                })?;
                let front = &mut buckets[0];
                child.visit_params(target, &mut |name, param| {
                    if param.requires_grad() && !param.is_sync_exempt() {
                        front.size_bytes += param.byte_len();
                        front.param_names.push(name.to_string());
                        front.param_ids.push(param.id());
                    }
                    Ok(())
                })?;
            }
            NodeKind::GetAttr { target } => {
                let param = module.attr(target).ok_or_else(|| {
                    anyhow!(
                        "node %{} reads unknown attribute '{}' while building buckets",
                        node.id.0,
                        target
                    )
                })?;
                if param.requires_grad() && !param.is_sync_exempt() {
                    let front = &mut buckets[0];
                    front.size_bytes += param.byte_len();
                    front.param_names.push(target.clone());
                    front.param_ids.push(param.id());
                }
            }
            NodeKind::CallOp(_) => {}
            NodeKind::Placeholder { .. } | NodeKind::Output { .. } => unreachable!(),
        }

        // Parameterless nodes still need a partition.
        buckets[0].nodes.push(node.id);
    }

    Ok(buckets)
}
