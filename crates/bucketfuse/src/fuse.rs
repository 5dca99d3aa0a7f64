//! Per-partition backend compilation and re-fusion.
//!
//! The compile walk interprets the split module in forward order with
//! shape-only stand-ins. Each partition call is compiled through the
//! external backend, replaced by a wrapper that restores the partition's
//! original output contract, and then simulated symbolically so downstream
//! shape propagation stays consistent with the uncompiled graph.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Context, Result};

use crate::diag;
use crate::graph::NodeKind;
use crate::interp;
use crate::module::{ChildModule, GraphModule};
use crate::ops;
use crate::tensor::Value;

/// Opaque compiled artifact returned by a backend. Calling convention is
/// identical to the subgraph it was compiled from.
pub trait CompiledCallable: Send + Sync {
    fn call(&self, args: &[Value]) -> Result<Value>;
}

/// External backend compiler: subgraph plus shape-only example inputs in,
/// compiled callable out. A black box to this crate.
pub trait BackendCompiler: Send + Sync {
    fn compile(
        &self,
        module: &GraphModule,
        example_inputs: &[Value],
    ) -> Result<Arc<dyn CompiledCallable>>;
}

impl<F> BackendCompiler for F
where
    F: Fn(&GraphModule, &[Value]) -> Result<Arc<dyn CompiledCallable>> + Send + Sync,
{
    fn compile(
        &self,
        module: &GraphModule,
        example_inputs: &[Value],
    ) -> Result<Arc<dyn CompiledCallable>> {
        self(module, example_inputs)
    }
}

/// Wraps a compiled partition, undoing the singleton-tuple normalization
/// applied before compilation on every invocation.
#[derive(Clone)]
pub struct CompiledSubmodule {
    inner: Arc<dyn CompiledCallable>,
    unwrap_singleton_tuple: bool,
}

impl CompiledSubmodule {
    pub fn new(inner: Arc<dyn CompiledCallable>, unwrap_singleton_tuple: bool) -> Self {
        Self {
            inner,
            unwrap_singleton_tuple,
        }
    }

    pub fn unwraps_singleton(&self) -> bool {
        self.unwrap_singleton_tuple
    }

    pub fn call(&self, args: &[Value]) -> Result<Value> {
        let result = self.inner.call(args)?;
        if self.unwrap_singleton_tuple {
            if let Value::Tuple(mut items) = result {
                return items
                    .pop()
                    .filter(|_| items.is_empty())
                    .ok_or_else(|| anyhow!("compiled submodule did not return a singleton tuple"));
            }
            return Ok(result);
        }
        Ok(result)
    }
}

impl fmt::Debug for CompiledSubmodule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledSubmodule")
            .field("unwrap_singleton_tuple", &self.unwrap_singleton_tuple)
            .finish()
    }
}

/// Process-wide flag standing in for the autograd engine's multithreaded
/// bookkeeping mode. Disabled for the duration of the compile walk.
static AUTOGRAD_MULTITHREADING: AtomicBool = AtomicBool::new(true);

pub fn autograd_multithreading_enabled() -> bool {
    AUTOGRAD_MULTITHREADING.load(Ordering::SeqCst)
}

/// Scoped acquisition of the single-threaded execution mode. The previous
/// mode is restored on drop, so every exit path unwinds cleanly, a failing
/// backend included.
pub(crate) struct MultithreadingGuard {
    previous: bool,
}

impl MultithreadingGuard {
    pub(crate) fn disable() -> Self {
        Self {
            previous: AUTOGRAD_MULTITHREADING.swap(false, Ordering::SeqCst),
        }
    }
}

impl Drop for MultithreadingGuard {
    fn drop(&mut self) {
        AUTOGRAD_MULTITHREADING.store(self.previous, Ordering::SeqCst);
    }
}

/// Walks the split module in execution order, compiling every partition
/// through `backend` and installing the compiled wrapper in its place.
///
/// On return, every `submod_<i>` child has been replaced by a
/// `compiled_submod_<i>` entry and the call nodes retargeted. A backend
/// failure aborts the walk and propagates in full; no partition falls back
/// to uncompiled execution here.
pub(crate) fn compile_submodules(
    parent: &mut GraphModule,
    backend: &dyn BackendCompiler,
    example_inputs: &[Value],
) -> Result<()> {
    let _mode = MultithreadingGuard::disable();

    ensure!(
        example_inputs.len() == parent.input_count(),
        "split module expects {} example inputs, got {}",
        parent.input_count(),
        example_inputs.len()
    );

    let node_count = parent.graph().len();
    let mut env: Vec<Option<Value>> = vec![None; node_count];
    let mut next_input = 0usize;

    for index in 0..node_count {
        // The walk rewrites the module as it goes, so take a snapshot of the
        // node before touching the registry.
        let node = parent.graph().nodes()[index].clone();
        let result = match &node.kind {
            NodeKind::Placeholder { .. } => {
                let value = example_inputs[next_input].to_fake();
                next_input += 1;
                value
            }
            NodeKind::CallOp(op) => {
                let args = interp::resolve_args(&env, &node.args)?;
                ops::evaluate(*op, &args)
                    .with_context(|| format!("while simulating %{}", node.id.0))?
            }
            NodeKind::GetAttr { target } => {
                let param = parent.attr(target).ok_or_else(|| {
                    anyhow!("node %{} reads unknown attribute '{}'", node.id.0, target)
                })?;
                Value::Fake(param.spec().clone())
            }
            NodeKind::CallModule { target } => {
                ensure!(
                    node.kwargs.is_empty(),
                    "partition call %{} must use positional arguments only",
                    node.id.0
                );
                let args = interp::resolve_args(&env, &node.args)?;
                compile_one_partition(parent, node.id, target, &args, backend)?
            }
            NodeKind::Output { .. } => continue,
        };
        env[index] = Some(result);
    }

    Ok(())
}

/// Compiles a single partition and returns the shape-only simulation of its
/// result for the continuing walk.
fn compile_one_partition(
    parent: &mut GraphModule,
    node: crate::graph::NodeId,
    target: &str,
    args: &[Value],
    backend: &dyn BackendCompiler,
) -> Result<Value> {
    let child = parent
        .remove_child(target)
        .with_context(|| format!("resolving partition call %{}", node.0))?;
    let mut real_mod = match child {
        ChildModule::Graph(module) => *module,
        _ => bail!("submodule '{target}' is not a partition subgraph"),
    };

    // Backends assume tuple outputs uniformly; remember whether we must
    // unwrap again at call time.
    let wrapped_singleton = real_mod.force_tuple_output()?;
    real_mod.recompile()?;

    let compiled = backend
        .compile(&real_mod, args)
        .with_context(|| format!("backend failed to compile partition '{target}'"))?;

    // Downstream shapes come from the original subgraph, never the compiled
    // artifact, so the simulation stays backend-independent.
    let simulated = real_mod.call_symbolic(args)?;
    let simulated = if wrapped_singleton {
        match simulated {
            Value::Tuple(mut items) if items.len() == 1 => items.pop().expect("length checked"),
            other => other,
        }
    } else {
        simulated
    };

    let wrapper = CompiledSubmodule::new(compiled, wrapped_singleton);
    let new_target = format!("compiled_{target}");
    parent.add_child(new_target.clone(), ChildModule::Compiled(wrapper))?;
    parent.rename_call_module_target(node, new_target.clone())?;
    diag::partition_compiled(&new_target);

    Ok(simulated)
}
