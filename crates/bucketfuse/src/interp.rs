//! Node-by-node graph evaluation, shared by concrete execution of fused
//! modules and the shape-only simulation used while compiling partitions.

use anyhow::{anyhow, bail, ensure, Context, Result};

use crate::graph::{Argument, NodeKind};
use crate::module::{ChildModule, GraphModule};
use crate::ops;
use crate::tensor::Value;

/// Evaluates `module`'s graph over `inputs` in construction order.
///
/// With `symbolic` set, placeholder inputs and attribute reads are reduced
/// to spec-only stand-ins before use, and fake-ness then propagates through
/// every operation and layer call on its own.
pub fn evaluate(module: &GraphModule, inputs: &[Value], symbolic: bool) -> Result<Value> {
    let graph = module.graph();
    ensure!(
        inputs.len() == module.input_count(),
        "graph expects {} inputs, got {}",
        module.input_count(),
        inputs.len()
    );

    let mut env: Vec<Option<Value>> = vec![None; graph.len()];
    let mut next_input = 0usize;

    for node in graph.nodes() {
        let result = match &node.kind {
            NodeKind::Placeholder { .. } => {
                let value = &inputs[next_input];
                next_input += 1;
                if symbolic {
                    value.to_fake()
                } else {
                    value.clone()
                }
            }
            NodeKind::CallOp(op) => {
                ensure!(
                    node.kwargs.is_empty(),
                    "%{}: {} does not take keyword arguments",
                    node.id.0,
                    op.name()
                );
                let args = resolve_args(&env, &node.args)?;
                ops::evaluate(*op, &args)
                    .with_context(|| format!("while evaluating %{}", node.id.0))?
            }
            NodeKind::CallModule { target } => {
                ensure!(
                    node.kwargs.is_empty(),
                    "%{}: submodule calls take positional arguments only",
                    node.id.0
                );
                let args = resolve_args(&env, &node.args)?;
                let child = module.child(target).ok_or_else(|| {
                    anyhow!("node %{} calls unknown submodule '{}'", node.id.0, target)
                })?;
                match child {
                    ChildModule::Layer(layer) => layer
                        .forward(&args)
                        .with_context(|| format!("in submodule '{target}' (%{})", node.id.0))?,
                    ChildModule::Graph(inner) => {
                        let result = if symbolic {
                            inner.call_symbolic(&args)
                        } else {
                            inner.call(&args)
                        };
                        result
                            .with_context(|| format!("in submodule '{target}' (%{})", node.id.0))?
                    }
                    ChildModule::Compiled(compiled) => {
                        if symbolic {
                            bail!(
                                "node %{} cannot symbolically execute compiled submodule '{}'",
                                node.id.0,
                                target
                            );
                        }
                        compiled
                            .call(&args)
                            .with_context(|| format!("in compiled submodule '{target}'"))?
                    }
                }
            }
            NodeKind::GetAttr { target } => {
                let param = module.attr(target).ok_or_else(|| {
                    anyhow!("node %{} reads unknown attribute '{}'", node.id.0, target)
                })?;
                let value = Value::Tensor(param.value().clone());
                if symbolic {
                    value.to_fake()
                } else {
                    value
                }
            }
            NodeKind::Output { as_tuple } => {
                let args = resolve_args(&env, &node.args)?;
                return if *as_tuple {
                    Ok(Value::Tuple(args))
                } else {
                    ensure!(
                        args.len() == 1,
                        "bare output must declare exactly one value, found {}",
                        args.len()
                    );
                    Ok(args.into_iter().next().expect("length checked"))
                };
            }
        };
        env[node.id.index()] = Some(result);
    }

    bail!("graph terminated without an output node")
}

/// Resolves node arguments against the evaluation environment.
pub(crate) fn resolve_args(env: &[Option<Value>], args: &[Argument]) -> Result<Vec<Value>> {
    args.iter().map(|arg| resolve(env, arg)).collect()
}

pub(crate) fn resolve(env: &[Option<Value>], arg: &Argument) -> Result<Value> {
    match arg {
        Argument::Node(id) => env
            .get(id.index())
            .and_then(|slot| slot.clone())
            .ok_or_else(|| anyhow!("value %{} is not available yet", id.0)),
        Argument::TupleElement { node, index } => {
            let value = env
                .get(node.index())
                .and_then(|slot| slot.as_ref())
                .ok_or_else(|| anyhow!("value %{} is not available yet", node.0))?;
            value
                .tuple_get(*index)
                .with_context(|| format!("extracting %{}[{}]", node.0, index))
                .map(Value::clone)
        }
        Argument::Literal(value) => Ok(Value::Scalar(*value)),
    }
}
