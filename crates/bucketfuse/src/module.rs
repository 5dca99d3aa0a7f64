//! Module tree surrounding a traced graph: leaf layers with parameters,
//! nested graph modules produced by splitting, and compiled partitions.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};

use crate::fuse::CompiledSubmodule;
use crate::graph::topology::validate_graph;
use crate::graph::Graph;
use crate::interp;
use crate::tensor::{HostTensor, TensorSpec, Value};

/// Process-unique parameter identity, used for bucket membership accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(pub u64);

static NEXT_PARAM_ID: AtomicU64 = AtomicU64::new(1);

/// Tensor owned by a layer or registered as a module attribute.
///
/// `sync_exempt` is the marker the gradient-synchronization layer leaves on
/// parameters it excludes from communication; exempt parameters never count
/// toward bucket capacity but their nodes still land in a bucket.
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    value: HostTensor,
    requires_grad: bool,
    sync_exempt: bool,
    id: ParamId,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: HostTensor) -> Self {
        Self {
            name: name.into(),
            value,
            requires_grad: true,
            sync_exempt: false,
            id: ParamId(NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// A tensor that never participates in gradient tracking.
    pub fn buffer(name: impl Into<String>, value: HostTensor) -> Self {
        let mut param = Self::new(name, value);
        param.requires_grad = false;
        param
    }

    pub fn with_sync_exempt(mut self, exempt: bool) -> Self {
        self.sync_exempt = exempt;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &HostTensor {
        &self.value
    }

    pub fn spec(&self) -> &TensorSpec {
        self.value.spec()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn is_sync_exempt(&self) -> bool {
        self.sync_exempt
    }

    pub fn id(&self) -> ParamId {
        self.id
    }

    pub fn byte_len(&self) -> usize {
        self.spec().byte_len()
    }
}

/// Visitor callback receiving dotted qualified names.
pub type ParamVisit<'a> = dyn FnMut(&str, &Parameter) -> Result<()> + 'a;

/// Opaque leaf submodule: owns parameters and a forward rule.
///
/// `forward` must accept both concrete and fake tensor inputs, producing a
/// fake output whenever any tensor input is fake. That contract is what lets
/// the engine simulate a layer's shapes without reading its parameters.
pub trait Layer: Send + Sync {
    fn visit_params(&self, f: &mut ParamVisit<'_>) -> Result<()>;
    fn forward(&self, args: &[Value]) -> Result<Value>;
}

/// A named entry in a module's child registry.
#[derive(Clone)]
pub enum ChildModule {
    Layer(Arc<dyn Layer>),
    Graph(Box<GraphModule>),
    Compiled(CompiledSubmodule),
}

impl ChildModule {
    /// Visits every gradient-relevant parameter reachable through this
    /// child, qualified with `prefix`.
    pub fn visit_params(&self, prefix: &str, f: &mut ParamVisit<'_>) -> Result<()> {
        match self {
            ChildModule::Layer(layer) => {
                let mut scoped =
                    |name: &str, param: &Parameter| f(&format!("{prefix}.{name}"), param);
                layer.visit_params(&mut scoped)
            }
            ChildModule::Graph(module) => {
                let mut scoped =
                    |name: &str, param: &Parameter| f(&format!("{prefix}.{name}"), param);
                module.visit_params(&mut scoped)
            }
            ChildModule::Compiled(_) => Ok(()),
        }
    }
}

impl fmt::Debug for ChildModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildModule::Layer(_) => f.write_str("ChildModule::Layer"),
            ChildModule::Graph(module) => f
                .debug_tuple("ChildModule::Graph")
                .field(&module.graph().len())
                .finish(),
            ChildModule::Compiled(compiled) => f
                .debug_tuple("ChildModule::Compiled")
                .field(compiled)
                .finish(),
        }
    }
}

/// Graph plus the registries its nodes resolve against.
///
/// Target resolution is deliberately lazy: a `call_module` or `get_attr`
/// node naming a missing entry only fails when the node is actually visited
/// (bucket accounting, splitting, or evaluation), carrying the offending
/// node in the error.
#[derive(Debug, Clone)]
pub struct GraphModule {
    graph: Graph,
    children: BTreeMap<String, ChildModule>,
    attrs: BTreeMap<String, Parameter>,
    input_count: usize,
    output_tuple: bool,
}

impl GraphModule {
    pub fn new(
        graph: Graph,
        children: BTreeMap<String, ChildModule>,
        attrs: BTreeMap<String, Parameter>,
    ) -> Result<Self> {
        validate_graph(&graph).map_err(anyhow::Error::new)?;
        let input_count = graph.placeholder_count();
        let output_tuple = graph
            .output_is_tuple()
            .ok_or_else(|| anyhow!("graph has no output node"))?;
        Ok(Self {
            graph,
            children,
            attrs,
            input_count,
            output_tuple,
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn child(&self, target: &str) -> Option<&ChildModule> {
        self.children.get(target)
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &ChildModule)> {
        self.children.iter().map(|(name, child)| (name.as_str(), child))
    }

    pub fn attr(&self, target: &str) -> Option<&Parameter> {
        self.attrs.get(target)
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &Parameter)> {
        self.attrs.iter().map(|(name, param)| (name.as_str(), param))
    }

    pub fn input_count(&self) -> usize {
        self.input_count
    }

    pub fn output_is_tuple(&self) -> bool {
        self.output_tuple
    }

    pub fn add_child(&mut self, name: impl Into<String>, child: ChildModule) -> Result<()> {
        let name = name.into();
        if self.children.contains_key(&name) {
            bail!("submodule '{name}' is already registered");
        }
        self.children.insert(name, child);
        Ok(())
    }

    pub fn remove_child(&mut self, name: &str) -> Result<ChildModule> {
        self.children
            .remove(name)
            .ok_or_else(|| anyhow!("submodule '{name}' is not registered"))
    }

    /// Controlled rewrite pass-throughs. See [`Graph`].
    pub(crate) fn force_tuple_output(&mut self) -> Result<bool> {
        self.graph.force_tuple_output()
    }

    pub(crate) fn rename_call_module_target(
        &mut self,
        id: crate::graph::NodeId,
        new_target: impl Into<String>,
    ) -> Result<()> {
        self.graph.rename_call_module_target(id, new_target)
    }

    /// Revalidates the graph and refreshes derived bookkeeping (input count,
    /// output tuple-ness) after a rewrite.
    pub fn recompile(&mut self) -> Result<()> {
        validate_graph(&self.graph).map_err(anyhow::Error::new)?;
        self.input_count = self.graph.placeholder_count();
        self.output_tuple = self
            .graph
            .output_is_tuple()
            .ok_or_else(|| anyhow!("graph has no output node"))?;
        Ok(())
    }

    /// Evaluates the graph on concrete inputs.
    pub fn call(&self, inputs: &[Value]) -> Result<Value> {
        interp::evaluate(self, inputs, false)
    }

    /// Evaluates the graph with every tensor input reduced to its spec.
    pub fn call_symbolic(&self, inputs: &[Value]) -> Result<Value> {
        interp::evaluate(self, inputs, true)
    }

    /// Visits every parameter in the module tree with dotted names: attrs
    /// first, then children in registry order.
    pub fn visit_params(&self, f: &mut ParamVisit<'_>) -> Result<()> {
        for (name, param) in &self.attrs {
            f(name, param)?;
        }
        for (name, child) in &self.children {
            child.visit_params(name, f)?;
        }
        Ok(())
    }
}
