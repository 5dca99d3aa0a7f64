#![allow(dead_code)]

//! Shared fixtures for the integration suites.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use bucketfuse::nn::{Linear, Scale};
use bucketfuse::{
    autograd_multithreading_enabled, BackendCompiler, ChildModule, CompiledCallable, GraphBuilder,
    GraphModule, HostTensor, Parameter, Value,
};
use bucketfuse_backend_ref_cpu::EagerBackend;

/// A rank-1 gain tensor occupying exactly `bytes` bytes of `F32` storage.
pub fn gain_tensor(bytes: usize, fill: f32) -> HostTensor {
    assert!(bytes % 4 == 0, "test sizes must be f32-aligned");
    HostTensor::filled([bytes / 4], fill)
}

/// Chain of `Scale` layers named `scale_<i>`, one per requested parameter
/// size. Shapes are driven by the sizes, so the chain is only executable
/// when all sizes agree.
pub fn scale_chain(sizes: &[usize]) -> GraphModule {
    scale_chain_from_params(
        sizes
            .iter()
            .map(|&bytes| Parameter::new("gain", gain_tensor(bytes, 1.0)))
            .collect(),
    )
}

/// Same chain built from explicit parameters so callers control gradient
/// and sync-exemption markers.
pub fn scale_chain_from_params(params: Vec<Parameter>) -> GraphModule {
    let mut children: BTreeMap<String, ChildModule> = BTreeMap::new();
    let mut b = GraphBuilder::new();
    let mut current = b.placeholder("x");
    for (i, param) in params.into_iter().enumerate() {
        let name = format!("scale_{i}");
        children.insert(
            name.clone(),
            ChildModule::Layer(Arc::new(Scale::from_param(param))),
        );
        current = b.call_module(name, vec![current.into()]);
    }
    b.output(vec![current.into()]);
    GraphModule::new(b.finish().unwrap(), children, BTreeMap::new()).unwrap()
}

/// Executable chain of square `Linear` layers (`features` in and out) named
/// `lin_<i>`, each with distinct weights and bias. Every layer occupies
/// `features * features * 4 + features * 4` bytes.
pub fn linear_chain(count: usize, features: usize) -> GraphModule {
    let mut children: BTreeMap<String, ChildModule> = BTreeMap::new();
    let mut b = GraphBuilder::new();
    let mut current = b.placeholder("x");
    for i in 0..count {
        let name = format!("lin_{i}");
        let weight = HostTensor::from_vec(
            [features, features],
            (0..features * features)
                .map(|j| ((i + 1) * (j + 1)) as f32 * 0.05)
                .collect(),
        )
        .unwrap();
        let bias = HostTensor::filled([features], i as f32 * 0.25);
        children.insert(
            name.clone(),
            ChildModule::Layer(Arc::new(Linear::new(weight, Some(bias)).unwrap())),
        );
        current = b.call_module(name, vec![current.into()]);
    }
    b.output(vec![current.into()]);
    GraphModule::new(b.finish().unwrap(), children, BTreeMap::new()).unwrap()
}

/// Deterministic rank-2 input for the linear chains.
pub fn chain_input(features: usize) -> Value {
    Value::Tensor(
        HostTensor::from_vec(
            [2, features],
            (0..2 * features).map(|i| i as f32 * 0.5 - 1.0).collect(),
        )
        .unwrap(),
    )
}

/// Snapshot of one backend invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub node_count: usize,
    pub input_count: usize,
    pub example_inputs_fake: bool,
    pub multithreading_disabled: bool,
}

/// Backend that records every compile request before delegating to the
/// eager reference backend.
#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<RecordedCall>>,
    inner: EagerBackend,
}

impl RecordingBackend {
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("recording mutex poisoned").clone()
    }
}

impl BackendCompiler for RecordingBackend {
    fn compile(
        &self,
        module: &GraphModule,
        example_inputs: &[Value],
    ) -> Result<Arc<dyn CompiledCallable>> {
        self.calls
            .lock()
            .expect("recording mutex poisoned")
            .push(RecordedCall {
                node_count: module.graph().len(),
                input_count: module.input_count(),
                example_inputs_fake: example_inputs.iter().any(Value::is_fake),
                multithreading_disabled: !autograd_multithreading_enabled(),
            });
        self.inner.compile(module, example_inputs)
    }
}

/// Backend that refuses every partition.
pub struct FailingBackend;

impl BackendCompiler for FailingBackend {
    fn compile(
        &self,
        _module: &GraphModule,
        _example_inputs: &[Value],
    ) -> Result<Arc<dyn CompiledCallable>> {
        bail!("synthetic backend failure")
    }
}

/// Recursive comparison with floating-point tolerance.
pub fn assert_close(actual: &Value, expected: &Value) {
    match (actual, expected) {
        (Value::Tensor(a), Value::Tensor(b)) => {
            assert_eq!(a.spec(), b.spec(), "tensor specs differ");
            for (i, (x, y)) in a.data().iter().zip(b.data().iter()).enumerate() {
                assert!(
                    (x - y).abs() <= 1e-5 * y.abs().max(1.0),
                    "element {i} differs: {x} vs {y}"
                );
            }
        }
        (Value::Scalar(a), Value::Scalar(b)) => assert_eq!(a, b),
        (Value::Tuple(a), Value::Tuple(b)) => {
            assert_eq!(a.len(), b.len(), "tuple arity differs");
            for (x, y) in a.iter().zip(b.iter()) {
                assert_close(x, y);
            }
        }
        (a, b) => panic!("value kinds differ: {a:?} vs {b:?}"),
    }
}
