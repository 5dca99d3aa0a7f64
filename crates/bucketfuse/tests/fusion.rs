mod support;

use std::collections::BTreeMap;
use std::sync::Arc;

use bucketfuse::nn::Scale;
use bucketfuse::{
    BucketCompiler, ChildModule, GraphBuilder, GraphModule, HostTensor, Parameter, TensorOp, Value,
};
use support::{
    assert_close, chain_input, gain_tensor, linear_chain, scale_chain_from_params, FailingBackend,
    RecordingBackend,
};

#[test]
fn single_bucket_takes_the_whole_graph_shortcut() {
    let module = linear_chain(3, 4);
    let backend = Arc::new(RecordingBackend::default());
    let mut compiler = BucketCompiler::new(usize::MAX, backend.clone()).unwrap();

    let x = chain_input(4);
    let fused = compiler.compile(&module, std::slice::from_ref(&x)).unwrap();

    assert_eq!(compiler.buckets().len(), 1);
    assert!(!fused.is_split());

    // The backend saw exactly one compile request: the original graph with
    // its concrete example inputs, no partitioning performed.
    let calls = backend.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].node_count, module.graph().len());
    assert!(!calls[0].example_inputs_fake);

    let expected = module.call(std::slice::from_ref(&x)).unwrap();
    let actual = fused.call(std::slice::from_ref(&x)).unwrap();
    assert_close(&actual, &expected);
}

#[test]
fn all_exempt_parameters_force_the_shortcut() {
    let params = (0..3)
        .map(|i| {
            Parameter::new("gain", gain_tensor(256, i as f32 + 1.0)).with_sync_exempt(true)
        })
        .collect();
    let module = scale_chain_from_params(params);
    let backend = Arc::new(RecordingBackend::default());
    // Caps far below the raw parameter sizes: exemption keeps every bucket
    // contribution at zero, so one bucket covers the graph.
    let mut compiler = BucketCompiler::with_first_bucket_cap(64, 32, backend.clone()).unwrap();

    let x = Value::Tensor(HostTensor::filled([64], 1.0));
    let fused = compiler.compile(&module, std::slice::from_ref(&x)).unwrap();

    assert_eq!(compiler.buckets().len(), 1);
    assert_eq!(compiler.buckets()[0].size_bytes, 0);
    assert!(!fused.is_split());
    assert_eq!(backend.calls().len(), 1);
}

#[test]
fn partitioned_compilation_matches_eager_execution() {
    // Each linear layer holds 4*4*4 + 4*4 = 80 bytes; an 80-byte cap closes
    // a bucket per layer, giving three compiled partitions.
    let module = linear_chain(3, 4);
    let backend = Arc::new(RecordingBackend::default());
    let mut compiler = BucketCompiler::with_first_bucket_cap(80, 80, backend.clone()).unwrap();

    let x = chain_input(4);
    let fused = compiler.compile(&module, std::slice::from_ref(&x)).unwrap();

    assert_eq!(compiler.buckets().len(), 3);
    assert!(fused.is_split());
    assert_eq!(backend.calls().len(), 3);

    let expected = module.call(std::slice::from_ref(&x)).unwrap();
    let actual = fused.call(std::slice::from_ref(&x)).unwrap();
    assert_close(&actual, &expected);
}

#[test]
fn partition_compiles_see_only_shape_stand_ins() {
    let module = linear_chain(2, 4);
    let backend = Arc::new(RecordingBackend::default());
    let mut compiler = BucketCompiler::with_first_bucket_cap(80, 80, backend.clone()).unwrap();

    let x = chain_input(4);
    compiler.compile(&module, std::slice::from_ref(&x)).unwrap();

    let calls = backend.calls();
    assert_eq!(calls.len(), 2);
    for call in &calls {
        assert!(call.example_inputs_fake, "backend saw concrete data");
    }
}

#[test]
fn singleton_partitions_unwrap_their_tuple_contract() {
    let module = linear_chain(3, 4);
    let backend = Arc::new(RecordingBackend::default());
    let mut compiler = BucketCompiler::with_first_bucket_cap(80, 80, backend).unwrap();

    let x = chain_input(4);
    let fused = compiler.compile(&module, std::slice::from_ref(&x)).unwrap();
    let split = fused.split_module().unwrap();

    // Originals are gone; compiled wrappers took their place.
    assert!(split.child("submod_0").is_none());
    for index in 0..3 {
        let name = format!("compiled_submod_{index}");
        let Some(ChildModule::Compiled(compiled)) = split.child(&name) else {
            panic!("expected compiled submodule '{name}'");
        };
        // Every chain partition returned one bare tensor, so its output was
        // coerced to a tuple for the backend and unwraps on each call.
        assert!(compiled.unwraps_singleton());
    }
}

#[test]
fn tuple_partitions_keep_their_contract() {
    // Diamond: partition 0 exports two values, so no singleton coercion.
    let mut children: BTreeMap<String, ChildModule> = BTreeMap::new();
    children.insert(
        "scale_a".to_string(),
        ChildModule::Layer(Arc::new(Scale::from_param(Parameter::new(
            "gain",
            gain_tensor(16, 2.0),
        )))),
    );
    children.insert(
        "scale_c".to_string(),
        ChildModule::Layer(Arc::new(Scale::from_param(Parameter::new(
            "gain",
            gain_tensor(16, -1.0),
        )))),
    );
    let mut b = GraphBuilder::new();
    let x = b.placeholder("x");
    let a = b.call_module("scale_a", vec![x.into()]);
    let r = b.call_op(TensorOp::Relu, vec![a.into()]);
    let c = b.call_module("scale_c", vec![a.into()]);
    let d = b.call_op(TensorOp::Add, vec![r.into(), c.into()]);
    b.output(vec![d.into()]);
    let module = GraphModule::new(b.finish().unwrap(), children, BTreeMap::new()).unwrap();

    let backend = Arc::new(RecordingBackend::default());
    // 16-byte caps: scale_a closes the first bucket, scale_c the second.
    let mut compiler = BucketCompiler::with_first_bucket_cap(16, 16, backend).unwrap();

    let x = Value::Tensor(HostTensor::from_vec([4], vec![1.0, -2.0, 3.0, -4.0]).unwrap());
    let fused = compiler.compile(&module, std::slice::from_ref(&x)).unwrap();
    let split = fused.split_module().unwrap();

    let Some(ChildModule::Compiled(first)) = split.child("compiled_submod_0") else {
        panic!("expected compiled submodule");
    };
    assert!(!first.unwraps_singleton());

    let expected = module.call(std::slice::from_ref(&x)).unwrap();
    let actual = fused.call(std::slice::from_ref(&x)).unwrap();
    assert_close(&actual, &expected);
}

#[test]
fn multi_output_arity_and_ordering_survive_fusion() {
    let mut children: BTreeMap<String, ChildModule> = BTreeMap::new();
    children.insert(
        "scale_0".to_string(),
        ChildModule::Layer(Arc::new(Scale::from_param(Parameter::new(
            "gain",
            gain_tensor(16, 2.0),
        )))),
    );
    children.insert(
        "scale_1".to_string(),
        ChildModule::Layer(Arc::new(Scale::from_param(Parameter::new(
            "gain",
            gain_tensor(16, 3.0),
        )))),
    );
    let mut b = GraphBuilder::new();
    let x = b.placeholder("x");
    let a = b.call_module("scale_0", vec![x.into()]);
    let c = b.call_module("scale_1", vec![a.into()]);
    b.output(vec![a.into(), c.into()]);
    let module = GraphModule::new(b.finish().unwrap(), children, BTreeMap::new()).unwrap();

    let backend = Arc::new(RecordingBackend::default());
    let mut compiler = BucketCompiler::with_first_bucket_cap(16, 16, backend).unwrap();

    let x = Value::Tensor(HostTensor::from_vec([4], vec![1.0, 2.0, 3.0, 4.0]).unwrap());
    let fused = compiler.compile(&module, std::slice::from_ref(&x)).unwrap();
    assert!(fused.is_split());

    let expected = module.call(std::slice::from_ref(&x)).unwrap();
    let actual = fused.call(std::slice::from_ref(&x)).unwrap();
    match &actual {
        Value::Tuple(items) => assert_eq!(items.len(), 2),
        other => panic!("expected tuple result, got {other:?}"),
    }
    assert_close(&actual, &expected);
}

#[test]
fn backend_failure_aborts_the_whole_compile() {
    let module = linear_chain(2, 4);
    let mut compiler =
        BucketCompiler::with_first_bucket_cap(80, 80, Arc::new(FailingBackend)).unwrap();

    let x = chain_input(4);
    let err = compiler.compile(&module, std::slice::from_ref(&x)).unwrap_err();

    // The failure names the partition and carries the backend's own error.
    let chain = format!("{err:#}");
    assert!(chain.contains("submod_0"), "got: {chain}");
    assert!(chain.contains("synthetic backend failure"), "got: {chain}");
}

#[test]
fn first_bucket_cap_above_main_cap_is_rejected() {
    let err =
        BucketCompiler::with_first_bucket_cap(100, 200, Arc::new(FailingBackend)).unwrap_err();
    assert!(err.to_string().contains("must not exceed"), "got: {err}");
}
