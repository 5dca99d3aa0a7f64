//! Splits a small linear chain along synchronization buckets, compiles each
//! partition through the reference backend, and runs the fused result.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use bucketfuse::diag::BucketReport;
use bucketfuse::nn::Linear;
use bucketfuse::{BucketCompiler, ChildModule, GraphBuilder, GraphModule, HostTensor, Value};
use bucketfuse_backend_ref_cpu::EagerBackend;

fn main() -> Result<()> {
    let features = 8;
    let mut children: BTreeMap<String, ChildModule> = BTreeMap::new();
    let mut b = GraphBuilder::new();
    let mut current = b.placeholder("x");
    for i in 0..4 {
        let name = format!("lin_{i}");
        let weight = HostTensor::from_vec(
            [features, features],
            (0..features * features)
                .map(|j| ((i + j) % 5) as f32 * 0.1)
                .collect(),
        )?;
        children.insert(
            name.clone(),
            ChildModule::Layer(Arc::new(Linear::new(weight, None)?)),
        );
        current = b.call_module(name, vec![current.into()]);
    }
    b.output(vec![current.into()]);
    let module = GraphModule::new(b.finish()?, children, BTreeMap::new())?;

    // Each layer holds 8*8*4 = 256 bytes; a 256-byte cap yields one bucket
    // per layer and therefore four compiled partitions.
    let mut compiler = BucketCompiler::with_first_bucket_cap(256, 256, Arc::new(EagerBackend))?;

    let x = Value::Tensor(HostTensor::filled([2, features], 1.0));
    let fused = compiler.compile(&module, std::slice::from_ref(&x))?;

    println!(
        "{}",
        BucketReport::new(256, compiler.buckets()).render()
    );

    let out = fused.call(std::slice::from_ref(&x))?;
    println!("fused result: {out:?}");
    Ok(())
}
