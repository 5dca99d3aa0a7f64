//! Reference backend compiler: "compiles" a partition by capturing it and
//! interpreting its graph eagerly on every call.
//!
//! This is the simplest backend satisfying the compile contract, used as the
//! stand-in for real compilers in tests and demos. Example inputs arrive as
//! shape-only stand-ins and are used for arity checking only; nothing about
//! the artifact depends on them.

use std::sync::Arc;

use anyhow::{ensure, Result};
use bucketfuse::{BackendCompiler, CompiledCallable, GraphModule, Value};

/// Backend that returns eagerly-interpreted partitions.
#[derive(Debug, Default, Clone, Copy)]
pub struct EagerBackend;

impl EagerBackend {
    pub fn new() -> Self {
        Self
    }
}

impl BackendCompiler for EagerBackend {
    fn compile(
        &self,
        module: &GraphModule,
        example_inputs: &[Value],
    ) -> Result<Arc<dyn CompiledCallable>> {
        ensure!(
            example_inputs.len() == module.input_count(),
            "partition expects {} inputs, got {} example inputs",
            module.input_count(),
            example_inputs.len()
        );
        Ok(Arc::new(EagerProgram {
            module: module.clone(),
        }))
    }
}

/// Compiled artifact backed by the captured subgraph.
struct EagerProgram {
    module: GraphModule,
}

impl CompiledCallable for EagerProgram {
    fn call(&self, args: &[Value]) -> Result<Value> {
        self.module.call(args)
    }
}
