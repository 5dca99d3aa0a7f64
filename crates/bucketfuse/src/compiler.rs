//! Entry point tying bucketing, splitting, and per-partition compilation
//! into a single graph-in, callable-out operation.

use std::fmt;
use std::sync::Arc;

use anyhow::{ensure, Result};

use crate::bucket::{build_buckets, Bucket};
use crate::diag::{self, BucketReport};
use crate::fuse::{compile_submodules, BackendCompiler, CompiledCallable};
use crate::graph::topology::validate_graph;
use crate::module::GraphModule;
use crate::split::{partition_map, split_graph};
use crate::tensor::Value;

/// Default cap for the first bucket. Communication warms up fastest when the
/// earliest allreduce is small, so the first bucket closes early.
pub const DEFAULT_FIRST_BUCKET_BYTES: usize = 1024 * 1024;

/// Compiles a traced graph as a pipeline of bucket-aligned partitions.
///
/// Graph breaks are placed where a gradient-synchronization layer with the
/// same caps would cut its allreduce buckets, so each compiled segment
/// surfaces its gradients as a unit and communication regains its overlap
/// with backward compute.
pub struct BucketCompiler {
    bucket_bytes_cap: usize,
    first_bucket_cap: usize,
    backend: Arc<dyn BackendCompiler>,
    buckets: Vec<Bucket>,
}

impl fmt::Debug for BucketCompiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketCompiler")
            .field("bucket_bytes_cap", &self.bucket_bytes_cap)
            .field("first_bucket_cap", &self.first_bucket_cap)
            .field("buckets", &self.buckets)
            .finish()
    }
}

impl BucketCompiler {
    /// Uses [`DEFAULT_FIRST_BUCKET_BYTES`] (clamped to the main cap) for the
    /// first bucket.
    pub fn new(bucket_bytes_cap: usize, backend: Arc<dyn BackendCompiler>) -> Result<Self> {
        Self::with_first_bucket_cap(
            bucket_bytes_cap,
            DEFAULT_FIRST_BUCKET_BYTES.min(bucket_bytes_cap),
            backend,
        )
    }

    pub fn with_first_bucket_cap(
        bucket_bytes_cap: usize,
        first_bucket_cap: usize,
        backend: Arc<dyn BackendCompiler>,
    ) -> Result<Self> {
        ensure!(
            first_bucket_cap <= bucket_bytes_cap,
            "first bucket cap {first_bucket_cap} must not exceed bucket cap {bucket_bytes_cap}; \
             the first bucket exists to start communication early"
        );
        Ok(Self {
            bucket_bytes_cap,
            first_bucket_cap,
            backend,
            buckets: Vec::new(),
        })
    }

    /// Bucket assignments from the most recent [`compile`](Self::compile)
    /// call, retained for inspection.
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Splits `module` along bucket boundaries, compiles every partition
    /// through the backend, and returns a callable with the original graph's
    /// input/output contract.
    ///
    /// With a single bucket the whole graph goes to the backend directly and
    /// its result is returned unchanged. Any backend failure aborts the
    /// entire attempt; callers own the decision to retry without bucketing
    /// or to fall back to uncompiled execution.
    pub fn compile(
        &mut self,
        module: &GraphModule,
        example_inputs: &[Value],
    ) -> Result<FusedModule> {
        validate_graph(module.graph()).map_err(anyhow::Error::new)?;

        self.buckets = build_buckets(module, self.bucket_bytes_cap, self.first_bucket_cap)?;
        diag::emit_bucket_report(&BucketReport::new(self.bucket_bytes_cap, &self.buckets));

        if self.buckets.len() == 1 {
            let compiled = self.backend.compile(module, example_inputs)?;
            return Ok(FusedModule {
                kind: FusedKind::Whole(compiled),
            });
        }

        let assignment = partition_map(&self.buckets);
        let mut split = split_graph(module, &assignment)?;
        compile_submodules(&mut split, self.backend.as_ref(), example_inputs)?;
        split.recompile()?;

        Ok(FusedModule {
            kind: FusedKind::Split(split),
        })
    }
}

enum FusedKind {
    /// Single-bucket shortcut: the backend's artifact, untouched.
    Whole(Arc<dyn CompiledCallable>),
    /// Pipeline of compiled partitions.
    Split(GraphModule),
}

/// Callable produced by [`BucketCompiler::compile`]. Input and output arity
/// and ordering match the original graph exactly.
pub struct FusedModule {
    kind: FusedKind,
}

impl FusedModule {
    pub fn call(&self, inputs: &[Value]) -> Result<Value> {
        match &self.kind {
            FusedKind::Whole(compiled) => compiled.call(inputs),
            FusedKind::Split(module) => module.call(inputs),
        }
    }

    /// True when the graph was split into multiple compiled partitions.
    pub fn is_split(&self) -> bool {
        matches!(self.kind, FusedKind::Split(_))
    }

    /// The stitched module, when partitioning happened.
    pub fn split_module(&self) -> Option<&GraphModule> {
        match &self.kind {
            FusedKind::Split(module) => Some(module),
            FusedKind::Whole(_) => None,
        }
    }
}

impl CompiledCallable for FusedModule {
    fn call(&self, args: &[Value]) -> Result<Value> {
        FusedModule::call(self, args)
    }
}

impl fmt::Debug for FusedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FusedKind::Whole(_) => f.write_str("FusedModule::Whole"),
            FusedKind::Split(module) => f
                .debug_tuple("FusedModule::Split")
                .field(&module.graph().len())
                .finish(),
        }
    }
}
