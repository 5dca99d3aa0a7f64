pub mod bucket;
pub mod compiler;
pub mod diag;
pub mod fuse;
pub mod graph;
pub mod interp;
pub mod module;
pub mod nn;
pub mod ops;
pub mod split;
pub mod tensor;

pub use bucket::{build_buckets, Bucket};
pub use compiler::{BucketCompiler, FusedModule, DEFAULT_FIRST_BUCKET_BYTES};
pub use fuse::{
    autograd_multithreading_enabled, BackendCompiler, CompiledCallable, CompiledSubmodule,
};
pub use graph::{builder::GraphBuilder, Argument, Graph, Node, NodeId, NodeKind};
pub use module::{ChildModule, GraphModule, Layer, ParamId, Parameter};
pub use ops::TensorOp;
pub use tensor::{DType, Device, HostTensor, Shape, TensorSpec, Value};
