//! Tensor metadata and host value model shared by graph capture, bucketing,
//! and the symbolic interpreter.
//!
//! Concrete data only exists inside [`HostTensor`]. Everything the engine
//! reasons about across partition boundaries (shapes, dtypes, devices,
//! byte sizes) lives in [`TensorSpec`], so symbolic execution can run on
//! specs alone without ever touching parameter values.

use std::fmt;
use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

/// Scalar element types understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    I1,
    Si64,
    Bf16,
    F16,
    F32,
    F64,
}

impl DType {
    /// Storage size of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::I1 => 1,
            DType::Bf16 | DType::F16 => 2,
            DType::F32 => 4,
            DType::Si64 | DType::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::Bf16 | DType::F16 | DType::F32 | DType::F64)
    }
}

/// Placement of a tensor. Only the CPU exists today; the enum keeps device
/// a first-class part of the spec so symbolic stand-ins carry it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
}

/// Logical tensor shape as an ordered list of static extents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dims.is_empty() {
            return f.write_str("[]");
        }
        let dims = self
            .dims
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("x");
        f.write_str(&dims)
    }
}

/// Tensor metadata coupling dtype, shape, and device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
    pub device: Device,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self {
            dtype,
            shape,
            device: Device::Cpu,
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn element_count(&self) -> usize {
        self.shape.element_count()
    }

    /// Total byte length: element count times element byte width.
    pub fn byte_len(&self) -> usize {
        self.element_count() * self.dtype.size_in_bytes()
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor<{:?} x {}>", self.dtype, self.shape)
    }
}

/// Dense host tensor. Data is staged as `f32` regardless of the logical
/// dtype; byte accounting always goes through the spec.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    spec: TensorSpec,
    data: Arc<[f32]>,
}

impl HostTensor {
    pub fn new(spec: TensorSpec, data: Vec<f32>) -> Result<Self> {
        ensure!(
            data.len() == spec.element_count(),
            "tensor data length {} does not match spec {} ({} elements)",
            data.len(),
            spec,
            spec.element_count()
        );
        Ok(Self {
            spec,
            data: Arc::from(data),
        })
    }

    /// Convenience constructor for `F32` tensors.
    pub fn from_vec(dims: impl Into<Vec<usize>>, data: Vec<f32>) -> Result<Self> {
        Self::new(TensorSpec::new(DType::F32, Shape::new(dims)), data)
    }

    /// An `F32` tensor filled with a constant.
    pub fn filled(dims: impl Into<Vec<usize>>, value: f32) -> Self {
        let shape = Shape::new(dims);
        let count = shape.element_count();
        Self {
            spec: TensorSpec::new(DType::F32, shape),
            data: Arc::from(vec![value; count]),
        }
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// Runtime value flowing through a graph evaluation.
///
/// `Fake` is the shape/dtype/device-only stand-in used during the compile
/// walk; it carries no data, so nothing downstream can capture concrete
/// parameter values. Any operation fed at least one fake tensor produces a
/// fake result.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Tensor(HostTensor),
    Fake(TensorSpec),
    Scalar(f64),
    Tuple(Vec<Value>),
}

impl Value {
    /// Strips concrete data, recursively, leaving specs and scalars intact.
    pub fn to_fake(&self) -> Value {
        match self {
            Value::Tensor(tensor) => Value::Fake(tensor.spec().clone()),
            Value::Fake(spec) => Value::Fake(spec.clone()),
            Value::Scalar(value) => Value::Scalar(*value),
            Value::Tuple(items) => Value::Tuple(items.iter().map(Value::to_fake).collect()),
        }
    }

    /// Tensor metadata for tensor-valued entries, fake or real.
    pub fn spec(&self) -> Option<&TensorSpec> {
        match self {
            Value::Tensor(tensor) => Some(tensor.spec()),
            Value::Fake(spec) => Some(spec),
            Value::Scalar(_) | Value::Tuple(_) => None,
        }
    }

    /// True when any tensor in the value is a dataless stand-in.
    pub fn is_fake(&self) -> bool {
        match self {
            Value::Fake(_) => true,
            Value::Tensor(_) | Value::Scalar(_) => false,
            Value::Tuple(items) => items.iter().any(Value::is_fake),
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// Extracts one element of a tuple value.
    pub fn tuple_get(&self, index: usize) -> Result<&Value> {
        match self {
            Value::Tuple(items) => items.get(index).ok_or_else(|| {
                anyhow::anyhow!("tuple index {index} out of range for {} elements", items.len())
            }),
            other => bail!("expected a tuple value, got {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_len_counts_elements_times_width() {
        let spec = TensorSpec::new(DType::F32, Shape::new([2, 3]));
        assert_eq!(spec.element_count(), 6);
        assert_eq!(spec.byte_len(), 24);

        let half = TensorSpec::new(DType::F16, Shape::new([5]));
        assert_eq!(half.byte_len(), 10);
    }

    #[test]
    fn to_fake_strips_data_recursively() {
        let tensor = HostTensor::from_vec([2], vec![1.0, 2.0]).unwrap();
        let value = Value::Tuple(vec![Value::Tensor(tensor.clone()), Value::Scalar(3.0)]);
        let fake = value.to_fake();
        assert!(fake.is_fake());
        match fake {
            Value::Tuple(items) => {
                assert_eq!(items[0], Value::Fake(tensor.spec().clone()));
                assert_eq!(items[1], Value::Scalar(3.0));
            }
            other => panic!("expected tuple, got {other:?}"),
        }
    }

    #[test]
    fn host_tensor_rejects_length_mismatch() {
        assert!(HostTensor::from_vec([4], vec![0.0; 3]).is_err());
    }
}
