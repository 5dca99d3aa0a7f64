//! Closed set of tensor operations callable from graph nodes.
//!
//! Each operation has a shape/dtype inference rule and an eager CPU kernel.
//! Evaluation degrades to spec-only propagation whenever an input tensor is
//! a fake stand-in, which is what keeps the compile-time interpreter walk
//! free of concrete data.

use anyhow::{bail, ensure, Result};

use crate::tensor::{HostTensor, Shape, TensorSpec, Value};

/// Operations a `call_op` node may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorOp {
    Add,
    Sub,
    Mul,
    MatMul,
    Relu,
    AddScalar,
    MulScalar,
}

impl TensorOp {
    pub fn name(self) -> &'static str {
        match self {
            TensorOp::Add => "add",
            TensorOp::Sub => "sub",
            TensorOp::Mul => "mul",
            TensorOp::MatMul => "matmul",
            TensorOp::Relu => "relu",
            TensorOp::AddScalar => "add_scalar",
            TensorOp::MulScalar => "mul_scalar",
        }
    }
}

/// Computes the output spec for `op` given input tensor specs.
pub fn infer_spec(op: TensorOp, inputs: &[&TensorSpec]) -> Result<TensorSpec> {
    match op {
        TensorOp::Add | TensorOp::Sub | TensorOp::Mul => {
            ensure!(inputs.len() == 2, "{} takes two tensors", op.name());
            let (lhs, rhs) = (inputs[0], inputs[1]);
            ensure!(
                lhs.shape == rhs.shape,
                "{} operand shapes differ: {} vs {}",
                op.name(),
                lhs,
                rhs
            );
            ensure!(
                lhs.dtype == rhs.dtype,
                "{} operand dtypes differ: {:?} vs {:?}",
                op.name(),
                lhs.dtype,
                rhs.dtype
            );
            Ok(lhs.clone())
        }
        TensorOp::MatMul => {
            ensure!(inputs.len() == 2, "matmul takes two tensors");
            let (lhs, rhs) = (inputs[0], inputs[1]);
            ensure!(
                lhs.shape.rank() == 2 && rhs.shape.rank() == 2,
                "matmul requires rank-2 operands, got {} and {}",
                lhs,
                rhs
            );
            ensure!(
                lhs.dtype == rhs.dtype,
                "matmul operand dtypes differ: {:?} vs {:?}",
                lhs.dtype,
                rhs.dtype
            );
            let (m, k) = (lhs.shape.dims()[0], lhs.shape.dims()[1]);
            let (k2, n) = (rhs.shape.dims()[0], rhs.shape.dims()[1]);
            ensure!(
                k == k2,
                "matmul contraction mismatch: {} vs {}",
                lhs,
                rhs
            );
            Ok(TensorSpec::new(lhs.dtype, Shape::new([m, n])).with_device(lhs.device))
        }
        TensorOp::Relu | TensorOp::AddScalar | TensorOp::MulScalar => {
            ensure!(inputs.len() == 1, "{} takes one tensor", op.name());
            Ok(inputs[0].clone())
        }
    }
}

/// Evaluates `op` over resolved argument values.
///
/// Scalar-suffixed ops expect a trailing `Value::Scalar` argument; everything
/// else is tensor-only. Output is fake iff any tensor input is fake.
pub fn evaluate(op: TensorOp, args: &[Value]) -> Result<Value> {
    let (tensors, scalar) = split_args(op, args)?;

    let specs = tensors
        .iter()
        .map(|value| {
            value.spec().ok_or_else(|| {
                anyhow::anyhow!("{} expects tensor arguments, got {value:?}", op.name())
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let out_spec = infer_spec(op, &specs)?;

    if tensors.iter().any(|value| value.is_fake()) {
        return Ok(Value::Fake(out_spec));
    }

    let data: Vec<&[f32]> = tensors
        .iter()
        .map(|value| match value {
            Value::Tensor(tensor) => tensor.data(),
            _ => unreachable!("fake inputs handled above"),
        })
        .collect();

    let out = match op {
        TensorOp::Add => zip_ew(data[0], data[1], |a, b| a + b),
        TensorOp::Sub => zip_ew(data[0], data[1], |a, b| a - b),
        TensorOp::Mul => zip_ew(data[0], data[1], |a, b| a * b),
        TensorOp::Relu => data[0].iter().map(|&a| a.max(0.0)).collect(),
        TensorOp::AddScalar => {
            let s = scalar.unwrap_or(0.0) as f32;
            data[0].iter().map(|&a| a + s).collect()
        }
        TensorOp::MulScalar => {
            let s = scalar.unwrap_or(1.0) as f32;
            data[0].iter().map(|&a| a * s).collect()
        }
        TensorOp::MatMul => {
            let (m, k) = (specs[0].shape.dims()[0], specs[0].shape.dims()[1]);
            let n = specs[1].shape.dims()[1];
            matmul(data[0], data[1], m, k, n)
        }
    };

    Ok(Value::Tensor(HostTensor::new(out_spec, out)?))
}

/// Separates tensor arguments from the scalar literal, validating arity.
fn split_args(op: TensorOp, args: &[Value]) -> Result<(Vec<&Value>, Option<f64>)> {
    match op {
        TensorOp::AddScalar | TensorOp::MulScalar => {
            ensure!(
                args.len() == 2,
                "{} takes a tensor and a scalar, got {} arguments",
                op.name(),
                args.len()
            );
            let scalar = match &args[1] {
                Value::Scalar(value) => *value,
                other => bail!("{} expects a scalar second argument, got {other:?}", op.name()),
            };
            Ok((vec![&args[0]], Some(scalar)))
        }
        _ => {
            let expected = match op {
                TensorOp::Relu => 1,
                _ => 2,
            };
            ensure!(
                args.len() == expected,
                "{} takes {} arguments, got {}",
                op.name(),
                expected,
                args.len()
            );
            Ok((args.iter().collect(), None))
        }
    }
}

fn zip_ew(lhs: &[f32], rhs: &[f32], f: impl Fn(f32, f32) -> f32) -> Vec<f32> {
    lhs.iter().zip(rhs.iter()).map(|(&a, &b)| f(a, b)).collect()
}

fn matmul(lhs: &[f32], rhs: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for p in 0..k {
            let a = lhs[i * k + p];
            if a == 0.0 {
                continue;
            }
            for j in 0..n {
                out[i * n + j] += a * rhs[p * n + j];
            }
        }
    }
    out
}
