//! Concrete leaf layers used by demos and the test suites.

use anyhow::{bail, ensure, Result};

use crate::module::{Layer, ParamVisit, Parameter};
use crate::tensor::{HostTensor, Shape, TensorSpec, Value};

/// Affine layer: `y = x · Wᵀ + b`, with `W` shaped `[out, in]`.
pub struct Linear {
    weight: Parameter,
    bias: Option<Parameter>,
}

impl Linear {
    pub fn new(weight: HostTensor, bias: Option<HostTensor>) -> Result<Self> {
        Self::from_params(
            Parameter::new("weight", weight),
            bias.map(|b| Parameter::new("bias", b)),
        )
    }

    /// Builds from explicit parameters so callers control gradient and
    /// sync-exemption markers.
    pub fn from_params(weight: Parameter, bias: Option<Parameter>) -> Result<Self> {
        ensure!(
            weight.spec().shape.rank() == 2,
            "linear weight must be rank 2, got {}",
            weight.spec()
        );
        if let Some(bias) = &bias {
            ensure!(
                bias.spec().shape.rank() == 1
                    && bias.spec().shape.dims()[0] == weight.spec().shape.dims()[0],
                "linear bias {} does not match weight {}",
                bias.spec(),
                weight.spec()
            );
        }
        Ok(Self { weight, bias })
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    fn out_features(&self) -> usize {
        self.weight.spec().shape.dims()[0]
    }

    fn in_features(&self) -> usize {
        self.weight.spec().shape.dims()[1]
    }
}

impl Layer for Linear {
    fn visit_params(&self, f: &mut ParamVisit<'_>) -> Result<()> {
        f("weight", &self.weight)?;
        if let Some(bias) = &self.bias {
            f("bias", bias)?;
        }
        Ok(())
    }

    fn forward(&self, args: &[Value]) -> Result<Value> {
        ensure!(args.len() == 1, "linear takes one input, got {}", args.len());
        let spec = match &args[0] {
            Value::Tensor(tensor) => tensor.spec(),
            Value::Fake(spec) => spec,
            other => bail!("linear expects a tensor input, got {other:?}"),
        };
        ensure!(
            spec.shape.rank() == 2 && spec.shape.dims()[1] == self.in_features(),
            "linear input {} does not match weight {}",
            spec,
            self.weight.spec()
        );

        let rows = spec.shape.dims()[0];
        let out_spec = TensorSpec::new(spec.dtype, Shape::new([rows, self.out_features()]))
            .with_device(spec.device);

        let input = match &args[0] {
            Value::Tensor(tensor) => tensor,
            Value::Fake(_) => return Ok(Value::Fake(out_spec)),
            _ => unreachable!(),
        };

        let (out, inn) = (self.out_features(), self.in_features());
        let weight = self.weight.value().data();
        let bias = self.bias.as_ref().map(|b| b.value().data());
        let x = input.data();

        let mut data = vec![0.0f32; rows * out];
        for i in 0..rows {
            for j in 0..out {
                let mut acc = bias.map(|b| b[j]).unwrap_or(0.0);
                for p in 0..inn {
                    acc += x[i * inn + p] * weight[j * inn + p];
                }
                data[i * out + j] = acc;
            }
        }
        Ok(Value::Tensor(HostTensor::new(out_spec, data)?))
    }
}

/// Elementwise gain: `y = x ⊙ g`, with `g` shaped exactly like the input.
pub struct Scale {
    gain: Parameter,
}

impl Scale {
    pub fn new(gain: HostTensor) -> Self {
        Self {
            gain: Parameter::new("gain", gain),
        }
    }

    pub fn from_param(gain: Parameter) -> Self {
        Self { gain }
    }

    pub fn gain(&self) -> &Parameter {
        &self.gain
    }
}

impl Layer for Scale {
    fn visit_params(&self, f: &mut ParamVisit<'_>) -> Result<()> {
        f("gain", &self.gain)
    }

    fn forward(&self, args: &[Value]) -> Result<Value> {
        ensure!(args.len() == 1, "scale takes one input, got {}", args.len());
        let spec = match &args[0] {
            Value::Tensor(tensor) => tensor.spec(),
            Value::Fake(spec) => spec,
            other => bail!("scale expects a tensor input, got {other:?}"),
        };
        ensure!(
            spec.shape == self.gain.spec().shape,
            "scale input {} does not match gain {}",
            spec,
            self.gain.spec()
        );

        match &args[0] {
            Value::Fake(_) => Ok(Value::Fake(spec.clone())),
            Value::Tensor(tensor) => {
                let data = tensor
                    .data()
                    .iter()
                    .zip(self.gain.value().data().iter())
                    .map(|(&x, &g)| x * g)
                    .collect();
                Ok(Value::Tensor(HostTensor::new(spec.clone(), data)?))
            }
            _ => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;

    #[test]
    fn linear_matches_manual_product() {
        let weight = HostTensor::from_vec([2, 3], vec![1.0, 0.0, 0.0, 0.0, 1.0, 1.0]).unwrap();
        let bias = HostTensor::from_vec([2], vec![0.5, -0.5]).unwrap();
        let layer = Linear::new(weight, Some(bias)).unwrap();
        let x = Value::Tensor(HostTensor::from_vec([1, 3], vec![1.0, 2.0, 3.0]).unwrap());
        match layer.forward(&[x]).unwrap() {
            Value::Tensor(out) => assert_eq!(out.data(), &[1.5, 4.5]),
            other => panic!("expected tensor, got {other:?}"),
        }
    }

    #[test]
    fn fake_input_yields_fake_output_spec() {
        let weight = HostTensor::filled([4, 3], 1.0);
        let layer = Linear::new(weight, None).unwrap();
        let x = Value::Fake(TensorSpec::new(DType::F32, Shape::new([2, 3])));
        match layer.forward(&[x]).unwrap() {
            Value::Fake(spec) => assert_eq!(spec.shape.dims(), &[2, 4]),
            other => panic!("expected fake, got {other:?}"),
        }
    }

    #[test]
    fn scale_rejects_shape_mismatch() {
        let layer = Scale::new(HostTensor::filled([4], 2.0));
        let x = Value::Tensor(HostTensor::filled([3], 1.0));
        assert!(layer.forward(&[x]).is_err());
    }
}
