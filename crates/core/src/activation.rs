//! Element-wise activations.
//!
//! | Unit | Forward | Backward |
//! |------|---------|----------|
//! | [`Binarize`] | `v > threshold ? 1 : 0` | straight-through inside `[clip_min, clip_max]` |
//! | [`Activation::relu`] | `max(x, 0)` | `dy · [x > 0]` |
//! | [`Activation::sigmoid`] | `σ(x)` | `dy · σ(x)(1 − σ(x))` |
//! | [`Activation::hard_tanh`] | `clamp(x, −1, 1)` | `dy · [−1 ≤ x ≤ 1]` |
//!
//! The soft activations switch to binarising behaviour on `binary true`.

use candle_core::{DType, Tensor};
use lutnet_common::{BinarizeConfig, DataType};

use crate::buffer::Buffer;
use crate::error::Result;
use crate::unit::{command_value, parse_bool, take_cache, Unit, UnitMeta};

// ── Straight-through threshold ──────────────────────────────────────────────

/// Hard threshold with a hard-tanh straight-through estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Binarizer {
    pub threshold: f64,
    pub clip_min: f64,
    pub clip_max: f64,
}

impl Default for Binarizer {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            clip_min: -1.0,
            clip_max: 1.0,
        }
    }
}

impl Binarizer {
    pub fn with_threshold(threshold: f64) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }

    /// `{0, 1}` in `F32`.
    pub fn forward(&self, v: &Tensor) -> Result<Tensor> {
        Ok(v.gt(self.threshold)?.to_dtype(DType::F32)?)
    }

    /// Pass `dy` where `clip_min ≤ v ≤ clip_max`, zero elsewhere.
    pub fn backward(&self, dy: &Tensor, v: &Tensor) -> Result<Tensor> {
        let lo = v.ge(self.clip_min)?.to_dtype(DType::F32)?;
        let hi = v.le(self.clip_max)?.to_dtype(DType::F32)?;
        Ok(dy.mul(&lo.mul(&hi)?)?)
    }

    pub fn forward_value(&self, v: f64) -> f64 {
        if v > self.threshold {
            1.0
        } else {
            0.0
        }
    }
}

impl From<&BinarizeConfig> for Binarizer {
    fn from(c: &BinarizeConfig) -> Self {
        Self {
            threshold: f64::from(c.threshold),
            clip_min: f64::from(c.clip_min),
            clip_max: f64::from(c.clip_max),
        }
    }
}

fn passthrough_shape(meta: &mut UnitMeta, input_shape: &[usize]) -> Vec<usize> {
    meta.set_shapes(input_shape, input_shape);
    input_shape.to_vec()
}

// ── Binarize ────────────────────────────────────────────────────────────────

pub struct Binarize {
    meta: UnitMeta,
    binarizer: Binarizer,
    output_dtype: DataType,
    cache: Option<Tensor>,
}

impl Binarize {
    pub fn new(config: &BinarizeConfig) -> Self {
        Self {
            meta: UnitMeta::new(),
            binarizer: Binarizer::from(config),
            output_dtype: config.output_dtype,
            cache: None,
        }
    }

    pub fn binarizer(&self) -> &Binarizer {
        &self.binarizer
    }
}

impl Default for Binarize {
    fn default() -> Self {
        Self::new(&BinarizeConfig::default())
    }
}

impl Unit for Binarize {
    fn class_name(&self) -> &'static str {
        "Binarize"
    }

    fn meta(&self) -> &UnitMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut UnitMeta {
        &mut self.meta
    }

    fn negotiate_shape(&mut self, input_shape: &[usize]) -> Result<Vec<usize>> {
        self.cache = None;
        Ok(passthrough_shape(&mut self.meta, input_shape))
    }

    fn forward(&mut self, x: &Buffer, train: bool) -> Result<Buffer> {
        self.meta.check_input(self.class_name(), x)?;
        let v = x.tensor()?;
        let y = Buffer::from_tensor(self.binarizer.forward(&v)?, x.shape())?;
        self.cache = if train { Some(v) } else { None };
        y.to_dtype(self.output_dtype)
    }

    fn backward(&mut self, dy: &Buffer) -> Result<Buffer> {
        let class = self.class_name();
        self.meta.check_output_grad(class, dy)?;
        let v = take_cache(&mut self.cache, class)?;
        Buffer::from_tensor(self.binarizer.backward(&dy.tensor()?, &v)?, dy.shape())
    }
}

// ── Soft activations ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    ReLU,
    Sigmoid,
    HardTanh,
}

impl ActivationKind {
    fn forward(self, x: &Tensor) -> Result<Tensor> {
        Ok(match self {
            Self::ReLU => x.relu()?,
            Self::Sigmoid => candle_nn::ops::sigmoid(x)?,
            Self::HardTanh => x.clamp(-1f64, 1f64)?,
        })
    }

    fn backward(self, dy: &Tensor, x: &Tensor) -> Result<Tensor> {
        Ok(match self {
            Self::ReLU => dy.mul(&x.gt(0f64)?.to_dtype(DType::F32)?)?,
            Self::Sigmoid => {
                let s = candle_nn::ops::sigmoid(x)?;
                dy.mul(&s.mul(&s.affine(-1.0, 1.0)?)?)?
            }
            Self::HardTanh => Binarizer::default().backward(dy, x)?,
        })
    }
}

struct ActivationCache {
    x: Tensor,
    binary: bool,
}

/// ReLU / Sigmoid / HardTanh with a switchable binary mode.
pub struct Activation {
    meta: UnitMeta,
    kind: ActivationKind,
    binary: bool,
    binarizer: Binarizer,
    cache: Option<ActivationCache>,
}

impl Activation {
    pub fn new(kind: ActivationKind) -> Self {
        Self {
            meta: UnitMeta::new(),
            kind,
            binary: false,
            binarizer: Binarizer::default(),
            cache: None,
        }
    }

    pub fn relu() -> Self {
        Self::new(ActivationKind::ReLU)
    }

    pub fn sigmoid() -> Self {
        Self::new(ActivationKind::Sigmoid)
    }

    pub fn hard_tanh() -> Self {
        Self::new(ActivationKind::HardTanh)
    }

    pub fn kind(&self) -> ActivationKind {
        self.kind
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }
}

impl Unit for Activation {
    fn class_name(&self) -> &'static str {
        match self.kind {
            ActivationKind::ReLU => "ReLU",
            ActivationKind::Sigmoid => "Sigmoid",
            ActivationKind::HardTanh => "HardTanh",
        }
    }

    fn meta(&self) -> &UnitMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut UnitMeta {
        &mut self.meta
    }

    fn negotiate_shape(&mut self, input_shape: &[usize]) -> Result<Vec<usize>> {
        self.cache = None;
        Ok(passthrough_shape(&mut self.meta, input_shape))
    }

    fn forward(&mut self, x: &Buffer, train: bool) -> Result<Buffer> {
        self.meta.check_input(self.class_name(), x)?;
        let t = x.tensor()?;
        let y = if self.binary {
            self.binarizer.forward(&t)?
        } else {
            self.kind.forward(&t)?
        };
        self.cache = if train {
            Some(ActivationCache { x: t, binary: self.binary })
        } else {
            None
        };
        Buffer::from_tensor(y, x.shape())
    }

    fn backward(&mut self, dy: &Buffer) -> Result<Buffer> {
        let class = self.class_name();
        self.meta.check_output_grad(class, dy)?;
        let cache = take_cache(&mut self.cache, class)?;
        let g = dy.tensor()?;
        let dx = if cache.binary {
            self.binarizer.backward(&g, &cache.x)?
        } else {
            self.kind.backward(&g, &cache.x)?
        };
        Buffer::from_tensor(dx, dy.shape())
    }

    fn command(&mut self, args: &[&str]) {
        if let Some(flag) = command_value(args, "binary").and_then(parse_bool) {
            self.binary = flag;
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LutError;
    use candle_core::Device;

    fn buffer(values: &[f32]) -> Buffer {
        Buffer::from_vec(values.to_vec(), values.len(), &[1], &Device::Cpu).unwrap()
    }

    fn column(b: &Buffer) -> Vec<f32> {
        b.to_vec2().unwrap().into_iter().map(|r| r[0]).collect()
    }

    #[test]
    fn binarize_ste_window() {
        let mut unit = Binarize::default();
        unit.negotiate_shape(&[1]).unwrap();
        let x = buffer(&[-1.5, -1.0, -0.2, 0.0, 0.3, 1.0, 1.7]);
        let y = unit.forward(&x, true).unwrap();
        assert_eq!(column(&y), vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);

        let dy = buffer(&[2.0; 7]);
        let dx = unit.backward(&dy).unwrap();
        assert_eq!(column(&dx), vec![0.0, 2.0, 2.0, 2.0, 2.0, 2.0, 0.0]);
    }

    #[test]
    fn binarize_bit_output() {
        let mut unit = Binarize::new(&BinarizeConfig {
            output_dtype: DataType::Bit,
            ..Default::default()
        });
        unit.negotiate_shape(&[1]).unwrap();
        let y = unit.forward(&buffer(&[0.5, -0.5]), false).unwrap();
        assert_eq!(y.dtype(), DataType::Bit);
        assert_eq!(y.packed_words().unwrap(), &[0b01]);
    }

    #[test]
    fn backward_twice_is_state_error() {
        let mut unit = Binarize::default();
        unit.negotiate_shape(&[1]).unwrap();
        unit.forward(&buffer(&[0.1]), true).unwrap();
        unit.backward(&buffer(&[1.0])).unwrap();
        assert!(matches!(unit.backward(&buffer(&[1.0])), Err(LutError::State(_))));
    }

    #[test]
    fn relu_forward_backward() {
        let mut unit = Activation::relu();
        unit.negotiate_shape(&[1]).unwrap();
        let y = unit.forward(&buffer(&[-1.0, 0.5, 2.0]), true).unwrap();
        assert_eq!(column(&y), vec![0.0, 0.5, 2.0]);
        let dx = unit.backward(&buffer(&[1.0, 1.0, 1.0])).unwrap();
        assert_eq!(column(&dx), vec![0.0, 1.0, 1.0]);
    }

    #[test]
    fn sigmoid_derivative() {
        let mut unit = Activation::sigmoid();
        unit.negotiate_shape(&[1]).unwrap();
        let y = unit.forward(&buffer(&[0.0]), true).unwrap();
        assert!((column(&y)[0] - 0.5).abs() < 1e-6);
        let dx = unit.backward(&buffer(&[1.0])).unwrap();
        assert!((column(&dx)[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn hard_tanh_clamps() {
        let mut unit = Activation::hard_tanh();
        unit.negotiate_shape(&[1]).unwrap();
        let y = unit.forward(&buffer(&[-3.0, 0.25, 3.0]), true).unwrap();
        assert_eq!(column(&y), vec![-1.0, 0.25, 1.0]);
        let dx = unit.backward(&buffer(&[1.0; 3])).unwrap();
        assert_eq!(column(&dx), vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn binary_command_switches_mode() {
        let mut unit = Activation::relu();
        unit.negotiate_shape(&[1]).unwrap();
        unit.send_command("binary true", "Sigmoid");
        assert!(!unit.is_binary());
        unit.send_command("binary true", "ReLU");
        assert!(unit.is_binary());
        let y = unit.forward(&buffer(&[-0.5, 0.5]), false).unwrap();
        assert_eq!(column(&y), vec![0.0, 1.0]);
        unit.send_command("host_only true", "all");
        assert!(unit.is_binary());
        unit.send_command("binary false", "all");
        assert!(!unit.is_binary());
    }
}
