//! Stochastic bit-stream modulation.
//!
//! [`RealToBinary`] expands every real frame into M bit frames (`x > u` for M
//! thresholds `u`), a wrapped binary network runs on the bit frames, and
//! [`BinaryToReal`] averages each group of M frames back into one real frame.
//! [`BinaryModulation`] packages the three stages and switches M between
//! training and inference.
//!
//! Generated frame `f · M + m` belongs to input frame `f`.

use lutnet_common::{DataType, ModulationConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::buffer::Buffer;
use crate::error::{LutError, Result};
use crate::snapshot::Snapshot;
use crate::unit::{command_value, take_cache, Unit, UnitMeta};
use crate::variables::Variables;

fn identity_shape(meta: &mut UnitMeta, input_shape: &[usize]) -> Vec<usize> {
    meta.set_shapes(input_shape, input_shape);
    input_shape.to_vec()
}

fn check_size(size: usize) -> Result<()> {
    if size == 0 {
        return Err(LutError::config("modulation size must be at least 1"));
    }
    Ok(())
}

// ── RealToBinary ────────────────────────────────────────────────────────────

pub struct RealToBinary {
    meta: UnitMeta,
    config: ModulationConfig,
    modulation_size: usize,
    rng: StdRng,
    cache: Option<usize>,
}

impl RealToBinary {
    pub fn new(config: ModulationConfig) -> Result<Self> {
        check_size(config.training_size)?;
        check_size(config.inference_size)?;
        if config.input_max <= config.input_min {
            return Err(LutError::config(format!(
                "empty input range [{}, {}]",
                config.input_min, config.input_max
            )));
        }
        Ok(Self {
            meta: UnitMeta::new(),
            modulation_size: config.training_size,
            rng: StdRng::seed_from_u64(config.seed),
            config,
            cache: None,
        })
    }

    pub fn modulation_size(&self) -> usize {
        self.modulation_size
    }

    pub fn set_modulation_size(&mut self, size: usize) -> Result<()> {
        check_size(size)?;
        self.modulation_size = size;
        Ok(())
    }

    fn threshold(&mut self, m: usize) -> f32 {
        if self.config.random_thresholds {
            self.rng.gen::<f32>()
        } else {
            (m as f32 + 0.5) / self.modulation_size as f32
        }
    }
}

impl Unit for RealToBinary {
    fn class_name(&self) -> &'static str {
        "RealToBinary"
    }

    fn meta(&self) -> &UnitMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut UnitMeta {
        &mut self.meta
    }

    fn negotiate_shape(&mut self, input_shape: &[usize]) -> Result<Vec<usize>> {
        self.cache = None;
        Ok(identity_shape(&mut self.meta, input_shape))
    }

    fn forward(&mut self, x: &Buffer, train: bool) -> Result<Buffer> {
        self.meta.check_input(self.class_name(), x)?;
        let rows = x.to_vec2()?;
        let size = self.modulation_size;
        let nodes = x.node_count();
        let (lo, hi) = (self.config.input_min, self.config.input_max);
        let mut values = Vec::with_capacity(rows.len() * size * nodes);
        for row in &rows {
            for m in 0..size {
                let shared = self.threshold(m);
                for &v in row {
                    let u = if self.config.framewise { shared } else { self.threshold(m) };
                    let p = (v - lo) / (hi - lo);
                    values.push(if p > u { 1.0 } else { 0.0 });
                }
            }
        }
        let y = Buffer::from_vec(values, rows.len() * size, x.shape(), x.device())?;
        self.cache = if train { Some(size) } else { None };
        y.to_dtype(self.config.bit_dtype)
    }

    /// Straight-through: each real frame receives the sum of its bit frames'
    /// gradients.
    fn backward(&mut self, dy: &Buffer) -> Result<Buffer> {
        let class = self.class_name();
        self.meta.check_output_grad(class, dy)?;
        let size = take_cache(&mut self.cache, class)?;
        let nodes = dy.node_count();
        let frames = dy.frames() / size;
        let dx = dy.tensor()?.reshape((frames, size, nodes))?.sum(1)?;
        Buffer::from_tensor(dx, dy.shape())
    }

    fn command(&mut self, args: &[&str]) {
        if let Some(size) = command_value(args, "modulation_size").and_then(|v| v.parse().ok()) {
            if self.set_modulation_size(size).is_err() {
                warn!(unit = self.name(), "ignoring modulation_size 0");
            }
        }
    }
}

// ── BinaryToReal ────────────────────────────────────────────────────────────

pub struct BinaryToReal {
    meta: UnitMeta,
    modulation_size: usize,
    cache: Option<usize>,
}

impl BinaryToReal {
    pub fn new(modulation_size: usize) -> Result<Self> {
        check_size(modulation_size)?;
        Ok(Self {
            meta: UnitMeta::new(),
            modulation_size,
            cache: None,
        })
    }

    pub fn modulation_size(&self) -> usize {
        self.modulation_size
    }

    pub fn set_modulation_size(&mut self, size: usize) -> Result<()> {
        check_size(size)?;
        self.modulation_size = size;
        Ok(())
    }
}

impl Unit for BinaryToReal {
    fn class_name(&self) -> &'static str {
        "BinaryToReal"
    }

    fn meta(&self) -> &UnitMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut UnitMeta {
        &mut self.meta
    }

    fn negotiate_shape(&mut self, input_shape: &[usize]) -> Result<Vec<usize>> {
        self.cache = None;
        Ok(identity_shape(&mut self.meta, input_shape))
    }

    fn forward(&mut self, x: &Buffer, train: bool) -> Result<Buffer> {
        self.meta.check_input(self.class_name(), x)?;
        let size = self.modulation_size;
        if x.frames() % size != 0 {
            return Err(LutError::shape(format!(
                "{} frames are not a multiple of modulation size {size}",
                x.frames()
            )));
        }
        let frames = x.frames() / size;
        let y = x.tensor()?.reshape((frames, size, x.node_count()))?.mean(1)?;
        self.cache = if train { Some(size) } else { None };
        Buffer::from_tensor(y, x.shape())
    }

    fn backward(&mut self, dy: &Buffer) -> Result<Buffer> {
        let class = self.class_name();
        self.meta.check_output_grad(class, dy)?;
        let size = take_cache(&mut self.cache, class)?;
        let (frames, nodes) = (dy.frames(), dy.node_count());
        let dx = dy
            .tensor()?
            .unsqueeze(1)?
            .broadcast_as((frames, size, nodes))?
            .affine(1.0 / size as f64, 0.0)?
            .contiguous()?
            .reshape((frames * size, nodes))?;
        Buffer::from_tensor(dx, dy.shape())
    }
}

// ── BinaryModulation ────────────────────────────────────────────────────────

/// `RealToBinary → layer → BinaryToReal` with separate training and
/// inference modulation sizes.
pub struct BinaryModulation {
    meta: UnitMeta,
    config: ModulationConfig,
    encoder: RealToBinary,
    layer: Box<dyn Unit>,
    decoder: BinaryToReal,
}

impl BinaryModulation {
    pub fn new(layer: Box<dyn Unit>, config: ModulationConfig) -> Result<Self> {
        Ok(Self {
            meta: UnitMeta::new(),
            encoder: RealToBinary::new(config.clone())?,
            decoder: BinaryToReal::new(config.training_size)?,
            layer,
            config,
        })
    }

    pub fn layer(&self) -> &dyn Unit {
        self.layer.as_ref()
    }

    pub fn layer_mut(&mut self) -> &mut dyn Unit {
        &mut *self.layer
    }

    fn select_size(&mut self, train: bool) -> Result<()> {
        let size = if train {
            self.config.training_size
        } else {
            self.config.inference_size
        };
        self.encoder.set_modulation_size(size)?;
        self.decoder.set_modulation_size(size)
    }
}

impl Unit for BinaryModulation {
    fn class_name(&self) -> &'static str {
        "BinaryModulation"
    }

    fn meta(&self) -> &UnitMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut UnitMeta {
        &mut self.meta
    }

    fn negotiate_shape(&mut self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let shape = self.encoder.negotiate_shape(input_shape)?;
        let shape = self.layer.negotiate_shape(&shape)?;
        let shape = self.decoder.negotiate_shape(&shape)?;
        self.meta.set_shapes(input_shape, &shape);
        Ok(shape)
    }

    fn forward(&mut self, x: &Buffer, train: bool) -> Result<Buffer> {
        self.meta.check_input(self.class_name(), x)?;
        self.select_size(train)?;
        let bits = self.encoder.forward(x, train)?;
        let y = self.layer.forward(&bits, train)?;
        self.decoder.forward(&y.to_dtype(DataType::F32)?, train)
    }

    fn backward(&mut self, dy: &Buffer) -> Result<Buffer> {
        let g = self.decoder.backward(dy)?;
        let g = self.layer.backward(&g)?;
        self.encoder.backward(&g)
    }

    fn send_command(&mut self, command: &str, target: &str) {
        if self.accepts(target) {
            let args: Vec<&str> = command.split_whitespace().collect();
            self.command(&args);
        }
        self.encoder.send_command(command, target);
        self.layer.send_command(command, target);
        self.decoder.send_command(command, target);
    }

    fn parameters(&self) -> Variables {
        self.layer.parameters()
    }

    fn gradients(&self) -> Variables {
        self.layer.gradients()
    }

    fn save(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new(self.class_name());
        snapshot.children.push(self.layer.save()?);
        Ok(snapshot)
    }

    fn load(&mut self, snapshot: &Snapshot) -> Result<()> {
        snapshot.expect_class(self.class_name())?;
        let children = snapshot.expect_children(1)?;
        self.layer.load(&children[0])
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};
    use crate::activation::Activation;

    fn ramp(frames: usize, nodes: usize, device: &Device) -> candle_core::Result<Tensor> {
        let total = frames * nodes;
        let step = if total > 1 { 1.0 / (total - 1) as f32 } else { 0.0 };
        let values: Vec<f32> = (0..total).map(|i| i as f32 * step).collect();
        Tensor::from_vec(values, (frames, nodes), device)
    }

    fn even(size: usize) -> ModulationConfig {
        ModulationConfig {
            training_size: size,
            inference_size: size,
            random_thresholds: false,
            ..Default::default()
        }
    }

    #[test]
    fn evenly_spaced_thresholds_encode_density() {
        let dev = Device::Cpu;
        let mut enc = RealToBinary::new(even(4)).unwrap();
        enc.negotiate_shape(&[1]).unwrap();
        let x = Buffer::from_vec(vec![0.3, 0.9], 2, &[1], &dev).unwrap();
        let bits = enc.forward(&x, false).unwrap();
        assert_eq!(bits.dtype(), DataType::Bit);
        assert_eq!(bits.frames(), 8);
        // thresholds 0.125, 0.375, 0.625, 0.875
        let got: Vec<bool> = (0..8).map(|f| bits.bit(f, 0).unwrap()).collect();
        assert_eq!(got, vec![true, false, false, false, true, true, true, true]);
    }

    #[test]
    fn decoder_averages_groups() {
        let dev = Device::Cpu;
        let mut dec = BinaryToReal::new(4).unwrap();
        dec.negotiate_shape(&[1]).unwrap();
        let x = Buffer::from_vec(vec![1.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0], 8, &[1], &dev).unwrap();
        let y = dec.forward(&x, true).unwrap().to_vec2().unwrap();
        assert_eq!(y, vec![vec![0.25], vec![0.75]]);
        let dy = Buffer::from_vec(vec![1.0, 2.0], 2, &[1], &dev).unwrap();
        let dx = dec.backward(&dy).unwrap().to_vec2().unwrap();
        assert_eq!(dx.len(), 8);
        assert_eq!(dx[0], vec![0.25]);
        assert_eq!(dx[7], vec![0.5]);
        let bad = Buffer::from_vec(vec![0.0; 3], 3, &[1], &dev).unwrap();
        assert!(dec.forward(&bad, false).is_err());
    }

    #[test]
    fn wrapped_identity_recovers_quantised_input() {
        let dev = Device::Cpu;
        let config = ModulationConfig {
            training_size: 2,
            inference_size: 8,
            ..even(8)
        };
        let mut unit = BinaryModulation::new(Box::new(Activation::hard_tanh()), config).unwrap();
        unit.negotiate_shape(&[3]).unwrap();
        let x = Buffer::from_tensor(ramp(2, 3, &dev).unwrap(), &[3]).unwrap();

        let y = unit.forward(&x, false).unwrap().to_vec2().unwrap();
        let expected = x.to_vec2().unwrap();
        for (row, want) in y.iter().zip(&expected) {
            for (a, b) in row.iter().zip(want) {
                assert!((a - b).abs() <= 1.0 / 8.0 + 1e-6, "{a} vs {b}");
            }
        }

        let y = unit.forward(&x, true).unwrap();
        assert_eq!(y.frames(), 2);
        let dy = Buffer::from_vec(vec![1.0; 6], 2, &[3], &dev).unwrap();
        let dx = unit.backward(&dy).unwrap().to_vec2().unwrap();
        // Average then sum over the group: gradient passes through unchanged.
        assert!(dx.iter().flatten().all(|g| (g - 1.0).abs() < 1e-6));
    }

    #[test]
    fn random_thresholds_are_seeded() {
        let dev = Device::Cpu;
        let config = ModulationConfig { training_size: 16, ..Default::default() };
        let x = Buffer::from_vec(vec![0.5; 4], 1, &[4], &dev).unwrap();
        let run = || {
            let mut enc = RealToBinary::new(config.clone()).unwrap();
            enc.negotiate_shape(&[4]).unwrap();
            enc.forward(&x, false).unwrap().packed_words().unwrap().to_vec()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn zero_modulation_size_is_rejected() {
        assert!(matches!(
            RealToBinary::new(ModulationConfig { training_size: 0, ..Default::default() }),
            Err(LutError::Configuration(_))
        ));
        assert!(BinaryToReal::new(0).is_err());
    }
}
