//! Folding of multiplied outputs back onto their class nodes.
//!
//! A network that emits `M` copies of every output node (e.g. `[10 · M]` for
//! ten classes) is folded by [`Reduce`] into `[10]`: input node `i` lands on
//! output node `i mod O`. The fold is a sum or a mean over the `M` copies.

use lutnet_common::{ReduceConfig, ReduceMode};
use tracing::debug;

use crate::buffer::Buffer;
use crate::error::{LutError, Result};
use crate::shape::{describe, node_count};
use crate::unit::{take_cache, Unit, UnitMeta};

pub struct Reduce {
    meta: UnitMeta,
    config: ReduceConfig,
    cache: Option<usize>,
}

impl Reduce {
    pub fn new(config: ReduceConfig) -> Result<Self> {
        if config.output_shape.is_empty() || node_count(&config.output_shape) == 0 {
            return Err(LutError::config(format!(
                "Reduce needs a non-empty output shape, got {:?}",
                config.output_shape
            )));
        }
        Ok(Self {
            meta: UnitMeta::new(),
            config,
            cache: None,
        })
    }

    pub fn config(&self) -> &ReduceConfig {
        &self.config
    }

    /// `(M, O)`: copies per output node and output node count.
    fn fold(&self) -> Result<(usize, usize)> {
        let (input_shape, output_shape) = self.meta.shapes(self.class_name())?;
        let outputs = node_count(output_shape);
        Ok((node_count(input_shape) / outputs, outputs))
    }

    fn scale(&self, copies: usize) -> f64 {
        match self.config.mode {
            ReduceMode::Sum => 1.0,
            ReduceMode::Mean => 1.0 / copies as f64,
        }
    }
}

impl Unit for Reduce {
    fn class_name(&self) -> &'static str {
        "Reduce"
    }

    fn meta(&self) -> &UnitMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut UnitMeta {
        &mut self.meta
    }

    fn negotiate_shape(&mut self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let output_shape = self.config.output_shape.clone();
        let inputs = node_count(input_shape);
        let outputs = node_count(&output_shape);
        if inputs == 0 || inputs % outputs != 0 {
            return Err(LutError::shape(format!(
                "Reduce cannot fold {input_shape:?} onto {output_shape:?}"
            )));
        }
        self.meta.set_shapes(input_shape, &output_shape);
        self.cache = None;
        debug!(
            unit = self.name(),
            input = %describe(input_shape),
            output = %describe(&output_shape),
            copies = inputs / outputs,
            "negotiated shape"
        );
        Ok(output_shape)
    }

    fn forward(&mut self, x: &Buffer, train: bool) -> Result<Buffer> {
        self.meta.check_input(self.class_name(), x)?;
        let (copies, outputs) = self.fold()?;
        let frames = x.frames();
        let y = x
            .tensor()?
            .reshape((frames, copies, outputs))?
            .sum(1)?
            .affine(self.scale(copies), 0.0)?;
        self.cache = if train { Some(frames) } else { None };
        Buffer::from_tensor(y, &self.config.output_shape)
    }

    fn backward(&mut self, dy: &Buffer) -> Result<Buffer> {
        let class = self.class_name();
        self.meta.check_output_grad(class, dy)?;
        let frames = take_cache(&mut self.cache, class)?;
        let (copies, outputs) = self.fold()?;
        let (input_shape, _) = self.meta.shapes(class)?;
        let dx = dy
            .tensor()?
            .affine(self.scale(copies), 0.0)?
            .reshape((frames, 1, outputs))?
            .broadcast_as((frames, copies, outputs))?
            .contiguous()?
            .reshape((frames, copies * outputs))?;
        Buffer::from_tensor(dx, input_shape)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn reduce(mode: ReduceMode) -> Reduce {
        let mut unit = Reduce::new(ReduceConfig { mode, ..ReduceConfig::new(&[2]) }).unwrap();
        assert_eq!(unit.negotiate_shape(&[6]).unwrap(), vec![2]);
        unit
    }

    fn input() -> Buffer {
        // Node i belongs to class i mod 2.
        let values = vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0];
        Buffer::from_vec(values, 2, &[6], &Device::Cpu).unwrap()
    }

    #[test]
    fn sum_folds_copies_onto_classes() {
        let mut unit = reduce(ReduceMode::Sum);
        let y = unit.forward(&input(), true).unwrap().to_vec2().unwrap();
        assert_eq!(y, vec![vec![6.0, 60.0], vec![2.0, 2.0]]);

        let dy = Buffer::from_vec(vec![1.0, 2.0, 3.0, 4.0], 2, &[2], &Device::Cpu).unwrap();
        let dx = unit.backward(&dy).unwrap().to_vec2().unwrap();
        assert_eq!(dx[0], vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
        assert_eq!(dx[1], vec![3.0, 4.0, 3.0, 4.0, 3.0, 4.0]);
        assert!(matches!(unit.backward(&dy), Err(LutError::State(_))));
    }

    #[test]
    fn mean_scales_both_passes() {
        let mut unit = reduce(ReduceMode::Mean);
        let y = unit.forward(&input(), true).unwrap().to_vec2().unwrap();
        assert_eq!(y, vec![vec![2.0, 20.0], vec![2.0 / 3.0, 2.0 / 3.0]]);

        let dy = Buffer::from_vec(vec![3.0, 6.0, 0.0, 3.0], 2, &[2], &Device::Cpu).unwrap();
        let dx = unit.backward(&dy).unwrap().to_vec2().unwrap();
        assert_eq!(dx[0], vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
        assert_eq!(dx[1], vec![0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn packed_input_is_counted() {
        let mut unit = reduce(ReduceMode::Sum);
        let bits = [true, false, true, true, false, true];
        let x = Buffer::from_bools(&bits, 1, &[6], &Device::Cpu).unwrap();
        assert_eq!(unit.forward(&x, false).unwrap().to_vec2().unwrap(), vec![vec![2.0, 2.0]]);
    }

    #[test]
    fn uneven_fold_is_shape_error() {
        let mut unit = Reduce::new(ReduceConfig::new(&[4])).unwrap();
        assert!(matches!(unit.negotiate_shape(&[6]), Err(LutError::Shape(_))));
        assert!(matches!(
            Reduce::new(ReduceConfig::default()),
            Err(LutError::Configuration(_))
        ));
    }
}
