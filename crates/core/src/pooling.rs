//! Spatial pooling over non-overlapping windows.
//!
//! | Unit | Forward | Backward | Packed input |
//! |------|---------|----------|--------------|
//! | [`MaxPooling`] | window maximum | `dy` routed to the arg-max tap | bitwise OR |
//! | [`StochasticMaxPooling`] | `1 − Π(1 − x)` | `dy · Π_{j≠i}(1 − x_j)` | bitwise OR |
//!
//! A `(C, H, W)` input pools to `(C, H / fh, W / fw)`. Rows and columns that
//! do not fill a whole window are dropped. Packed inputs stay packed; in
//! training mode they are also unpacked so the backward pass has values.

use candle_core::{DType, Device, Tensor};
use lutnet_common::PoolingConfig;
use rayon::prelude::*;
use tracing::debug;

use crate::buffer::{words_per_node, Buffer};
use crate::conv::spatial_input;
use crate::error::{LutError, Result};
use crate::shape::{describe, flatten_index, node_count};
use crate::unit::{take_cache, Unit, UnitMeta};

// ── Window layout ───────────────────────────────────────────────────────────

/// Input node of every (tap, output node) pair.
struct PoolLayout {
    /// `taps[fy·fw + fx][o]`.
    taps: Vec<Vec<u32>>,
    input_nodes: usize,
}

impl PoolLayout {
    fn build(class: &str, config: &PoolingConfig, input_shape: &[usize]) -> Result<(Self, Vec<usize>)> {
        let (fh, fw) = config.filter_size;
        let (c, h, w) = spatial_input(class, input_shape)?;
        if h < fh || w < fw {
            return Err(LutError::shape(format!(
                "{class} window {:?} does not fit input {input_shape:?}",
                config.filter_size
            )));
        }
        let (oh, ow) = (h / fh, w / fw);
        let mut taps = vec![Vec::with_capacity(c * oh * ow); fh * fw];
        for ch in 0..c {
            for oy in 0..oh {
                for ox in 0..ow {
                    for fy in 0..fh {
                        for fx in 0..fw {
                            let i = flatten_index(&[ch, oy * fh + fy, ox * fw + fx], input_shape)?;
                            taps[fy * fw + fx].push(i as u32);
                        }
                    }
                }
            }
        }
        let layout = Self {
            taps,
            input_nodes: node_count(input_shape),
        };
        Ok((layout, vec![c, oh, ow]))
    }

    fn tap_ids(&self, device: &Device) -> Result<Vec<Tensor>> {
        self.taps
            .iter()
            .map(|tap| Ok(Tensor::from_vec(tap.clone(), tap.len(), device)?))
            .collect()
    }

    /// One `(frames, outputs)` tensor per tap.
    fn gather(&self, x: &Tensor) -> Result<Vec<Tensor>> {
        self.tap_ids(x.device())?
            .iter()
            .map(|ids| Ok(x.index_select(ids, 1)?))
            .collect()
    }

    /// Sum per-tap `(frames, outputs)` gradients back onto the input nodes.
    fn scatter(&self, grads: &[Tensor], frames: usize, device: &Device) -> Result<Tensor> {
        let mut dx = Tensor::zeros((frames, self.input_nodes), DType::F32, device)?;
        for (ids, g) in self.tap_ids(device)?.iter().zip(grads) {
            dx = dx.index_add(ids, g, 1)?;
        }
        Ok(dx)
    }

    /// OR of every window, one rayon task per output node.
    fn or_packed(&self, words: &[u32], frames: usize) -> Vec<u32> {
        let wpn = words_per_node(frames);
        let outputs = self.taps.first().map_or(0, Vec::len);
        let mut out = vec![0u32; outputs * wpn];
        if wpn == 0 {
            return out;
        }
        out.par_chunks_mut(wpn).enumerate().for_each(|(node, dst)| {
            for tap in &self.taps {
                let src = tap[node] as usize * wpn;
                for (d, &s) in dst.iter_mut().zip(&words[src..src + wpn]) {
                    *d |= s;
                }
            }
        });
        out
    }
}

fn validate(class: &str, config: &PoolingConfig) -> Result<()> {
    let (fh, fw) = config.filter_size;
    if fh == 0 || fw == 0 {
        return Err(LutError::config(format!(
            "{class} window {:?} must be positive",
            config.filter_size
        )));
    }
    Ok(())
}

fn negotiate(
    meta: &mut UnitMeta,
    class: &str,
    config: &PoolingConfig,
    input_shape: &[usize],
) -> Result<(PoolLayout, Vec<usize>)> {
    let (layout, output_shape) = PoolLayout::build(class, config, input_shape)?;
    meta.set_shapes(input_shape, &output_shape);
    debug!(
        unit = meta.name().unwrap_or(class),
        input = %describe(input_shape),
        output = %describe(&output_shape),
        "negotiated shape"
    );
    Ok((layout, output_shape))
}

// ── MaxPooling ──────────────────────────────────────────────────────────────

pub struct MaxPooling {
    meta: UnitMeta,
    config: PoolingConfig,
    layout: Option<PoolLayout>,
    /// Winning tap per `(frame, output)`, as `F32`.
    cache: Option<Tensor>,
}

impl MaxPooling {
    pub fn new(config: PoolingConfig) -> Result<Self> {
        validate("MaxPooling", &config)?;
        Ok(Self {
            meta: UnitMeta::new(),
            config,
            layout: None,
            cache: None,
        })
    }

    pub fn config(&self) -> &PoolingConfig {
        &self.config
    }

    fn layout(&self) -> Result<&PoolLayout> {
        self.layout
            .as_ref()
            .ok_or_else(|| LutError::shape("MaxPooling used before negotiate_shape"))
    }
}

impl Unit for MaxPooling {
    fn class_name(&self) -> &'static str {
        "MaxPooling"
    }

    fn meta(&self) -> &UnitMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut UnitMeta {
        &mut self.meta
    }

    fn negotiate_shape(&mut self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let class = self.class_name();
        let (layout, output_shape) = negotiate(&mut self.meta, class, &self.config, input_shape)?;
        self.layout = Some(layout);
        self.cache = None;
        Ok(output_shape)
    }

    fn forward(&mut self, x: &Buffer, train: bool) -> Result<Buffer> {
        let class = self.class_name();
        self.meta.check_input(class, x)?;
        let output_shape = self.meta.shapes(class)?.1.to_vec();
        let layout = self.layout()?;
        let frames = x.frames();
        if let (Some(words), false) = (x.packed_words(), train) {
            let out = layout.or_packed(words, frames);
            self.cache = None;
            return Buffer::from_packed(out, frames, &output_shape, x.device());
        }
        let windows = Tensor::stack(&layout.gather(&x.tensor()?)?, 0)?;
        let y = windows.max(0)?;
        self.cache = if train {
            Some(windows.argmax(0)?.to_dtype(DType::F32)?)
        } else {
            None
        };
        Buffer::from_tensor(y, &output_shape)?.to_dtype(x.dtype())
    }

    fn backward(&mut self, dy: &Buffer) -> Result<Buffer> {
        let class = self.class_name();
        self.meta.check_output_grad(class, dy)?;
        let winner = take_cache(&mut self.cache, class)?;
        let layout = self.layout()?;
        let (input_shape, _) = self.meta.shapes(class)?;
        let g = dy.tensor()?;
        let grads = (0..layout.taps.len())
            .map(|tap| Ok(g.mul(&winner.eq(tap as f64)?.to_dtype(DType::F32)?)?))
            .collect::<Result<Vec<_>>>()?;
        let dx = layout.scatter(&grads, dy.frames(), g.device())?;
        Buffer::from_tensor(dx, input_shape)
    }
}

// ── StochasticMaxPooling ────────────────────────────────────────────────────

/// Probabilistic OR: the chance that at least one tap of the window fires.
pub struct StochasticMaxPooling {
    meta: UnitMeta,
    config: PoolingConfig,
    layout: Option<PoolLayout>,
    /// `1 − x` per tap.
    cache: Option<Vec<Tensor>>,
}

impl StochasticMaxPooling {
    pub fn new(config: PoolingConfig) -> Result<Self> {
        validate("StochasticMaxPooling", &config)?;
        Ok(Self {
            meta: UnitMeta::new(),
            config,
            layout: None,
            cache: None,
        })
    }

    pub fn config(&self) -> &PoolingConfig {
        &self.config
    }

    fn layout(&self) -> Result<&PoolLayout> {
        self.layout
            .as_ref()
            .ok_or_else(|| LutError::shape("StochasticMaxPooling used before negotiate_shape"))
    }
}

impl Unit for StochasticMaxPooling {
    fn class_name(&self) -> &'static str {
        "StochasticMaxPooling"
    }

    fn meta(&self) -> &UnitMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut UnitMeta {
        &mut self.meta
    }

    fn negotiate_shape(&mut self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let class = self.class_name();
        let (layout, output_shape) = negotiate(&mut self.meta, class, &self.config, input_shape)?;
        self.layout = Some(layout);
        self.cache = None;
        Ok(output_shape)
    }

    fn forward(&mut self, x: &Buffer, train: bool) -> Result<Buffer> {
        let class = self.class_name();
        self.meta.check_input(class, x)?;
        let output_shape = self.meta.shapes(class)?.1.to_vec();
        let layout = self.layout()?;
        let frames = x.frames();
        if let (Some(words), false) = (x.packed_words(), train) {
            let out = layout.or_packed(words, frames);
            self.cache = None;
            return Buffer::from_packed(out, frames, &output_shape, x.device());
        }
        let complements = layout
            .gather(&x.tensor()?)?
            .iter()
            .map(|t| Ok(t.affine(-1.0, 1.0)?))
            .collect::<Result<Vec<_>>>()?;
        let mut none = complements[0].clone();
        for c in &complements[1..] {
            none = none.mul(c)?;
        }
        let y = none.affine(-1.0, 1.0)?;
        self.cache = if train { Some(complements) } else { None };
        Buffer::from_tensor(y, &output_shape)?.to_dtype(x.dtype())
    }

    fn backward(&mut self, dy: &Buffer) -> Result<Buffer> {
        let class = self.class_name();
        self.meta.check_output_grad(class, dy)?;
        let complements = take_cache(&mut self.cache, class)?;
        let layout = self.layout()?;
        let (input_shape, _) = self.meta.shapes(class)?;
        let g = dy.tensor()?;
        let grads = (0..complements.len())
            .map(|tap| {
                let mut d = g.clone();
                for (j, c) in complements.iter().enumerate() {
                    if j != tap {
                        d = d.mul(c)?;
                    }
                }
                Ok(d)
            })
            .collect::<Result<Vec<_>>>()?;
        let dx = layout.scatter(&grads, dy.frames(), g.device())?;
        Buffer::from_tensor(dx, input_shape)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
