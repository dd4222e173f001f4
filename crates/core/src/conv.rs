//! Convolution lowering.
//!
//! A 2-D convolution is rewritten as a per-patch computation:
//!
//! ```text
//! (F, C, H, W) ──Im2Col──▶ (F·OH·OW, C, fh, fw) ──sub-unit──▶ (F·OH·OW, M) ──Col2Im──▶ (F, M, OH, OW)
//! ```
//!
//! Patch frame `f·OH·OW + oy·OW + ox` holds the window whose origin is
//! `(oy·sh − pad_y, ox·sw − pad_x)`. Taps outside the image are resolved by
//! the [`BorderMode`]; constant fills read a sentinel column appended to the
//! input. Any sub-unit works, so a sparse LUT becomes a LUT convolution.

use candle_core::{Device, Tensor};
use lutnet_common::{BorderMode, ConvolutionConfig, Padding};
use tracing::debug;

use crate::buffer::Buffer;
use crate::error::{LutError, Result};
use crate::sequential::Sequential;
use crate::shape::{describe, flatten_index, node_count};
use crate::snapshot::Snapshot;
use crate::unit::{take_cache, Unit, UnitMeta};
use crate::variables::Variables;

/// Output spatial size for one axis.
fn output_extent(input: usize, filter: usize, stride: usize, padding: Padding) -> Result<usize> {
    match padding {
        Padding::Valid => {
            if input < filter {
                return Err(LutError::shape(format!(
                    "valid padding needs input {input} >= filter {filter}"
                )));
            }
            Ok((input - filter + stride) / stride)
        }
        Padding::Same => Ok(input.div_ceil(stride)),
    }
}

/// `(OH, OW)` for an `(H, W)` input.
pub fn conv_output_size(input: (usize, usize), config: &ConvolutionConfig) -> Result<(usize, usize)> {
    let (fh, fw) = config.filter_size;
    let (sh, sw) = config.stride;
    Ok((
        output_extent(input.0, fh, sh, config.padding)?,
        output_extent(input.1, fw, sw, config.padding)?,
    ))
}

fn validate(config: &ConvolutionConfig) -> Result<()> {
    let (fh, fw) = config.filter_size;
    let (sh, sw) = config.stride;
    if fh == 0 || fw == 0 || sh == 0 || sw == 0 {
        return Err(LutError::config(format!(
            "filter {:?} and stride {:?} must be positive",
            config.filter_size, config.stride
        )));
    }
    Ok(())
}

pub(crate) fn spatial_input(class: &str, shape: &[usize]) -> Result<(usize, usize, usize)> {
    match *shape {
        [c, h, w] => Ok((c, h, w)),
        _ => Err(LutError::shape(format!(
            "{class} needs a (channels, height, width) input, got {shape:?}"
        ))),
    }
}

/// Map a possibly out-of-range coordinate into `0..size`, or `None` for fill.
fn resolve(pos: isize, size: usize, mode: BorderMode) -> Option<usize> {
    let n = size as isize;
    if (0..n).contains(&pos) {
        return Some(pos as usize);
    }
    match mode {
        BorderMode::Constant => None,
        BorderMode::Replicate => Some(pos.clamp(0, n - 1) as usize),
        BorderMode::Wrap => Some(pos.rem_euclid(n) as usize),
        BorderMode::Reflect => {
            let period = 2 * n;
            let p = pos.rem_euclid(period);
            let folded = if p < n { p } else { period - 1 - p };
            Some(folded as usize)
        }
        BorderMode::Reflect101 => {
            if n == 1 {
                return Some(0);
            }
            let period = 2 * (n - 1);
            let p = pos.rem_euclid(period);
            let folded = if p < n { p } else { period - p };
            Some(folded as usize)
        }
    }
}

// ── Im2Col ──────────────────────────────────────────────────────────────────

struct Im2ColLayout {
    /// Patches per input frame (`OH · OW`).
    patches: usize,
    /// Source column per (patch, tap); `sentinel` selects the fill value.
    indices: Vec<u32>,
    sentinel: u32,
    uses_fill: bool,
}

impl Im2ColLayout {
    fn index_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(self.indices.clone(), self.indices.len(), device)?)
    }
}

pub struct Im2Col {
    meta: UnitMeta,
    config: ConvolutionConfig,
    layout: Option<Im2ColLayout>,
    cache: Option<usize>,
}

impl Im2Col {
    pub fn new(config: &ConvolutionConfig) -> Result<Self> {
        validate(config)?;
        Ok(Self {
            meta: UnitMeta::new(),
            config: config.clone(),
            layout: None,
            cache: None,
        })
    }

    /// `(OH, OW)` after negotiation.
    pub fn output_size(&self) -> Result<(usize, usize)> {
        let (_, h, w) = spatial_input(self.class_name(), self.meta.shapes(self.class_name())?.0)?;
        conv_output_size((h, w), &self.config)
    }

    fn layout(&self) -> Result<&Im2ColLayout> {
        self.layout
            .as_ref()
            .ok_or_else(|| LutError::shape("Im2Col used before negotiate_shape"))
    }
}

impl Unit for Im2Col {
    fn class_name(&self) -> &'static str {
        "Im2Col"
    }

    fn meta(&self) -> &UnitMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut UnitMeta {
        &mut self.meta
    }

    fn negotiate_shape(&mut self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let (c, h, w) = spatial_input(self.class_name(), input_shape)?;
        let (oh, ow) = conv_output_size((h, w), &self.config)?;
        let (fh, fw) = self.config.filter_size;
        let (sh, sw) = self.config.stride;
        let (pad_y, pad_x) = match self.config.padding {
            Padding::Valid => (0, 0),
            Padding::Same => ((fh - 1) / 2, (fw - 1) / 2),
        };
        let sentinel = (c * h * w) as u32;
        let mut indices = Vec::with_capacity(oh * ow * c * fh * fw);
        let mut uses_fill = false;
        for oy in 0..oh {
            for ox in 0..ow {
                for ch in 0..c {
                    for fy in 0..fh {
                        for fx in 0..fw {
                            let iy = (oy * sh + fy) as isize - pad_y as isize;
                            let ix = (ox * sw + fx) as isize - pad_x as isize;
                            let mode = self.config.border_mode;
                            match (resolve(iy, h, mode), resolve(ix, w, mode)) {
                                (Some(y), Some(x)) => {
                                    indices.push(flatten_index(&[ch, y, x], input_shape)? as u32)
                                }
                                _ => {
                                    uses_fill = true;
                                    indices.push(sentinel);
                                }
                            }
                        }
                    }
                }
            }
        }
        self.layout = Some(Im2ColLayout {
            patches: oh * ow,
            indices,
            sentinel,
            uses_fill,
        });
        self.cache = None;
        let output_shape = vec![c, fh, fw];
        self.meta.set_shapes(input_shape, &output_shape);
        debug!(
            unit = self.name(),
            input = %describe(input_shape),
            patches = oh * ow,
            patch = %describe(&output_shape),
            "negotiated shape"
        );
        Ok(output_shape)
    }

    fn forward(&mut self, x: &Buffer, train: bool) -> Result<Buffer> {
        self.meta.check_input(self.class_name(), x)?;
        let layout = self.layout()?;
        let (_, patch_shape) = self.meta.shapes(self.class_name())?;
        let frames = x.frames();
        let dense = x.tensor()?;
        let source = if layout.uses_fill {
            let fill = Tensor::full(self.config.border_value, (frames, 1), dense.device())?;
            Tensor::cat(&[&dense, &fill], 1)?
        } else {
            dense
        };
        let ids = layout.index_tensor(source.device())?;
        let cols = source
            .index_select(&ids, 1)?
            .reshape((frames * layout.patches, node_count(patch_shape)))?;
        let y = Buffer::from_tensor(cols, patch_shape)?;
        let y = y.to_dtype(x.dtype())?;
        self.cache = if train { Some(frames) } else { None };
        Ok(y)
    }

    fn backward(&mut self, dy: &Buffer) -> Result<Buffer> {
        let class = self.class_name();
        self.meta.check_output_grad(class, dy)?;
        let frames = take_cache(&mut self.cache, class)?;
        let layout = self.layout()?;
        let (input_shape, _) = self.meta.shapes(class)?;
        let input_nodes = node_count(input_shape);
        let g = dy.tensor()?;
        let g = g.reshape((frames, layout.indices.len()))?;
        let ids = layout.index_tensor(g.device())?;
        let width = layout.sentinel as usize + 1;
        let dx = Tensor::zeros((frames, width), g.dtype(), g.device())?
            .index_add(&ids, &g, 1)?
            .narrow(1, 0, input_nodes)?;
        Buffer::from_tensor(dx, input_shape)
    }
}

// ── Col2Im ──────────────────────────────────────────────────────────────────

/// Regroups `F·OH·OW` frames of `C` nodes into `F` frames of `(C, OH, OW)`.
pub struct Col2Im {
    meta: UnitMeta,
    out_h: usize,
    out_w: usize,
    cache: Option<usize>,
}

impl Col2Im {
    pub fn new(out_h: usize, out_w: usize) -> Self {
        Self {
            meta: UnitMeta::new(),
            out_h,
            out_w,
            cache: None,
        }
    }

    pub fn output_size(&self) -> (usize, usize) {
        (self.out_h, self.out_w)
    }
}

impl Unit for Col2Im {
    fn class_name(&self) -> &'static str {
        "Col2Im"
    }

    fn meta(&self) -> &UnitMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut UnitMeta {
        &mut self.meta
    }

    fn negotiate_shape(&mut self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let channels = node_count(input_shape);
        let output_shape = vec![channels, self.out_h, self.out_w];
        self.meta.set_shapes(input_shape, &output_shape);
        self.cache = None;
        Ok(output_shape)
    }

    fn forward(&mut self, x: &Buffer, train: bool) -> Result<Buffer> {
        let class = self.class_name();
        self.meta.check_input(class, x)?;
        let (_, output_shape) = self.meta.shapes(class)?;
        let patches = self.out_h * self.out_w;
        if patches == 0 || x.frames() % patches != 0 {
            return Err(LutError::shape(format!(
                "{} frames cannot be grouped into {}×{} images",
                x.frames(),
                self.out_h,
                self.out_w
            )));
        }
        let frames = x.frames() / patches;
        let channels = x.node_count();
        let y = x
            .tensor()?
            .reshape((frames, patches, channels))?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((frames, channels * patches))?;
        let y = Buffer::from_tensor(y, output_shape)?.to_dtype(x.dtype())?;
        self.cache = if train { Some(frames) } else { None };
        Ok(y)
    }

    fn backward(&mut self, dy: &Buffer) -> Result<Buffer> {
        let class = self.class_name();
        self.meta.check_output_grad(class, dy)?;
        let frames = take_cache(&mut self.cache, class)?;
        let (input_shape, _) = self.meta.shapes(class)?;
        let patches = self.out_h * self.out_w;
        let channels = node_count(input_shape);
        let dx = dy
            .tensor()?
            .reshape((frames, channels, patches))?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((frames * patches, channels))?;
        Buffer::from_tensor(dx, input_shape)
    }
}

// ── Convolution2d ───────────────────────────────────────────────────────────

/// `Im2Col → sub-unit → Col2Im`, with the output size fixed at negotiation.
pub struct Convolution2d {
    meta: UnitMeta,
    config: ConvolutionConfig,
    layers: Sequential,
}

const SUB_UNIT: usize = 1;
const COL2IM: usize = 2;

impl Convolution2d {
    pub fn new(sub_unit: Box<dyn Unit>, config: ConvolutionConfig) -> Result<Self> {
        let im2col = Im2Col::new(&config)?;
        let layers = Sequential::from_units(vec![
            Box::new(im2col),
            sub_unit,
            Box::new(Col2Im::new(1, 1)),
        ]);
        Ok(Self {
            meta: UnitMeta::new(),
            config,
            layers,
        })
    }

    pub fn config(&self) -> &ConvolutionConfig {
        &self.config
    }

    pub fn sub_unit(&self) -> Option<&dyn Unit> {
        self.layers.get(SUB_UNIT)
    }

    pub fn sub_unit_mut(&mut self) -> Option<&mut dyn Unit> {
        self.layers.get_mut(SUB_UNIT)
    }

    /// `(OH, OW)` for an `(H, W)` input.
    pub fn output_size(&self, input: (usize, usize)) -> Result<(usize, usize)> {
        conv_output_size(input, &self.config)
    }
}

impl Unit for Convolution2d {
    fn class_name(&self) -> &'static str {
        "Convolution2d"
    }

    fn meta(&self) -> &UnitMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut UnitMeta {
        &mut self.meta
    }

    fn negotiate_shape(&mut self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let (_, h, w) = spatial_input(self.class_name(), input_shape)?;
        let (oh, ow) = self.output_size((h, w))?;
        self.layers.set(COL2IM, Box::new(Col2Im::new(oh, ow)))?;
        let output_shape = self.layers.negotiate_shape(input_shape)?;
        self.meta.set_shapes(input_shape, &output_shape);
        debug!(
            unit = self.name(),
            input = %describe(input_shape),
            output = %describe(&output_shape),
            "negotiated shape"
        );
        Ok(output_shape)
    }

    fn forward(&mut self, x: &Buffer, train: bool) -> Result<Buffer> {
        self.meta.check_input(self.class_name(), x)?;
        self.layers.forward(x, train)
    }

    fn backward(&mut self, dy: &Buffer) -> Result<Buffer> {
        self.layers.backward(dy)
    }

    fn send_command(&mut self, command: &str, target: &str) {
        if self.accepts(target) {
            let args: Vec<&str> = command.split_whitespace().collect();
            self.command(&args);
        }
        self.layers.send_to_children(command, target);
    }

    fn parameters(&self) -> Variables {
        self.layers.parameters()
    }

    fn gradients(&self) -> Variables {
        self.layers.gradients()
    }

    fn save(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new(self.class_name());
        snapshot.children.push(self.layers.save()?);
        Ok(snapshot)
    }

    fn load(&mut self, snapshot: &Snapshot) -> Result<()> {
        snapshot.expect_class(self.class_name())?;
        let children = snapshot.expect_children(1)?;
        self.layers.load(&children[0])
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
