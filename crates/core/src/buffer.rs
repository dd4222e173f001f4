//! Frame-batched activation / gradient container.
//!
//! A [`Buffer`] holds `frames` samples of a per-frame `shape`. Two layouts:
//!
//! | [`DataType`] | Storage |
//! |--------------|---------|
//! | `F32` | candle `Tensor`, shape `(frames, node_count)`, dtype `F32` |
//! | `Bit` | `Vec<u32>`, node-major, `ceil(frames / 32)` words per node |
//!
//! In the packed layout bit `b` of word `w` of a node is frame `32 * w + b`;
//! unused tail bits are always zero. Dense → bit thresholds at `>= 0.5`,
//! bit → dense yields `0.0` / `1.0`.

use candle_core::{DType, Device, Tensor};
use lutnet_common::DataType;
use rayon::prelude::*;

use crate::error::{LutError, Result};
use crate::shape::node_count;

/// Frames per packed word.
pub const WORD_BITS: usize = 32;

/// Packed words each node occupies for `frames` samples.
pub fn words_per_node(frames: usize) -> usize {
    frames.div_ceil(WORD_BITS)
}

#[derive(Debug, Clone)]
enum Storage {
    Dense(Tensor),
    Packed(Vec<u32>),
}

#[derive(Debug, Clone)]
pub struct Buffer {
    frames: usize,
    shape: Vec<usize>,
    device: Device,
    storage: Storage,
}

impl Buffer {
    // ── Construction ────────────────────────────────────────────────────────

    /// Wrap a tensor whose first dimension is the frame count.
    pub fn from_tensor(tensor: Tensor, shape: &[usize]) -> Result<Self> {
        if tensor.rank() == 0 {
            return Err(LutError::shape("buffer tensor needs a frame dimension"));
        }
        let frames = tensor.dim(0)?;
        let nodes = node_count(shape);
        if tensor.elem_count() != frames * nodes {
            return Err(LutError::shape(format!(
                "tensor {:?} does not hold {frames} frames of shape {shape:?}",
                tensor.dims()
            )));
        }
        let tensor = tensor.to_dtype(DType::F32)?.reshape((frames, nodes))?;
        Ok(Self {
            frames,
            shape: shape.to_vec(),
            device: tensor.device().clone(),
            storage: Storage::Dense(tensor),
        })
    }

    /// Dense buffer from frame-major values (`data[frame * nodes + node]`).
    pub fn from_vec(data: Vec<f32>, frames: usize, shape: &[usize], device: &Device) -> Result<Self> {
        let nodes = node_count(shape);
        if data.len() != frames * nodes {
            return Err(LutError::shape(format!(
                "{} values cannot fill {frames} frames of shape {shape:?}",
                data.len()
            )));
        }
        let tensor = Tensor::from_vec(data, (frames, nodes), device)?;
        Self::from_tensor(tensor, shape)
    }

    /// Bit buffer from frame-major booleans (`data[frame * nodes + node]`).
    pub fn from_bools(data: &[bool], frames: usize, shape: &[usize], device: &Device) -> Result<Self> {
        let nodes = node_count(shape);
        if data.len() != frames * nodes {
            return Err(LutError::shape(format!(
                "{} bits cannot fill {frames} frames of shape {shape:?}",
                data.len()
            )));
        }
        let values: Vec<f32> = data.iter().map(|&b| if b { 1.0 } else { 0.0 }).collect();
        Ok(Self {
            frames,
            shape: shape.to_vec(),
            device: device.clone(),
            storage: Storage::Packed(pack_values(&values, frames, nodes)),
        })
    }

    /// Bit buffer from already packed node-major words.
    pub fn from_packed(mut words: Vec<u32>, frames: usize, shape: &[usize], device: &Device) -> Result<Self> {
        let nodes = node_count(shape);
        let wpn = words_per_node(frames);
        if words.len() != nodes * wpn {
            return Err(LutError::shape(format!(
                "{} words cannot hold {frames} frames of shape {shape:?}",
                words.len()
            )));
        }
        let tail = frames % WORD_BITS;
        if tail != 0 && wpn > 0 {
            let mask = (1u32 << tail) - 1;
            for node in 0..nodes {
                words[node * wpn + wpn - 1] &= mask;
            }
        }
        Ok(Self {
            frames,
            shape: shape.to_vec(),
            device: device.clone(),
            storage: Storage::Packed(words),
        })
    }

    pub fn zeros(frames: usize, shape: &[usize], dtype: DataType, device: &Device) -> Result<Self> {
        let nodes = node_count(shape);
        match dtype {
            DataType::F32 => {
                Self::from_tensor(Tensor::zeros((frames, nodes), DType::F32, device)?, shape)
            }
            DataType::Bit => Self::from_packed(
                vec![0; nodes * words_per_node(frames)],
                frames,
                shape,
                device,
            ),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn node_count(&self) -> usize {
        node_count(&self.shape)
    }

    pub fn dtype(&self) -> DataType {
        match self.storage {
            Storage::Dense(_) => DataType::F32,
            Storage::Packed(_) => DataType::Bit,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn is_packed(&self) -> bool {
        matches!(self.storage, Storage::Packed(_))
    }

    /// Packed words, or `None` for a dense buffer.
    pub fn packed_words(&self) -> Option<&[u32]> {
        match &self.storage {
            Storage::Packed(words) => Some(words),
            Storage::Dense(_) => None,
        }
    }

    /// Dense `(frames, node_count)` view; bit buffers are expanded to 0/1.
    pub fn tensor(&self) -> Result<Tensor> {
        match &self.storage {
            Storage::Dense(t) => Ok(t.clone()),
            Storage::Packed(words) => {
                let nodes = self.node_count();
                let values = unpack_words(words, self.frames, nodes);
                Ok(Tensor::from_vec(values, (self.frames, nodes), &self.device)?)
            }
        }
    }

    /// Values as `frames × nodes` rows.
    pub fn to_vec2(&self) -> Result<Vec<Vec<f32>>> {
        Ok(self.tensor()?.to_vec2::<f32>()?)
    }

    /// Single sample as a boolean (dense values threshold at 0.5).
    pub fn bit(&self, frame: usize, node: usize) -> Result<bool> {
        let nodes = self.node_count();
        if frame >= self.frames || node >= nodes {
            return Err(LutError::shape(format!(
                "sample ({frame}, {node}) outside {} frames × {nodes} nodes",
                self.frames
            )));
        }
        match &self.storage {
            Storage::Packed(words) => {
                let word = words[node * words_per_node(self.frames) + frame / WORD_BITS];
                Ok((word >> (frame % WORD_BITS)) & 1 == 1)
            }
            Storage::Dense(t) => Ok(t.get(frame)?.get(node)?.to_scalar::<f32>()? >= 0.5),
        }
    }

    // ── Conversion ──────────────────────────────────────────────────────────

    pub fn to_dense(&self) -> Result<Self> {
        match self.storage {
            Storage::Dense(_) => Ok(self.clone()),
            Storage::Packed(_) => Self::from_tensor(self.tensor()?, &self.shape),
        }
    }

    pub fn to_packed(&self) -> Result<Self> {
        match &self.storage {
            Storage::Packed(_) => Ok(self.clone()),
            Storage::Dense(t) => {
                let values = t.flatten_all()?.to_vec1::<f32>()?;
                Ok(Self {
                    frames: self.frames,
                    shape: self.shape.clone(),
                    device: self.device.clone(),
                    storage: Storage::Packed(pack_values(&values, self.frames, self.node_count())),
                })
            }
        }
    }

    pub fn to_dtype(&self, dtype: DataType) -> Result<Self> {
        match dtype {
            DataType::F32 => self.to_dense(),
            DataType::Bit => self.to_packed(),
        }
    }
}

// ── Packing kernels ─────────────────────────────────────────────────────────

/// Frame-major values → node-major packed words (`>= 0.5` is set).
pub(crate) fn pack_values(values: &[f32], frames: usize, nodes: usize) -> Vec<u32> {
    let wpn = words_per_node(frames);
    let mut words = vec![0u32; nodes * wpn];
    if wpn == 0 {
        return words;
    }
    words.par_chunks_mut(wpn).enumerate().for_each(|(node, chunk)| {
        for frame in 0..frames {
            if values[frame * nodes + node] >= 0.5 {
                chunk[frame / WORD_BITS] |= 1 << (frame % WORD_BITS);
            }
        }
    });
    words
}

/// Node-major packed words → frame-major `0.0 / 1.0` values.
pub(crate) fn unpack_words(words: &[u32], frames: usize, nodes: usize) -> Vec<f32> {
    let wpn = words_per_node(frames);
    let mut values = vec![0f32; frames * nodes];
    if nodes == 0 {
        return values;
    }
    values.par_chunks_mut(nodes).enumerate().for_each(|(frame, row)| {
        let (w, b) = (frame / WORD_BITS, frame % WORD_BITS);
        for (node, v) in row.iter_mut().enumerate() {
            if (words[node * wpn + w] >> b) & 1 == 1 {
                *v = 1.0;
            }
        }
    });
    values
}

// ── Tests ───────────────────────────────────────────────────────────────────
