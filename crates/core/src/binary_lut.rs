//! Inference-only boolean LUT.
//!
//! Each output node looks up one of `2^N` booleans, addressed by its N input
//! bits (bit `i` of the address is slot `i`). Inputs are processed in the
//! packed layout: 32 frames per word, nodes in parallel.
//!
//! A trained [`SparseUnit`] is frozen into a `BinaryLut` with
//! [`BinaryLut::from_sparse`] / [`BinaryLut::import_from`]: entry `k` of node
//! `n` is `source.forward_node(n, bits(k)) >= 0.5`.

use candle_core::Device;
use lutnet_common::{BinaryLutConfig, LutArity};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::debug;

use crate::buffer::{words_per_node, Buffer, WORD_BITS};
use crate::error::{LutError, Result};
use crate::shape::{describe, node_count};
use crate::snapshot::{Snapshot, TensorRecord};
use crate::sparse::{entry_inputs, ConnectionTable, SparseUnit};
use crate::unit::{Unit, UnitMeta};

struct BinaryLutState {
    connections: ConnectionTable,
    /// `node * 2^N + entry`.
    table: Vec<bool>,
}

pub struct BinaryLut {
    meta: UnitMeta,
    config: BinaryLutConfig,
    arity: LutArity,
    device: Device,
    state: Option<BinaryLutState>,
}

impl BinaryLut {
    pub fn new(config: BinaryLutConfig, device: &Device) -> Result<Self> {
        let arity = LutArity::try_from(config.arity)?;
        if config.output_shape.is_empty() || node_count(&config.output_shape) == 0 {
            return Err(LutError::config(format!(
                "BinaryLut needs a non-empty output shape, got {:?}",
                config.output_shape
            )));
        }
        Ok(Self {
            meta: UnitMeta::new(),
            config,
            arity,
            device: device.clone(),
            state: None,
        })
    }

    /// Freeze a trained sparse unit into an equivalent boolean LUT.
    pub fn from_sparse(source: &dyn SparseUnit, device: &Device) -> Result<Self> {
        let (input_shape, output_shape) = match (source.input_shape(), source.output_shape()) {
            (Some(i), Some(o)) => (i.to_vec(), o.to_vec()),
            _ => return Err(LutError::state("cannot import from an un-negotiated unit")),
        };
        let config = BinaryLutConfig {
            arity: source.connection_size(),
            ..BinaryLutConfig::new(&output_shape)
        };
        let mut lut = Self::new(config, device)?;
        lut.negotiate_shape(&input_shape)?;
        lut.import_from(source)?;
        Ok(lut)
    }

    /// Copy connections from `source` and threshold its per-entry outputs.
    pub fn import_from(&mut self, source: &dyn SparseUnit) -> Result<()> {
        let arity = self.arity.inputs();
        let table_size = self.arity.table_size();
        if source.connection_size() != arity {
            return Err(LutError::config(format!(
                "cannot import arity {} into arity {arity}",
                source.connection_size()
            )));
        }
        if source.input_shape() != self.input_shape() || source.output_shape() != self.output_shape() {
            return Err(LutError::shape(format!(
                "import source {:?} → {:?} does not match {:?} → {:?}",
                source.input_shape(),
                source.output_shape(),
                self.input_shape(),
                self.output_shape()
            )));
        }
        let connections = source.connection_table()?.clone();
        let outputs = connections.output_nodes();
        let patterns: Vec<Vec<f64>> = (0..table_size).map(|k| entry_inputs(k, arity)).collect();
        let mut table = Vec::with_capacity(outputs * table_size);
        for node in 0..outputs {
            for inputs in &patterns {
                table.push(source.forward_node(node, inputs)? >= 0.5);
            }
        }
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| LutError::shape("BinaryLut used before negotiate_shape"))?;
        state.connections = connections;
        state.table = table;
        debug!(
            unit = self.meta.name().unwrap_or("BinaryLut"),
            source = source.name(),
            nodes = outputs,
            arity,
            "imported LUT tables"
        );
        Ok(())
    }

    fn state(&self) -> Result<&BinaryLutState> {
        self.state
            .as_ref()
            .ok_or_else(|| LutError::shape("BinaryLut used before negotiate_shape"))
    }

    /// Boolean entries of one node.
    pub fn bit_table(&self, node: usize) -> Result<&[bool]> {
        let state = self.state()?;
        let size = self.arity.table_size();
        if node >= state.connections.output_nodes() {
            return Err(LutError::state(format!("node {node} out of range")));
        }
        Ok(&state.table[node * size..(node + 1) * size])
    }

    pub fn set_bit_table(&mut self, node: usize, entries: &[bool]) -> Result<()> {
        let size = self.arity.table_size();
        if entries.len() != size {
            return Err(LutError::state(format!(
                "node table needs {size} entries, got {}",
                entries.len()
            )));
        }
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| LutError::shape("BinaryLut used before negotiate_shape"))?;
        if node >= state.connections.output_nodes() {
            return Err(LutError::state(format!("node {node} out of range")));
        }
        state.table[node * size..(node + 1) * size].copy_from_slice(entries);
        Ok(())
    }
}

/// Table lookup over packed inputs, one rayon task per output node.
fn lookup_packed(state: &BinaryLutState, table_size: usize, words: &[u32], frames: usize) -> Vec<u32> {
    let wpn = words_per_node(frames);
    let outputs = state.connections.output_nodes();
    let mut out = vec![0u32; outputs * wpn];
    if wpn == 0 {
        return out;
    }
    out.par_chunks_mut(wpn).enumerate().for_each(|(node, dst)| {
        let inputs = state.connections.node(node);
        let table = &state.table[node * table_size..(node + 1) * table_size];
        for (w, dst_word) in dst.iter_mut().enumerate() {
            let valid = (frames - w * WORD_BITS).min(WORD_BITS);
            let mut word = 0u32;
            for bit in 0..valid {
                let mut address = 0usize;
                for (slot, &src) in inputs.iter().enumerate() {
                    let src_word = words[src as usize * wpn + w];
                    address |= (((src_word >> bit) & 1) as usize) << slot;
                }
                if table[address] {
                    word |= 1 << bit;
                }
            }
            *dst_word = word;
        }
    });
    out
}

impl Unit for BinaryLut {
    fn class_name(&self) -> &'static str {
        "BinaryLut"
    }

    fn meta(&self) -> &UnitMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut UnitMeta {
        &mut self.meta
    }

    fn negotiate_shape(&mut self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let output_shape = self.config.output_shape.clone();
        let connections = ConnectionTable::build(
            self.config.connection,
            self.arity.inputs(),
            input_shape,
            &output_shape,
            self.config.seed,
        )?;
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(1));
        let size = connections.output_nodes() * self.arity.table_size();
        let table = (0..size).map(|_| rng.gen::<bool>()).collect();
        self.state = Some(BinaryLutState { connections, table });
        self.meta.set_shapes(input_shape, &output_shape);
        debug!(
            unit = self.name(),
            input = %describe(input_shape),
            output = %describe(&output_shape),
            "negotiated shape"
        );
        Ok(output_shape)
    }

    fn forward(&mut self, x: &Buffer, _train: bool) -> Result<Buffer> {
        self.meta.check_input(self.class_name(), x)?;
        let state = self.state()?;
        let packed = x.to_packed()?;
        let words = packed
            .packed_words()
            .ok_or_else(|| LutError::state("packing produced a dense buffer"))?;
        let out = lookup_packed(state, self.arity.table_size(), words, x.frames());
        let y = Buffer::from_packed(out, x.frames(), &self.config.output_shape, &self.device)?;
        y.to_dtype(self.config.output_dtype)
    }

    fn backward(&mut self, _dy: &Buffer) -> Result<Buffer> {
        Err(LutError::state("BinaryLut is inference-only and has no backward"))
    }

    fn save(&self) -> Result<Snapshot> {
        let state = self.state()?;
        let mut snapshot = Snapshot::new(self.class_name());
        snapshot.insert("connections", state.connections.to_record());
        snapshot.insert(
            "table",
            TensorRecord::bool(
                &[state.connections.output_nodes(), self.arity.table_size()],
                state.table.clone(),
            ),
        );
        Ok(snapshot)
    }

    fn load(&mut self, snapshot: &Snapshot) -> Result<()> {
        snapshot.expect_class(self.class_name())?;
        let size = self.arity.table_size();
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| LutError::state("BinaryLut must be negotiated before load"))?;
        let table = snapshot
            .tensor("table")?
            .expect_dims(&[state.connections.output_nodes(), size])?
            .as_bool()?
            .to_vec();
        let mut connections = state.connections.clone();
        connections.load_record(snapshot.tensor("connections")?)?;
        state.connections = connections;
        state.table = table;
        Ok(())
    }

    fn as_sparse(&self) -> Option<&dyn SparseUnit> {
        Some(self)
    }
}

impl SparseUnit for BinaryLut {
    fn connection_table(&self) -> Result<&ConnectionTable> {
        Ok(&self.state()?.connections)
    }

    fn connection_table_mut(&mut self) -> Result<&mut ConnectionTable> {
        self.state
            .as_mut()
            .map(|s| &mut s.connections)
            .ok_or_else(|| LutError::shape("BinaryLut used before negotiate_shape"))
    }

    fn connection_size(&self) -> usize {
        self.arity.inputs()
    }

    fn lut_table(&self, node: usize) -> Result<Vec<f32>> {
        Ok(self
            .bit_table(node)?
            .iter()
            .map(|&b| if b { 1.0 } else { 0.0 })
            .collect())
    }

    fn forward_node(&self, node: usize, inputs: &[f64]) -> Result<f64> {
        if inputs.len() != self.arity.inputs() {
            return Err(LutError::shape(format!(
                "forward_node needs {} inputs, got {}",
                self.arity.inputs(),
                inputs.len()
            )));
        }
        let address = inputs
            .iter()
            .enumerate()
            .fold(0usize, |acc, (i, &v)| acc | (usize::from(v >= 0.5) << i));
        Ok(if self.bit_table(node)?[address] { 1.0 } else { 0.0 })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use lutnet_common::DataType;

    fn xor_lut(frames_out: DataType) -> BinaryLut {
        let config = BinaryLutConfig {
            arity: 2,
            output_dtype: frames_out,
            ..BinaryLutConfig::new(&[1])
        };
        let mut lut = BinaryLut::new(config, &Device::Cpu).unwrap();
        lut.negotiate_shape(&[2]).unwrap();
        lut.set_connection_list(&[vec![0, 1]]).unwrap();
        lut.set_bit_table(0, &[false, true, true, false]).unwrap();
        lut
    }

    #[test]
    fn dense_inputs_threshold_at_half() {
        let mut lut = xor_lut(DataType::F32);
        let x = Buffer::from_vec(
            vec![0.0, 0.0, 0.9, 0.1, 0.2, 0.6, 0.5, 0.5],
            4,
            &[2],
            &Device::Cpu,
        )
        .unwrap();
        let y = lut.forward(&x, false).unwrap().to_vec2().unwrap();
        assert_eq!(y, vec![vec![0.0], vec![1.0], vec![1.0], vec![0.0]]);
    }

    #[test]
    fn packed_inputs_across_word_boundary() {
        let mut lut = xor_lut(DataType::Bit);
        let frames = 70;
        let bits: Vec<bool> = (0..frames * 2).map(|i| (i * 31 + i / 3) % 5 < 2).collect();
        let x = Buffer::from_bools(&bits, frames, &[2], &Device::Cpu).unwrap();
        let y = lut.forward(&x, false).unwrap();
        assert_eq!(y.dtype(), DataType::Bit);
        for f in 0..frames {
            assert_eq!(y.bit(f, 0).unwrap(), bits[f * 2] ^ bits[f * 2 + 1], "frame {f}");
        }
        let words = y.packed_words().unwrap();
        assert_eq!(words.len(), 3);
        assert_eq!(words[2] >> 6, 0);
    }

    #[test]
    fn backward_is_state_error() {
        let mut lut = xor_lut(DataType::F32);
        let dy = Buffer::from_vec(vec![1.0], 1, &[1], &Device::Cpu).unwrap();
        assert!(matches!(lut.backward(&dy), Err(LutError::State(_))));
    }

    #[test]
    fn rejects_unsupported_arity() {
        let config = BinaryLutConfig { arity: 3, ..BinaryLutConfig::new(&[1]) };
        assert!(matches!(
            BinaryLut::new(config, &Device::Cpu),
            Err(LutError::Configuration(_))
        ));
    }

    #[test]
    fn snapshot_round_trip() {
        let lut = xor_lut(DataType::F32);
        let blob = lut.serialize().unwrap();
        let mut other = BinaryLut::new(
            BinaryLutConfig { arity: 2, seed: 11, ..BinaryLutConfig::new(&[1]) },
            &Device::Cpu,
        )
        .unwrap();
        other.negotiate_shape(&[2]).unwrap();
        other.deserialize(&blob).unwrap();
        assert_eq!(other.bit_table(0).unwrap(), &[false, true, true, false]);
        assert_eq!(other.connection_list().unwrap(), vec![vec![0, 1]]);
    }

    #[test]
    fn short_table_fails_to_load() {
        let mut lut = BinaryLut::new(
            BinaryLutConfig { arity: 2, ..BinaryLutConfig::new(&[4]) },
            &Device::Cpu,
        )
        .unwrap();
        lut.negotiate_shape(&[8]).unwrap();
        let before = lut.save().unwrap();

        let mut snapshot = before.clone();
        snapshot.insert("table", TensorRecord::bool(&[4, 4], vec![true; 3]));
        assert!(matches!(lut.load(&snapshot), Err(LutError::State(_))));

        let mut snapshot = before.clone();
        snapshot.insert("connections", TensorRecord::u32(&[4, 2], vec![0, 1, 2]));
        assert!(matches!(lut.load(&snapshot), Err(LutError::State(_))));

        assert_eq!(lut.save().unwrap(), before);
        let x = Buffer::from_bools(&[true; 8], 1, &[8], &Device::Cpu).unwrap();
        assert_eq!(lut.forward(&x, false).unwrap().node_count(), 4);
    }
}
