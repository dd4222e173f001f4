//! Sparse connectivity: each output node reads exactly N input nodes.
//!
//! | Rule | Inputs of output node `o` |
//! |------|---------------------------|
//! | `random` | N distinct inputs drawn from a reshuffled pool over all inputs |
//! | `serial` | the next N inputs, round-robin |
//! | `depthwise` | N positions of the output node's own channel |
//! | `pointwise` | N channels at the output node's own spatial position |
//!
//! All rules are seeded and therefore reproducible.

use candle_core::{Device, Tensor};
use lutnet_common::ConnectionRule;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::error::{LutError, Result};
use crate::shape::{flatten_index, node_count};
use crate::snapshot::TensorRecord;
use crate::unit::Unit;

// ── Shuffle set ─────────────────────────────────────────────────────────────

/// Draws values from `0..size` without replacement, reshuffling when empty.
pub(crate) struct ShuffleSet {
    pool: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl ShuffleSet {
    pub fn new(size: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut pool: Vec<usize> = (0..size).collect();
        pool.shuffle(&mut rng);
        Self { pool, cursor: 0, rng }
    }

    fn next(&mut self) -> usize {
        if self.cursor == self.pool.len() {
            self.pool.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        let v = self.pool[self.cursor];
        self.cursor += 1;
        v
    }

    /// `n` values, distinct whenever the pool holds at least `n`.
    pub fn draw(&mut self, n: usize) -> Vec<usize> {
        let mut out = Vec::with_capacity(n);
        if self.pool.is_empty() {
            return out;
        }
        while out.len() < n {
            let v = self.next();
            if out.len() >= self.pool.len() || !out.contains(&v) {
                out.push(v);
            }
        }
        out
    }
}

// ── Connection table ────────────────────────────────────────────────────────

/// `(output node, slot) → input node`, stored flat at `node * N + slot`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTable {
    arity: usize,
    input_nodes: usize,
    indices: Vec<u32>,
}

impl ConnectionTable {
    /// Table with every slot wired to input 0.
    pub fn zeros(arity: usize, input_nodes: usize, output_nodes: usize) -> Self {
        Self {
            arity,
            input_nodes,
            indices: vec![0; arity * output_nodes],
        }
    }

    /// Build the table for `rule` between the negotiated shapes.
    pub fn build(
        rule: ConnectionRule,
        arity: usize,
        input_shape: &[usize],
        output_shape: &[usize],
        seed: u64,
    ) -> Result<Self> {
        let input_nodes = node_count(input_shape);
        let output_nodes = node_count(output_shape);
        if input_nodes == 0 || output_nodes == 0 {
            return Err(LutError::shape(format!(
                "cannot connect {input_shape:?} to {output_shape:?}"
            )));
        }
        if input_nodes < arity && rule == ConnectionRule::Random {
            warn!(
                inputs = input_nodes,
                arity, "fewer inputs than LUT arity; connections will repeat"
            );
        }
        match rule {
            ConnectionRule::Random => Ok(Self::random(arity, input_nodes, output_nodes, seed)),
            ConnectionRule::Serial => Ok(Self::serial(arity, input_nodes, output_nodes)),
            ConnectionRule::Depthwise => Self::depthwise(arity, input_shape, output_shape, seed),
            ConnectionRule::Pointwise => Self::pointwise(arity, input_shape, output_shape, seed),
        }
    }

    fn random(arity: usize, input_nodes: usize, output_nodes: usize, seed: u64) -> Self {
        let mut table = Self::zeros(arity, input_nodes, output_nodes);
        let mut set = ShuffleSet::new(input_nodes, seed);
        for node in 0..output_nodes {
            table.write_node(node, &set.draw(arity));
        }
        table
    }

    fn serial(arity: usize, input_nodes: usize, output_nodes: usize) -> Self {
        let mut table = Self::zeros(arity, input_nodes, output_nodes);
        for (i, slot) in table.indices.iter_mut().enumerate() {
            *slot = (i % input_nodes) as u32;
        }
        table
    }

    fn depthwise(arity: usize, input_shape: &[usize], output_shape: &[usize], seed: u64) -> Result<Self> {
        let [c, h, w] = spatial(input_shape)?;
        let [oc, oh, ow] = spatial(output_shape)?;
        if c != oc {
            return Err(LutError::shape(format!(
                "depthwise connection needs equal channels, got {input_shape:?} → {output_shape:?}"
            )));
        }
        if h * w < arity {
            warn!(
                pool = h * w,
                arity, "channel plane smaller than LUT arity; depthwise connections will repeat"
            );
        }
        let mut table = Self::zeros(arity, c * h * w, c * oh * ow);
        let mut rng = StdRng::seed_from_u64(seed);
        for ch in 0..c {
            let mut set = ShuffleSet::new(h * w, rng.gen());
            for y in 0..oh {
                for x in 0..ow {
                    let node = flatten_index(&[ch, y, x], output_shape)?;
                    let inputs = set
                        .draw(arity)
                        .into_iter()
                        .map(|pos| flatten_index(&[ch, pos / w, pos % w], input_shape))
                        .collect::<Result<Vec<_>>>()?;
                    table.write_node(node, &inputs);
                }
            }
        }
        Ok(table)
    }

    fn pointwise(arity: usize, input_shape: &[usize], output_shape: &[usize], seed: u64) -> Result<Self> {
        let [c, h, w] = spatial(input_shape)?;
        let [oc, oh, ow] = spatial(output_shape)?;
        if (h, w) != (oh, ow) {
            return Err(LutError::shape(format!(
                "pointwise connection needs equal spatial size, got {input_shape:?} → {output_shape:?}"
            )));
        }
        if c < arity {
            warn!(
                pool = c,
                arity, "fewer channels than LUT arity; pointwise connections will repeat"
            );
        }
        let mut table = Self::zeros(arity, c * h * w, oc * oh * ow);
        let mut rng = StdRng::seed_from_u64(seed);
        for y in 0..h {
            for x in 0..w {
                let mut set = ShuffleSet::new(c, rng.gen());
                for och in 0..oc {
                    let node = flatten_index(&[och, y, x], output_shape)?;
                    let inputs = set
                        .draw(arity)
                        .into_iter()
                        .map(|ch| flatten_index(&[ch, y, x], input_shape))
                        .collect::<Result<Vec<_>>>()?;
                    table.write_node(node, &inputs);
                }
            }
        }
        Ok(table)
    }

    fn write_node(&mut self, node: usize, inputs: &[usize]) {
        let row = &mut self.indices[node * self.arity..(node + 1) * self.arity];
        for (slot, &input) in row.iter_mut().zip(inputs) {
            *slot = input as u32;
        }
    }

    // ── Access ──────────────────────────────────────────────────────────────

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn input_nodes(&self) -> usize {
        self.input_nodes
    }

    pub fn output_nodes(&self) -> usize {
        self.indices.len() / self.arity.max(1)
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.indices
    }

    /// The N inputs of one output node. Callers pass `node < output_nodes()`.
    pub(crate) fn node(&self, node: usize) -> &[u32] {
        &self.indices[node * self.arity..(node + 1) * self.arity]
    }

    fn check_slot(&self, node: usize, slot: usize) -> Result<usize> {
        if node >= self.output_nodes() || slot >= self.arity {
            return Err(LutError::state(format!(
                "connection ({node}, {slot}) outside {} nodes × {} inputs",
                self.output_nodes(),
                self.arity
            )));
        }
        Ok(node * self.arity + slot)
    }

    pub fn get(&self, node: usize, slot: usize) -> Result<usize> {
        Ok(self.indices[self.check_slot(node, slot)?] as usize)
    }

    pub fn set(&mut self, node: usize, slot: usize, input: usize) -> Result<()> {
        let at = self.check_slot(node, slot)?;
        if input >= self.input_nodes {
            return Err(LutError::state(format!(
                "input node {input} outside {} inputs",
                self.input_nodes
            )));
        }
        self.indices[at] = input as u32;
        Ok(())
    }

    pub fn to_list(&self) -> Vec<Vec<usize>> {
        self.indices
            .chunks(self.arity.max(1))
            .map(|row| row.iter().map(|&i| i as usize).collect())
            .collect()
    }

    /// Replace every row. Nothing changes unless the whole list is valid.
    pub fn set_list(&mut self, list: &[Vec<usize>]) -> Result<()> {
        if list.len() != self.output_nodes() {
            return Err(LutError::state(format!(
                "connection list has {} rows, expected {}",
                list.len(),
                self.output_nodes()
            )));
        }
        for (node, row) in list.iter().enumerate() {
            if row.len() != self.arity {
                return Err(LutError::state(format!(
                    "row {node} has {} inputs, expected {}",
                    row.len(),
                    self.arity
                )));
            }
            if let Some(&bad) = row.iter().find(|&&i| i >= self.input_nodes) {
                return Err(LutError::state(format!(
                    "row {node} references input {bad} outside {} inputs",
                    self.input_nodes
                )));
            }
        }
        for (node, row) in list.iter().enumerate() {
            self.write_node(node, row);
        }
        Ok(())
    }

    /// Flat `u32` index tensor of length `O * N` for gathers.
    pub fn index_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(self.indices.clone(), self.indices.len(), device)?)
    }

    pub fn to_record(&self) -> TensorRecord {
        TensorRecord::u32(&[self.output_nodes(), self.arity], self.indices.clone())
    }

    /// Restore from a record, validating size and range.
    pub fn load_record(&mut self, record: &TensorRecord) -> Result<()> {
        record.expect_dims(&[self.output_nodes(), self.arity])?;
        let values = record.as_u32()?;
        if let Some(&bad) = values.iter().find(|&&i| i as usize >= self.input_nodes) {
            return Err(LutError::state(format!(
                "stored connection {bad} outside {} inputs",
                self.input_nodes
            )));
        }
        self.indices.copy_from_slice(values);
        Ok(())
    }
}

fn spatial(shape: &[usize]) -> Result<[usize; 3]> {
    match shape {
        &[c, h, w] => Ok([c, h, w]),
        _ => Err(LutError::shape(format!(
            "spatial connection rules need (channels, height, width), got {shape:?}"
        ))),
    }
}

// ── SparseUnit ──────────────────────────────────────────────────────────────

/// A unit whose every output node reads N input nodes through a table.
pub trait SparseUnit: Unit {
    /// Negotiated connection table.
    fn connection_table(&self) -> Result<&ConnectionTable>;
    fn connection_table_mut(&mut self) -> Result<&mut ConnectionTable>;

    /// N, fixed at construction.
    fn connection_size(&self) -> usize;

    /// Table values of one node (`2^N` entries).
    fn lut_table(&self, node: usize) -> Result<Vec<f32>>;

    /// Evaluate one node on explicit input values, using inference statistics.
    fn forward_node(&self, node: usize, inputs: &[f64]) -> Result<f64>;

    fn lut_table_size(&self) -> usize {
        1 << self.connection_size()
    }

    fn connection(&self, node: usize, slot: usize) -> Result<usize> {
        self.connection_table()?.get(node, slot)
    }

    fn set_connection(&mut self, node: usize, slot: usize, input: usize) -> Result<()> {
        self.connection_table_mut()?.set(node, slot, input)
    }

    fn connection_list(&self) -> Result<Vec<Vec<usize>>> {
        Ok(self.connection_table()?.to_list())
    }

    fn set_connection_list(&mut self, list: &[Vec<usize>]) -> Result<()> {
        self.connection_table_mut()?.set_list(list)
    }

    fn lut_table_list(&self) -> Result<Vec<Vec<f32>>> {
        (0..self.output_node_count()).map(|n| self.lut_table(n)).collect()
    }
}

/// Input values selecting table entry `k`: bit `i` of `k` drives slot `i`.
pub fn entry_inputs(k: usize, arity: usize) -> Vec<f64> {
    (0..arity).map(|i| ((k >> i) & 1) as f64).collect()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::unflatten_index;

    fn distinct(row: &[u32]) -> bool {
        let mut sorted = row.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        sorted.len() == row.len()
    }

    #[test]
    fn shuffle_set_draws_distinct() {
        let mut set = ShuffleSet::new(6, 7);
        for _ in 0..20 {
            let mut d = set.draw(6);
            d.sort_unstable();
            assert_eq!(d, vec![0, 1, 2, 3, 4, 5]);
        }
        // Pool smaller than n repeats rather than looping forever.
        assert_eq!(ShuffleSet::new(2, 1).draw(4).len(), 4);
    }

    #[test]
    fn random_rule_is_seeded_and_distinct() {
        let a = ConnectionTable::build(ConnectionRule::Random, 6, &[100], &[50], 3).unwrap();
        let b = ConnectionTable::build(ConnectionRule::Random, 6, &[100], &[50], 3).unwrap();
        let c = ConnectionTable::build(ConnectionRule::Random, 6, &[100], &[50], 4).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        for node in 0..50 {
            assert!(distinct(a.node(node)));
            assert!(a.node(node).iter().all(|&i| i < 100));
        }
    }

    #[test]
    fn serial_rule_round_robin() {
        let t = ConnectionTable::build(ConnectionRule::Serial, 2, &[3], &[3], 0).unwrap();
        assert_eq!(t.to_list(), vec![vec![0, 1], vec![2, 0], vec![1, 2]]);
    }

    #[test]
    fn depthwise_stays_in_channel() {
        let input = [4, 5, 5];
        let output = [4, 2, 2];
        let t = ConnectionTable::build(ConnectionRule::Depthwise, 4, &input, &output, 9).unwrap();
        for node in 0..t.output_nodes() {
            let ch = unflatten_index(node, &output).unwrap()[0];
            for &i in t.node(node) {
                assert_eq!(unflatten_index(i as usize, &input).unwrap()[0], ch);
            }
            assert!(distinct(t.node(node)));
        }
        assert!(matches!(
            ConnectionTable::build(ConnectionRule::Depthwise, 4, &[3, 5, 5], &[4, 2, 2], 0),
            Err(LutError::Shape(_))
        ));
        assert!(matches!(
            ConnectionTable::build(ConnectionRule::Depthwise, 4, &[75], &[16], 0),
            Err(LutError::Shape(_))
        ));
    }

    #[test]
    fn pointwise_stays_at_position() {
        let input = [8, 3, 3];
        let output = [4, 3, 3];
        let t = ConnectionTable::build(ConnectionRule::Pointwise, 4, &input, &output, 2).unwrap();
        for node in 0..t.output_nodes() {
            let at = unflatten_index(node, &output).unwrap();
            for &i in t.node(node) {
                let src = unflatten_index(i as usize, &input).unwrap();
                assert_eq!((src[1], src[2]), (at[1], at[2]));
            }
        }
        assert!(ConnectionTable::build(ConnectionRule::Pointwise, 4, &input, &[4, 2, 2], 2).is_err());
    }

    #[test]
    fn small_groups_repeat_inside_their_group() {
        // 2x1 planes feed 4-input LUTs: each row repeats but never leaves its channel.
        let input = [3, 2, 1];
        let t = ConnectionTable::build(ConnectionRule::Depthwise, 4, &input, &[3, 1, 1], 5).unwrap();
        for node in 0..3 {
            let row = t.node(node);
            assert_eq!(row.len(), 4);
            assert!(!distinct(row));
            assert!(row.iter().all(|&i| unflatten_index(i as usize, &input).unwrap()[0] == node));
        }
        // Two channels feed 4-input LUTs at each position.
        let input = [2, 2, 2];
        let t = ConnectionTable::build(ConnectionRule::Pointwise, 4, &input, &[3, 2, 2], 5).unwrap();
        for node in 0..t.output_nodes() {
            let row = t.node(node);
            assert!(!distinct(row));
            let at = unflatten_index(node, &[3, 2, 2]).unwrap();
            for &i in row {
                let src = unflatten_index(i as usize, &input).unwrap();
                assert_eq!((src[1], src[2]), (at[1], at[2]));
            }
        }
    }

    #[test]
    fn short_record_is_state_error() {
        let mut t = ConnectionTable::build(ConnectionRule::Serial, 2, &[8], &[4], 0).unwrap();
        let before = t.clone();
        let short = TensorRecord::u32(&[4, 2], vec![0, 1, 2]);
        assert!(matches!(t.load_record(&short), Err(LutError::State(_))));
        assert_eq!(t, before);
    }

    #[test]
    fn set_list_is_all_or_nothing() {
        let mut t = ConnectionTable::build(ConnectionRule::Serial, 2, &[4], &[2], 0).unwrap();
        let before = t.clone();
        assert!(t.set_list(&[vec![0, 1], vec![2, 9]]).is_err());
        assert_eq!(t, before);
        assert!(t.set_list(&[vec![0, 1], vec![2]]).is_err());
        assert!(t.set_list(&[vec![0, 1]]).is_err());
        assert_eq!(t, before);
        t.set_list(&[vec![3, 2], vec![1, 0]]).unwrap();
        assert_eq!(t.get(0, 0).unwrap(), 3);
        assert!(t.set(0, 0, 4).is_err());
        assert!(t.get(2, 0).is_err());
    }

    #[test]
    fn entry_inputs_follow_bit_order() {
        assert_eq!(entry_inputs(0b101, 4), vec![1.0, 0.0, 1.0, 0.0]);
    }
}
