//! Serialisable unit state.
//!
//! `save()` produces a [`Snapshot`] tree mirroring the unit tree; `serialize()`
//! is its `serde_json` encoding. f32 values survive the JSON round trip
//! exactly.

use std::collections::BTreeMap;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{LutError, Result};

/// Typed flat payload of one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "values", rename_all = "snake_case")]
pub enum RecordData {
    F32(Vec<f32>),
    U32(Vec<u32>),
    Bool(Vec<bool>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub dims: Vec<usize>,
    pub data: RecordData,
}

impl TensorRecord {
    pub fn f32(dims: &[usize], values: Vec<f32>) -> Self {
        Self { dims: dims.to_vec(), data: RecordData::F32(values) }
    }

    pub fn u32(dims: &[usize], values: Vec<u32>) -> Self {
        Self { dims: dims.to_vec(), data: RecordData::U32(values) }
    }

    pub fn bool(dims: &[usize], values: Vec<bool>) -> Self {
        Self { dims: dims.to_vec(), data: RecordData::Bool(values) }
    }

    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let values = tensor.flatten_all()?.to_vec1::<f32>()?;
        Ok(Self::f32(tensor.dims(), values))
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let values = self.as_f32()?.to_vec();
        Ok(Tensor::from_vec(values, self.dims.as_slice(), device)?)
    }

    pub fn as_f32(&self) -> Result<&[f32]> {
        match &self.data {
            RecordData::F32(v) => Ok(v),
            _ => Err(LutError::state("expected f32 record")),
        }
    }

    pub fn as_u32(&self) -> Result<&[u32]> {
        match &self.data {
            RecordData::U32(v) => Ok(v),
            _ => Err(LutError::state("expected u32 record")),
        }
    }

    pub fn as_bool(&self) -> Result<&[bool]> {
        match &self.data {
            RecordData::Bool(v) => Ok(v),
            _ => Err(LutError::state("expected bool record")),
        }
    }

    /// Number of stored values, whatever their type.
    pub fn len(&self) -> usize {
        match &self.data {
            RecordData::F32(v) => v.len(),
            RecordData::U32(v) => v.len(),
            RecordData::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail unless the record has exactly `dims` and a payload to fill them.
    pub fn expect_dims(&self, dims: &[usize]) -> Result<&Self> {
        if self.dims != dims {
            return Err(LutError::state(format!(
                "stored dims {:?} do not match negotiated dims {dims:?}",
                self.dims
            )));
        }
        let expected: usize = dims.iter().product();
        if self.len() != expected {
            return Err(LutError::state(format!(
                "record with dims {dims:?} holds {} values, expected {expected}",
                self.len()
            )));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub class_name: String,
    #[serde(default)]
    pub tensors: BTreeMap<String, TensorRecord>,
    #[serde(default)]
    pub children: Vec<Snapshot>,
}

impl Snapshot {
    pub fn new(class_name: &str) -> Self {
        Self {
            class_name: class_name.to_string(),
            tensors: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn insert(&mut self, key: &str, record: TensorRecord) {
        self.tensors.insert(key.to_string(), record);
    }

    pub fn tensor(&self, key: &str) -> Result<&TensorRecord> {
        self.tensors
            .get(key)
            .ok_or_else(|| LutError::state(format!("{} snapshot has no '{key}'", self.class_name)))
    }

    pub fn expect_class(&self, class_name: &str) -> Result<()> {
        if self.class_name != class_name {
            return Err(LutError::state(format!(
                "snapshot of {} cannot be loaded into {class_name}",
                self.class_name
            )));
        }
        Ok(())
    }

    /// Children, requiring exactly `count` of them.
    pub fn expect_children(&self, count: usize) -> Result<&[Snapshot]> {
        if self.children.len() != count {
            return Err(LutError::state(format!(
                "{} snapshot has {} children, expected {count}",
                self.class_name,
                self.children.len()
            )));
        }
        Ok(&self.children)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(blob: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(blob)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trip_is_exact() {
        let mut snap = Snapshot::new("DifferentiableLut");
        snap.insert("table", TensorRecord::f32(&[1, 3], vec![0.1, 1.0 / 3.0, 0.412_345_67]));
        snap.insert("connections", TensorRecord::u32(&[1, 2], vec![4, 7]));
        snap.children.push(Snapshot::new("Binarize"));
        let restored = Snapshot::from_bytes(&snap.to_bytes().unwrap()).unwrap();
        assert_eq!(snap, restored);
    }

    #[test]
    fn mismatches_are_state_errors() {
        let snap = Snapshot::new("ReLU");
        assert!(matches!(snap.expect_class("Sigmoid"), Err(LutError::State(_))));
        assert!(matches!(snap.tensor("missing"), Err(LutError::State(_))));
        assert!(matches!(snap.expect_children(1), Err(LutError::State(_))));
        let rec = TensorRecord::bool(&[2], vec![true, false]);
        assert!(rec.as_f32().is_err());
        assert!(rec.expect_dims(&[3]).is_err());
    }

    #[test]
    fn short_payload_fails_dims_check() {
        let rec = TensorRecord::u32(&[4, 2], vec![0, 1, 2]);
        assert_eq!(rec.len(), 3);
        assert!(matches!(rec.expect_dims(&[4, 2]), Err(LutError::State(_))));
        let rec = TensorRecord::f32(&[2, 2], vec![0.5; 5]);
        assert!(matches!(rec.expect_dims(&[2, 2]), Err(LutError::State(_))));
        let rec = TensorRecord::bool(&[2, 2], vec![true; 4]);
        assert!(rec.expect_dims(&[2, 2]).is_ok());
    }

    #[test]
    fn garbage_blob_is_serialization_error() {
        assert!(matches!(
            Snapshot::from_bytes(b"not json"),
            Err(LutError::Serialization(_))
        ));
    }
}
