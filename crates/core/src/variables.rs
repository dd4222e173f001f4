//! Ordered collections of trainable tensors.
//!
//! A unit exposes `parameters()` and `gradients()` as two [`Variables`] of
//! equal length with positional correspondence. Entries are candle [`Var`]
//! handles, so an optimizer writing through them updates the unit in place.

use candle_core::{Tensor, Var};

use crate::error::{LutError, Result};

#[derive(Debug, Clone, Default)]
pub struct Variables {
    vars: Vec<Var>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, var: Var) {
        self.vars.push(var);
    }

    /// Append every entry of `other`, keeping order.
    pub fn extend(&mut self, other: Variables) {
        self.vars.extend(other.vars);
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Var> {
        self.vars.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Var> {
        self.vars.iter()
    }

    pub fn as_slice(&self) -> &[Var] {
        &self.vars
    }

    /// Total number of scalar elements across all entries.
    pub fn elem_count(&self) -> usize {
        self.vars.iter().map(|v| v.elem_count()).sum()
    }

    /// Zero every entry in place. Units never call this on their own
    /// gradients; it exists for optimizers.
    pub fn zero_all(&self) -> Result<()> {
        for var in &self.vars {
            var.set(&var.as_tensor().zeros_like()?)?;
        }
        Ok(())
    }

    /// All entries flattened and concatenated into one 1-D tensor.
    pub fn flatten(&self) -> Result<Tensor> {
        if self.vars.is_empty() {
            return Err(LutError::state("cannot flatten an empty variable list"));
        }
        let parts = self
            .vars
            .iter()
            .map(|v| v.as_tensor().flatten_all())
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Tensor::cat(&parts, 0)?)
    }
}

impl From<Vec<Var>> for Variables {
    fn from(vars: Vec<Var>) -> Self {
        Self { vars }
    }
}

impl<'a> IntoIterator for &'a Variables {
    type Item = &'a Var;
    type IntoIter = std::slice::Iter<'a, Var>;

    fn into_iter(self) -> Self::IntoIter {
        self.vars.iter()
    }
}

/// Add `delta` into a gradient variable.
pub(crate) fn accumulate(grad: &Var, delta: &Tensor) -> Result<()> {
    grad.set(&grad.as_tensor().add(delta)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn handles_share_storage() {
        let dev = Device::Cpu;
        let var = Var::zeros(3, DType::F32, &dev).unwrap();
        let vars = Variables::from(vec![var.clone()]);
        accumulate(&var, &Tensor::new(&[1f32, 2.0, 3.0], &dev).unwrap()).unwrap();
        let seen = vars.get(0).unwrap().as_tensor().to_vec1::<f32>().unwrap();
        assert_eq!(seen, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn accumulate_adds_never_replaces() {
        let dev = Device::Cpu;
        let grad = Var::zeros(2, DType::F32, &dev).unwrap();
        let delta = Tensor::new(&[0.5f32, -1.0], &dev).unwrap();
        accumulate(&grad, &delta).unwrap();
        accumulate(&grad, &delta).unwrap();
        assert_eq!(grad.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0, -2.0]);
    }

    #[test]
    fn zero_all_and_flatten() {
        let dev = Device::Cpu;
        let mut vars = Variables::new();
        vars.push(Var::ones((2, 2), DType::F32, &dev).unwrap());
        vars.push(Var::ones(3, DType::F32, &dev).unwrap());
        assert_eq!(vars.elem_count(), 7);
        assert_eq!(vars.flatten().unwrap().dims(), &[7]);
        vars.zero_all().unwrap();
        let sum: f32 = vars.flatten().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 0.0);
        assert!(Variables::new().flatten().is_err());
    }
}
