//! Dense affine layer `y = x · Wᵀ + b`.
//!
//! Mostly used as the sub-unit of a [`crate::Convolution2d`] for a
//! conventional (non-LUT) convolution.

use candle_core::{DType, Device, Tensor, Var};
use lutnet_common::DenseAffineConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::buffer::Buffer;
use crate::error::{LutError, Result};
use crate::shape::{describe, node_count};
use crate::snapshot::{Snapshot, TensorRecord};
use crate::unit::{take_cache, Unit, UnitMeta};
use crate::variables::{accumulate, Variables};

struct AffineState {
    weight: Var,
    bias: Var,
    dweight: Var,
    dbias: Var,
}

pub struct DenseAffine {
    meta: UnitMeta,
    config: DenseAffineConfig,
    device: Device,
    state: Option<AffineState>,
    cache: Option<Tensor>,
}

impl DenseAffine {
    pub fn new(config: DenseAffineConfig, device: &Device) -> Result<Self> {
        if node_count(&config.output_shape) == 0 || config.output_shape.is_empty() {
            return Err(LutError::config(format!(
                "DenseAffine needs a non-empty output shape, got {:?}",
                config.output_shape
            )));
        }
        Ok(Self {
            meta: UnitMeta::new(),
            config,
            device: device.clone(),
            state: None,
            cache: None,
        })
    }

    fn state(&self) -> Result<&AffineState> {
        self.state
            .as_ref()
            .ok_or_else(|| LutError::shape("DenseAffine used before negotiate_shape"))
    }

    /// `(O, I)` weight.
    pub fn weight(&self) -> Result<&Var> {
        Ok(&self.state()?.weight)
    }

    pub fn bias(&self) -> Result<&Var> {
        Ok(&self.state()?.bias)
    }
}

impl Unit for DenseAffine {
    fn class_name(&self) -> &'static str {
        "DenseAffine"
    }

    fn meta(&self) -> &UnitMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut UnitMeta {
        &mut self.meta
    }

    fn negotiate_shape(&mut self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let inputs = node_count(input_shape);
        let outputs = node_count(&self.config.output_shape);
        if inputs == 0 {
            return Err(LutError::shape(format!(
                "DenseAffine cannot read shape {input_shape:?}"
            )));
        }
        // Uniform with the configured standard deviation: bound = std · √3.
        let bound = self.config.init_std * 3f32.sqrt();
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let w: Vec<f32> = (0..outputs * inputs)
            .map(|_| rng.gen_range(-bound..=bound))
            .collect();
        let weight = Var::from_tensor(&Tensor::from_vec(w, (outputs, inputs), &self.device)?)?;
        self.state = Some(AffineState {
            weight,
            bias: Var::zeros(outputs, DType::F32, &self.device)?,
            dweight: Var::zeros((outputs, inputs), DType::F32, &self.device)?,
            dbias: Var::zeros(outputs, DType::F32, &self.device)?,
        });
        self.cache = None;
        let output_shape = self.config.output_shape.clone();
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
        let state = self.state()?;
        let t = x.tensor()?;
        let y = t
            .matmul(&state.weight.as_tensor().t()?)?
            .broadcast_add(&state.bias.as_tensor().unsqueeze(0)?)?;
        self.cache = if train { Some(t) } else { None };
        Buffer::from_tensor(y, &self.config.output_shape)
    }

    fn backward(&mut self, dy: &Buffer) -> Result<Buffer> {
        let class = self.class_name();
        self.meta.check_output_grad(class, dy)?;
        let x = take_cache(&mut self.cache, class)?;
        let state = self.state()?;
        let g = dy.tensor()?;
        accumulate(&state.dweight, &g.t()?.matmul(&x)?)?;
        accumulate(&state.dbias, &g.sum(0)?)?;
        let dx = g.matmul(state.weight.as_tensor())?;
        Buffer::from_tensor(dx, self.meta.shapes(class)?.0)
    }

    fn parameters(&self) -> Variables {
        match &self.state {
            Some(s) => Variables::from(vec![s.weight.clone(), s.bias.clone()]),
            None => Variables::new(),
        }
    }

    fn gradients(&self) -> Variables {
        match &self.state {
            Some(s) => Variables::from(vec![s.dweight.clone(), s.dbias.clone()]),
            None => Variables::new(),
        }
    }

    fn save(&self) -> Result<Snapshot> {
        let state = self.state()?;
        let mut snapshot = Snapshot::new(self.class_name());
        snapshot.insert("weight", TensorRecord::from_tensor(state.weight.as_tensor())?);
        snapshot.insert("bias", TensorRecord::from_tensor(state.bias.as_tensor())?);
        Ok(snapshot)
    }

    fn load(&mut self, snapshot: &Snapshot) -> Result<()> {
        snapshot.expect_class(self.class_name())?;
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| LutError::state("DenseAffine must be negotiated before load"))?;
        let weight = snapshot
            .tensor("weight")?
            .expect_dims(state.weight.dims())?
            .to_tensor(&self.device)?;
        let bias = snapshot
            .tensor("bias")?
            .expect_dims(state.bias.dims())?
            .to_tensor(&self.device)?;
        state.weight.set(&weight)?;
        state.bias.set(&bias)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn affine() -> DenseAffine {
        let dev = Device::Cpu;
        let mut unit = DenseAffine::new(DenseAffineConfig::new(&[2]), &dev).unwrap();
        unit.negotiate_shape(&[3]).unwrap();
        let w = Tensor::new(&[[1f32, 0.0, -1.0], [0.5, 2.0, 0.0]], &dev).unwrap();
        unit.weight().unwrap().set(&w).unwrap();
        unit.bias().unwrap().set(&Tensor::new(&[0.1f32, -0.2], &dev).unwrap()).unwrap();
        unit
    }

    #[test]
    fn forward_is_affine() {
        let mut unit = affine();
        let x = Buffer::from_vec(vec![1.0, 2.0, 3.0], 1, &[3], &Device::Cpu).unwrap();
        let y = unit.forward(&x, false).unwrap().to_vec2().unwrap();
        assert!((y[0][0] - (1.0 - 3.0 + 0.1)).abs() < 1e-6);
        assert!((y[0][1] - (0.5 + 4.0 - 0.2)).abs() < 1e-6);
    }

    #[test]
    fn backward_gradients() {
        let dev = Device::Cpu;
        let mut unit = affine();
        let x = Buffer::from_vec(vec![1.0, 2.0, 3.0], 1, &[3], &dev).unwrap();
        unit.forward(&x, true).unwrap();
        let dy = Buffer::from_vec(vec![1.0, 2.0], 1, &[2], &dev).unwrap();
        let dx = unit.backward(&dy).unwrap().to_vec2().unwrap();
        // dx = dy · W
        assert_eq!(dx, vec![vec![2.0, 4.0, -1.0]]);
        let grads = unit.gradients();
        let dw = grads.get(0).unwrap().as_tensor().to_vec2::<f32>().unwrap();
        assert_eq!(dw, vec![vec![1.0, 2.0, 3.0], vec![2.0, 4.0, 6.0]]);
        let db = grads.get(1).unwrap().as_tensor().to_vec1::<f32>().unwrap();
        assert_eq!(db, vec![1.0, 2.0]);
    }

    #[test]
    fn initialisation_is_seeded_and_bounded() {
        let dev = Device::Cpu;
        let config = DenseAffineConfig { init_std: 0.1, ..DenseAffineConfig::new(&[4]) };
        let mut a = DenseAffine::new(config.clone(), &dev).unwrap();
        let mut b = DenseAffine::new(config, &dev).unwrap();
        a.negotiate_shape(&[8]).unwrap();
        b.negotiate_shape(&[8]).unwrap();
        let wa = a.weight().unwrap().as_tensor().to_vec2::<f32>().unwrap();
        let wb = b.weight().unwrap().as_tensor().to_vec2::<f32>().unwrap();
        assert_eq!(wa, wb);
        let bound = 0.1 * 3f32.sqrt() + 1e-6;
        assert!(wa.iter().flatten().all(|w| w.abs() <= bound));
    }
}
