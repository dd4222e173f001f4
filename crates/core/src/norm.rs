//! Batch normalisation over frames.
//!
//! [`NormState`] holds the per-node scale/shift, running statistics and their
//! gradients; it is embedded in [`crate::DifferentiableLut`] and wrapped by the
//! standalone [`BatchNormalization`] unit.
//!
//! Training normalises with batch statistics and updates
//! `running = momentum · running + (1 − momentum) · batch`; inference uses the
//! running statistics. Variance is the biased (population) variance.

use candle_core::{DType, Device, Tensor, Var};
use lutnet_common::BatchNormConfig;
use tracing::debug;

use crate::buffer::Buffer;
use crate::error::{LutError, Result};
use crate::shape::{describe, node_count};
use crate::snapshot::{Snapshot, TensorRecord};
use crate::unit::{take_cache, Unit, UnitMeta};
use crate::variables::{accumulate, Variables};

/// Mean and reciprocal standard deviation, each `(1, O)`.
#[derive(Debug, Clone)]
pub(crate) struct BatchStats {
    pub mean: Tensor,
    pub rstd: Tensor,
    var: Tensor,
}

pub(crate) struct NormState {
    nodes: usize,
    momentum: f64,
    epsilon: f64,
    fix_gamma: bool,
    fix_beta: bool,
    gamma: Var,
    beta: Var,
    dgamma: Var,
    dbeta: Var,
    running_mean: Tensor,
    running_var: Tensor,
}

impl NormState {
    pub fn new(nodes: usize, config: &BatchNormConfig, device: &Device) -> Result<Self> {
        Ok(Self {
            nodes,
            momentum: f64::from(config.momentum),
            epsilon: f64::from(config.epsilon),
            fix_gamma: config.fix_gamma,
            fix_beta: config.fix_beta,
            gamma: Var::from_tensor(&Tensor::full(config.gamma, nodes, device)?)?,
            beta: Var::from_tensor(&Tensor::full(config.beta, nodes, device)?)?,
            dgamma: Var::zeros(nodes, DType::F32, device)?,
            dbeta: Var::zeros(nodes, DType::F32, device)?,
            running_mean: Tensor::zeros(nodes, DType::F32, device)?,
            running_var: Tensor::ones(nodes, DType::F32, device)?,
        })
    }

    /// Batch statistics of `x (F, O)`.
    pub fn batch_stats(&self, x: &Tensor) -> Result<BatchStats> {
        let mean = x.mean_keepdim(0)?;
        let var = x.broadcast_sub(&mean)?.sqr()?.mean_keepdim(0)?;
        let rstd = var.affine(1.0, self.epsilon)?.sqrt()?.recip()?;
        Ok(BatchStats { mean, rstd, var })
    }

    pub fn running_stats(&self) -> Result<BatchStats> {
        let mean = self.running_mean.unsqueeze(0)?;
        let var = self.running_var.unsqueeze(0)?;
        let rstd = var.affine(1.0, self.epsilon)?.sqrt()?.recip()?;
        Ok(BatchStats { mean, rstd, var })
    }

    pub fn update_running(&mut self, stats: &BatchStats) -> Result<()> {
        let m = self.momentum;
        self.running_mean = self
            .running_mean
            .affine(m, 0.0)?
            .add(&stats.mean.squeeze(0)?.affine(1.0 - m, 0.0)?)?;
        self.running_var = self
            .running_var
            .affine(m, 0.0)?
            .add(&stats.var.squeeze(0)?.affine(1.0 - m, 0.0)?)?;
        Ok(())
    }

    /// Statistics for this pass, updating the running estimate when training.
    pub fn stats_for(&mut self, x: &Tensor, train: bool) -> Result<BatchStats> {
        if train {
            let stats = self.batch_stats(x)?;
            self.update_running(&stats)?;
            Ok(stats)
        } else {
            self.running_stats()
        }
    }

    /// `x_hat = (x − mean) · rstd`.
    pub fn standardize(&self, x: &Tensor, stats: &BatchStats) -> Result<Tensor> {
        Ok(x.broadcast_sub(&stats.mean)?.broadcast_mul(&stats.rstd)?)
    }

    /// `gamma · x_hat + beta`.
    pub fn scale_shift(&self, x_hat: &Tensor) -> Result<Tensor> {
        let gamma = self.gamma.as_tensor().unsqueeze(0)?;
        let beta = self.beta.as_tensor().unsqueeze(0)?;
        Ok(x_hat.broadcast_mul(&gamma)?.broadcast_add(&beta)?)
    }

    /// Input gradient given the output gradient; accumulates `dgamma` / `dbeta`
    /// unless fixed.
    ///
    /// `dx = rstd · (g − mean(g) − x_hat · mean(g · x_hat))` with `g = gamma · dy`.
    pub fn backward(&self, dy: &Tensor, x_hat: &Tensor, stats: &BatchStats) -> Result<Tensor> {
        if !self.fix_beta {
            accumulate(&self.dbeta, &dy.sum(0)?)?;
        }
        if !self.fix_gamma {
            accumulate(&self.dgamma, &dy.mul(x_hat)?.sum(0)?)?;
        }
        let g = dy.broadcast_mul(&self.gamma.as_tensor().unsqueeze(0)?)?;
        let g_mean = g.mean_keepdim(0)?;
        let gx_mean = g.mul(x_hat)?.mean_keepdim(0)?;
        let centered = g.broadcast_sub(&g_mean)?.sub(&x_hat.broadcast_mul(&gx_mean)?)?;
        Ok(centered.broadcast_mul(&stats.rstd)?)
    }

    /// Apply inference statistics to a single value of `node`.
    pub fn forward_node(&self, node: usize, v: f64) -> Result<f64> {
        let scalar = |t: &Tensor| -> Result<f64> { Ok(f64::from(t.get(node)?.to_scalar::<f32>()?)) };
        let mean = scalar(&self.running_mean)?;
        let var = scalar(&self.running_var)?;
        let gamma = scalar(self.gamma.as_tensor())?;
        let beta = scalar(self.beta.as_tensor())?;
        Ok((v - mean) / (var + self.epsilon).sqrt() * gamma + beta)
    }

    pub fn parameters(&self) -> Variables {
        let mut vars = Variables::new();
        if !self.fix_gamma {
            vars.push(self.gamma.clone());
        }
        if !self.fix_beta {
            vars.push(self.beta.clone());
        }
        vars
    }

    pub fn gradients(&self) -> Variables {
        let mut vars = Variables::new();
        if !self.fix_gamma {
            vars.push(self.dgamma.clone());
        }
        if !self.fix_beta {
            vars.push(self.dbeta.clone());
        }
        vars
    }

    pub fn running_mean(&self) -> &Tensor {
        &self.running_mean
    }

    pub fn running_var(&self) -> &Tensor {
        &self.running_var
    }

    pub fn save_into(&self, snapshot: &mut Snapshot) -> Result<()> {
        snapshot.insert("gamma", TensorRecord::from_tensor(self.gamma.as_tensor())?);
        snapshot.insert("beta", TensorRecord::from_tensor(self.beta.as_tensor())?);
        snapshot.insert("running_mean", TensorRecord::from_tensor(&self.running_mean)?);
        snapshot.insert("running_var", TensorRecord::from_tensor(&self.running_var)?);
        Ok(())
    }

    pub fn load_from(&mut self, snapshot: &Snapshot) -> Result<()> {
        let device = self.running_mean.device().clone();
        let dims = [self.nodes];
        let read = |key: &str| -> Result<Tensor> {
            snapshot.tensor(key)?.expect_dims(&dims)?.to_tensor(&device)
        };
        let (gamma, beta) = (read("gamma")?, read("beta")?);
        let (mean, var) = (read("running_mean")?, read("running_var")?);
        self.gamma.set(&gamma)?;
        self.beta.set(&beta)?;
        self.running_mean = mean;
        self.running_var = var;
        Ok(())
    }
}

// ── BatchNormalization unit ─────────────────────────────────────────────────

/// Standalone per-node normalisation layer.
pub struct BatchNormalization {
    meta: UnitMeta,
    config: BatchNormConfig,
    device: Device,
    state: Option<NormState>,
    cache: Option<(Tensor, BatchStats)>,
}

impl BatchNormalization {
    pub fn new(config: BatchNormConfig, device: &Device) -> Self {
        Self {
            meta: UnitMeta::new(),
            config,
            device: device.clone(),
            state: None,
            cache: None,
        }
    }

    fn state(&self) -> Result<&NormState> {
        self.state
            .as_ref()
            .ok_or_else(|| LutError::shape("BatchNormalization used before negotiate_shape"))
    }

    pub fn running_mean(&self) -> Result<Vec<f32>> {
        Ok(self.state()?.running_mean().to_vec1::<f32>()?)
    }

    pub fn running_var(&self) -> Result<Vec<f32>> {
        Ok(self.state()?.running_var().to_vec1::<f32>()?)
    }
}

impl Unit for BatchNormalization {
    fn class_name(&self) -> &'static str {
        "BatchNormalization"
    }

    fn meta(&self) -> &UnitMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut UnitMeta {
        &mut self.meta
    }

    fn negotiate_shape(&mut self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let nodes = node_count(input_shape);
        if nodes == 0 {
            return Err(LutError::shape(format!(
                "BatchNormalization cannot normalise shape {input_shape:?}"
            )));
        }
        self.state = Some(NormState::new(nodes, &self.config, &self.device)?);
        self.cache = None;
        self.meta.set_shapes(input_shape, input_shape);
        debug!(unit = self.name(), shape = %describe(input_shape), "negotiated shape");
        Ok(input_shape.to_vec())
    }

    fn forward(&mut self, x: &Buffer, train: bool) -> Result<Buffer> {
        self.meta.check_input(self.class_name(), x)?;
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| LutError::shape("BatchNormalization used before negotiate_shape"))?;
        let t = x.tensor()?;
        let stats = state.stats_for(&t, train)?;
        let x_hat = state.standardize(&t, &stats)?;
        let y = state.scale_shift(&x_hat)?;
        self.cache = if train { Some((x_hat, stats)) } else { None };
        Buffer::from_tensor(y, x.shape())
    }

    fn backward(&mut self, dy: &Buffer) -> Result<Buffer> {
        let class = self.class_name();
        self.meta.check_output_grad(class, dy)?;
        let (x_hat, stats) = take_cache(&mut self.cache, class)?;
        let dx = self.state()?.backward(&dy.tensor()?, &x_hat, &stats)?;
        Buffer::from_tensor(dx, dy.shape())
    }

    fn parameters(&self) -> Variables {
        self.state.as_ref().map(NormState::parameters).unwrap_or_default()
    }

    fn gradients(&self) -> Variables {
        self.state.as_ref().map(NormState::gradients).unwrap_or_default()
    }

    fn save(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new(self.class_name());
        self.state()?.save_into(&mut snapshot)?;
        Ok(snapshot)
    }

    fn load(&mut self, snapshot: &Snapshot) -> Result<()> {
        snapshot.expect_class(self.class_name())?;
        self.state
            .as_mut()
            .ok_or_else(|| LutError::state("BatchNormalization must be negotiated before load"))?
            .load_from(snapshot)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
