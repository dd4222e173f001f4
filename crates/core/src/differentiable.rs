//! Trainable sparse LUT layer.
//!
//! Each output node owns a table of `2^N` values in `[0,1]` and reads N inputs
//! through a [`ConnectionTable`]. The stochastic table output (see
//! [`crate::lut`]) optionally passes through batch normalisation and a
//! straight-through binariser. The pipeline is fixed at construction:
//!
//! | [`LutPipeline`] | Stages | Training cache |
//! |-----------------|--------|----------------|
//! | `Stochastic` | LUT | selected inputs |
//! | `Normalized` | LUT → norm | selected inputs, `x_hat`, batch stats |
//! | `Binary` | LUT → binarise | selected inputs, pre-threshold values |
//! | `NormalizedBinary` | LUT → norm → binarise | selected inputs, batch stats (rest recomputed) |

use candle_core::{Device, Tensor, Var};
use lutnet_common::{BatchNormConfig, DataType, DifferentiableLutConfig, LutArity};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::activation::Binarizer;
use crate::buffer::Buffer;
use crate::error::{LutError, Result};
use crate::lut::{evaluate_node, gather_inputs, lut_backward, lut_forward, scatter_inputs};
use crate::norm::{BatchStats, NormState};
use crate::shape::{describe, node_count};
use crate::snapshot::{Snapshot, TensorRecord};
use crate::sparse::{ConnectionTable, SparseUnit};
use crate::unit::{take_cache, Unit, UnitMeta};
use crate::variables::{accumulate, Variables};

/// Initial table entries are drawn uniformly from this range.
const TABLE_INIT_RANGE: (f32, f32) = (0.4, 0.6);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LutPipeline {
    Stochastic,
    Normalized,
    Binary,
    NormalizedBinary,
}

impl LutPipeline {
    pub fn select(batch_norm: bool, binarize: bool) -> Self {
        match (batch_norm, binarize) {
            (false, false) => Self::Stochastic,
            (true, false) => Self::Normalized,
            (false, true) => Self::Binary,
            (true, true) => Self::NormalizedBinary,
        }
    }

    pub fn normalizes(self) -> bool {
        matches!(self, Self::Normalized | Self::NormalizedBinary)
    }

    pub fn binarizes(self) -> bool {
        matches!(self, Self::Binary | Self::NormalizedBinary)
    }
}

struct LutState {
    connections: ConnectionTable,
    table: Var,
    dtable: Var,
    norm: Option<NormState>,
}

enum LutCache {
    Stochastic {
        ids: Tensor,
        x_sel: Tensor,
    },
    Normalized {
        ids: Tensor,
        x_sel: Tensor,
        x_hat: Tensor,
        stats: BatchStats,
    },
    Binary {
        ids: Tensor,
        x_sel: Tensor,
        pre: Tensor,
    },
    NormalizedBinary {
        ids: Tensor,
        x_sel: Tensor,
        stats: BatchStats,
    },
}

pub struct DifferentiableLut {
    meta: UnitMeta,
    config: DifferentiableLutConfig,
    arity: LutArity,
    pipeline: LutPipeline,
    binarizer: Binarizer,
    device: Device,
    state: Option<LutState>,
    cache: Option<LutCache>,
}

impl DifferentiableLut {
    /// Validate the configuration and pick the pipeline.
    pub fn new(config: DifferentiableLutConfig, device: &Device) -> Result<Self> {
        let arity = LutArity::try_from(config.arity)?;
        if config.output_shape.is_empty() || node_count(&config.output_shape) == 0 {
            return Err(LutError::config(format!(
                "DifferentiableLut needs a non-empty output shape, got {:?}",
                config.output_shape
            )));
        }
        if config.output_dtype == DataType::Bit && !config.binarize {
            return Err(LutError::config(
                "bit output requires binarize = true",
            ));
        }
        let pipeline = LutPipeline::select(config.batch_norm, config.binarize);
        debug!(
            arity = arity.inputs(),
            ?pipeline,
            output = %describe(&config.output_shape),
            "selected LUT pipeline"
        );
        Ok(Self {
            meta: UnitMeta::new(),
            binarizer: Binarizer::with_threshold(f64::from(config.binary_threshold)),
            config,
            arity,
            pipeline,
            device: device.clone(),
            state: None,
            cache: None,
        })
    }

    pub fn pipeline(&self) -> LutPipeline {
        self.pipeline
    }

    pub fn config(&self) -> &DifferentiableLutConfig {
        &self.config
    }

    fn state(&self) -> Result<&LutState> {
        self.state
            .as_ref()
            .ok_or_else(|| LutError::shape("DifferentiableLut used before negotiate_shape"))
    }

    fn state_mut(&mut self) -> Result<&mut LutState> {
        self.state
            .as_mut()
            .ok_or_else(|| LutError::shape("DifferentiableLut used before negotiate_shape"))
    }

    /// The `(O, 2^N)` table variable.
    pub fn table(&self) -> Result<&Var> {
        Ok(&self.state()?.table)
    }

    /// The accumulated `(O, 2^N)` table gradient.
    pub fn table_gradient(&self) -> Result<&Var> {
        Ok(&self.state()?.dtable)
    }

    /// Overwrite the table, e.g. with hand-chosen values.
    pub fn set_table(&mut self, table: &Tensor) -> Result<()> {
        let state = self.state()?;
        if table.dims() != state.table.dims() {
            return Err(LutError::shape(format!(
                "table {:?} does not match {:?}",
                table.dims(),
                state.table.dims()
            )));
        }
        state.table.set(table)?;
        Ok(())
    }

    /// Running `(mean, variance)` of the normalisation stage, if any.
    pub fn running_stats(&self) -> Result<Option<(Vec<f32>, Vec<f32>)>> {
        match &self.state()?.norm {
            Some(norm) => Ok(Some((
                norm.running_mean().to_vec1::<f32>()?,
                norm.running_var().to_vec1::<f32>()?,
            ))),
            None => Ok(None),
        }
    }

    fn norm_config(&self) -> BatchNormConfig {
        BatchNormConfig {
            momentum: self.config.momentum,
            gamma: self.config.gamma,
            beta: self.config.beta,
            fix_gamma: self.config.fix_gamma,
            fix_beta: self.config.fix_beta,
            epsilon: self.config.epsilon,
        }
    }

    fn initial_table(&self, outputs: usize) -> Result<Tensor> {
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(1));
        let (lo, hi) = TABLE_INIT_RANGE;
        let size = outputs * self.arity.table_size();
        let values: Vec<f32> = (0..size).map(|_| rng.gen_range(lo..hi)).collect();
        Ok(Tensor::from_vec(values, (outputs, self.arity.table_size()), &self.device)?)
    }
}

fn norm_of(state: &LutState) -> Result<&NormState> {
    state
        .norm
        .as_ref()
        .ok_or_else(|| LutError::state("normalisation stage missing"))
}

impl Unit for DifferentiableLut {
    fn class_name(&self) -> &'static str {
        "DifferentiableLut"
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
        let outputs = node_count(&output_shape);
        let table = Var::from_tensor(&self.initial_table(outputs)?)?;
        let dtable = Var::from_tensor(&table.as_tensor().zeros_like()?)?;
        let norm = if self.pipeline.normalizes() {
            Some(NormState::new(outputs, &self.norm_config(), &self.device)?)
        } else {
            None
        };
        self.state = Some(LutState { connections, table, dtable, norm });
        self.cache = None;
        self.meta.set_shapes(input_shape, &output_shape);
        debug!(
            unit = self.name(),
            input = %describe(input_shape),
            output = %describe(&output_shape),
            rule = %self.config.connection,
            "negotiated shape"
        );
        Ok(output_shape)
    }

    fn forward(&mut self, x: &Buffer, train: bool) -> Result<Buffer> {
        self.meta.check_input(self.class_name(), x)?;
        let arity = self.arity.inputs();
        let pipeline = self.pipeline;
        let binarizer = self.binarizer;
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| LutError::shape("DifferentiableLut used before negotiate_shape"))?;
        let outputs = state.connections.output_nodes();

        let ids = state.connections.index_tensor(&self.device)?;
        let x_sel = gather_inputs(&x.tensor()?, &ids, outputs, arity)?;
        let raw = lut_forward(&x_sel, state.table.as_tensor(), arity)?;

        let (y, cache) = match pipeline {
            LutPipeline::Stochastic => (raw, LutCache::Stochastic { ids, x_sel }),
            LutPipeline::Binary => (
                binarizer.forward(&raw)?,
                LutCache::Binary { ids, x_sel, pre: raw },
            ),
            LutPipeline::Normalized | LutPipeline::NormalizedBinary => {
                let norm = state
                    .norm
                    .as_mut()
                    .ok_or_else(|| LutError::state("normalisation stage missing"))?;
                let stats = norm.stats_for(&raw, train)?;
                let x_hat = norm.standardize(&raw, &stats)?;
                let v = norm.scale_shift(&x_hat)?;
                if pipeline == LutPipeline::Normalized {
                    (v, LutCache::Normalized { ids, x_sel, x_hat, stats })
                } else {
                    (binarizer.forward(&v)?, LutCache::NormalizedBinary { ids, x_sel, stats })
                }
            }
        };
        self.cache = if train { Some(cache) } else { None };

        let out = Buffer::from_tensor(y, &self.config.output_shape)?;
        out.to_dtype(self.config.output_dtype)
    }

    fn backward(&mut self, dy: &Buffer) -> Result<Buffer> {
        let class = self.class_name();
        self.meta.check_output_grad(class, dy)?;
        let cache = take_cache(&mut self.cache, class)?;
        let arity = self.arity.inputs();
        let binarizer = self.binarizer;
        let input_shape = self.meta.shapes(class)?.0.to_vec();
        let state = self.state()?;
        let table = state.table.as_tensor();
        let dy = dy.tensor()?;

        let (ids, x_sel, g) = match cache {
            LutCache::Stochastic { ids, x_sel } => (ids, x_sel, dy),
            LutCache::Binary { ids, x_sel, pre } => {
                let g = binarizer.backward(&dy, &pre)?;
                (ids, x_sel, g)
            }
            LutCache::Normalized { ids, x_sel, x_hat, stats } => {
                let g = norm_of(state)?.backward(&dy, &x_hat, &stats)?;
                (ids, x_sel, g)
            }
            LutCache::NormalizedBinary { ids, x_sel, stats } => {
                let norm = norm_of(state)?;
                let raw = lut_forward(&x_sel, table, arity)?;
                let x_hat = norm.standardize(&raw, &stats)?;
                let v = norm.scale_shift(&x_hat)?;
                let g = norm.backward(&binarizer.backward(&dy, &v)?, &x_hat, &stats)?;
                (ids, x_sel, g)
            }
        };

        let (dx_sel, dtable) = lut_backward(&x_sel, table, &g, arity)?;
        accumulate(&state.dtable, &dtable)?;
        let dx = scatter_inputs(&dx_sel, &ids, node_count(&input_shape))?;
        Buffer::from_tensor(dx, &input_shape)
    }

    fn parameters(&self) -> Variables {
        let mut vars = Variables::new();
        if let Some(state) = &self.state {
            vars.push(state.table.clone());
            if let Some(norm) = &state.norm {
                vars.extend(norm.parameters());
            }
        }
        vars
    }

    fn gradients(&self) -> Variables {
        let mut vars = Variables::new();
        if let Some(state) = &self.state {
            vars.push(state.dtable.clone());
            if let Some(norm) = &state.norm {
                vars.extend(norm.gradients());
            }
        }
        vars
    }

    fn save(&self) -> Result<Snapshot> {
        let state = self.state()?;
        let mut snapshot = Snapshot::new(self.class_name());
        snapshot.insert("connections", state.connections.to_record());
        snapshot.insert("table", TensorRecord::from_tensor(state.table.as_tensor())?);
        if let Some(norm) = &state.norm {
            norm.save_into(&mut snapshot)?;
        }
        Ok(snapshot)
    }

    fn load(&mut self, snapshot: &Snapshot) -> Result<()> {
        snapshot.expect_class(self.class_name())?;
        let device = self.device.clone();
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| LutError::state("DifferentiableLut must be negotiated before load"))?;
        let table = snapshot
            .tensor("table")?
            .expect_dims(state.table.dims())?
            .to_tensor(&device)?;
        let mut connections = state.connections.clone();
        connections.load_record(snapshot.tensor("connections")?)?;
        if let Some(norm) = state.norm.as_mut() {
            norm.load_from(snapshot)?;
        }
        state.table.set(&table)?;
        state.connections = connections;
        self.cache = None;
        Ok(())
    }

    fn as_sparse(&self) -> Option<&dyn SparseUnit> {
        Some(self)
    }
}

impl SparseUnit for DifferentiableLut {
    fn connection_table(&self) -> Result<&ConnectionTable> {
        Ok(&self.state()?.connections)
    }

    fn connection_table_mut(&mut self) -> Result<&mut ConnectionTable> {
        Ok(&mut self.state_mut()?.connections)
    }

    fn connection_size(&self) -> usize {
        self.arity.inputs()
    }

    fn lut_table(&self, node: usize) -> Result<Vec<f32>> {
        let state = self.state()?;
        if node >= state.connections.output_nodes() {
            return Err(LutError::state(format!("node {node} out of range")));
        }
        Ok(state.table.as_tensor().get(node)?.to_vec1::<f32>()?)
    }

    fn forward_node(&self, node: usize, inputs: &[f64]) -> Result<f64> {
        if inputs.len() != self.arity.inputs() {
            return Err(LutError::shape(format!(
                "forward_node needs {} inputs, got {}",
                self.arity.inputs(),
                inputs.len()
            )));
        }
        let mut v = evaluate_node(&self.lut_table(node)?, inputs);
        let state = self.state()?;
        if let Some(norm) = &state.norm {
            v = norm.forward_node(node, v)?;
        }
        if self.pipeline.binarizes() {
            v = self.binarizer.forward_value(v);
        }
        Ok(v)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
