//! Construction configuration for every LUT-Net unit.
//!
//! Serialised as JSON so a network description can be stored next to its
//! snapshot. Every field has a default, so `{}` deserialises to a working
//! configuration for all structs except where an output shape is required.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────────────

/// Failure to interpret a configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown {kind} \"{value}\"")]
    UnknownVariant { kind: &'static str, value: String },
    #[error("unsupported LUT arity {0} (expected one of 2, 4, 5, 6)")]
    UnsupportedArity(usize),
}

// ── Enums ───────────────────────────────────────────────────────────────────

/// Element type of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Dense 32-bit float, one value per node per frame.
    #[default]
    F32,
    /// One bit per node per frame, packed 32 frames to a word.
    Bit,
}

/// How a sparse unit chooses its N inputs when its shape is negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionRule {
    /// Shuffle-set draw of N distinct inputs over the whole input.
    #[default]
    Random,
    /// Round-robin over the inputs in order.
    Serial,
    /// Inputs restricted to the output node's own channel.
    Depthwise,
    /// Inputs restricted to the output node's own spatial position.
    Pointwise,
}

/// Convolution padding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    #[default]
    Valid,
    Same,
}

/// Resolution of taps that fall outside the input image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BorderMode {
    /// Fill with `border_value`.
    #[default]
    Constant,
    /// `cba|abc|cba` (edge repeated).
    Reflect,
    /// `dcb|abcd|cba` (edge not repeated).
    #[serde(rename = "reflect_101")]
    Reflect101,
    /// `aaa|abc|ccc`.
    Replicate,
    /// `abc|abc|abc`.
    Wrap,
}

/// How [`ReduceConfig`] folds repeated input nodes onto one output node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceMode {
    #[default]
    Sum,
    Mean,
}

macro_rules! impl_from_str {
    ($ty:ident, $kind:literal, { $($text:literal => $variant:ident),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(ConfigError::UnknownVariant {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let text = match self {
                    $(Self::$variant => $text,)+
                };
                f.write_str(text)
            }
        }
    };
}

impl_from_str!(DataType, "data type", { "f32" => F32, "bit" => Bit });
impl_from_str!(ConnectionRule, "connection rule", {
    "random" => Random,
    "serial" => Serial,
    "depthwise" => Depthwise,
    "pointwise" => Pointwise,
});
impl_from_str!(Padding, "padding", { "valid" => Valid, "same" => Same });
impl_from_str!(BorderMode, "border mode", {
    "constant" => Constant,
    "reflect" => Reflect,
    "reflect_101" => Reflect101,
    "replicate" => Replicate,
    "wrap" => Wrap,
});
impl_from_str!(ReduceMode, "reduce mode", { "sum" => Sum, "mean" => Mean });

/// Number of inputs per LUT node. Only these arities have kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LutArity {
    Two,
    Four,
    Five,
    Six,
}

impl LutArity {
    /// N, the number of inputs per node.
    pub fn inputs(self) -> usize {
        match self {
            Self::Two => 2,
            Self::Four => 4,
            Self::Five => 5,
            Self::Six => 6,
        }
    }

    /// 2^N, the number of table entries per node.
    pub fn table_size(self) -> usize {
        1 << self.inputs()
    }
}

impl TryFrom<usize> for LutArity {
    type Error = ConfigError;

    fn try_from(n: usize) -> Result<Self, Self::Error> {
        match n {
            2 => Ok(Self::Two),
            4 => Ok(Self::Four),
            5 => Ok(Self::Five),
            6 => Ok(Self::Six),
            other => Err(ConfigError::UnsupportedArity(other)),
        }
    }
}

// ── JSON persistence ────────────────────────────────────────────────────────

/// Save/load helpers shared by every configuration struct.
pub trait JsonConfig: Serialize + DeserializeOwned {
    /// Save config to a JSON file.
    fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

// ── Differentiable LUT ──────────────────────────────────────────────────────

/// Hyperparameters of a trainable sparse LUT layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifferentiableLutConfig {
    /// Per-frame output shape, e.g. `[1024]` or `[36, 1, 1]`.
    #[serde(default)]
    pub output_shape: Vec<usize>,
    /// Inputs per node (N). Validated against [`LutArity`] at construction.
    #[serde(default = "default_arity")]
    pub arity: usize,
    #[serde(default)]
    pub connection: ConnectionRule,
    /// Threshold the output to {0,1} with a straight-through gradient.
    #[serde(default = "default_true")]
    pub binarize: bool,
    /// Normalise outputs with batch statistics before binarising.
    #[serde(default = "default_true")]
    pub batch_norm: bool,
    #[serde(default = "default_lut_momentum")]
    pub momentum: f32,
    #[serde(default = "default_lut_gamma")]
    pub gamma: f32,
    #[serde(default = "default_lut_beta")]
    pub beta: f32,
    #[serde(default = "default_true")]
    pub fix_gamma: bool,
    #[serde(default = "default_true")]
    pub fix_beta: bool,
    #[serde(default = "default_lut_threshold")]
    pub binary_threshold: f32,
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
    /// `bit` is only valid together with `binarize`.
    #[serde(default)]
    pub output_dtype: DataType,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl DifferentiableLutConfig {
    pub fn new(output_shape: &[usize]) -> Self {
        Self {
            output_shape: output_shape.to_vec(),
            ..Default::default()
        }
    }
}

impl Default for DifferentiableLutConfig {
    fn default() -> Self {
        Self {
            output_shape: Vec::new(),
            arity: default_arity(),
            connection: ConnectionRule::Random,
            binarize: true,
            batch_norm: true,
            momentum: default_lut_momentum(),
            gamma: default_lut_gamma(),
            beta: default_lut_beta(),
            fix_gamma: true,
            fix_beta: true,
            binary_threshold: default_lut_threshold(),
            epsilon: default_epsilon(),
            output_dtype: DataType::F32,
            seed: default_seed(),
        }
    }
}

impl JsonConfig for DifferentiableLutConfig {}

// ── Binary LUT ──────────────────────────────────────────────────────────────

/// Inference-only boolean LUT layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryLutConfig {
    #[serde(default)]
    pub output_shape: Vec<usize>,
    #[serde(default = "default_arity")]
    pub arity: usize,
    #[serde(default)]
    pub connection: ConnectionRule,
    #[serde(default)]
    pub output_dtype: DataType,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl BinaryLutConfig {
    pub fn new(output_shape: &[usize]) -> Self {
        Self {
            output_shape: output_shape.to_vec(),
            ..Default::default()
        }
    }
}

impl Default for BinaryLutConfig {
    fn default() -> Self {
        Self {
            output_shape: Vec::new(),
            arity: default_arity(),
            connection: ConnectionRule::Random,
            output_dtype: DataType::F32,
            seed: default_seed(),
        }
    }
}

impl JsonConfig for BinaryLutConfig {}

// ── Batch normalisation ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNormConfig {
    #[serde(default = "default_bn_momentum")]
    pub momentum: f32,
    #[serde(default = "default_one")]
    pub gamma: f32,
    #[serde(default)]
    pub beta: f32,
    #[serde(default)]
    pub fix_gamma: bool,
    #[serde(default)]
    pub fix_beta: bool,
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        Self {
            momentum: default_bn_momentum(),
            gamma: 1.0,
            beta: 0.0,
            fix_gamma: false,
            fix_beta: false,
            epsilon: default_epsilon(),
        }
    }
}

impl JsonConfig for BatchNormConfig {}

// ── Binarize ────────────────────────────────────────────────────────────────

/// Hard threshold with a hard-tanh straight-through window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinarizeConfig {
    #[serde(default)]
    pub threshold: f32,
    #[serde(default = "default_clip_min")]
    pub clip_min: f32,
    #[serde(default = "default_one")]
    pub clip_max: f32,
    #[serde(default)]
    pub output_dtype: DataType,
}

impl Default for BinarizeConfig {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            clip_min: default_clip_min(),
            clip_max: 1.0,
            output_dtype: DataType::F32,
        }
    }
}

impl JsonConfig for BinarizeConfig {}

// ── Convolution ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvolutionConfig {
    /// `(height, width)` of the filter window.
    #[serde(default = "default_filter")]
    pub filter_size: (usize, usize),
    /// `(height, width)` step between windows.
    #[serde(default = "default_stride")]
    pub stride: (usize, usize),
    #[serde(default)]
    pub padding: Padding,
    #[serde(default)]
    pub border_mode: BorderMode,
    /// Fill value for [`BorderMode::Constant`].
    #[serde(default)]
    pub border_value: f32,
}

impl ConvolutionConfig {
    pub fn new(filter_size: (usize, usize)) -> Self {
        Self {
            filter_size,
            ..Default::default()
        }
    }
}

impl Default for ConvolutionConfig {
    fn default() -> Self {
        Self {
            filter_size: default_filter(),
            stride: default_stride(),
            padding: Padding::Valid,
            border_mode: BorderMode::Constant,
            border_value: 0.0,
        }
    }
}

impl JsonConfig for ConvolutionConfig {}

// ── Modulation ──────────────────────────────────────────────────────────────

/// Real ↔ bit-stream conversion around a binary sub-network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModulationConfig {
    /// Bit frames generated per real frame while training.
    #[serde(default = "default_modulation_size")]
    pub training_size: usize,
    /// Bit frames generated per real frame at inference.
    #[serde(default = "default_modulation_size")]
    pub inference_size: usize,
    /// Draw thresholds uniformly at random instead of evenly spaced.
    #[serde(default = "default_true")]
    pub random_thresholds: bool,
    /// Share one threshold across all nodes of a generated frame.
    #[serde(default = "default_true")]
    pub framewise: bool,
    #[serde(default)]
    pub input_min: f32,
    #[serde(default = "default_one")]
    pub input_max: f32,
    #[serde(default = "default_bit_dtype")]
    pub bit_dtype: DataType,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for ModulationConfig {
    fn default() -> Self {
        Self {
            training_size: default_modulation_size(),
            inference_size: default_modulation_size(),
            random_thresholds: true,
            framewise: true,
            input_min: 0.0,
            input_max: 1.0,
            bit_dtype: DataType::Bit,
            seed: default_seed(),
        }
    }
}

impl JsonConfig for ModulationConfig {}

// ── Dense affine ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseAffineConfig {
    #[serde(default)]
    pub output_shape: Vec<usize>,
    /// Standard deviation of the uniform weight initialiser.
    #[serde(default = "default_init_std")]
    pub init_std: f32,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl DenseAffineConfig {
    pub fn new(output_shape: &[usize]) -> Self {
        Self {
            output_shape: output_shape.to_vec(),
            ..Default::default()
        }
    }
}

impl Default for DenseAffineConfig {
    fn default() -> Self {
        Self {
            output_shape: Vec::new(),
            init_std: default_init_std(),
            seed: default_seed(),
        }
    }
}

impl JsonConfig for DenseAffineConfig {}

// ── Pooling ─────────────────────────────────────────────────────────────────

/// Non-overlapping `(height, width)` pooling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolingConfig {
    #[serde(default = "default_pool_filter")]
    pub filter_size: (usize, usize),
}

impl PoolingConfig {
    pub fn new(filter_size: (usize, usize)) -> Self {
        Self { filter_size }
    }
}

impl Default for PoolingConfig {
    fn default() -> Self {
        Self {
            filter_size: default_pool_filter(),
        }
    }
}

impl JsonConfig for PoolingConfig {}

// ── Reduce ──────────────────────────────────────────────────────────────────

/// Folds input node `i` onto output node `i mod O`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceConfig {
    #[serde(default)]
    pub output_shape: Vec<usize>,
    #[serde(default)]
    pub mode: ReduceMode,
}

impl ReduceConfig {
    pub fn new(output_shape: &[usize]) -> Self {
        Self {
            output_shape: output_shape.to_vec(),
            ..Default::default()
        }
    }
}

impl Default for ReduceConfig {
    fn default() -> Self {
        Self {
            output_shape: Vec::new(),
            mode: ReduceMode::Sum,
        }
    }
}

impl JsonConfig for ReduceConfig {}

// ── Default value functions ─────────────────────────────────────────────────

fn default_true() -> bool {
    true
}
fn default_one() -> f32 {
    1.0
}
fn default_arity() -> usize {
    6
}
fn default_lut_momentum() -> f32 {
    0.0
}
fn default_lut_gamma() -> f32 {
    0.3
}
fn default_lut_beta() -> f32 {
    0.5
}
fn default_lut_threshold() -> f32 {
    0.5
}
fn default_bn_momentum() -> f32 {
    0.9
}
fn default_epsilon() -> f32 {
    1e-5
}
fn default_clip_min() -> f32 {
    -1.0
}
fn default_filter() -> (usize, usize) {
    (3, 3)
}
fn default_pool_filter() -> (usize, usize) {
    (2, 2)
}
fn default_stride() -> (usize, usize) {
    (1, 1)
}
fn default_modulation_size() -> usize {
    1
}
fn default_bit_dtype() -> DataType {
    DataType::Bit
}
fn default_init_std() -> f32 {
    0.01
}
fn default_seed() -> u64 {
    1
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lut_config_json_round_trip() {
        let config = DifferentiableLutConfig {
            arity: 4,
            connection: ConnectionRule::Depthwise,
            ..DifferentiableLutConfig::new(&[8, 2, 2])
        };
        let json = serde_json::to_string(&config).unwrap();
        let loaded: DifferentiableLutConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, loaded);
        assert!(json.contains("\"depthwise\""));
    }

    #[test]
    fn lut_config_defaults_from_empty_json() {
        let loaded: DifferentiableLutConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(loaded.arity, 6);
        assert!(loaded.binarize);
        assert!(loaded.batch_norm);
        assert_eq!(loaded.momentum, 0.0);
        assert_eq!(loaded.gamma, 0.3);
        assert_eq!(loaded.beta, 0.5);
        assert!(loaded.fix_gamma && loaded.fix_beta);
        assert_eq!(loaded.binary_threshold, 0.5);
        assert_eq!(loaded.output_dtype, DataType::F32);
    }

    #[test]
    fn batch_norm_defaults_are_learnable() {
        let c = BatchNormConfig::default();
        assert_eq!(c.momentum, 0.9);
        assert_eq!(c.gamma, 1.0);
        assert_eq!(c.beta, 0.0);
        assert!(!c.fix_gamma && !c.fix_beta);
    }

    #[test]
    fn convolution_config_partial_json() {
        let loaded: ConvolutionConfig =
            serde_json::from_str(r#"{ "filter_size": [5, 3], "padding": "same" }"#).unwrap();
        assert_eq!(loaded.filter_size, (5, 3));
        assert_eq!(loaded.stride, (1, 1));
        assert_eq!(loaded.padding, Padding::Same);
        assert_eq!(loaded.border_mode, BorderMode::Constant);
    }

    #[test]
    fn pooling_and_reduce_defaults() {
        let pool: PoolingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(pool.filter_size, (2, 2));
        let reduce: ReduceConfig =
            serde_json::from_str(r#"{ "output_shape": [10], "mode": "mean" }"#).unwrap();
        assert_eq!(reduce.output_shape, vec![10]);
        assert_eq!(reduce.mode, ReduceMode::Mean);
        assert_eq!(ReduceConfig::new(&[3]).mode, ReduceMode::Sum);
        assert_eq!("MEAN".parse::<ReduceMode>().unwrap(), ReduceMode::Mean);
    }

    #[test]
    fn enums_parse_from_strings() {
        assert_eq!("random".parse::<ConnectionRule>().unwrap(), ConnectionRule::Random);
        assert_eq!(" Serial ".parse::<ConnectionRule>().unwrap(), ConnectionRule::Serial);
        assert_eq!("same".parse::<Padding>().unwrap(), Padding::Same);
        assert_eq!("reflect_101".parse::<BorderMode>().unwrap(), BorderMode::Reflect101);
        assert_eq!("bit".parse::<DataType>().unwrap(), DataType::Bit);
        assert_eq!(BorderMode::Reflect101.to_string(), "reflect_101");

        let err = "gauss".parse::<ConnectionRule>().unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownVariant {
                kind: "connection rule",
                value: "gauss".into()
            }
        );
        assert!("full".parse::<Padding>().is_err());
    }

    #[test]
    fn lut_arity_accepts_only_supported_sizes() {
        for n in [2, 4, 5, 6] {
            let arity = LutArity::try_from(n).unwrap();
            assert_eq!(arity.inputs(), n);
            assert_eq!(arity.table_size(), 1 << n);
        }
        for n in [0, 1, 3, 7] {
            assert_eq!(LutArity::try_from(n), Err(ConfigError::UnsupportedArity(n)));
        }
    }

    #[test]
    fn json_config_save_load() {
        let path = std::env::temp_dir().join(format!("lutnet-config-{}.json", std::process::id()));
        let config = ModulationConfig {
            training_size: 7,
            random_thresholds: false,
            ..Default::default()
        };
        config.save(&path).unwrap();
        let loaded = ModulationConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config, loaded);
    }
}
