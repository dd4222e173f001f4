//! # lutnet-common: Shared Configuration
//!
//! Types shared across every crate in the workspace:
//!
//! * **Unit configs**: [`DifferentiableLutConfig`], [`BinaryLutConfig`],
//!   [`BatchNormConfig`], [`BinarizeConfig`], [`ConvolutionConfig`],
//!   [`ModulationConfig`], [`DenseAffineConfig`], [`PoolingConfig`],
//!   [`ReduceConfig`] (serialised as JSON).
//! * **Enums**: [`DataType`], [`ConnectionRule`], [`Padding`], [`BorderMode`],
//!   [`ReduceMode`], [`LutArity`].

pub mod config;

pub use config::{
    BatchNormConfig, BinarizeConfig, BinaryLutConfig, BorderMode, ConfigError, ConnectionRule,
    ConvolutionConfig, DataType, DenseAffineConfig, DifferentiableLutConfig, JsonConfig,
    LutArity, ModulationConfig, Padding, PoolingConfig, ReduceConfig, ReduceMode,
};
