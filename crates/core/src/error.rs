//! Error type shared by every unit.

use lutnet_common::ConfigError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LutError>;

#[derive(Debug, Error)]
pub enum LutError {
    /// Invalid construction parameters (arity, dtype combination, unknown rule).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Incompatible shapes during negotiation or execution.
    #[error("shape error: {0}")]
    Shape(String),

    /// Operation not valid in the unit's current state.
    #[error("state error: {0}")]
    State(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LutError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }
}

impl From<ConfigError> for LutError {
    fn from(e: ConfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}
