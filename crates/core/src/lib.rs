//! # lutnet-core: Layer Composition Engine
//!
//! Every unit needed to build, train, and run a LUT network lives in this
//! crate:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`buffer`] | `Buffer`: frame-major activations, dense `F32` or bit-packed |
//! | [`unit`] | The `Unit` trait: shape negotiation, forward/backward, commands, snapshots |
//! | [`sequential`] | `Sequential` container |
//! | [`sparse`] | `ConnectionTable`, `SparseUnit`, connection rules |
//! | [`differentiable`] | `DifferentiableLut` (stochastic LUT + batch-norm + binarize) |
//! | [`binary_lut`] | `BinaryLut`: bit tables over packed frames |
//! | [`norm`] | `BatchNormalization` |
//! | [`activation`] | `Binarize`, ReLU / Sigmoid / HardTanh |
//! | [`conv`] | `Im2Col`, `Col2Im`, `Convolution2d` |
//! | [`dense`] | `DenseAffine` |
//! | [`modulation`] | `RealToBinary`, `BinaryToReal`, `BinaryModulation` |
//! | [`pooling`] | `MaxPooling`, `StochasticMaxPooling` |
//! | [`reduce`] | `Reduce`: folds repeated outputs onto class nodes |
//! | [`snapshot`] | Versionless JSON snapshots of unit state |
//!
//! ## Design principles
//!
//! 1. **Explicit gradients.** Every unit derives its own backward pass and
//!    accumulates into gradient `Var`s; candle autograd is not involved.
//! 2. **Negotiate once.** Shapes flow through `negotiate_shape` before the
//!    first forward; units allocate their state there.
//! 3. **Deterministic.** Connection tables, table initialisers, and modulation
//!    thresholds are all seeded.

pub mod activation;
pub mod binary_lut;
pub mod buffer;
pub mod conv;
pub mod dense;
pub mod differentiable;
pub mod error;
mod lut;
pub mod modulation;
pub mod norm;
pub mod pooling;
pub mod reduce;
pub mod sequential;
pub mod shape;
pub mod snapshot;
pub mod sparse;
pub mod unit;
pub mod variables;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use activation::{Activation, ActivationKind, Binarize, Binarizer};
pub use binary_lut::BinaryLut;
pub use buffer::{words_per_node, Buffer, WORD_BITS};
pub use conv::{conv_output_size, Col2Im, Convolution2d, Im2Col};
pub use dense::DenseAffine;
pub use differentiable::{DifferentiableLut, LutPipeline};
pub use error::{LutError, Result};
pub use modulation::{BinaryModulation, BinaryToReal, RealToBinary};
pub use norm::BatchNormalization;
pub use pooling::{MaxPooling, StochasticMaxPooling};
pub use reduce::Reduce;
pub use sequential::Sequential;
pub use shape::{flatten_index, node_count, unflatten_index};
pub use snapshot::{RecordData, Snapshot, TensorRecord};
pub use sparse::{entry_inputs, ConnectionTable, SparseUnit};
pub use unit::{Unit, UnitMeta, TARGET_ALL};
pub use variables::Variables;

pub use lutnet_common::{
    BatchNormConfig, BinarizeConfig, BinaryLutConfig, BorderMode, ConnectionRule,
    ConvolutionConfig, DataType, DenseAffineConfig, DifferentiableLutConfig, JsonConfig,
    LutArity, ModulationConfig, Padding, PoolingConfig, ReduceConfig, ReduceMode,
};
