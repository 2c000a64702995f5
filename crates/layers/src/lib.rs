//! Hypersphere-constrained layer primitives.
//!
//! The crate collects the building blocks of the normalised-network
//! formulation: weight matrices and activations are kept on the unit
//! hypersphere, learned per-channel scales decouple initial values from
//! effective learning rates, and residual updates are spherical
//! interpolation steps instead of free-form addition.
//!
//! Tensors follow a `[..., dim]` convention: any number of leading batch
//! dimensions with the feature axis last. Every forward pass threads a
//! [`PrecisionPolicy`] so parameters can be stored in reduced precision
//! while matmuls and norm statistics promote to `f32`.
//!
//! Weight constraints come in two flavours behind one interface: structural
//! mode re-projects the raw parameter on every read so gradients flow
//! through the constraint, while manual mode reads the raw parameter and
//! relies on an explicit [`NormLinear::renorm_weights`] call after each
//! optimizer step. See [`linear::WeightMode`].

pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod residual;
pub mod scale;

pub use dtypes::PrecisionPolicy;
pub use linear::{LinearInit, NormLinear, NormLinearConfig, WeightMode};
pub use mlp::{FeedForward, FeedForwardConfig};
pub use norm::{l2norm, unit_normalize};
pub use residual::{BranchLayer, BranchOutput, Residual};
pub use scale::Scale;
