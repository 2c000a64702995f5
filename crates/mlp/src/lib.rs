//! Normalization-constrained feedforward stacks.
//!
//! Assembles the primitives from the `layers` crate into the full
//! hypersphere-constrained block: `depth` gated feedforward layers wrapped
//! in spherical residuals, optional boundary projections, and the
//! magnitude-preserving constant shift at the input. The stack is the only
//! component with an external call surface; a training loop constructs it,
//! drives [`FeedForwardStack::forward`], hands
//! [`FeedForwardStack::named_parameters`] to its optimizer, and, when built
//! with manual weight normalization, calls
//! [`FeedForwardStack::renorm_weights`] after every optimizer step.

pub mod config;
pub mod generic;
pub mod stack;

pub use config::{PerLayer, StackConfig};
pub use generic::{GenericMlp, MlpError};
pub use stack::FeedForwardStack;
