//! Learned per-channel scales with decoupled init and learning-rate scaling.
//!
//! A [`Scale`] stores its learned vector multiplied up by `scale` and divides
//! it back out on every read, so the effective value starts at `init` while
//! the gradient magnitude seen by the optimizer is governed by `scale`. This
//! lets a single global learning rate apply a different effective rate to
//! each scale in the network, which is how the hypersphere formulation tunes
//! residual step sizes and branch gains per layer.

use candle_core::{bail, DType, Device, Result, Tensor, Var};

/// Learned `[dim]` multiplicative factor with decoupled hyperparameters.
#[derive(Debug, Clone)]
pub struct Scale {
    vector: Var,
    forward_scale: f64,
    dim: usize,
}

impl Scale {
    /// Builds a scale whose effective value at initialisation is `init`.
    ///
    /// The learned vector is initialised to the constant `scale` and every
    /// read multiplies by `init / scale`, so `scale` must be non-zero.
    pub fn new(dim: usize, init: f64, scale: f64, device: &Device, dtype: DType) -> Result<Self> {
        if dim == 0 {
            bail!("scale requires dim > 0");
        }
        if scale == 0.0 {
            bail!("scale hyperparameter must be non-zero");
        }
        let initial = Tensor::full(scale as f32, dim, device)?.to_dtype(dtype)?;
        Ok(Self {
            vector: Var::from_tensor(&initial)?,
            forward_scale: init / scale,
            dim,
        })
    }

    /// Builds a scale with `init = scale = 1`, the neutral configuration.
    pub fn unit(dim: usize, device: &Device, dtype: DType) -> Result<Self> {
        Self::new(dim, 1.0, 1.0, device, dtype)
    }

    /// Number of channels covered by this scale.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Evaluates the effective `[dim]` scale vector.
    pub fn forward(&self) -> Result<Tensor> {
        self.vector.as_tensor().affine(self.forward_scale, 0.0)
    }

    /// Returns the trainable parameter under a scoped name.
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        vec![(format!("{scope}.scale"), self.vector.clone())]
    }
}
