//! Norm-constrained linear projections.
//!
//! A [`NormLinear`] is a bias-free linear map whose weight matrix is kept on
//! the unit hypersphere: depending on the axis selection, every row or every
//! column has unit L2 norm whenever the weight is observed outside an
//! optimizer step. Bias is deliberately unsupported; the geometry requires
//! every output to be a normalised combination of normalised inputs.
//!
//! Inputs are shaped `[..., dim_in]` with any number of leading batch
//! dimensions and produce `[..., dim_out]`. Weights and activations are cast
//! to [`PrecisionPolicy::compute`] for the matmul and back to the storage
//! dtype afterwards.

use candle_core::{bail, DType, Device, Result, Tensor, Var};

use crate::{checks, dtypes::PrecisionPolicy, norm::l2norm};

/// Selects how the unit-norm weight constraint is maintained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightMode {
    /// The forward pass reads the normalised projection of the raw weight on
    /// every call. Gradients flow through the projection, so the constraint
    /// holds by construction and no explicit renormalisation is required.
    Structural,
    /// The forward pass reads the raw weight directly. The caller must invoke
    /// [`NormLinear::renorm_weights`] after every optimizer step or the
    /// constraint decays under gradient descent.
    Manual,
}

impl WeightMode {
    /// Maps the stack-wide `manual_norm_weights` flag onto a mode.
    pub fn from_manual_flag(manual: bool) -> Self {
        if manual {
            WeightMode::Manual
        } else {
            WeightMode::Structural
        }
    }
}

/// Configuration for a norm-constrained projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormLinearConfig {
    /// Incoming feature dimension.
    pub dim_in: usize,
    /// Outgoing feature dimension.
    pub dim_out: usize,
    /// `true` normalises each output row over the `dim_in` axis (the output
    /// direction is a normalised combination of input directions); `false`
    /// normalises over the `dim_out` axis instead, which projections out of a
    /// block use so their output directions stay unit length.
    pub norm_input_axis: bool,
    /// How the constraint is maintained.
    pub mode: WeightMode,
}

impl NormLinearConfig {
    /// Creates a configuration with input-axis normalisation in structural
    /// mode, the standard case for in-block projections.
    pub fn new(dim_in: usize, dim_out: usize) -> Self {
        Self {
            dim_in,
            dim_out,
            norm_input_axis: true,
            mode: WeightMode::Structural,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.dim_in == 0 || self.dim_out == 0 {
            bail!(
                "norm_linear requires non-zero dimensions, got {} -> {}",
                self.dim_in,
                self.dim_out
            );
        }
        Ok(())
    }
}

/// Supported weight initialisation policies.
///
/// The sampled weight is renormalised immediately after construction, so the
/// policy only determines the direction distribution of the rows or columns,
/// never their length.
#[derive(Debug, Clone)]
pub enum LinearInit {
    /// Kaiming/He uniform initialisation (defaults to ReLU gain).
    KaimingUniform { negative_slope: f64 },
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
}

impl Default for LinearInit {
    fn default() -> Self {
        LinearInit::KaimingUniform {
            negative_slope: 5f64.sqrt(),
        }
    }
}

impl LinearInit {
    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        let weight_f32 = match self {
            LinearInit::KaimingUniform { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                let bound = (3.0f64).sqrt() * gain / fan_in.sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
        };
        if dtype == DType::F32 {
            Ok(weight_f32)
        } else {
            weight_f32.to_dtype(dtype)
        }
    }
}

/// Bias-free linear projection constrained to the unit hypersphere.
#[derive(Debug, Clone)]
pub struct NormLinear {
    config: NormLinearConfig,
    weight: Var,
}

impl NormLinear {
    /// Builds a projection with the default initialisation policy.
    pub fn new(config: NormLinearConfig, device: &Device, dtype: DType) -> Result<Self> {
        Self::with_init(config, &LinearInit::default(), device, dtype)
    }

    /// Builds a projection sampling the raw weight from `init`.
    pub fn with_init(
        config: NormLinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let weight = init.sample((config.dim_out, config.dim_in), device, dtype)?;
        Self::from_weight(config, weight)
    }

    /// Builds a projection from a pre-existing weight matrix.
    ///
    /// The weight is renormalised in place, establishing the unit-norm
    /// invariant regardless of the incoming values.
    pub fn from_weight(config: NormLinearConfig, weight: Tensor) -> Result<Self> {
        config.validate()?;
        checks::expect_rank("norm_linear.weight", &weight, 2)?;
        checks::expect_shape(
            "norm_linear.weight",
            &weight,
            &[config.dim_out, config.dim_in],
        )?;
        checks::expect_dtype_in(
            "norm_linear.weight",
            &weight,
            &[DType::F16, DType::BF16, DType::F32],
        )?;
        let layer = Self {
            config,
            weight: Var::from_tensor(&weight.contiguous()?)?,
        };
        layer.renorm_weights()?;
        Ok(layer)
    }

    /// Returns the static configuration.
    pub fn config(&self) -> &NormLinearConfig {
        &self.config
    }

    fn norm_axis(&self) -> usize {
        if self.config.norm_input_axis {
            1
        } else {
            0
        }
    }

    /// Weight matrix as observed by the forward pass.
    ///
    /// In structural mode this is the normalised projection of the raw
    /// parameter, recomputed on every read so gradients flow through the
    /// constraint. In manual mode it is the raw parameter itself, which is
    /// only unit-norm between [`renorm_weights`](Self::renorm_weights) calls.
    pub fn weight(&self) -> Result<Tensor> {
        match self.config.mode {
            WeightMode::Structural => l2norm(self.weight.as_tensor(), self.norm_axis()),
            WeightMode::Manual => Ok(self.weight.as_tensor().clone()),
        }
    }

    /// Raw parameter before any normalisation.
    pub fn raw_weight(&self) -> Tensor {
        self.weight.as_tensor().clone()
    }

    /// Overwrites the raw weight with its own normalised projection.
    ///
    /// Idempotent and safe at any time. The mutation goes through
    /// [`Var::set`], which bypasses the autodiff tape: renormalisation is a
    /// direct parameter update, not a differentiable forward step. Manual
    /// mode callers must invoke this after every optimizer step; in
    /// structural mode it only re-bases the raw parameter and leaves the
    /// forward behaviour unchanged.
    pub fn renorm_weights(&self) -> Result<()> {
        let normed = l2norm(self.weight.as_tensor(), self.norm_axis())?;
        self.weight.set(&normed)
    }

    /// Returns the trainable parameter under a scoped name.
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        vec![(format!("{scope}.weight"), self.weight.clone())]
    }

    /// Applies the projection to a `[..., dim_in]` tensor.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_trailing_dim("norm_linear.input", hidden, self.config.dim_in)?;

        let mut lead_dims = hidden.dims().to_vec();
        lead_dims.pop();
        let rows: usize = lead_dims.iter().product();

        let input = policy
            .cast_for_matmul(hidden)?
            .reshape((rows, self.config.dim_in))?;
        let weight = policy.cast_for_matmul(&self.weight()?)?;
        let projected = input.matmul(&weight.t()?)?;

        lead_dims.push(self.config.dim_out);
        policy.cast_to_storage(&projected.reshape(lead_dims)?)
    }
}
