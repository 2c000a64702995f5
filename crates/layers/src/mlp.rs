//! Gated feedforward unit built entirely from norm-constrained pieces.
//!
//! The block is SwiGLU-shaped: two parallel projections into the expanded
//! space (hidden and gate), a learned per-channel scale on each branch, silu
//! gating, then a contraction back to the model width. Because the
//! projections carry unit-norm weights, the gate would otherwise see
//! activations roughly `sqrt(dim)` smaller than in an unconstrained network;
//! the gate branch multiplies that factor back in so the non-linearity
//! operates at the usual scale.

use candle_core::{bail, DType, Device, Result, Tensor, Var};

use crate::{
    dtypes::PrecisionPolicy,
    linear::{NormLinear, NormLinearConfig, WeightMode},
    residual::{BranchLayer, BranchOutput},
    scale::Scale,
};

/// Configuration for the gated feedforward unit.
#[derive(Debug, Clone, Copy)]
pub struct FeedForwardConfig {
    /// Model width at the block boundary.
    pub dim: usize,
    /// Expansion ratio before the `2/3` gating correction.
    pub expand_factor: f64,
    /// Selects manual weight renormalisation for every projection.
    pub manual_norm_weights: bool,
    /// Hidden branch scale init.
    pub s_hidden_init: f64,
    /// Hidden branch scale learning-rate decoupling.
    pub s_hidden_scale: f64,
    /// Gate branch scale init.
    pub s_gate_init: f64,
    /// Gate branch scale learning-rate decoupling.
    pub s_gate_scale: f64,
}

impl FeedForwardConfig {
    /// Creates the standard configuration: fourfold expansion, structural
    /// weight constraints, neutral branch scales.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            expand_factor: 4.0,
            manual_norm_weights: false,
            s_hidden_init: 1.0,
            s_hidden_scale: 1.0,
            s_gate_init: 1.0,
            s_gate_scale: 1.0,
        }
    }

    /// Expanded width. The `2/3` factor keeps the parameter count of the
    /// gated block comparable to a non-gated feedforward with the same
    /// expansion ratio.
    pub fn dim_inner(&self) -> usize {
        (self.dim as f64 * self.expand_factor * 2.0 / 3.0) as usize
    }

    fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            bail!("feedforward requires dim > 0");
        }
        if self.expand_factor <= 0.0 {
            bail!("feedforward expand_factor must be positive");
        }
        if self.dim_inner() == 0 {
            bail!(
                "feedforward inner dim collapsed to zero (dim {} expand_factor {})",
                self.dim,
                self.expand_factor
            );
        }
        Ok(())
    }
}

/// Norm-constrained gated feedforward block.
#[derive(Debug)]
pub struct FeedForward {
    config: FeedForwardConfig,
    to_hidden: NormLinear,
    to_gate: NormLinear,
    hidden_scale: Scale,
    gate_scale: Scale,
    to_out: NormLinear,
    gate_mult: f64,
}

impl FeedForward {
    /// Builds the block on `device` with parameters stored as `dtype`.
    pub fn new(config: FeedForwardConfig, device: &Device, dtype: DType) -> Result<Self> {
        config.validate()?;
        let dim_inner = config.dim_inner();
        let mode = WeightMode::from_manual_flag(config.manual_norm_weights);

        let mut hidden_cfg = NormLinearConfig::new(config.dim, dim_inner);
        hidden_cfg.mode = mode;
        let mut gate_cfg = NormLinearConfig::new(config.dim, dim_inner);
        gate_cfg.mode = mode;
        // The contraction normalises over its output axis so the block's
        // output directions stay unit length.
        let mut out_cfg = NormLinearConfig::new(dim_inner, config.dim);
        out_cfg.norm_input_axis = false;
        out_cfg.mode = mode;

        Ok(Self {
            to_hidden: NormLinear::new(hidden_cfg, device, dtype)?,
            to_gate: NormLinear::new(gate_cfg, device, dtype)?,
            hidden_scale: Scale::new(
                dim_inner,
                config.s_hidden_init,
                config.s_hidden_scale,
                device,
                dtype,
            )?,
            gate_scale: Scale::new(
                dim_inner,
                config.s_gate_init,
                config.s_gate_scale,
                device,
                dtype,
            )?,
            to_out: NormLinear::new(out_cfg, device, dtype)?,
            gate_mult: (config.dim as f64).sqrt(),
            config,
        })
    }

    /// Returns the static configuration.
    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    /// Applies the gated feedforward to a `[..., dim]` tensor.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let hidden_proj = self.to_hidden.forward(hidden, policy)?;
        let gate_proj = self.to_gate.forward(hidden, policy)?;

        let hidden_proj = hidden_proj.broadcast_mul(&self.hidden_scale.forward()?)?;
        let gate_proj = gate_proj
            .broadcast_mul(&self.gate_scale.forward()?)?
            .affine(self.gate_mult, 0.0)?;

        let gate = policy.cast_for_matmul(&gate_proj)?;
        let value = policy.cast_for_matmul(&hidden_proj)?;
        let activated = policy.cast_to_storage(&gate.silu()?.mul(&value)?)?;

        self.to_out.forward(&activated, policy)
    }

    /// Renormalises all three projections.
    pub fn renorm_weights(&self) -> Result<()> {
        self.to_hidden.renorm_weights()?;
        self.to_gate.renorm_weights()?;
        self.to_out.renorm_weights()
    }

    /// Trainable parameters with scoped names.
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.to_hidden.named_parameters(&format!("{scope}.to_hidden"));
        params.extend(self.to_gate.named_parameters(&format!("{scope}.to_gate")));
        params.extend(
            self.hidden_scale
                .named_parameters(&format!("{scope}.hidden_scale")),
        );
        params.extend(
            self.gate_scale
                .named_parameters(&format!("{scope}.gate_scale")),
        );
        params.extend(self.to_out.named_parameters(&format!("{scope}.to_out")));
        params
    }
}

impl BranchLayer for FeedForward {
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<BranchOutput> {
        Ok(BranchOutput::Primary(FeedForward::forward(
            self, hidden, policy,
        )?))
    }

    fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        FeedForward::named_parameters(self, scope)
    }

    fn renorm_weights(&self) -> Result<()> {
        FeedForward::renorm_weights(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::ops;

    #[test]
    fn inner_dim_follows_the_gating_convention() {
        assert_eq!(FeedForwardConfig::new(512).dim_inner(), 1365);
        let mut config = FeedForwardConfig::new(256);
        config.expand_factor = 2.0;
        assert_eq!(config.dim_inner(), 341);
    }

    #[test]
    fn forward_preserves_shape() -> Result<()> {
        let device = Device::Cpu;
        let ff = FeedForward::new(FeedForwardConfig::new(32), &device, DType::F32)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let input = Tensor::randn(0f32, 1.0, (2, 5, 32), &device)?;
        let output = ff.forward(&input, &policy)?;
        assert_eq!(output.dims(), input.dims());
        Ok(())
    }

    #[test]
    fn forward_matches_reference_composition() -> Result<()> {
        let device = Device::Cpu;
        let config = FeedForwardConfig::new(16);
        let ff = FeedForward::new(config, &device, DType::F32)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let input = Tensor::randn(0f32, 1.0, (3, 16), &device)?;

        let output = ff.forward(&input, &policy)?;

        // Recompose the block from its observable pieces using the
        // independent silu kernel from candle-nn.
        let hidden = input
            .matmul(&ff.to_hidden.weight()?.t()?)?
            .broadcast_mul(&ff.hidden_scale.forward()?)?;
        let gate = input
            .matmul(&ff.to_gate.weight()?.t()?)?
            .broadcast_mul(&ff.gate_scale.forward()?)?
            .affine((16f64).sqrt(), 0.0)?;
        let reference = ops::silu(&gate)?
            .mul(&hidden)?
            .matmul(&ff.to_out.weight()?.t()?)?;

        let diff = output.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-5, "max diff {diff}");
        Ok(())
    }

    #[test]
    fn all_projections_satisfy_their_norm_axis() -> Result<()> {
        let device = Device::Cpu;
        let ff = FeedForward::new(FeedForwardConfig::new(24), &device, DType::F32)?;

        let row_norms = ff
            .to_hidden
            .weight()?
            .sqr()?
            .sum_keepdim(1)?
            .sqrt()?
            .flatten_all()?
            .to_vec1::<f32>()?;
        for norm in row_norms {
            assert!((norm - 1.0).abs() < 1e-5);
        }

        let col_norms = ff
            .to_out
            .weight()?
            .sqr()?
            .sum_keepdim(0)?
            .sqrt()?
            .flatten_all()?
            .to_vec1::<f32>()?;
        for norm in col_norms {
            assert!((norm - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn parameter_registration_covers_every_piece() -> Result<()> {
        let device = Device::Cpu;
        let ff = FeedForward::new(FeedForwardConfig::new(8), &device, DType::F32)?;
        let names: Vec<String> = ff
            .named_parameters("ff")
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(
            names,
            vec![
                "ff.to_hidden.weight",
                "ff.to_gate.weight",
                "ff.hidden_scale.scale",
                "ff.gate_scale.scale",
                "ff.to_out.weight",
            ]
        );
        Ok(())
    }

    #[test]
    fn manual_mode_propagates_to_every_projection() -> Result<()> {
        let device = Device::Cpu;
        let mut config = FeedForwardConfig::new(12);
        config.manual_norm_weights = true;
        let ff = FeedForward::new(config, &device, DType::F32)?;
        assert_eq!(ff.to_hidden.config().mode, WeightMode::Manual);
        assert_eq!(ff.to_gate.config().mode, WeightMode::Manual);
        assert_eq!(ff.to_out.config().mode, WeightMode::Manual);
        Ok(())
    }
}
