//! Configuration for the feedforward stack.
//!
//! Per-layer hyperparameters accept either a single value shared by every
//! layer or an explicit per-layer sequence. Sequences are validated eagerly
//! at construction: a length other than `depth` is a configuration mistake
//! and fails immediately rather than being padded or truncated.

use candle_core::{bail, DType, Device, Error, Result};

/// A hyperparameter that is either shared across the stack or given per layer.
#[derive(Debug, Clone, PartialEq)]
pub enum PerLayer {
    /// One value broadcast to every layer.
    Shared(f64),
    /// One value per layer, in application order. Must have exactly `depth`
    /// entries.
    Each(Vec<f64>),
}

impl PerLayer {
    /// Expands to a `depth`-length vector, failing fast on length mismatch.
    pub fn resolve(&self, name: &str, depth: usize) -> Result<Vec<f64>> {
        match self {
            PerLayer::Shared(value) => Ok(vec![*value; depth]),
            PerLayer::Each(values) if values.len() == depth => Ok(values.clone()),
            PerLayer::Each(values) => Err(Error::Msg(format!(
                "{name}: expected {depth} per-layer values, got {}",
                values.len()
            ))),
        }
    }
}

impl From<f64> for PerLayer {
    fn from(value: f64) -> Self {
        PerLayer::Shared(value)
    }
}

impl From<Vec<f64>> for PerLayer {
    fn from(values: Vec<f64>) -> Self {
        PerLayer::Each(values)
    }
}

/// Resolved hyperparameters for a single residual-wrapped layer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LayerHyperparams {
    pub alpha_init: f64,
    pub alpha_scale: f64,
    pub s_hidden_init: f64,
    pub s_hidden_scale: f64,
    pub s_gate_init: f64,
    pub s_gate_scale: f64,
}

/// High-level configuration for assembling the feedforward stack.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Model width carried through the residual layers.
    pub dim: usize,
    /// Number of residual-wrapped feedforward layers.
    pub depth: usize,
    /// Optional incoming width; creates an input projection when set.
    pub dim_in: Option<usize>,
    /// Optional outgoing width; creates an output projection when set.
    pub dim_out: Option<usize>,
    /// Expansion ratio of every feedforward layer.
    pub ff_expand_factor: f64,
    /// Concatenate a constant feature before normalising the input, so the
    /// input's original magnitude survives the projection onto the sphere.
    pub input_preserve_magnitude: bool,
    /// The constant concatenated when preserving magnitude.
    pub constant_shift: f64,
    /// Selects manual weight renormalisation for the whole stack; the caller
    /// must then invoke `renorm_weights` after every optimizer step.
    pub manual_norm_weights: bool,
    /// Residual step init shared by every layer. Defaults to `1 / depth` so
    /// the total residual contribution stays roughly constant with depth.
    pub alpha_init: Option<f64>,
    /// Per-layer residual step init; overrides `alpha_init` where given.
    pub alpha_ff_init: Option<PerLayer>,
    /// Per-layer residual step learning-rate decoupling. Defaults per layer
    /// to `dim^-0.5`.
    pub alpha_ff_scale: Option<PerLayer>,
    /// Hidden branch scale init per layer.
    pub s_ff_hidden_init: PerLayer,
    /// Hidden branch scale decoupling per layer.
    pub s_ff_hidden_scale: PerLayer,
    /// Gate branch scale init per layer.
    pub s_ff_gate_init: PerLayer,
    /// Gate branch scale decoupling per layer.
    pub s_ff_gate_scale: PerLayer,
    /// Storage dtype for every parameter.
    pub dtype: DType,
    /// Device hosting the parameters.
    pub device: Device,
}

impl StackConfig {
    /// Creates a configuration with the standard defaults.
    pub fn new(dim: usize, depth: usize) -> Self {
        Self {
            dim,
            depth,
            dim_in: None,
            dim_out: None,
            ff_expand_factor: 4.0,
            input_preserve_magnitude: false,
            constant_shift: 3.0,
            manual_norm_weights: false,
            alpha_init: None,
            alpha_ff_init: None,
            alpha_ff_scale: None,
            s_ff_hidden_init: PerLayer::Shared(1.0),
            s_ff_hidden_scale: PerLayer::Shared(1.0),
            s_ff_gate_init: PerLayer::Shared(1.0),
            s_ff_gate_scale: PerLayer::Shared(1.0),
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    /// Validates structural invariants, including every per-layer sequence
    /// length.
    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            bail!("stack requires dim > 0");
        }
        if self.depth == 0 {
            bail!("stack requires depth > 0");
        }
        if self.ff_expand_factor <= 0.0 {
            bail!("ff_expand_factor must be positive");
        }
        if self.dim_in == Some(0) {
            bail!("dim_in must be non-zero when set");
        }
        if self.dim_out == Some(0) {
            bail!("dim_out must be non-zero when set");
        }
        self.layer_hyperparams().map(|_| ())
    }

    /// Fans the scalar-or-sequence hyperparameters out to one bundle per
    /// layer, applying the documented defaults.
    pub(crate) fn layer_hyperparams(&self) -> Result<Vec<LayerHyperparams>> {
        let depth = self.depth;
        let alpha_default = self.alpha_init.unwrap_or(1.0 / depth as f64);
        let step_scale_default = (self.dim as f64).powf(-0.5);

        let alpha_init = match &self.alpha_ff_init {
            Some(per_layer) => per_layer.resolve("alpha_ff_init", depth)?,
            None => vec![alpha_default; depth],
        };
        let alpha_scale = match &self.alpha_ff_scale {
            Some(per_layer) => per_layer.resolve("alpha_ff_scale", depth)?,
            None => vec![step_scale_default; depth],
        };
        let s_hidden_init = self.s_ff_hidden_init.resolve("s_ff_hidden_init", depth)?;
        let s_hidden_scale = self.s_ff_hidden_scale.resolve("s_ff_hidden_scale", depth)?;
        let s_gate_init = self.s_ff_gate_init.resolve("s_ff_gate_init", depth)?;
        let s_gate_scale = self.s_ff_gate_scale.resolve("s_ff_gate_scale", depth)?;

        Ok((0..depth)
            .map(|layer| LayerHyperparams {
                alpha_init: alpha_init[layer],
                alpha_scale: alpha_scale[layer],
                s_hidden_init: s_hidden_init[layer],
                s_hidden_scale: s_hidden_scale[layer],
                s_gate_init: s_gate_init[layer],
                s_gate_scale: s_gate_scale[layer],
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_and_explicit_sequence_resolve_identically() -> Result<()> {
        let mut shared = StackConfig::new(64, 4);
        shared.s_ff_hidden_init = 0.5.into();

        let mut explicit = StackConfig::new(64, 4);
        explicit.s_ff_hidden_init = vec![0.5; 4].into();

        let lhs = shared.layer_hyperparams()?;
        let rhs = explicit.layer_hyperparams()?;
        for (a, b) in lhs.iter().zip(rhs.iter()) {
            assert_eq!(a.s_hidden_init, b.s_hidden_init);
            assert_eq!(a.alpha_init, b.alpha_init);
            assert_eq!(a.alpha_scale, b.alpha_scale);
        }
        Ok(())
    }

    #[test]
    fn wrong_sequence_length_fails_validation() {
        let mut config = StackConfig::new(64, 4);
        config.s_ff_gate_scale = vec![1.0, 1.0, 1.0].into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("s_ff_gate_scale"));

        let mut config = StackConfig::new(64, 4);
        config.alpha_ff_init = Some(vec![0.1; 5].into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn alpha_defaults_follow_depth_and_dim() -> Result<()> {
        let config = StackConfig::new(16, 8);
        let hyper = config.layer_hyperparams()?;
        assert_eq!(hyper.len(), 8);
        for layer in &hyper {
            assert!((layer.alpha_init - 0.125).abs() < 1e-12);
            assert!((layer.alpha_scale - 0.25).abs() < 1e-12);
        }
        Ok(())
    }

    #[test]
    fn per_layer_alpha_overrides_the_shared_default() -> Result<()> {
        let mut config = StackConfig::new(16, 3);
        config.alpha_init = Some(0.9);
        config.alpha_ff_init = Some(vec![0.1, 0.2, 0.3].into());
        let hyper = config.layer_hyperparams()?;
        let inits: Vec<f64> = hyper.iter().map(|h| h.alpha_init).collect();
        assert_eq!(inits, vec![0.1, 0.2, 0.3]);
        Ok(())
    }

    #[test]
    fn degenerate_shapes_fail_validation() {
        assert!(StackConfig::new(0, 2).validate().is_err());
        assert!(StackConfig::new(8, 0).validate().is_err());

        let mut config = StackConfig::new(8, 2);
        config.dim_out = Some(0);
        assert!(config.validate().is_err());

        let mut config = StackConfig::new(8, 2);
        config.ff_expand_factor = 0.0;
        assert!(config.validate().is_err());
    }
}
