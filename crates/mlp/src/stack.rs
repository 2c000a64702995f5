//! The normalization-constrained feedforward stack.
//!
//! `depth` gated feedforward layers, each wrapped in a spherical residual,
//! with optional projections at both boundaries. The running activation is
//! kept on the unit hypersphere from the first normalization until the
//! output projection; the output projection itself is deliberately not
//! renormalized, because magnitude is informative at the block boundary.

use std::fmt;

use candle_core::{bail, Result, Tensor, Var, D};

use layers::{
    dtypes::PrecisionPolicy,
    linear::{NormLinear, NormLinearConfig, WeightMode},
    mlp::{FeedForward, FeedForwardConfig},
    norm::unit_normalize,
    residual::Residual,
    scale::Scale,
};

use crate::config::StackConfig;

/// Boundary projection with its learned scale.
struct Projection {
    linear: NormLinear,
    scale: Scale,
}

/// Stack of residual-wrapped, norm-constrained feedforward layers.
pub struct FeedForwardStack {
    config: StackConfig,
    policy: PrecisionPolicy,
    layers: Vec<Residual>,
    input_proj: Option<Projection>,
    output_proj: Option<Projection>,
}

impl fmt::Debug for FeedForwardStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedForwardStack")
            .field("dim", &self.config.dim)
            .field("depth", &self.config.depth)
            .field("dim_in", &self.config.dim_in)
            .field("dim_out", &self.config.dim_out)
            .finish()
    }
}

impl FeedForwardStack {
    /// Builds the stack and every contained layer according to `config`.
    pub fn new(config: StackConfig) -> Result<Self> {
        config.validate()?;
        let policy = PrecisionPolicy::from_parameter_dtype(config.dtype);
        let mode = WeightMode::from_manual_flag(config.manual_norm_weights);
        let device = &config.device;
        let dtype = config.dtype;

        let mut layers = Vec::with_capacity(config.depth);
        for hyper in config.layer_hyperparams()? {
            let mut ff_config = FeedForwardConfig::new(config.dim);
            ff_config.expand_factor = config.ff_expand_factor;
            ff_config.manual_norm_weights = config.manual_norm_weights;
            ff_config.s_hidden_init = hyper.s_hidden_init;
            ff_config.s_hidden_scale = hyper.s_hidden_scale;
            ff_config.s_gate_init = hyper.s_gate_init;
            ff_config.s_gate_scale = hyper.s_gate_scale;

            let feedforward = FeedForward::new(ff_config, device, dtype)?;
            layers.push(Residual::new(
                Box::new(feedforward),
                config.dim,
                hyper.alpha_init,
                Some(hyper.alpha_scale),
                device,
                dtype,
            )?);
        }

        let input_proj = if config.dim_in.is_some() || config.input_preserve_magnitude {
            let dim_in = config.dim_in.unwrap_or(config.dim)
                + usize::from(config.input_preserve_magnitude);
            let mut proj_config = NormLinearConfig::new(dim_in, config.dim);
            proj_config.norm_input_axis = false;
            proj_config.mode = mode;
            Some(Projection {
                linear: NormLinear::new(proj_config, device, dtype)?,
                scale: Scale::unit(config.dim, device, dtype)?,
            })
        } else {
            None
        };

        let output_proj = match config.dim_out {
            Some(dim_out) => {
                let mut proj_config = NormLinearConfig::new(config.dim, dim_out);
                proj_config.mode = mode;
                Some(Projection {
                    linear: NormLinear::new(proj_config, device, dtype)?,
                    scale: Scale::new(
                        dim_out,
                        1.0,
                        (config.dim as f64).powf(-0.5),
                        device,
                        dtype,
                    )?,
                })
            }
            None => None,
        };

        Ok(Self {
            config,
            policy,
            layers,
            input_proj,
            output_proj,
        })
    }

    /// Returns the stack configuration.
    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Runs the stack over a `[..., dim_in_or_dim]` tensor, producing
    /// `[..., dim_out_or_dim]`.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let mut hidden = hidden.clone();

        if self.config.input_preserve_magnitude {
            hidden = append_constant(&hidden, self.config.constant_shift)?;
            hidden = unit_normalize(&hidden, &self.policy)?;
        }

        if let Some(proj) = &self.input_proj {
            let projected = proj.linear.forward(&hidden, &self.policy)?;
            let scaled = projected.broadcast_mul(&proj.scale.forward()?)?;
            hidden = unit_normalize(&scaled, &self.policy)?;
        }

        for layer in &self.layers {
            hidden = layer.forward(&hidden, &self.policy)?.into_primary();
        }

        if let Some(proj) = &self.output_proj {
            let projected = proj.linear.forward(&hidden, &self.policy)?;
            hidden = projected.broadcast_mul(&proj.scale.forward()?)?;
        }

        Ok(hidden)
    }

    /// Renormalizes every constrained weight in the stack.
    ///
    /// Required after each optimizer step when the stack was built with
    /// `manual_norm_weights`; in structural mode it only re-bases the raw
    /// parameters and leaves the forward behaviour untouched.
    pub fn renorm_weights(&self) -> Result<()> {
        if let Some(proj) = &self.input_proj {
            proj.linear.renorm_weights()?;
        }
        for layer in &self.layers {
            layer.renorm_weights()?;
        }
        if let Some(proj) = &self.output_proj {
            proj.linear.renorm_weights()?;
        }
        Ok(())
    }

    /// Flat list of every trainable parameter, scoped by position, in
    /// forward order.
    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut params = Vec::new();
        if let Some(proj) = &self.input_proj {
            params.extend(proj.linear.named_parameters("proj_in"));
            params.extend(proj.scale.named_parameters("proj_in_scale"));
        }
        for (index, layer) in self.layers.iter().enumerate() {
            params.extend(layer.named_parameters(&format!("layers.{index}")));
        }
        if let Some(proj) = &self.output_proj {
            params.extend(proj.linear.named_parameters("proj_out"));
            params.extend(proj.scale.named_parameters("proj_out_scale"));
        }
        params
    }
}

/// Concatenates a constant feature so the input's magnitude survives the
/// projection onto the unit sphere: the constant's relative weight after
/// normalization decreases as the true input grows.
fn append_constant(hidden: &Tensor, value: f64) -> Result<Tensor> {
    let mut dims = hidden.dims().to_vec();
    match dims.last_mut() {
        Some(last) => *last = 1,
        None => bail!("magnitude-preserving shift expects at least one dimension"),
    }
    let shift = Tensor::full(value as f32, dims, hidden.device())?.to_dtype(hidden.dtype())?;
    Tensor::cat(&[hidden, &shift], D::Minus1)
}
