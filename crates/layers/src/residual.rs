//! Spherical residual connections with a learned interpolation step.
//!
//! Instead of adding the branch output back onto the running activation, the
//! residual update here interpolates towards the normalised branch output and
//! re-projects onto the unit sphere, so the carried activation never leaves
//! the hypersphere. The per-channel step size is a learned [`Scale`], which
//! is how depth scaling (`alpha`) enters the stack.

use std::fmt;

use candle_core::{DType, Device, Result, Tensor, Var};

use crate::{
    checks,
    dtypes::PrecisionPolicy,
    norm::unit_normalize,
    scale::Scale,
};

/// Output of a wrapped branch transform.
///
/// Branches either produce a plain activation or an activation bundled with
/// auxiliary state (attention caches and the like). The residual update only
/// touches the primary tensor; auxiliary state passes through untouched.
#[derive(Debug, Clone)]
pub enum BranchOutput {
    /// A bare activation tensor.
    Primary(Tensor),
    /// An activation plus auxiliary state forwarded unchanged.
    WithState(Tensor, Vec<Tensor>),
}

impl BranchOutput {
    /// Borrows the primary activation.
    pub fn primary(&self) -> &Tensor {
        match self {
            BranchOutput::Primary(tensor) => tensor,
            BranchOutput::WithState(tensor, _) => tensor,
        }
    }

    /// Consumes the output, returning the primary activation and dropping
    /// any auxiliary state.
    pub fn into_primary(self) -> Tensor {
        match self {
            BranchOutput::Primary(tensor) => tensor,
            BranchOutput::WithState(tensor, _) => tensor,
        }
    }

    fn split(self) -> (Tensor, Option<Vec<Tensor>>) {
        match self {
            BranchOutput::Primary(tensor) => (tensor, None),
            BranchOutput::WithState(tensor, state) => (tensor, Some(state)),
        }
    }

    fn rejoin(primary: Tensor, state: Option<Vec<Tensor>>) -> Self {
        match state {
            None => BranchOutput::Primary(primary),
            Some(state) => BranchOutput::WithState(primary, state),
        }
    }
}

/// Transform that can sit inside a [`Residual`] wrapper.
///
/// Implementations own their parameters and expose them for optimizer
/// registration, along with the recursive weight renormalisation hook.
pub trait BranchLayer: Send + Sync {
    /// Applies the transform to the running activation.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<BranchOutput>;

    /// Trainable parameters with scoped names.
    fn named_parameters(&self, scope: &str) -> Vec<(String, Var)>;

    /// Renormalises any constrained weights owned by the transform.
    fn renorm_weights(&self) -> Result<()>;
}

/// Residual wrapper performing a slerp-like update on the unit sphere.
pub struct Residual {
    inner: Box<dyn BranchLayer>,
    step: Scale,
    dim: usize,
}

impl fmt::Debug for Residual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Residual")
            .field("dim", &self.dim)
            .field("step", &self.step)
            .finish()
    }
}

impl Residual {
    /// Wraps `inner`, interpolating with a learned `[dim]` step initialised
    /// to `init`. `scale` defaults to `dim^-0.5`, the standard decoupling for
    /// residual steps.
    pub fn new(
        inner: Box<dyn BranchLayer>,
        dim: usize,
        init: f64,
        scale: Option<f64>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let scale = scale.unwrap_or_else(|| (dim as f64).powf(-0.5));
        Ok(Self {
            inner,
            step: Scale::new(dim, init, scale, device, dtype)?,
            dim,
        })
    }

    /// Applies the wrapped transform and fuses its output back into `hidden`.
    ///
    /// The branch output is normalised, interpolated against the carried
    /// activation with the learned per-channel step, and the blend is
    /// normalised again, so the result is always unit-norm along the feature
    /// axis whatever the branch produced.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<BranchOutput> {
        checks::expect_trailing_dim("residual.input", hidden, self.dim)?;

        let (branch, state) = self.inner.forward(hidden, policy)?.split();
        let branch = unit_normalize(&branch, policy)?;

        let residual = policy.cast_for_matmul(hidden)?;
        let branch = policy.cast_for_matmul(&branch)?;
        let step = policy.cast_for_matmul(&self.step.forward()?)?;

        // lerp(residual, branch, step) with a per-channel step.
        let delta = branch.sub(&residual)?;
        let blended = residual.add(&delta.broadcast_mul(&step)?)?;
        let fused = unit_normalize(&policy.cast_to_storage(&blended)?, policy)?;

        Ok(BranchOutput::rejoin(fused, state))
    }

    /// Trainable parameters of the step scale and the wrapped transform.
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.step.named_parameters(&format!("{scope}.step"));
        params.extend(self.inner.named_parameters(&format!("{scope}.inner")));
        params
    }

    /// Renormalises constrained weights inside the wrapped transform.
    pub fn renorm_weights(&self) -> Result<()> {
        self.inner.renorm_weights()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, D};

    /// Branch that rescales its input, for exercising the renormalisation.
    struct Amplify(f64);

    impl BranchLayer for Amplify {
        fn forward(&self, hidden: &Tensor, _policy: &PrecisionPolicy) -> Result<BranchOutput> {
            Ok(BranchOutput::Primary(hidden.affine(self.0, 0.0)?))
        }

        fn named_parameters(&self, _scope: &str) -> Vec<(String, Var)> {
            vec![]
        }

        fn renorm_weights(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Branch that carries auxiliary state alongside the activation.
    struct WithCache;

    impl BranchLayer for WithCache {
        fn forward(&self, hidden: &Tensor, _policy: &PrecisionPolicy) -> Result<BranchOutput> {
            let cache = Tensor::full(42f32, (2, 2), hidden.device())?;
            Ok(BranchOutput::WithState(hidden.clone(), vec![cache]))
        }

        fn named_parameters(&self, _scope: &str) -> Vec<(String, Var)> {
            vec![]
        }

        fn renorm_weights(&self) -> Result<()> {
            Ok(())
        }
    }

    fn feature_norms(tensor: &Tensor) -> Result<Vec<f32>> {
        tensor
            .to_dtype(DType::F32)?
            .sqr()?
            .sum_keepdim(D::Minus1)?
            .sqrt()?
            .flatten_all()?
            .to_vec1::<f32>()
    }

    #[test]
    fn output_is_unit_norm_whatever_the_branch_scale() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let input = Tensor::randn(0f32, 1.0, (3, 5, 16), &device)?;

        for gain in [1e-3, 1.0, 1e3] {
            let residual = Residual::new(
                Box::new(Amplify(gain)),
                16,
                0.25,
                None,
                &device,
                DType::F32,
            )?;
            let out = residual.forward(&input, &policy)?.into_primary();
            assert_eq!(out.dims(), input.dims());
            for norm in feature_norms(&out)? {
                assert!((norm - 1.0).abs() < 1e-5, "gain {gain} norm {norm}");
            }
        }
        Ok(())
    }

    #[test]
    fn zero_step_returns_the_normalised_input() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let residual = Residual::new(Box::new(Amplify(3.0)), 8, 0.0, None, &device, DType::F32)?;

        let input = crate::norm::unit_normalize(
            &Tensor::randn(0f32, 1.0, (4, 8), &device)?,
            &policy,
        )?;
        let out = residual.forward(&input, &policy)?;
        assert_eq!(out.primary().dims(), input.dims());
        let diff = out
            .into_primary()
            .sub(&input)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert!(diff < 1e-6, "zero step moved the activation by {diff}");
        Ok(())
    }

    #[test]
    fn full_step_reaches_the_normalised_branch() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let residual = Residual::new(
            Box::new(Amplify(7.0)),
            8,
            1.0,
            Some(1.0),
            &device,
            DType::F32,
        )?;

        let input = Tensor::randn(0f32, 1.0, (4, 8), &device)?;
        let expected = crate::norm::unit_normalize(&input, &policy)?;
        let out = residual.forward(&input, &policy)?.into_primary();
        // Amplify preserves direction, so a unit step lands exactly on the
        // normalised input direction.
        let diff = out.sub(&expected)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn auxiliary_state_passes_through_untouched() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let residual = Residual::new(Box::new(WithCache), 8, 0.5, None, &device, DType::F32)?;

        let input = Tensor::randn(0f32, 1.0, (2, 8), &device)?;
        match residual.forward(&input, &policy)? {
            BranchOutput::WithState(primary, state) => {
                for norm in feature_norms(&primary)? {
                    assert!((norm - 1.0).abs() < 1e-5);
                }
                assert_eq!(state.len(), 1);
                let values = state[0].flatten_all()?.to_vec1::<f32>()?;
                assert!(values.iter().all(|v| *v == 42.0));
            }
            BranchOutput::Primary(_) => panic!("auxiliary state was dropped"),
        }
        Ok(())
    }

    #[test]
    fn step_scale_is_registered_for_training() -> Result<()> {
        let device = Device::Cpu;
        let residual = Residual::new(Box::new(Amplify(1.0)), 4, 0.1, None, &device, DType::F32)?;
        let params = residual.named_parameters("layers.0");
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].0, "layers.0.step.scale");
        Ok(())
    }
}
