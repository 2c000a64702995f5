//! Unit-norm projection onto the hypersphere.
//!
//! Everything in this crate lives on (or is pulled back to) the unit sphere:
//! weight matrices row- or column-wise, activations along the trailing
//! feature axis. The projection here is stateless; there are no learned
//! affine parameters. The denominator is clamped from below so a zero vector
//! normalises to zero instead of dividing by zero, matching standard
//! normalize semantics.

use candle_core::{shape::Dim, Result, Tensor, D};

use crate::dtypes::PrecisionPolicy;

/// Floor applied to the L2 norm before division.
pub const NORM_EPS: f64 = 1e-12;

/// Projects every vector along `axis` onto the unit sphere.
///
/// Pure function of its input; gradients flow through the normalisation, so
/// this is also the structural weight-constraint operator.
pub fn l2norm<A: Dim>(tensor: &Tensor, axis: A) -> Result<Tensor> {
    let norm = tensor.sqr()?.sum_keepdim(axis)?.sqrt()?;
    tensor.broadcast_div(&norm.maximum(NORM_EPS)?)
}

/// Unit-normalises activations along the trailing feature axis.
///
/// Promotes to the reduction dtype before taking the norm and casts the
/// result back to the storage dtype, so reduced-precision activations do not
/// accumulate norm error.
pub fn unit_normalize(tensor: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
    let promoted = policy.cast_for_reduction(tensor)?;
    let normed = l2norm(&promoted, D::Minus1)?;
    policy.cast_to_storage(&normed)
}
