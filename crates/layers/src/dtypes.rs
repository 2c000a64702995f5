//! Precision and dtype policy utilities shared by the layer primitives.
//!
//! Parameters may be stored in `f16`/`bf16` while matmuls and norm statistics
//! promote to `f32`. The unit-norm constraint is sensitive to where the
//! normalisation denominator is computed, so every layer threads a
//! [`PrecisionPolicy`] through its forward pass and promotes to the reduction
//! dtype before taking norms, casting back to the storage dtype afterwards.

use candle_core::{DType, Result, Tensor};

/// Describes how tensors should be cast during different phases of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Constructs a new policy from explicit dtype selections.
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Builds a policy from the parameter storage dtype.
    ///
    /// Reduced-precision parameters promote to `f32` for matmuls; norm
    /// statistics always reduce in at least `f32`.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        Self::new(storage, compute, DType::F32)
    }

    /// Returns the dtype used to store parameters and outputs.
    pub fn storage(&self) -> DType {
        self.storage
    }

    /// Returns the dtype used for matmuls and activation evaluation.
    pub fn compute(&self) -> DType {
        self.compute
    }

    /// Returns the dtype used for norm statistics.
    pub fn reduction(&self) -> DType {
        self.reduction
    }

    /// Casts a tensor to the compute dtype for matmul readiness.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor to the reduction dtype before norm statistics.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    /// Casts a tensor back to the storage dtype (or leaves it unchanged).
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }

    /// Comparison tolerance appropriate for values round-tripped through the
    /// storage dtype. Used when asserting the unit-norm invariants.
    pub fn tolerance(&self) -> f32 {
        match self.storage {
            DType::BF16 => 2e-2,
            DType::F16 => 5e-3,
            DType::F64 => 1e-7,
            _ => 1e-5,
        }
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}
