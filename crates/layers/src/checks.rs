//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape and dtype assertions that can be
//! wired into constructors or forward paths. They return
//! `candle_core::Result<()>` so call sites can propagate errors without
//! panicking, and every message names the offending tensor.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor has the expected number of dimensions.
pub fn expect_rank(name: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    let actual = tensor.rank();
    if actual == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected rank {rank}, got rank {actual} with shape {:?}",
            tensor.dims()
        )))
    }
}

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected shape {expected:?}, got {actual:?}"
        )))
    }
}

/// Validates the trailing feature axis of a `[..., dim]` tensor.
///
/// Leading batch dimensions are unconstrained; only the feature axis is
/// checked, so ranks from 1 upwards are accepted.
pub fn expect_trailing_dim(name: &str, tensor: &Tensor, dim: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(actual) if *actual == dim => Ok(()),
        Some(actual) => Err(Error::Msg(format!(
            "{name}: expected trailing dim {dim}, got {actual} with shape {:?}",
            tensor.dims()
        ))),
        None => Err(Error::Msg(format!(
            "{name}: expected a tensor with at least one dimension, got a scalar"
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(name: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.iter().any(|candidate| *candidate == dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn trailing_dim_accepts_any_leading_layout() -> Result<()> {
        let device = Device::Cpu;
        let vector = Tensor::zeros(8, DType::F32, &device)?;
        let batched = Tensor::zeros((3, 8), DType::F32, &device)?;
        let nested = Tensor::zeros((7, 3, 8), DType::F32, &device)?;

        expect_trailing_dim("t", &vector, 8)?;
        expect_trailing_dim("t", &batched, 8)?;
        expect_trailing_dim("t", &nested, 8)?;
        assert!(expect_trailing_dim("t", &nested, 4).is_err());
        Ok(())
    }

    #[test]
    fn scalar_inputs_are_rejected() -> Result<()> {
        let device = Device::Cpu;
        let scalar = Tensor::zeros((), DType::F32, &device)?;
        assert!(expect_trailing_dim("t", &scalar, 1).is_err());
        assert!(expect_rank("t", &scalar, 1).is_err());
        Ok(())
    }

    #[test]
    fn dtype_check_names_the_tensor() -> Result<()> {
        let device = Device::Cpu;
        let ids = Tensor::zeros(4, DType::U32, &device)?;
        let err = expect_dtype_in("embedding.ids", &ids, &[DType::F32]).unwrap_err();
        assert!(err.to_string().contains("embedding.ids"));
        Ok(())
    }
}
