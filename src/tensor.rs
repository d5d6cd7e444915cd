//! Owned activation buffers with a shape.

use crate::error::{DiffusionLmError, Result};
use rand::Rng;

/// Row-major `f32` tensor. The last dimension is the feature axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Vec<usize>,
}

impl Tensor {
    /// Wrap `data` with `shape`; the element counts must agree.
    pub fn new(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let numel = numel(shape)?;
        if numel != data.len() {
            return Err(DiffusionLmError::Shape(format!(
                "shape {:?} holds {} elements, got {}",
                shape,
                numel,
                data.len()
            )));
        }
        Ok(Tensor {
            data,
            shape: shape.to_vec(),
        })
    }

    pub fn zeros(shape: &[usize]) -> Result<Self> {
        Ok(Tensor {
            data: vec![0.0; numel(shape)?],
            shape: shape.to_vec(),
        })
    }

    /// Standard-uniform samples in `[-1, 1)`.
    pub fn random<R: Rng>(shape: &[usize], rng: &mut R) -> Result<Self> {
        let data = (0..numel(shape)?)
            .map(|_| rng.random::<f32>() * 2.0 - 1.0)
            .collect();
        Ok(Tensor {
            data,
            shape: shape.to_vec(),
        })
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Size of the feature axis, `None` for a scalar.
    #[inline]
    pub fn last_dim(&self) -> Option<usize> {
        self.shape.last().copied()
    }

    /// Shape with the last dimension replaced.
    pub(crate) fn with_last_dim(&self, dim: usize) -> Vec<usize> {
        let mut shape = self.shape.clone();
        if let Some(last) = shape.last_mut() {
            *last = dim;
        }
        shape
    }
}

/// Element count of `shape`, or a shape error if it overflows.
pub(crate) fn numel(shape: &[usize]) -> Result<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| DiffusionLmError::Shape(format!("shape {shape:?} overflows usize")))
}
