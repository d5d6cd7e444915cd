//! Affine layer with learnable weight and bias.

use crate::error::{DiffusionLmError, Result};
use crate::ops::affine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use std::io::{Read, Write};

/// y = x @ weight.T + bias
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    /// Row-major `[out_features, in_features]`
    weight: Vec<f32>,
    /// `[out_features]`
    bias: Vec<f32>,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    /// Random init: weight and bias uniform in `[-1/sqrt(in), 1/sqrt(in))`.
    pub fn new<R: Rng>(in_features: usize, out_features: usize, rng: &mut R) -> Result<Self> {
        let numel = weight_len(in_features, out_features)?;
        let bound = if in_features > 0 {
            1.0 / (in_features as f32).sqrt()
        } else {
            0.0
        };
        let mut uniform = || (rng.random::<f32>() * 2.0 - 1.0) * bound;
        let weight = (0..numel).map(|_| uniform()).collect();
        let bias = (0..out_features).map(|_| uniform()).collect();
        Ok(Linear {
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    pub fn from_parts(
        weight: Vec<f32>,
        bias: Vec<f32>,
        in_features: usize,
        out_features: usize,
    ) -> Result<Self> {
        let numel = weight_len(in_features, out_features)?;
        if weight.len() != numel {
            return Err(DiffusionLmError::Shape(format!(
                "weight for {in_features}->{out_features} needs {numel} values, got {}",
                weight.len()
            )));
        }
        if bias.len() != out_features {
            return Err(DiffusionLmError::Shape(format!(
                "bias for {out_features} outputs has {} values",
                bias.len()
            )));
        }
        Ok(Linear {
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    /// Read weight then bias as little-endian f32.
    pub fn load<R: Read>(reader: &mut R, in_features: usize, out_features: usize) -> Result<Self> {
        let weight = read_f32_vec(reader, weight_len(in_features, out_features)?)?;
        let bias = read_f32_vec(reader, out_features)?;
        Linear::from_parts(weight, bias, in_features, out_features)
    }

    /// Write weight then bias as little-endian f32.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        for v in self.weight.iter().chain(self.bias.iter()) {
            writer.write_f32::<LittleEndian>(*v)?;
        }
        Ok(())
    }

    /// Project one row of `in_features` into `xout` of `out_features`.
    pub fn forward_into(&self, xout: &mut [f32], x: &[f32]) -> Result<()> {
        if x.len() != self.in_features || xout.len() != self.out_features {
            return Err(DiffusionLmError::Shape(format!(
                "linear {}->{} got row {} into {}",
                self.in_features,
                self.out_features,
                x.len(),
                xout.len()
            )));
        }
        self.project(xout, x);
        Ok(())
    }

    /// Unchecked row projection for callers that already validated widths.
    #[inline]
    pub(crate) fn project(&self, xout: &mut [f32], x: &[f32]) {
        affine(xout, x, &self.weight, &self.bias);
    }

    #[inline]
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    #[inline]
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weight(&self) -> &[f32] {
        &self.weight
    }

    pub fn bias(&self) -> &[f32] {
        &self.bias
    }

    pub fn num_parameters(&self) -> usize {
        self.weight.len() + self.bias.len()
    }
}

/// Upper bound on the up-front allocation when reading; the rest grows as data arrives.
const READ_RESERVE: usize = 1 << 20;

/// Element count of an `[out, in]` weight.
fn weight_len(in_features: usize, out_features: usize) -> Result<usize> {
    in_features.checked_mul(out_features).ok_or_else(|| {
        DiffusionLmError::Shape(format!("weight {in_features}x{out_features} overflows usize"))
    })
}

/// Read a vector of f32 values from the reader.
fn read_f32_vec<R: Read>(reader: &mut R, count: usize) -> Result<Vec<f32>> {
    let mut buf = Vec::with_capacity(count.min(READ_RESERVE));
    for _ in 0..count {
        buf.push(reader.read_f32::<LittleEndian>()?);
    }
    Ok(buf)
}
