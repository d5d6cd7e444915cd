//! Gated feed-forward block (SwiGLU).
//!
//! ```text
//! x ──up_proj──▶ [value | gate] ──silu(gate) * value──▶ down_proj ──▶ y
//!    in → 2·out                        out                 out → out
//! ```

use crate::config::Config;
use crate::error::{DiffusionLmError, Result};
use crate::linear::Linear;
use crate::ops::swiglu;
use crate::tensor::{Tensor, numel};
use rand::Rng;
use rayon::prelude::*;
use std::io::{Read, Write};

#[derive(Debug, Clone, PartialEq)]
pub struct GatedFeedForward {
    /// in_features -> 2 * out_features
    up_proj: Linear,
    /// out_features -> out_features
    down_proj: Linear,
}

impl GatedFeedForward {
    /// Randomly initialised block. Both widths must be non-zero.
    pub fn new<R: Rng>(in_features: usize, out_features: usize, rng: &mut R) -> Result<Self> {
        let up_width = up_width(in_features, out_features)?;
        Ok(GatedFeedForward {
            up_proj: Linear::new(in_features, up_width, rng)?,
            down_proj: Linear::new(out_features, out_features, rng)?,
        })
    }

    /// Block sized for one layer of `config`: `n_embed -> intermediate_size`.
    pub fn from_config<R: Rng>(config: &Config, rng: &mut R) -> Result<Self> {
        Self::new(config.n_embed(), config.intermediate_size(), rng)
    }

    /// Assemble from existing projections, checking that they chain.
    pub fn from_linears(up_proj: Linear, down_proj: Linear) -> Result<Self> {
        let out_features = down_proj.in_features();
        if up_proj.out_features() != up_width(up_proj.in_features(), out_features)? {
            return Err(DiffusionLmError::Shape(format!(
                "up_proj width {} must be twice down_proj input {}",
                up_proj.out_features(),
                out_features
            )));
        }
        if down_proj.out_features() != out_features {
            return Err(DiffusionLmError::Shape(format!(
                "down_proj must be square, got {}->{}",
                out_features,
                down_proj.out_features()
            )));
        }
        Ok(GatedFeedForward { up_proj, down_proj })
    }

    /// Load parameters in order: up_proj weight, up_proj bias, down_proj weight, down_proj bias.
    pub fn load<R: Read>(reader: &mut R, in_features: usize, out_features: usize) -> Result<Self> {
        let up_width = up_width(in_features, out_features)?;
        let up_proj = Linear::load(reader, in_features, up_width)?;
        let down_proj = Linear::load(reader, out_features, out_features)?;
        Ok(GatedFeedForward { up_proj, down_proj })
    }

    /// Write parameters in the order [`GatedFeedForward::load`] reads them.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.up_proj.write_to(writer)?;
        self.down_proj.write_to(writer)
    }

    #[inline]
    pub fn in_features(&self) -> usize {
        self.up_proj.in_features()
    }

    #[inline]
    pub fn out_features(&self) -> usize {
        self.down_proj.out_features()
    }

    pub fn up_proj(&self) -> &Linear {
        &self.up_proj
    }

    pub fn down_proj(&self) -> &Linear {
        &self.down_proj
    }

    pub fn num_parameters(&self) -> usize {
        self.up_proj.num_parameters() + self.down_proj.num_parameters()
    }

    /// Map `[..., in_features]` to `[..., out_features]`. Rows run in parallel.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let in_features = self.in_features();
        let out_features = self.out_features();
        match x.last_dim() {
            Some(dim) if dim == in_features => {}
            _ => {
                return Err(DiffusionLmError::Shape(format!(
                    "expected [..., {}], got {:?}",
                    in_features,
                    x.shape()
                )));
            }
        }

        let shape = x.with_last_dim(out_features);
        let mut out = vec![0.0f32; numel(&shape)?];
        out.par_chunks_mut(out_features)
            .zip(x.data().par_chunks(in_features))
            .for_each(|(y, row)| self.row(y, row));

        Tensor::new(out, &shape)
    }

    /// Forward a single `in_features` row.
    pub fn forward_row(&self, x: &[f32]) -> Result<Vec<f32>> {
        if x.len() != self.in_features() {
            return Err(DiffusionLmError::Shape(format!(
                "expected row of {}, got {}",
                self.in_features(),
                x.len()
            )));
        }
        let mut y = vec![0.0f32; self.out_features()];
        self.row(&mut y, x);
        Ok(y)
    }

    /// Widths are fixed at construction, so rows skip the per-layer checks.
    fn row(&self, y: &mut [f32], x: &[f32]) {
        let hidden = self.out_features();

        let mut up = vec![0.0f32; self.up_proj.out_features()];
        self.up_proj.project(&mut up, x);

        // First half is the value, second half the gate.
        let (value, gate) = up.split_at_mut(hidden);
        swiglu(value, gate);

        self.down_proj.project(y, value);
    }
}

/// Width of up_proj (`2 * out_features`); both widths must be non-zero.
fn up_width(in_features: usize, out_features: usize) -> Result<usize> {
    if in_features == 0 || out_features == 0 {
        return Err(DiffusionLmError::Shape(format!(
            "feature widths must be non-zero, got {in_features}->{out_features}"
        )));
    }
    out_features.checked_mul(2).ok_or_else(|| {
        DiffusionLmError::Shape(format!("up_proj width 2 * {out_features} overflows usize"))
    })
}
