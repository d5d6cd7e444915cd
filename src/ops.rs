//! Core numeric kernels over flat `f32` slices.

/// Affine projection: xout = x @ w.T + b (w is row-major `[out, in]`).
#[inline]
pub(crate) fn affine(xout: &mut [f32], x: &[f32], w: &[f32], b: &[f32]) {
    let in_dim = x.len();
    for (i, out) in xout.iter_mut().enumerate() {
        let row = &w[i * in_dim..(i + 1) * in_dim];
        let mut val = b[i];
        for (wj, xj) in row.iter().zip(x.iter()) {
            val += wj * xj;
        }
        *out = val;
    }
}

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// SiLU activation: x * sigmoid(x).
#[inline]
pub fn silu(x: f32) -> f32 {
    x * sigmoid(x)
}

/// Gated product in-place: value = silu(gate) * value.
#[inline]
pub fn swiglu(value: &mut [f32], gate: &[f32]) {
    for (v, g) in value.iter_mut().zip(gate.iter()) {
        *v *= silu(*g);
    }
}
