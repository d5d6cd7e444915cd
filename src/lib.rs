//! Diffusion language model building blocks in Rust
//!
//! Hyperparameter resolution for the model and its gated (SwiGLU)
//! feed-forward block, computed over flat `f32` buffers.

pub mod config;
pub mod error;
pub mod feed_forward;
pub mod linear;
pub mod ops;
pub mod tensor;

pub use config::{AttentionKind, Config, MlpClass, NormClass, RawConfig};
pub use error::{DiffusionLmError, Result};
pub use feed_forward::GatedFeedForward;
pub use linear::Linear;
pub use tensor::Tensor;
