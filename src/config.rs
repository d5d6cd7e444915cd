//! Model configuration.
//!
//! Configs are built in two phases. [`RawConfig`] is the boundary type: every
//! key is typed strictly and every omitted key takes its documented default.
//! [`RawConfig::resolve`] then runs the derivation pipeline and returns an
//! immutable [`Config`].

use crate::error::{DiffusionLmError, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;

/// Feed-forward variant used by the model's blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MlpClass {
    #[default]
    #[serde(rename = "GptNeoXMLP")]
    GptNeoXMlp,
    /// Requires an explicit `intermediate_size`.
    #[serde(rename = "LLaMAMLP")]
    LlamaMlp,
}

/// Normalization layer used by the model's blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NormClass {
    #[default]
    LayerNorm,
    #[serde(rename = "RMSNorm")]
    RmsNorm,
}

/// How key/value heads are shared between query heads.
///
/// ```text
///  MHA: n_query_groups == n_head   one k/v head per query head
///  GQA: 1 < n_query_groups < n_head
///  MQA: n_query_groups == 1        one k/v head for all query heads
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionKind {
    MultiHead,
    GroupedQuery,
    MultiQuery,
}

/// Unresolved hyperparameters, as read from a config file or built in code.
///
/// Unknown keys are rejected, and values are never coerced across primitive
/// types (`32.0` is not an integer, `1` is not a bool).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawConfig {
    pub name: Option<String>,
    pub block_size: usize,
    pub vocab_size: usize,
    pub padding_multiple: usize,
    pub padded_vocab_size: Option<usize>,
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embed: usize,
    pub rotary_percentage: f64,
    pub parallel_residual: bool,
    pub bias: bool,
    pub n_query_groups: Option<usize>,
    pub shared_attention_norm: bool,
    pub norm_class: NormClass,
    pub norm_eps: f64,
    pub mlp_class: MlpClass,
    pub intermediate_size: Option<usize>,
    pub condense_ratio: usize,
}

impl Default for RawConfig {
    fn default() -> Self {
        RawConfig {
            name: None,
            block_size: 4096,
            vocab_size: 50254,
            padding_multiple: 512,
            padded_vocab_size: None,
            n_layer: 16,
            n_head: 32,
            n_embed: 4096,
            rotary_percentage: 0.25,
            parallel_residual: true,
            bias: true,
            n_query_groups: None,
            shared_attention_norm: false,
            norm_class: NormClass::LayerNorm,
            norm_eps: 1e-5,
            mlp_class: MlpClass::GptNeoXMlp,
            intermediate_size: None,
            condense_ratio: 1,
        }
    }
}

impl RawConfig {
    /// Defaults for every field, with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        RawConfig {
            name: Some(name.into()),
            ..RawConfig::default()
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_vocab_size(mut self, vocab_size: usize) -> Self {
        self.vocab_size = vocab_size;
        self
    }

    pub fn with_padding_multiple(mut self, padding_multiple: usize) -> Self {
        self.padding_multiple = padding_multiple;
        self
    }

    /// Fix the padded vocabulary size instead of deriving it.
    pub fn with_padded_vocab_size(mut self, padded_vocab_size: usize) -> Self {
        self.padded_vocab_size = Some(padded_vocab_size);
        self
    }

    pub fn with_n_layer(mut self, n_layer: usize) -> Self {
        self.n_layer = n_layer;
        self
    }

    pub fn with_n_head(mut self, n_head: usize) -> Self {
        self.n_head = n_head;
        self
    }

    pub fn with_n_embed(mut self, n_embed: usize) -> Self {
        self.n_embed = n_embed;
        self
    }

    pub fn with_rotary_percentage(mut self, rotary_percentage: f64) -> Self {
        self.rotary_percentage = rotary_percentage;
        self
    }

    pub fn with_parallel_residual(mut self, parallel_residual: bool) -> Self {
        self.parallel_residual = parallel_residual;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    /// `1` for multi-query, `n_head` for multi-head attention.
    pub fn with_n_query_groups(mut self, n_query_groups: usize) -> Self {
        self.n_query_groups = Some(n_query_groups);
        self
    }

    pub fn with_shared_attention_norm(mut self, shared_attention_norm: bool) -> Self {
        self.shared_attention_norm = shared_attention_norm;
        self
    }

    pub fn with_norm_class(mut self, norm_class: NormClass) -> Self {
        self.norm_class = norm_class;
        self
    }

    pub fn with_norm_eps(mut self, norm_eps: f64) -> Self {
        self.norm_eps = norm_eps;
        self
    }

    pub fn with_mlp_class(mut self, mlp_class: MlpClass) -> Self {
        self.mlp_class = mlp_class;
        self
    }

    pub fn with_intermediate_size(mut self, intermediate_size: usize) -> Self {
        self.intermediate_size = Some(intermediate_size);
        self
    }

    pub fn with_condense_ratio(mut self, condense_ratio: usize) -> Self {
        self.condense_ratio = condense_ratio;
        self
    }

    /// Validate and derive the dependent fields.
    ///
    /// Derivations run in a fixed order: head divisibility, padded
    /// vocabulary size, query groups, intermediate size.
    pub fn resolve(self) -> Result<Config> {
        let name = match self.name {
            Some(name) if !name.is_empty() => name,
            Some(_) => return Err(invalid("name must not be empty")),
            None => return Err(invalid("name is required")),
        };
        if self.n_head == 0 {
            return Err(invalid("n_head must be greater than 0"));
        }
        if self.n_embed % self.n_head != 0 {
            return Err(invalid(format!(
                "n_embed ({}) must be divisible by n_head ({})",
                self.n_embed, self.n_head
            )));
        }

        if self.padding_multiple == 0 {
            return Err(invalid("padding_multiple must be greater than 0"));
        }
        let padded_vocab_size = match self.padded_vocab_size {
            Some(padded) => {
                if padded % self.padding_multiple != 0 || padded < self.vocab_size {
                    warn!(
                        "{name}: padded_vocab_size {padded} is not a multiple of {} covering vocab_size {}",
                        self.padding_multiple, self.vocab_size
                    );
                }
                padded
            }
            None => {
                let padded = pad_to_multiple(self.vocab_size, self.padding_multiple)?;
                debug!("{name}: derived padded_vocab_size={padded}");
                padded
            }
        };

        let n_query_groups = match self.n_query_groups {
            Some(0) => return Err(invalid("n_query_groups must be greater than 0")),
            Some(groups) if self.n_head % groups != 0 => {
                return Err(invalid(format!(
                    "n_head ({}) must be divisible by n_query_groups ({groups})",
                    self.n_head
                )));
            }
            Some(groups) => groups,
            None => {
                debug!("{name}: n_query_groups defaults to n_head={}", self.n_head);
                self.n_head
            }
        };

        let intermediate_size = match (self.intermediate_size, self.mlp_class) {
            (Some(size), _) => size,
            (None, MlpClass::LlamaMlp) => {
                return Err(invalid("intermediate_size is required for LLaMAMLP"));
            }
            (None, MlpClass::GptNeoXMlp) => {
                let size = self
                    .n_embed
                    .checked_mul(4)
                    .ok_or_else(|| invalid("intermediate_size overflows (4 * n_embed)"))?;
                debug!("{name}: derived intermediate_size={size}");
                size
            }
        };

        Ok(Config {
            name,
            block_size: self.block_size,
            vocab_size: self.vocab_size,
            padding_multiple: self.padding_multiple,
            padded_vocab_size,
            n_layer: self.n_layer,
            n_head: self.n_head,
            n_embed: self.n_embed,
            rotary_percentage: self.rotary_percentage,
            parallel_residual: self.parallel_residual,
            bias: self.bias,
            n_query_groups,
            shared_attention_norm: self.shared_attention_norm,
            norm_class: self.norm_class,
            norm_eps: self.norm_eps,
            mlp_class: self.mlp_class,
            intermediate_size,
            condense_ratio: self.condense_ratio,
        })
    }
}

impl TryFrom<RawConfig> for Config {
    type Error = DiffusionLmError;

    fn try_from(raw: RawConfig) -> Result<Self> {
        raw.resolve()
    }
}

/// Smallest multiple of `multiple` that is >= `value`.
fn pad_to_multiple(value: usize, multiple: usize) -> Result<usize> {
    value
        .div_ceil(multiple)
        .checked_mul(multiple)
        .ok_or_else(|| invalid("padded_vocab_size overflows"))
}

fn invalid(msg: impl Into<String>) -> DiffusionLmError {
    DiffusionLmError::InvalidConfig(msg.into())
}

/// Resolved model hyperparameters. Read-only once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    name: String,
    block_size: usize,
    vocab_size: usize,
    padding_multiple: usize,
    padded_vocab_size: usize,
    n_layer: usize,
    n_head: usize,
    n_embed: usize,
    rotary_percentage: f64,
    parallel_residual: bool,
    bias: bool,
    n_query_groups: usize,
    shared_attention_norm: bool,
    norm_class: NormClass,
    norm_eps: f64,
    mlp_class: MlpClass,
    intermediate_size: usize,
    condense_ratio: usize,
}

impl Config {
    /// Resolve a config from an already-parsed JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let raw: RawConfig = serde_json::from_value(value)?;
        raw.resolve()
    }

    /// Resolve a config from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(json)?;
        raw.resolve()
    }

    /// Resolve a config from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let raw: RawConfig = serde_json::from_reader(reader)?;
        raw.resolve()
    }

    /// Pretty JSON with every derived field filled in.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum sequence length.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    #[inline]
    pub fn padding_multiple(&self) -> usize {
        self.padding_multiple
    }

    /// Vocabulary size rounded up for the embedding and output matrices.
    #[inline]
    pub fn padded_vocab_size(&self) -> usize {
        self.padded_vocab_size
    }

    #[inline]
    pub fn n_layer(&self) -> usize {
        self.n_layer
    }

    #[inline]
    pub fn n_head(&self) -> usize {
        self.n_head
    }

    #[inline]
    pub fn n_embed(&self) -> usize {
        self.n_embed
    }

    /// Fraction of each head's dimensions that receive rotary embeddings.
    #[inline]
    pub fn rotary_percentage(&self) -> f64 {
        self.rotary_percentage
    }

    #[inline]
    pub fn parallel_residual(&self) -> bool {
        self.parallel_residual
    }

    #[inline]
    pub fn bias(&self) -> bool {
        self.bias
    }

    /// Number of key/value head groups.
    #[inline]
    pub fn n_query_groups(&self) -> usize {
        self.n_query_groups
    }

    #[inline]
    pub fn shared_attention_norm(&self) -> bool {
        self.shared_attention_norm
    }

    #[inline]
    pub fn norm_class(&self) -> NormClass {
        self.norm_class
    }

    #[inline]
    pub fn norm_eps(&self) -> f64 {
        self.norm_eps
    }

    #[inline]
    pub fn mlp_class(&self) -> MlpClass {
        self.mlp_class
    }

    /// Hidden width of the feed-forward block.
    #[inline]
    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size
    }

    #[inline]
    pub fn condense_ratio(&self) -> usize {
        self.condense_ratio
    }

    /// Returns the head size.
    #[inline]
    pub fn head_size(&self) -> usize {
        self.n_embed / self.n_head
    }

    /// Returns the number of query heads sharing one key/value head.
    #[inline]
    pub fn queries_per_group(&self) -> usize {
        self.n_head / self.n_query_groups
    }

    /// Returns the key/value projection width.
    #[inline]
    pub fn kv_dim(&self) -> usize {
        self.n_query_groups * self.head_size()
    }

    /// Returns how many leading dimensions of each head are rotated.
    #[inline]
    pub fn rope_n_elem(&self) -> usize {
        (self.rotary_percentage * self.head_size() as f64) as usize
    }

    pub fn attention_kind(&self) -> AttentionKind {
        if self.n_query_groups == self.n_head {
            AttentionKind::MultiHead
        } else if self.n_query_groups == 1 {
            AttentionKind::MultiQuery
        } else {
            AttentionKind::GroupedQuery
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolve(value: serde_json::Value) -> Result<Config> {
        Config::from_value(value)
    }

    fn invalid_message(result: Result<Config>) -> String {
        match result {
            Err(DiffusionLmError::InvalidConfig(msg)) => msg,
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn defaults_resolve() {
        let config = resolve(json!({ "name": "base" })).unwrap();
        assert_eq!(config.name(), "base");
        assert_eq!(config.block_size(), 4096);
        assert_eq!(config.vocab_size(), 50254);
        assert_eq!(config.padded_vocab_size(), 50688);
        assert_eq!(config.n_layer(), 16);
        assert_eq!(config.n_query_groups(), 32);
        assert_eq!(config.intermediate_size(), 16384);
        assert_eq!(config.head_size(), 128);
        assert_eq!(config.norm_class(), NormClass::LayerNorm);
        assert_eq!(config.mlp_class(), MlpClass::GptNeoXMlp);
        assert!(config.parallel_residual());
        assert!(config.bias());
        assert!(!config.shared_attention_norm());
        assert_eq!(config.condense_ratio(), 1);
    }

    #[test]
    fn head_size_is_exact_quotient() {
        for n_head in [1usize, 2, 4, 8, 16, 32] {
            for mult in [1usize, 3, 64, 128] {
                let raw = RawConfig {
                    n_head,
                    n_embed: n_head * mult,
                    ..RawConfig::new("h")
                };
                assert_eq!(raw.resolve().unwrap().head_size(), mult);
            }
        }
    }

    #[test]
    fn indivisible_embed_is_rejected() {
        let msg = invalid_message(resolve(json!({ "name": "x", "n_embed": 4097 })));
        assert!(msg.contains("n_embed"));
    }

    #[test]
    fn zero_heads_is_rejected() {
        let msg = invalid_message(resolve(json!({ "name": "x", "n_head": 0 })));
        assert!(msg.contains("n_head"));
    }

    #[test]
    fn padded_vocab_covers_vocab() {
        for padding_multiple in [1usize, 7, 64, 512] {
            for vocab_size in [1usize, 100, 511, 512, 513, 50254] {
                let config = RawConfig {
                    vocab_size,
                    padding_multiple,
                    ..RawConfig::new("v")
                }
                .resolve()
                .unwrap();
                let padded = config.padded_vocab_size();
                assert_eq!(padded % padding_multiple, 0);
                assert!(vocab_size <= padded);
                assert!(padded - padding_multiple < vocab_size);
            }
        }
    }

    #[test]
    fn aligned_vocab_is_unchanged() {
        let config = resolve(json!({ "name": "x", "vocab_size": 512, "padding_multiple": 512 }))
            .unwrap();
        assert_eq!(config.padded_vocab_size(), 512);
    }

    #[test]
    fn supplied_padded_vocab_is_kept() {
        let config = resolve(json!({ "name": "x", "padded_vocab_size": 50300 })).unwrap();
        assert_eq!(config.padded_vocab_size(), 50300);
    }

    #[test]
    fn zero_padding_multiple_is_rejected() {
        let msg = invalid_message(resolve(json!({ "name": "x", "padding_multiple": 0 })));
        assert!(msg.contains("padding_multiple"));
    }

    #[test]
    fn query_groups_default_to_heads() {
        let config = resolve(json!({ "name": "x", "n_head": 32 })).unwrap();
        assert_eq!(config.n_query_groups(), 32);
        assert_eq!(config.attention_kind(), AttentionKind::MultiHead);
    }

    #[test]
    fn query_groups_must_divide_heads() {
        let msg = invalid_message(resolve(json!({ "name": "x", "n_head": 32, "n_query_groups": 5 })));
        assert!(msg.contains("n_query_groups"));
        assert!(resolve(json!({ "name": "x", "n_query_groups": 0 })).is_err());
    }

    #[test]
    fn grouped_and_multi_query() {
        let gqa = resolve(json!({ "name": "x", "n_query_groups": 4 })).unwrap();
        assert_eq!(gqa.attention_kind(), AttentionKind::GroupedQuery);
        assert_eq!(gqa.queries_per_group(), 8);
        assert_eq!(gqa.kv_dim(), 4 * 128);

        let mqa = resolve(json!({ "name": "x", "n_query_groups": 1 })).unwrap();
        assert_eq!(mqa.attention_kind(), AttentionKind::MultiQuery);
        assert_eq!(mqa.kv_dim(), 128);
    }

    #[test]
    fn llama_mlp_requires_intermediate_size() {
        let msg = invalid_message(resolve(json!({ "name": "x", "mlp_class": "LLaMAMLP" })));
        assert!(msg.contains("intermediate_size"));

        let config = resolve(json!({
            "name": "x",
            "mlp_class": "LLaMAMLP",
            "intermediate_size": 11008
        }))
        .unwrap();
        assert_eq!(config.mlp_class(), MlpClass::LlamaMlp);
        assert_eq!(config.intermediate_size(), 11008);
    }

    #[test]
    fn other_mlp_defaults_intermediate_size() {
        let config = resolve(json!({ "name": "x", "n_embed": 4096 })).unwrap();
        assert_eq!(config.intermediate_size(), 16384);
    }

    #[test]
    fn divisibility_is_checked_before_mlp() {
        // Both are violated; the head check runs first.
        let msg = invalid_message(resolve(json!({
            "name": "x",
            "n_embed": 100,
            "n_head": 3,
            "mlp_class": "LLaMAMLP"
        })));
        assert!(msg.contains("n_embed"));
    }

    #[test]
    fn name_is_required() {
        assert_eq!(invalid_message(resolve(json!({}))), "name is required");
        assert!(invalid_message(resolve(json!({ "name": "" }))).contains("empty"));
        assert!(matches!(
            resolve(json!({ "name": 7 })),
            Err(DiffusionLmError::Parse(_))
        ));
    }

    #[test]
    fn primitive_types_are_strict() {
        let cases = [
            json!({ "name": "x", "n_head": 32.0 }),
            json!({ "name": "x", "block_size": "4096" }),
            json!({ "name": "x", "n_layer": -1 }),
            json!({ "name": "x", "bias": 1 }),
            json!({ "name": "x", "parallel_residual": "true" }),
            json!({ "name": "x", "intermediate_size": 11008.5 }),
            json!({ "name": "x", "mlp_class": "SwiGLU" }),
            json!({ "name": "x", "norm_class": "BatchNorm" }),
            json!({ "name": "x", "n_heads": 32 }),
        ];
        for case in cases {
            assert!(
                matches!(resolve(case.clone()), Err(DiffusionLmError::Parse(_))),
                "accepted {case}"
            );
        }
    }

    #[test]
    fn integers_widen_to_floats() {
        let config = resolve(json!({ "name": "x", "norm_eps": 1, "rotary_percentage": 1 })).unwrap();
        assert_eq!(config.norm_eps(), 1.0);
        assert_eq!(config.rope_n_elem(), 128);
    }

    #[test]
    fn rope_n_elem_truncates() {
        let config = resolve(json!({ "name": "x", "n_embed": 96, "n_head": 1, "rotary_percentage": 0.3 }))
            .unwrap();
        assert_eq!(config.rope_n_elem(), 28);
    }

    #[test]
    fn explicit_null_means_derive() {
        let config = resolve(json!({
            "name": "x",
            "padded_vocab_size": null,
            "n_query_groups": null,
            "intermediate_size": null
        }))
        .unwrap();
        assert_eq!(config.padded_vocab_size(), 50688);
        assert_eq!(config.n_query_groups(), 32);
        assert_eq!(config.intermediate_size(), 16384);
    }

    #[test]
    fn resolved_json_reloads_equal() {
        let config = RawConfig {
            n_query_groups: Some(8),
            norm_class: NormClass::RmsNorm,
            mlp_class: MlpClass::LlamaMlp,
            intermediate_size: Some(11008),
            ..RawConfig::new("llama-ish")
        }
        .resolve()
        .unwrap();
        let json = config.to_json_string().unwrap();
        assert!(json.contains("\"RMSNorm\""));
        assert!(json.contains("\"LLaMAMLP\""));
        assert_eq!(Config::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn divisibility_is_checked_before_padding() {
        let msg = invalid_message(resolve(json!({
            "name": "x",
            "n_embed": 100,
            "n_head": 3,
            "padding_multiple": 0
        })));
        assert!(msg.contains("n_embed"));
    }

    #[test]
    fn builder_setters_resolve() {
        let config = RawConfig::new("built")
            .with_block_size(2048)
            .with_vocab_size(32000)
            .with_padding_multiple(64)
            .with_n_layer(22)
            .with_n_head(32)
            .with_n_embed(2048)
            .with_rotary_percentage(1.0)
            .with_parallel_residual(false)
            .with_bias(false)
            .with_n_query_groups(4)
            .with_shared_attention_norm(true)
            .with_norm_class(NormClass::RmsNorm)
            .with_norm_eps(1e-6)
            .with_mlp_class(MlpClass::LlamaMlp)
            .with_intermediate_size(5632)
            .with_condense_ratio(2)
            .resolve()
            .unwrap();
        assert_eq!(config.block_size(), 2048);
        assert_eq!(config.padded_vocab_size(), 32000);
        assert_eq!(config.n_layer(), 22);
        assert_eq!(config.head_size(), 64);
        assert_eq!(config.rope_n_elem(), 64);
        assert!(!config.parallel_residual());
        assert!(!config.bias());
        assert_eq!(config.n_query_groups(), 4);
        assert!(config.shared_attention_norm());
        assert_eq!(config.norm_class(), NormClass::RmsNorm);
        assert_eq!(config.norm_eps(), 1e-6);
        assert_eq!(config.intermediate_size(), 5632);
        assert_eq!(config.condense_ratio(), 2);
    }

    #[test]
    fn builder_runs_the_same_checks() {
        let err = RawConfig::new("b").with_n_query_groups(5).resolve();
        assert!(invalid_message(err).contains("n_query_groups"));
        let err = RawConfig::new("b").with_mlp_class(MlpClass::LlamaMlp).resolve();
        assert!(invalid_message(err).contains("intermediate_size"));
        let config = RawConfig::new("b").with_padded_vocab_size(50300).resolve().unwrap();
        assert_eq!(config.padded_vocab_size(), 50300);
    }

    #[test]
    fn try_from_raw() {
        let config = Config::try_from(RawConfig::new("t")).unwrap();
        assert_eq!(config.name(), "t");
    }
}
