use std::collections::HashMap;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_dropout() -> f64 { 0.1 }
fn default_attention_dropout() -> f64 { 0.1 }
fn default_activation_dropout() -> f64 { 0.0 }
fn default_normalize_before() -> bool { true }

fn check_layer(dim: i64, heads: i64, ffn_dim: i64, rates: &[(&str, f64)]) -> Result<()> {
    ensure!(dim > 0, "embedding dimension must be positive, got {dim}");
    ensure!(heads > 0, "attention head count must be positive, got {heads}");
    ensure!(dim % heads == 0, "embedding dimension {dim} must be divisible by head count {heads}");
    ensure!(ffn_dim > 0, "feed-forward dimension must be positive, got {ffn_dim}");
    for (name, p) in rates {
        ensure!((0.0..1.0).contains(p), "{name} must be in [0, 1), got {p}");
    }
    Ok(())
}

/// Options consumed by the encoder layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub encoder_embed_dim: i64,
    pub encoder_attention_heads: i64,
    pub encoder_ffn_embed_dim: i64,
    #[serde(default = "default_attention_dropout")]
    pub attention_dropout: f64,
    #[serde(default = "default_dropout")]
    pub dropout: f64,
    #[serde(default = "default_activation_dropout")]
    pub activation_dropout: f64,
    #[serde(default = "default_normalize_before")]
    pub encoder_normalize_before: bool,
}

impl EncoderConfig {
    pub fn new(dim: i64, ff_dim: i64, num_head: i64) -> Self {
        Self {
            encoder_embed_dim: dim,
            encoder_attention_heads: num_head,
            encoder_ffn_embed_dim: ff_dim,
            attention_dropout: default_attention_dropout(),
            dropout: default_dropout(),
            activation_dropout: default_activation_dropout(),
            encoder_normalize_before: default_normalize_before(),
        }
    }

    /// Builds the record from a flat mapping of option names to values.
    pub fn from_options(options: HashMap<String, Value>) -> Result<Self> {
        let config: Self = serde_json::from_value(Value::Object(options.into_iter().collect()))
            .context("invalid encoder options")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_layer(
            self.encoder_embed_dim,
            self.encoder_attention_heads,
            self.encoder_ffn_embed_dim,
            &[
                ("attention_dropout", self.attention_dropout),
                ("dropout", self.dropout),
                ("activation_dropout", self.activation_dropout),
            ],
        )
        .context("invalid encoder config")
    }
}

/// Options consumed by the decoder layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub decoder_embed_dim: i64,
    pub decoder_attention_heads: i64,
    pub decoder_ffn_embed_dim: i64,
    #[serde(default = "default_attention_dropout")]
    pub attention_dropout: f64,
    #[serde(default = "default_dropout")]
    pub dropout: f64,
    #[serde(default = "default_activation_dropout")]
    pub activation_dropout: f64,
    #[serde(default = "default_normalize_before")]
    pub decoder_normalize_before: bool,
}

impl DecoderConfig {
    pub fn new(dim: i64, ff_dim: i64, num_head: i64) -> Self {
        Self {
            decoder_embed_dim: dim,
            decoder_attention_heads: num_head,
            decoder_ffn_embed_dim: ff_dim,
            attention_dropout: default_attention_dropout(),
            dropout: default_dropout(),
            activation_dropout: default_activation_dropout(),
            decoder_normalize_before: default_normalize_before(),
        }
    }

    pub fn from_options(options: HashMap<String, Value>) -> Result<Self> {
        let config: Self = serde_json::from_value(Value::Object(options.into_iter().collect()))
            .context("invalid decoder options")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_layer(
            self.decoder_embed_dim,
            self.decoder_attention_heads,
            self.decoder_ffn_embed_dim,
            &[
                ("attention_dropout", self.attention_dropout),
                ("dropout", self.dropout),
                ("activation_dropout", self.activation_dropout),
            ],
        )
        .context("invalid decoder config")
    }
}

fn default_bos() -> i64 { 1 }
fn default_eos() -> i64 { 2 }
fn default_pad() -> i64 { 0 }

/// Configuration of the full captioning model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub dim: i64,
    pub ff_dim: i64,
    pub num_head: i64,
    pub num_layer: i64,
    pub vocab_size: i64,
    pub max_length: i64,
    pub image_width: i64,
    pub image_height: i64,
    #[serde(default = "default_bos")]
    pub bos_token: i64,
    #[serde(default = "default_eos")]
    pub eos_token: i64,
    #[serde(default = "default_pad")]
    pub pad_token: i64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dim: 384,
            ff_dim: 1024,
            num_head: 8,
            num_layer: 3,
            vocab_size: 256,
            max_length: 300,
            image_width: 16,
            image_height: 16,
            bos_token: default_bos(),
            eos_token: default_eos(),
            pad_token: default_pad(),
        }
    }
}

impl ModelConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read model config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse model config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn encoder(&self) -> EncoderConfig {
        EncoderConfig::new(self.dim, self.ff_dim, self.num_head)
    }

    pub fn decoder(&self) -> DecoderConfig {
        DecoderConfig::new(self.dim, self.ff_dim, self.num_head)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.num_layer > 0, "num_layer must be positive, got {}", self.num_layer);
        ensure!(self.dim % 4 == 0, "dim must be divisible by 4 for the 2d position table, got {}", self.dim);
        ensure!(self.vocab_size > 0, "vocab_size must be positive");
        ensure!(self.max_length > 0, "max_length must be positive");
        ensure!(self.image_width > 0 && self.image_height > 0, "image grid must be non-empty");
        for (name, token) in [("bos_token", self.bos_token), ("eos_token", self.eos_token), ("pad_token", self.pad_token)] {
            ensure!((0..self.vocab_size).contains(&token), "{name} {token} outside vocabulary of {}", self.vocab_size);
        }
        self.encoder().validate()?;
        self.decoder().validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encoder_options_fill_defaults() {
        let options: HashMap<String, Value> = [
            ("encoder_embed_dim".to_string(), json!(64)),
            ("encoder_attention_heads".to_string(), json!(4)),
            ("encoder_ffn_embed_dim".to_string(), json!(256)),
        ]
        .into_iter()
        .collect();
        let config = EncoderConfig::from_options(options).unwrap();
        assert_eq!(config, EncoderConfig::new(64, 256, 4));
        assert!(config.encoder_normalize_before);
        assert_eq!(config.dropout, 0.1);
        assert_eq!(config.activation_dropout, 0.0);
    }

    #[test]
    fn decoder_options_override_defaults() {
        let options: HashMap<String, Value> = [
            ("decoder_embed_dim".to_string(), json!(32)),
            ("decoder_attention_heads".to_string(), json!(2)),
            ("decoder_ffn_embed_dim".to_string(), json!(64)),
            ("dropout".to_string(), json!(0.3)),
            ("decoder_normalize_before".to_string(), json!(false)),
        ]
        .into_iter()
        .collect();
        let config = DecoderConfig::from_options(options).unwrap();
        assert_eq!(config.dropout, 0.3);
        assert!(!config.decoder_normalize_before);
    }

    #[test]
    fn heads_must_divide_dim() {
        assert!(EncoderConfig::new(30, 64, 4).validate().is_err());
        assert!(DecoderConfig::new(32, 64, 4).validate().is_ok());
    }

    #[test]
    fn missing_option_is_rejected() {
        let options: HashMap<String, Value> =
            [("decoder_embed_dim".to_string(), json!(32))].into_iter().collect();
        assert!(DecoderConfig::from_options(options).is_err());
    }

    #[test]
    fn model_config_parses_with_defaults() {
        let text = r#"{
            "dim": 64, "ff_dim": 128, "num_head": 4, "num_layer": 2,
            "vocab_size": 50, "max_length": 20, "image_width": 8, "image_height": 6
        }"#;
        let config: ModelConfig = serde_json::from_str(text).unwrap();
        config.validate().unwrap();
        assert_eq!((config.bos_token, config.eos_token, config.pad_token), (1, 2, 0));
        assert_eq!(config.decoder().decoder_embed_dim, 64);
    }

    #[test]
    fn model_dim_must_split_into_quarters() {
        let config = ModelConfig { dim: 66, num_head: 2, ..ModelConfig::default() };
        assert!(config.validate().is_err());
    }
}
