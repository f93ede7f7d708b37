use anyhow::Result;
use tch::{nn, Tensor};

use crate::attention::{AttentionCache, MultiheadAttention};
use crate::config::{DecoderConfig, EncoderConfig};

/// A layer that maps a (length, batch, dim) sequence to a sequence of the same shape.
pub trait EncoderLayer: std::fmt::Debug + Send {
    fn forward_t(&self, xs: &Tensor, padding_mask: Option<&Tensor>, train: bool) -> Tensor;
}

/// A layer that attends to itself and to an encoder memory, optionally one step at a time.
pub trait DecoderLayer: std::fmt::Debug + Send {
    fn forward_t(
        &self,
        xs: &Tensor,
        memory: &Tensor,
        self_attn_mask: Option<&Tensor>,
        state: Option<&mut LayerState>,
        train: bool,
    ) -> Tensor;
}

/// Per-layer incremental decoding cache.
#[derive(Debug, Default)]
pub struct LayerState {
    pub self_attn: AttentionCache,
    pub encoder_attn: AttentionCache,
}

impl LayerState {
    /// Decoded steps held in the self-attention cache.
    pub fn steps(&self) -> i64 {
        self.self_attn.len()
    }

    pub fn reorder(&mut self, new_order: &Tensor) {
        self.self_attn.reorder(new_order);
        self.encoder_attn.reorder(new_order);
    }
}

#[derive(Debug)]
struct FeedForward {
    expand: nn::Linear,
    compress: nn::Linear,
    activation_dropout: f64,
}

impl FeedForward {
    fn new(vs: &nn::Path, dim: i64, ffn_dim: i64, activation_dropout: f64) -> FeedForward {
        FeedForward {
            expand: nn::linear(vs / "fc1", dim, ffn_dim, Default::default()),
            compress: nn::linear(vs / "fc2", ffn_dim, dim, Default::default()),
            activation_dropout,
        }
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.apply(&self.expand)
            .relu()
            .dropout(self.activation_dropout, train)
            .apply(&self.compress)
    }
}

// Normalizes before `sublayer` when `normalize_before`, after the residual add otherwise.
fn residual(
    xs: &Tensor,
    norm: &nn::LayerNorm,
    normalize_before: bool,
    dropout: f64,
    train: bool,
    sublayer: impl FnOnce(&Tensor) -> Tensor,
) -> Tensor {
    let h = if normalize_before { xs.apply(norm) } else { xs.shallow_clone() };
    let h = sublayer(&h).dropout(dropout, train) + xs;
    if normalize_before {
        h
    } else {
        h.apply(norm)
    }
}

#[derive(Debug)]
pub struct TransformerEncoderLayer {
    self_attn: MultiheadAttention,
    attn_norm: nn::LayerNorm,
    ffn: FeedForward,
    ffn_norm: nn::LayerNorm,
    dropout: f64,
    normalize_before: bool,
}

impl TransformerEncoderLayer {
    pub fn new(vs: &nn::Path, config: &EncoderConfig) -> Result<TransformerEncoderLayer> {
        let dim = config.encoder_embed_dim;
        Ok(TransformerEncoderLayer {
            self_attn: MultiheadAttention::new(
                &(vs / "self_attn"),
                dim,
                config.encoder_attention_heads,
                config.attention_dropout,
                true,
            )?,
            attn_norm: nn::layer_norm(vs / "self_attn_layer_norm", vec![dim], Default::default()),
            ffn: FeedForward::new(vs, dim, config.encoder_ffn_embed_dim, config.activation_dropout),
            ffn_norm: nn::layer_norm(vs / "final_layer_norm", vec![dim], Default::default()),
            dropout: config.dropout,
            normalize_before: config.encoder_normalize_before,
        })
    }
}

impl EncoderLayer for TransformerEncoderLayer {
    fn forward_t(&self, xs: &Tensor, padding_mask: Option<&Tensor>, train: bool) -> Tensor {
        let xs = residual(xs, &self.attn_norm, self.normalize_before, self.dropout, train, |h| {
            self.self_attn.forward_t(h, h, None, padding_mask, None, train)
        });
        residual(&xs, &self.ffn_norm, self.normalize_before, self.dropout, train, |h| {
            self.ffn.forward_t(h, train)
        })
    }
}

#[derive(Debug)]
pub struct TransformerDecoderLayer {
    self_attn: MultiheadAttention,
    self_attn_norm: nn::LayerNorm,
    cross_attn: MultiheadAttention,
    cross_attn_norm: nn::LayerNorm,
    ffn: FeedForward,
    ffn_norm: nn::LayerNorm,
    dropout: f64,
    normalize_before: bool,
}

impl TransformerDecoderLayer {
    pub fn new(vs: &nn::Path, config: &DecoderConfig) -> Result<TransformerDecoderLayer> {
        let dim = config.decoder_embed_dim;
        let heads = config.decoder_attention_heads;
        Ok(TransformerDecoderLayer {
            self_attn: MultiheadAttention::new(&(vs / "self_attn"), dim, heads, config.attention_dropout, true)?,
            self_attn_norm: nn::layer_norm(vs / "self_attn_layer_norm", vec![dim], Default::default()),
            cross_attn: MultiheadAttention::new(&(vs / "encoder_attn"), dim, heads, config.attention_dropout, false)?,
            cross_attn_norm: nn::layer_norm(vs / "encoder_attn_layer_norm", vec![dim], Default::default()),
            ffn: FeedForward::new(vs, dim, config.decoder_ffn_embed_dim, config.activation_dropout),
            ffn_norm: nn::layer_norm(vs / "final_layer_norm", vec![dim], Default::default()),
            dropout: config.dropout,
            normalize_before: config.decoder_normalize_before,
        })
    }
}

impl DecoderLayer for TransformerDecoderLayer {
    fn forward_t(
        &self,
        xs: &Tensor,
        memory: &Tensor,
        self_attn_mask: Option<&Tensor>,
        state: Option<&mut LayerState>,
        train: bool,
    ) -> Tensor {
        let (self_cache, cross_cache) = match state {
            Some(state) => (Some(&mut state.self_attn), Some(&mut state.encoder_attn)),
            None => (None, None),
        };

        let xs = residual(xs, &self.self_attn_norm, self.normalize_before, self.dropout, train, |h| {
            self.self_attn.forward_t(h, h, self_attn_mask, None, self_cache, train)
        });
        let xs = residual(&xs, &self.cross_attn_norm, self.normalize_before, self.dropout, train, |h| {
            self.cross_attn.forward_t(h, memory, None, None, cross_cache, train)
        });
        residual(&xs, &self.ffn_norm, self.normalize_before, self.dropout, train, |h| {
            self.ffn.forward_t(h, train)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn encoder_layer_keeps_shape() {
        tch::manual_seed(11);
        let vs = nn::VarStore::new(Device::Cpu);
        let layer = TransformerEncoderLayer::new(&vs.root(), &EncoderConfig::new(16, 32, 4)).unwrap();
        let xs = Tensor::randn(&[7, 3, 16], (Kind::Float, Device::Cpu));
        assert_eq!(layer.forward_t(&xs, None, true).size(), vec![7, 3, 16]);
    }

    #[test]
    fn post_norm_output_is_normalized() {
        tch::manual_seed(12);
        let vs = nn::VarStore::new(Device::Cpu);
        let config = EncoderConfig { encoder_normalize_before: false, ..EncoderConfig::new(16, 32, 4) };
        let layer = TransformerEncoderLayer::new(&vs.root(), &config).unwrap();
        let xs = Tensor::randn(&[4, 2, 16], (Kind::Float, Device::Cpu)) * 5.0;
        let ys = layer.forward_t(&xs, None, false);
        // fresh layer norms have unit weight and zero bias
        let mean = ys.mean_dim(-1i64, false, Kind::Float);
        assert!(mean.abs().max().double_value(&[]) < 1e-5);
    }

    #[test]
    fn decoder_layer_fills_both_caches() {
        tch::manual_seed(13);
        let vs = nn::VarStore::new(Device::Cpu);
        let layer = TransformerDecoderLayer::new(&vs.root(), &DecoderConfig::new(8, 16, 2)).unwrap();
        let memory = Tensor::randn(&[5, 2, 8], (Kind::Float, Device::Cpu));
        let mut state = LayerState::default();
        for step in 1..=4 {
            let xs = Tensor::randn(&[1, 2, 8], (Kind::Float, Device::Cpu));
            let ys = layer.forward_t(&xs, &memory, None, Some(&mut state), false);
            assert_eq!(ys.size(), vec![1, 2, 8]);
            assert_eq!(state.steps(), step);
            assert_eq!(state.encoder_attn.len(), 5);
        }
    }

    #[test]
    fn eval_mode_is_deterministic() {
        tch::manual_seed(14);
        let vs = nn::VarStore::new(Device::Cpu);
        let layer = TransformerDecoderLayer::new(&vs.root(), &DecoderConfig::new(8, 16, 2)).unwrap();
        let xs = Tensor::randn(&[3, 1, 8], (Kind::Float, Device::Cpu));
        let memory = Tensor::randn(&[4, 1, 8], (Kind::Float, Device::Cpu));
        let a = layer.forward_t(&xs, &memory, None, None, false);
        let b = layer.forward_t(&xs, &memory, None, None, false);
        assert!(a.equal(&b));
    }
}
