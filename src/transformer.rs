use anyhow::{ensure, Result};
use tch::{nn, Device, Kind, Tensor};

use crate::config::{DecoderConfig, EncoderConfig};
use crate::layer::{DecoderLayer, EncoderLayer, LayerState, TransformerDecoderLayer, TransformerEncoderLayer};

/// Additive causal mask of shape (len, len): `-inf` strictly above the diagonal, zero elsewhere.
pub fn future_mask(len: i64, device: Device) -> Tensor {
    Tensor::full(&[len, len], f64::NEG_INFINITY, (Kind::Float, device)).triu(1)
}

/// Stack of encoder layers followed by a final layer norm, over (length, batch, dim) inputs.
#[derive(Debug)]
pub struct TransformerEncode {
    layers: Vec<Box<dyn EncoderLayer>>,
    layer_norm: nn::LayerNorm,
}

impl TransformerEncode {
    pub fn new(vs: &nn::Path, config: &EncoderConfig, num_layer: i64) -> Result<TransformerEncode> {
        config.validate()?;
        ensure!(num_layer > 0, "encoder needs at least one layer, got {num_layer}");

        let layers = (0..num_layer)
            .map(|i| -> Result<Box<dyn EncoderLayer>> {
                let layer = TransformerEncoderLayer::new(&(vs / "layer" / i), config)?;
                Ok(Box::new(layer))
            })
            .collect::<Result<Vec<_>>>()?;
        let layer_norm = nn::layer_norm(vs / "layer_norm", vec![config.encoder_embed_dim], Default::default());

        log::debug!("encoder: {num_layer} layers, dim={}", config.encoder_embed_dim);
        Ok(TransformerEncode::from_layers(layers, layer_norm))
    }

    pub fn from_layers(layers: Vec<Box<dyn EncoderLayer>>, layer_norm: nn::LayerNorm) -> TransformerEncode {
        TransformerEncode { layers, layer_norm }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn forward_t(&self, xs: &Tensor, padding_mask: Option<&Tensor>, train: bool) -> Tensor {
        let mut xs = xs.shallow_clone();
        for layer in &self.layers {
            xs = layer.forward_t(&xs, padding_mask, train);
        }
        xs.apply(&self.layer_norm)
    }

    pub fn forward(&self, xs: &Tensor) -> Tensor {
        self.forward_t(xs, None, false)
    }
}

/// Cached keys and values of one generation session, one entry per decoder layer.
///
/// Created by [`TransformerDecode::start_session`], advanced by
/// [`TransformerDecode::forward_one`] and finished with [`IncrementalState::end`] (or dropped).
#[derive(Debug)]
pub struct IncrementalState {
    layers: Vec<LayerState>,
    embed_dim: i64,
    steps: i64,
}

impl IncrementalState {
    fn new(num_layers: usize, embed_dim: i64) -> IncrementalState {
        IncrementalState {
            layers: (0..num_layers).map(|_| LayerState::default()).collect(),
            embed_dim,
            steps: 0,
        }
    }

    pub fn steps(&self) -> i64 {
        self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps == 0
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, index: usize) -> Option<&LayerState> {
        self.layers.get(index)
    }

    /// Reorders every cached tensor along the batch dimension.
    pub fn reorder(&mut self, new_order: &Tensor) {
        for layer in &mut self.layers {
            layer.reorder(new_order);
        }
    }

    /// Ends the session, returning how many steps were decoded.
    pub fn end(self) -> i64 {
        log::debug!("decode session ended after {} steps", self.steps);
        self.steps
    }
}

/// Stack of decoder layers followed by a final layer norm, over (length, batch, dim) inputs.
#[derive(Debug)]
pub struct TransformerDecode {
    layers: Vec<Box<dyn DecoderLayer>>,
    layer_norm: nn::LayerNorm,
    embed_dim: i64,
}

impl TransformerDecode {
    pub fn new(vs: &nn::Path, config: &DecoderConfig, num_layer: i64) -> Result<TransformerDecode> {
        config.validate()?;
        ensure!(num_layer > 0, "decoder needs at least one layer, got {num_layer}");

        let layers = (0..num_layer)
            .map(|i| -> Result<Box<dyn DecoderLayer>> {
                let layer = TransformerDecoderLayer::new(&(vs / "layer" / i), config)?;
                Ok(Box::new(layer))
            })
            .collect::<Result<Vec<_>>>()?;
        let layer_norm = nn::layer_norm(vs / "layer_norm", vec![config.decoder_embed_dim], Default::default());

        log::debug!("decoder: {num_layer} layers, dim={}", config.decoder_embed_dim);
        Ok(TransformerDecode::from_layers(layers, layer_norm, config.decoder_embed_dim))
    }

    pub fn from_layers(layers: Vec<Box<dyn DecoderLayer>>, layer_norm: nn::LayerNorm, embed_dim: i64) -> TransformerDecode {
        TransformerDecode { layers, layer_norm, embed_dim }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn embed_dim(&self) -> i64 {
        self.embed_dim
    }

    /// Decodes the whole target sequence at once; pass [`future_mask`] for causal decoding.
    pub fn forward_t(&self, xs: &Tensor, memory: &Tensor, self_attn_mask: Option<&Tensor>, train: bool) -> Tensor {
        let mut xs = xs.shallow_clone();
        for layer in &self.layers {
            xs = layer.forward_t(&xs, memory, self_attn_mask, None, train);
        }
        xs.apply(&self.layer_norm)
    }

    pub fn forward(&self, xs: &Tensor, memory: &Tensor, self_attn_mask: Option<&Tensor>) -> Tensor {
        self.forward_t(xs, memory, self_attn_mask, false)
    }

    pub fn start_session(&self) -> IncrementalState {
        IncrementalState::new(self.layers.len(), self.embed_dim)
    }

    /// Decodes the last step of `xs` (length, batch, dim) and returns it as (1, batch, dim).
    ///
    /// Every layer appends the step to `state`, so the same state must be passed on each
    /// call of a session.
    pub fn forward_one(&self, xs: &Tensor, memory: &Tensor, state: &mut IncrementalState) -> Tensor {
        assert!(
            state.layers.len() == self.layers.len() && state.embed_dim == self.embed_dim,
            "incremental state belongs to a {}-layer dim-{} decoder, not {}-layer dim-{}",
            state.layers.len(),
            state.embed_dim,
            self.layers.len(),
            self.embed_dim
        );

        let len = xs.size()[0];
        let mut xs = xs.narrow(0, len - 1, 1);
        for (layer, layer_state) in self.layers.iter().zip(state.layers.iter_mut()) {
            xs = layer.forward_t(&xs, memory, None, Some(layer_state), false);
        }
        state.steps += 1;
        log::debug!("decode step {}", state.steps);

        xs.apply(&self.layer_norm)
    }
}
