use anyhow::Result;
use tch::{nn, nn::Module, Kind, Tensor};

use crate::config::ModelConfig;
use crate::position_encoding::{PositionEncode1D, PositionEncode2D};
use crate::transformer::{future_mask, TransformerDecode, TransformerEncode};

/// Image captioning model: a feature map is encoded into a memory sequence, and tokens are
/// decoded against it.
#[derive(Debug)]
pub struct CaptionModel {
    config: ModelConfig,
    image_pos: PositionEncode2D,
    encoder: TransformerEncode,
    token_embed: nn::Embedding,
    token_pos: PositionEncode1D,
    decoder: TransformerDecode,
    logit: nn::Linear,
}

impl CaptionModel {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Result<CaptionModel> {
        config.validate()?;
        let dim = config.dim;

        let model = CaptionModel {
            config: config.clone(),
            image_pos: PositionEncode2D::new(&(vs / "image_pos"), dim, config.image_width, config.image_height)?,
            encoder: TransformerEncode::new(&(vs / "encoder"), &config.encoder(), config.num_layer)?,
            token_embed: nn::embedding(vs / "token_embed", config.vocab_size, dim, Default::default()),
            token_pos: PositionEncode1D::new(&(vs / "token_pos"), dim, config.max_length)?,
            decoder: TransformerDecode::new(&(vs / "decoder"), &config.decoder(), config.num_layer)?,
            logit: nn::linear(vs / "logit", dim, config.vocab_size, Default::default()),
        };
        log::info!(
            "caption model: dim={} layers={} heads={} vocab={}",
            dim,
            config.num_layer,
            config.num_head,
            config.vocab_size
        );
        Ok(model)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// (batch, dim, H, W) features -> (H * W, batch, dim) memory.
    pub fn encode(&self, features: &Tensor, train: bool) -> Tensor {
        let xs = self.image_pos.forward(features).flatten(2, 3).permute(&[2, 0, 1]);
        self.encoder.forward_t(&xs, None, train)
    }

    // (batch, T) token ids -> (T, batch, dim)
    fn embed(&self, tokens: &Tensor) -> Tensor {
        let xs = tokens.apply(&self.token_embed);
        self.token_pos.forward(&xs).permute(&[1, 0, 2])
    }

    /// Teacher-forced logits (batch, T, vocab) for `tokens` (batch, T).
    pub fn forward_t(&self, memory: &Tensor, tokens: &Tensor, train: bool) -> Tensor {
        let mask = future_mask(tokens.size()[1], tokens.device());
        self.decoder
            .forward_t(&self.embed(tokens), memory, Some(&mask), train)
            .apply(&self.logit)
            .permute(&[1, 0, 2])
    }

    /// Greedy decoding of at most `max_length` tokens (bos included) per image.
    ///
    /// Rows that already emitted eos are padded until every row has finished.
    pub fn generate(&self, features: &Tensor, max_length: i64) -> Tensor {
        assert!(
            max_length <= self.config.max_length,
            "max_length {max_length} exceeds the position table length {}",
            self.config.max_length
        );
        let _guard = tch::no_grad_guard();

        let device = features.device();
        let batch = features.size()[0];
        let memory = self.encode(features, false);

        let mut tokens = Tensor::full(&[batch, 1], self.config.bos_token, (Kind::Int64, device));
        let mut finished = Tensor::zeros(&[batch], (Kind::Bool, device));
        let mut state = self.decoder.start_session();

        for _ in 1..max_length {
            let last = self.decoder.forward_one(&self.embed(&tokens), &memory, &mut state);
            let next = last
                .apply(&self.logit)
                .squeeze_dim(0)
                .argmax(-1, false)
                .masked_fill(&finished, self.config.pad_token);
            finished = finished.logical_or(&next.eq(self.config.eos_token));
            tokens = Tensor::cat(&[tokens, next.unsqueeze(1)], 1);

            if finished.all().int64_value(&[]) == 1 {
                break;
            }
        }

        let steps = state.end();
        log::debug!("generated {} tokens for {batch} images", steps + 1);
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, IndexOp};

    fn small_config() -> ModelConfig {
        ModelConfig {
            dim: 16,
            ff_dim: 32,
            num_head: 4,
            num_layer: 2,
            vocab_size: 11,
            max_length: 12,
            image_width: 4,
            image_height: 3,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn encode_flattens_the_grid() {
        tch::manual_seed(31);
        let vs = nn::VarStore::new(Device::Cpu);
        let model = CaptionModel::new(&vs.root(), &small_config()).unwrap();
        let features = Tensor::randn(&[2, 16, 3, 4], (Kind::Float, Device::Cpu));
        assert_eq!(model.encode(&features, false).size(), vec![12, 2, 16]);
    }

    #[test]
    fn logits_cover_the_vocabulary() {
        tch::manual_seed(32);
        let vs = nn::VarStore::new(Device::Cpu);
        let model = CaptionModel::new(&vs.root(), &small_config()).unwrap();
        let features = Tensor::randn(&[2, 16, 3, 4], (Kind::Float, Device::Cpu));
        let memory = model.encode(&features, false);
        let tokens = Tensor::from_slice(&[1i64, 5, 7, 1, 3, 4]).view([2, 3]);
        assert_eq!(model.forward_t(&memory, &tokens, false).size(), vec![2, 3, 11]);
    }

    #[test]
    fn generation_starts_with_bos_and_respects_length() {
        tch::manual_seed(33);
        let vs = nn::VarStore::new(Device::Cpu);
        let config = small_config();
        let model = CaptionModel::new(&vs.root(), &config).unwrap();
        let features = Tensor::randn(&[3, 16, 3, 4], (Kind::Float, Device::Cpu));

        let tokens = model.generate(&features, 8);
        let size = tokens.size();
        assert_eq!(size[0], 3);
        assert!(size[1] >= 2 && size[1] <= 8);
        for row in 0..3i64 {
            assert_eq!(tokens.int64_value(&[row, 0]), config.bos_token);
        }
        let max = tokens.i((.., 1..)).max().int64_value(&[]);
        assert!(max < config.vocab_size);
    }

    #[test]
    fn greedy_steps_match_teacher_forced_argmax() {
        tch::manual_seed(34);
        let vs = nn::VarStore::new(Device::Cpu);
        let config = ModelConfig { eos_token: 0, pad_token: 0, ..small_config() };
        let model = CaptionModel::new(&vs.root(), &config).unwrap();
        let features = Tensor::randn(&[1, 16, 3, 4], (Kind::Float, Device::Cpu));

        let tokens = model.generate(&features, 6);
        let len = tokens.size()[1];
        let memory = model.encode(&features, false);
        let prefix = tokens.i((.., ..len - 1));
        let expected = model.forward_t(&memory, &prefix, false).argmax(-1, false);
        let produced = tokens.i((.., 1..));
        // once eos is produced later positions are padding
        let first = produced.i((0, 0)).int64_value(&[]);
        assert_eq!(first, expected.i((0, 0)).int64_value(&[]));
        if first != config.eos_token {
            assert_eq!(produced.i((0, 1)).int64_value(&[]), expected.i((0, 1)).int64_value(&[]));
        }
    }

    #[test]
    #[should_panic(expected = "exceeds the position table length")]
    fn generation_longer_than_table_is_rejected() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = CaptionModel::new(&vs.root(), &small_config()).unwrap();
        let features = Tensor::zeros(&[1, 16, 3, 4], (Kind::Float, Device::Cpu));
        let _ = model.generate(&features, 13);
    }
}
