use anyhow::{ensure, Result};
use tch::{nn, Kind, Tensor};

/// Keys and values kept between incremental steps, shaped (batch, heads, steps, head_dim).
#[derive(Debug, Default)]
pub struct AttentionCache {
    key: Option<Tensor>,
    value: Option<Tensor>,
}

impl AttentionCache {
    /// Number of cached key positions.
    pub fn len(&self) -> i64 {
        self.key.as_ref().map_or(0, |key| key.size()[2])
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_none()
    }

    pub fn key(&self) -> Option<&Tensor> {
        self.key.as_ref()
    }

    pub fn value(&self) -> Option<&Tensor> {
        self.value.as_ref()
    }

    /// Selects cached entries along the batch dimension, e.g. to follow surviving beams.
    pub fn reorder(&mut self, new_order: &Tensor) {
        for cached in [&mut self.key, &mut self.value].into_iter().flatten() {
            *cached = cached.index_select(0, new_order);
        }
    }

    pub fn clear(&mut self) {
        self.key = None;
        self.value = None;
    }
}

/// Scaled dot-product attention over (length, batch, embed_dim) inputs.
///
/// A self-attention module appends the new step's keys and values to its cache; an
/// encoder-attention module projects the memory once and reuses it for every later step.
#[derive(Debug)]
pub struct MultiheadAttention {
    embed_dim: i64,
    num_heads: i64,
    head_dim: i64,
    scaling: f64,
    dropout: f64,
    self_attn: bool,
    q_proj: nn::Linear,
    k_proj: nn::Linear,
    v_proj: nn::Linear,
    out_proj: nn::Linear,
}

impl MultiheadAttention {
    pub fn new(vs: &nn::Path, embed_dim: i64, num_heads: i64, dropout: f64, self_attn: bool) -> Result<MultiheadAttention> {
        ensure!(num_heads > 0 && embed_dim % num_heads == 0, "embed_dim {embed_dim} must be divisible by num_heads {num_heads}");
        let head_dim = embed_dim / num_heads;

        Ok(MultiheadAttention {
            embed_dim,
            num_heads,
            head_dim,
            scaling: (head_dim as f64).powf(-0.5),
            dropout,
            self_attn,
            q_proj: nn::linear(vs / "q_proj", embed_dim, embed_dim, Default::default()),
            k_proj: nn::linear(vs / "k_proj", embed_dim, embed_dim, Default::default()),
            v_proj: nn::linear(vs / "v_proj", embed_dim, embed_dim, Default::default()),
            out_proj: nn::linear(vs / "out_proj", embed_dim, embed_dim, Default::default()),
        })
    }

    pub fn embed_dim(&self) -> i64 {
        self.embed_dim
    }

    pub fn num_heads(&self) -> i64 {
        self.num_heads
    }

    // (len, batch, embed_dim) -> (batch, heads, len, head_dim)
    fn split_heads(&self, xs: &Tensor, len: i64, batch: i64) -> Tensor {
        xs.contiguous()
            .view([len, batch, self.num_heads, self.head_dim])
            .permute(&[1, 2, 0, 3])
    }

    fn project_kv(&self, key: &Tensor, batch: i64) -> (Tensor, Tensor) {
        let src_len = key.size()[0];
        let k = self.split_heads(&key.apply(&self.k_proj), src_len, batch);
        let v = self.split_heads(&key.apply(&self.v_proj), src_len, batch);
        (k, v)
    }

    fn cached_kv(&self, key: &Tensor, batch: i64, cache: &mut AttentionCache) -> (Tensor, Tensor) {
        if !self.self_attn {
            if let (Some(k), Some(v)) = (&cache.key, &cache.value) {
                return (k.shallow_clone(), v.shallow_clone());
            }
        }

        let (mut k, mut v) = self.project_kv(key, batch);
        if self.self_attn {
            if let (Some(prev_k), Some(prev_v)) = (&cache.key, &cache.value) {
                k = Tensor::cat(&[prev_k, &k], 2);
                v = Tensor::cat(&[prev_v, &v], 2);
            }
        }
        cache.key = Some(k.shallow_clone());
        cache.value = Some(v.shallow_clone());
        (k, v)
    }

    /// Attends `query` (tgt_len, batch, embed_dim) over `key` (src_len, batch, embed_dim).
    ///
    /// `attn_mask` (tgt_len, src_len) is added to the scores; `key_padding_mask` (batch, src_len)
    /// is boolean with `true` marking padded keys. With a cache, `key` only has to hold the
    /// positions that are not cached yet.
    pub fn forward_t(
        &self,
        query: &Tensor,
        key: &Tensor,
        attn_mask: Option<&Tensor>,
        key_padding_mask: Option<&Tensor>,
        cache: Option<&mut AttentionCache>,
        train: bool,
    ) -> Tensor {
        let size = query.size();
        assert!(size.len() == 3 && size[2] == self.embed_dim, "expected a (length, batch, {}) query, got {size:?}", self.embed_dim);
        let (tgt_len, batch) = (size[0], size[1]);

        let q = self.split_heads(&(query.apply(&self.q_proj) * self.scaling), tgt_len, batch);
        let (k, v) = match cache {
            Some(cache) => self.cached_kv(key, batch, cache),
            None => self.project_kv(key, batch),
        };
        let src_len = k.size()[2];

        let mut scores = q.matmul(&k.transpose(-2, -1));
        if let Some(mask) = attn_mask {
            scores = scores + mask;
        }
        if let Some(padding) = key_padding_mask {
            scores = scores.masked_fill(&padding.view([batch, 1, 1, src_len]), f64::NEG_INFINITY);
        }

        let probs = scores
            .softmax(-1, Kind::Float)
            .to_kind(q.kind())
            .dropout(self.dropout, train);

        // (batch, heads, tgt_len, head_dim) -> (tgt_len, batch, embed_dim)
        probs
            .matmul(&v)
            .permute(&[2, 0, 1, 3])
            .contiguous()
            .view([tgt_len, batch, self.embed_dim])
            .apply(&self.out_proj)
    }
}
