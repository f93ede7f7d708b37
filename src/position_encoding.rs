use anyhow::{ensure, Result};
use tch::{nn, Device, IndexOp, Kind, Tensor};

/// Geometrically spaced frequencies `exp(2i * (-ln(10000) / dim))` for `i` in `0..dim / 2`.
pub fn inverse_frequencies(dim: i64, device: Device) -> Tensor {
    let range = Tensor::arange_start_step(0, dim, 2, (Kind::Float, device));
    (range * (-(10000f64.ln()) / dim as f64)).exp()
}

/// Interleaves `sin(position * freq)` on even channels with `cos(position * freq)` on odd ones.
///
/// `position` is a column of shape (n, 1), `freqs` has shape (dim / 2); the result is (n, dim).
pub fn interleave_sin_cos(position: &Tensor, freqs: &Tensor) -> Tensor {
    let angles = position * freqs;
    let n = angles.size()[0];

    // Stack sin and cos on a new last dimension, then flatten each (sin, cos) pair into two channels
    Tensor::stack(&[angles.sin(), angles.cos()], -1).view([n, -1])
}

fn register_table(vs: &nn::Path, table: &Tensor) -> Tensor {
    let mut pos = vs.zeros_no_train("pos", &table.size());
    tch::no_grad(|| pos.copy_(table));
    pos
}

/// Fixed sinusoidal encoding added to (batch, T, dim) embeddings.
#[derive(Debug)]
pub struct PositionEncode1D {
    dim: i64,
    max_length: i64,
    pos: Tensor,
}

impl PositionEncode1D {
    pub fn new(vs: &nn::Path, dim: i64, max_length: i64) -> Result<PositionEncode1D> {
        ensure!(dim > 0 && dim % 2 == 0, "position encoding dimension must be even and positive, got {dim}");
        ensure!(max_length > 0, "position table length must be positive, got {max_length}");

        let freqs = inverse_frequencies(dim, vs.device());
        let position = Tensor::arange(max_length, (Kind::Float, vs.device())).unsqueeze(1);
        let table = interleave_sin_cos(&position, &freqs).unsqueeze(0);

        log::debug!("position table 1d: dim={dim} max_length={max_length}");
        Ok(PositionEncode1D { dim, max_length, pos: register_table(vs, &table) })
    }

    pub fn dim(&self) -> i64 {
        self.dim
    }

    pub fn max_length(&self) -> i64 {
        self.max_length
    }

    /// The full (1, max_length, dim) table.
    pub fn table(&self) -> &Tensor {
        &self.pos
    }
}

impl nn::Module for PositionEncode1D {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let size = xs.size();
        assert!(size.len() == 3, "expected a (batch, length, dim) input, got {size:?}");
        let t = size[1];
        assert!(t <= self.max_length, "sequence length {t} exceeds position table length {}", self.max_length);

        xs + self.pos.i((.., ..t))
    }
}

/// Fixed sinusoidal encoding over a (height, width) grid, added to (batch, dim, H, W) feature maps.
///
/// The first half of the channels encodes the column and is constant down each column;
/// the second half encodes the row and is constant along each row.
#[derive(Debug)]
pub struct PositionEncode2D {
    dim: i64,
    width: i64,
    height: i64,
    pos: Tensor,
}

impl PositionEncode2D {
    pub fn new(vs: &nn::Path, dim: i64, width: i64, height: i64) -> Result<PositionEncode2D> {
        ensure!(dim > 0 && dim % 4 == 0, "2d position encoding dimension must be divisible by 4, got {dim}");
        ensure!(width > 0 && height > 0, "position grid must be non-empty, got {width}x{height}");

        let device = vs.device();
        let half = dim / 2;
        let freqs = inverse_frequencies(half, device);
        let position_w = Tensor::arange(width, (Kind::Float, device)).unsqueeze(1);
        let position_h = Tensor::arange(height, (Kind::Float, device)).unsqueeze(1);

        // (W, half) -> (half, 1, W), repeated down the height
        let pos_w = interleave_sin_cos(&position_w, &freqs)
            .transpose(0, 1)
            .unsqueeze(1)
            .expand(&[half, height, width], false);
        // (H, half) -> (half, H, 1), repeated across the width
        let pos_h = interleave_sin_cos(&position_h, &freqs)
            .transpose(0, 1)
            .unsqueeze(2)
            .expand(&[half, height, width], false);
        let table = Tensor::cat(&[pos_w, pos_h], 0).unsqueeze(0);

        log::debug!("position table 2d: dim={dim} grid={width}x{height}");
        Ok(PositionEncode2D { dim, width, height, pos: register_table(vs, &table) })
    }

    pub fn dim(&self) -> i64 {
        self.dim
    }

    pub fn width(&self) -> i64 {
        self.width
    }

    pub fn height(&self) -> i64 {
        self.height
    }

    /// The full (1, dim, height, width) table.
    pub fn table(&self) -> &Tensor {
        &self.pos
    }
}

impl nn::Module for PositionEncode2D {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let size = xs.size();
        assert!(size.len() == 4, "expected a (batch, channels, height, width) input, got {size:?}");
        let (h, w) = (size[2], size[3]);
        assert!(
            h <= self.height && w <= self.width,
            "feature map {h}x{w} exceeds position grid {}x{}",
            self.height,
            self.width
        );

        xs + self.pos.i((.., .., ..h, ..w))
    }
}
