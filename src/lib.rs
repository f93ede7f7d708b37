pub mod attention;
pub mod config;
pub mod layer;
pub mod model;
pub mod position_encoding;
pub mod transformer;

pub use attention::{AttentionCache, MultiheadAttention};
pub use config::{DecoderConfig, EncoderConfig, ModelConfig};
pub use layer::{DecoderLayer, EncoderLayer, LayerState, TransformerDecoderLayer, TransformerEncoderLayer};
pub use model::CaptionModel;
pub use position_encoding::{PositionEncode1D, PositionEncode2D};
pub use transformer::{future_mask, IncrementalState, TransformerDecode, TransformerEncode};
