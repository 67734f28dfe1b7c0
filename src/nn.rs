pub mod utils;
pub use utils::{moments, WeightDecay};

mod embedding;
pub use embedding::Embedding;
mod graph_conv;
pub use graph_conv::{GraphConv, GraphConvInit};
mod graph_pool;
pub use graph_pool::GraphEmbedPool;
mod batch_norm;
pub use batch_norm::{BatchNormConfig, MaskedBatchNorm};
mod conv;
pub use conv::{max_pool, Conv2dLayer, Padding};

pub mod beam;
mod decoder;
pub use decoder::{masked_sequence_loss, sequence_loss, DecodeOutput, SequenceDecoder};
