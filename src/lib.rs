//! Graph-CNN building blocks on top of candle.
//!
//! [`network::GraphCnnNetwork`] chains graph convolutions, graph pooling,
//! dense and convolutional layers, batch normalisation and an LSTM sequence
//! decoder over batches of padded graphs produced by [`data::GraphBatch`].

pub mod config;
pub mod data;
pub mod error;
pub mod network;
pub mod nn;
pub mod store;
pub mod utils;

pub use config::{DecoderConfig, NetworkConfig};
pub use error::{Error, Result};
