//! Hyper-parameters shared by every layer the builder creates.
//!
//! All fields have defaults, so a JSON file only needs to mention what it
//! overrides:
//!
//! ```json
//! { "weight_decay": 0.0001, "decoder": { "beam_width": 4 } }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// L2 coefficient of decayed weights.
    pub weight_decay: f64,
    /// Initial value of every bias and of batch-norm offsets.
    pub bias_init: f64,
    /// Upper bound of the moving-average decay of batch norm.
    pub bn_decay: f64,
    pub bn_epsilon: f64,
    /// Scales the fan-in used to initialise graph convolutions.
    pub graphcnn_init_factor: f64,
    /// Relative variance of the self-connection weights of graph convolutions.
    pub graphcnn_i_factor: f64,
    pub decoder: DecoderConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            weight_decay: 0.0005,
            bias_init: 0.1,
            bn_decay: 0.999,
            bn_epsilon: 1e-3,
            graphcnn_init_factor: 1.0,
            graphcnn_i_factor: 1.0,
            decoder: DecoderConfig::default(),
        }
    }
}

impl NetworkConfig {
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub go_token: u32,
    pub end_token: u32,
    pub beam_width: usize,
    pub max_decode_len: usize,
    /// GNMT length penalty exponent; 0 disables the penalty.
    pub length_penalty: f64,
    /// LSTM weights are drawn from uniform(-init_range, init_range).
    pub init_range: f64,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            go_token: 1,
            end_token: 2,
            beam_width: 16,
            max_decode_len: 300,
            length_penalty: 0.0,
            init_range: 0.1,
        }
    }
}
