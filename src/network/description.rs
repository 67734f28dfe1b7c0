//! Compact text form of an architecture, e.g. `embed:64,gc:64,gep:32,fc:10`.

use std::{fmt, str::FromStr};

use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const LAYER_PATTERN: &str = r"^(?P<kind>[a-z]+)(?P<args>(?::[0-9]+(?:\.[0-9]+)?)*)$";

/// One layer of a [`NetworkDescription`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerSpec {
    Embed { filters: usize },
    GraphConv { filters: usize },
    GraphEmbedPool { vertices: usize },
    Fc { filters: usize },
    Conv { filters: usize },
    Pool,
    Dropout { keep_prob: f32 },
    BatchNorm,
    Rnn {
        units: usize,
        embedding_size: usize,
        vocab_size: usize,
    },
}

impl fmt::Display for LayerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerSpec::Embed { filters } => write!(f, "embed:{filters}"),
            LayerSpec::GraphConv { filters } => write!(f, "gc:{filters}"),
            LayerSpec::GraphEmbedPool { vertices } => write!(f, "gep:{vertices}"),
            LayerSpec::Fc { filters } => write!(f, "fc:{filters}"),
            LayerSpec::Conv { filters } => write!(f, "conv:{filters}"),
            LayerSpec::Pool => write!(f, "pool"),
            LayerSpec::Dropout { keep_prob } => write!(f, "dropout:{keep_prob}"),
            LayerSpec::BatchNorm => write!(f, "bn"),
            LayerSpec::Rnn {
                units,
                embedding_size,
                vocab_size,
            } => write!(f, "rnn:{units}:{embedding_size}:{vocab_size}"),
        }
    }
}

impl LayerSpec {
    fn parse_with(token: &str, re: &Regex) -> Result<Self> {
        let bad = || Error::LayerSpec(token.to_string());
        let caps = re.captures(token).ok_or_else(bad)?;
        let args: Vec<&str> = caps["args"].split(':').skip(1).collect();
        let int = |i: usize| -> Result<usize> {
            args.get(i)
                .and_then(|a| a.parse().ok())
                .ok_or_else(bad)
        };
        let spec = match (&caps["kind"], args.len()) {
            ("embed", 1) => LayerSpec::Embed { filters: int(0)? },
            ("gc", 1) => LayerSpec::GraphConv { filters: int(0)? },
            ("gep", 1) => LayerSpec::GraphEmbedPool { vertices: int(0)? },
            ("fc", 1) => LayerSpec::Fc { filters: int(0)? },
            ("conv", 1) => LayerSpec::Conv { filters: int(0)? },
            ("pool", 0) => LayerSpec::Pool,
            ("dropout", 1) => LayerSpec::Dropout {
                keep_prob: args[0].parse().map_err(|_| bad())?,
            },
            ("bn", 0) => LayerSpec::BatchNorm,
            ("rnn", 3) => LayerSpec::Rnn {
                units: int(0)?,
                embedding_size: int(1)?,
                vocab_size: int(2)?,
            },
            _ => return Err(bad()),
        };
        Ok(spec)
    }
}

impl FromStr for LayerSpec {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::parse_with(s.trim(), &Regex::new(LAYER_PATTERN)?)
    }
}

/// Ordered record of the layers a network was built from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkDescription {
    layers: Vec<LayerSpec>,
}

impl NetworkDescription {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn push(&mut self, layer: LayerSpec) {
        self.layers.push(layer);
    }
    pub fn layers(&self) -> &[LayerSpec] {
        &self.layers
    }
    pub fn len(&self) -> usize {
        self.layers.len()
    }
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl From<Vec<LayerSpec>> for NetworkDescription {
    fn from(layers: Vec<LayerSpec>) -> Self {
        Self { layers }
    }
}

impl fmt::Display for NetworkDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.layers.iter().join(","))
    }
}

impl FromStr for NetworkDescription {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let re = Regex::new(LAYER_PATTERN)?;
        let layers = s
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| LayerSpec::parse_with(token, &re))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_architecture() {
        let desc: NetworkDescription = "embed:64, gc:64,gep:8,bn,dropout:0.5,fc:10,rnn:10:4:20"
            .parse()
            .unwrap();
        assert_eq!(
            desc.layers(),
            &[
                LayerSpec::Embed { filters: 64 },
                LayerSpec::GraphConv { filters: 64 },
                LayerSpec::GraphEmbedPool { vertices: 8 },
                LayerSpec::BatchNorm,
                LayerSpec::Dropout { keep_prob: 0.5 },
                LayerSpec::Fc { filters: 10 },
                LayerSpec::Rnn {
                    units: 10,
                    embedding_size: 4,
                    vocab_size: 20
                },
            ]
        );
        assert_eq!(
            desc.to_string(),
            "embed:64,gc:64,gep:8,bn,dropout:0.5,fc:10,rnn:10:4:20"
        );
    }

    #[test]
    fn rejects_unknown_layers() {
        for bad in ["gc", "gc:x", "pool:3", "lstm:3", "rnn:1:2", "GC:3", "gc:-1"] {
            assert!(bad.parse::<LayerSpec>().is_err(), "{bad}");
        }
        assert!("".parse::<NetworkDescription>().unwrap().is_empty());
    }

    #[test]
    fn serde_form_is_tagged() {
        let json = serde_json::to_string(&LayerSpec::Conv { filters: 3 }).unwrap();
        assert_eq!(json, r#"{"kind":"conv","filters":3}"#);
        let back: LayerSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, LayerSpec::Conv { filters: 3 });
    }
}
