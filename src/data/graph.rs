use candle_core::{DType, IndexOp, Tensor};

use crate::error::{Error, Result};

/// Directed edge `source -> target` of relation `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub source: usize,
    pub target: usize,
    pub kind: usize,
}
impl Edge {
    pub fn new(source: usize, target: usize, kind: usize) -> Self {
        Self {
            source,
            target,
            kind,
        }
    }
}

/// A single graph with per-vertex features and its target labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    pub features: Vec<Vec<f32>>,
    pub edges: Vec<Edge>,
    pub labels: Vec<u32>,
}
impl Graph {
    pub fn new(features: Vec<Vec<f32>>, edges: Vec<Edge>, labels: Vec<u32>) -> Self {
        Self {
            features,
            edges,
            labels,
        }
    }

    /// Builds a graph from an `[N, F]` feature matrix and a `[2, E]` edge
    /// index whose first row holds sources. All edges get kind 0 and are
    /// taken as directed; chain [`undirected`](Self::undirected) otherwise.
    pub fn from_edge_index(x: &Tensor, edge_index: &Tensor, labels: Vec<u32>) -> Result<Self> {
        let features = x.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let edge_index = edge_index.to_dtype(DType::U32)?;
        let source = edge_index.i((0, ..))?.to_vec1::<u32>()?;
        let target = edge_index.i((1, ..))?.to_vec1::<u32>()?;
        let edges = source
            .into_iter()
            .zip(target)
            .map(|(s, t)| Edge::new(s as usize, t as usize, 0))
            .collect();
        Ok(Self::new(features, edges, labels))
    }

    pub fn num_vertices(&self) -> usize {
        self.features.len()
    }

    pub fn num_features(&self) -> usize {
        self.features.first().map_or(0, Vec::len)
    }

    /// Adds the reverse of every edge that is missing it.
    pub fn undirected(mut self) -> Self {
        let mut seen: std::collections::HashSet<Edge> = self.edges.iter().copied().collect();
        let reversed: Vec<Edge> = self
            .edges
            .iter()
            .map(|e| Edge::new(e.target, e.source, e.kind))
            .filter(|e| seen.insert(*e))
            .collect();
        self.edges.extend(reversed);
        self
    }

    pub(crate) fn validate(&self, index: usize, num_edge_types: usize) -> Result<()> {
        let invalid = |reason: String| Error::InvalidGraph { index, reason };
        let n = self.num_vertices();
        if n == 0 {
            return Err(invalid("graph has no vertices".into()));
        }
        let f = self.num_features();
        if let Some(v) = self.features.iter().position(|row| row.len() != f) {
            return Err(invalid(format!(
                "vertex {v} has {} features, expected {f}",
                self.features[v].len()
            )));
        }
        for e in &self.edges {
            if e.source >= n || e.target >= n {
                return Err(invalid(format!(
                    "edge {} -> {} out of range for {n} vertices",
                    e.source, e.target
                )));
            }
            if e.kind >= num_edge_types {
                return Err(invalid(format!(
                    "edge kind {} but only {num_edge_types} kinds",
                    e.kind
                )));
            }
        }
        Ok(())
    }
}
