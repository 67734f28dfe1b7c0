use candle_core::{Device, IndexOp, Tensor};
use tracing::trace;

use super::graph::Graph;
use crate::error::{Error, Result};
use crate::utils::{mask_to_index, sequence_mask};

/// Dense, padded tensors of a batch of graphs.
///
/// Every graph is padded to the size of the largest one; `vertex_mask`
/// marks the real vertices and `label_mask` the real label positions.
#[derive(Debug, Clone)]
pub struct GraphBatch {
    /// `[B, N, F]` vertex features.
    pub v: Tensor,
    /// `[B, N, L, N]` adjacency, `a[b, i, l, j] = 1` for an edge `i -> j` of kind `l`.
    pub a: Tensor,
    /// `[B, T]` u32 labels padded with zeros.
    pub labels: Tensor,
    /// `[B, N]` f32.
    pub vertex_mask: Tensor,
    /// `[B, T]` f32.
    pub label_mask: Tensor,
    pub sizes: Vec<usize>,
}

impl GraphBatch {
    pub fn from_graphs(graphs: &[Graph], num_edge_types: usize, device: &Device) -> Result<Self> {
        if graphs.is_empty() {
            return Err(Error::EmptyBatch);
        }
        for (index, graph) in graphs.iter().enumerate() {
            graph.validate(index, num_edge_types)?;
        }
        let features = graphs[0].num_features();
        if let Some(index) = graphs.iter().position(|g| g.num_features() != features) {
            return Err(Error::InvalidGraph {
                index,
                reason: format!(
                    "{} features per vertex, the batch has {features}",
                    graphs[index].num_features()
                ),
            });
        }

        let b = graphs.len();
        let sizes: Vec<usize> = graphs.iter().map(Graph::num_vertices).collect();
        let n = sizes.iter().copied().max().unwrap_or(0);
        let l = num_edge_types;
        let label_lengths: Vec<usize> = graphs.iter().map(|g| g.labels.len()).collect();
        let t = label_lengths.iter().copied().max().unwrap_or(0);

        let mut v = vec![0f32; b * n * features];
        let mut a = vec![0f32; b * n * l * n];
        let mut labels = vec![0u32; b * t];
        for (i, graph) in graphs.iter().enumerate() {
            for (vertex, row) in graph.features.iter().enumerate() {
                let offset = (i * n + vertex) * features;
                v[offset..offset + features].copy_from_slice(row);
            }
            for e in &graph.edges {
                a[((i * n + e.source) * l + e.kind) * n + e.target] = 1.0;
            }
            labels[i * t..i * t + graph.labels.len()].copy_from_slice(&graph.labels);
        }
        trace!(batch = b, vertices = n, features, edge_types = l, "batched graphs");

        Ok(Self {
            v: Tensor::from_vec(v, (b, n, features), device)?,
            a: Tensor::from_vec(a, (b, n, l, n), device)?,
            labels: Tensor::from_vec(labels, (b, t), device)?,
            vertex_mask: sequence_mask(&sizes, n, device)?,
            label_mask: sequence_mask(&label_lengths, t, device)?,
            sizes,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.sizes.len()
    }

    pub fn num_edge_types(&self) -> usize {
        self.a.dims().get(2).copied().unwrap_or(0)
    }

    /// Rows of a `[B, N, ..]` per-vertex tensor that belong to real vertices
    /// of graph `index`.
    pub fn unpad_vertices(&self, xs: &Tensor, index: usize) -> Result<Tensor> {
        let keep = mask_to_index(&self.vertex_mask.i(index)?)?;
        Ok(xs.i(index)?.index_select(&keep, 0)?)
    }
}
