use candle_core::Device;

use super::{batch::GraphBatch, graph::Graph};
use crate::error::Result;

/// Iterates over consecutive batches of `batch_size` graphs; the last batch
/// may be smaller.
pub struct GraphBatchLoader<'a> {
    graphs: &'a [Graph],
    batch_size: usize,
    num_edge_types: usize,
    device: &'a Device,
    position: usize,
}
impl<'a> GraphBatchLoader<'a> {
    pub fn new(
        graphs: &'a [Graph],
        batch_size: usize,
        num_edge_types: usize,
        device: &'a Device,
    ) -> Self {
        Self {
            graphs,
            batch_size: batch_size.max(1),
            num_edge_types,
            device,
            position: 0,
        }
    }

    pub fn num_batches(&self) -> usize {
        self.graphs.len().div_ceil(self.batch_size)
    }
}

impl<'a> Iterator for GraphBatchLoader<'a> {
    type Item = Result<GraphBatch>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.graphs.len() {
            None
        } else {
            let end = (self.position + self.batch_size).min(self.graphs.len());
            let chunk = &self.graphs[self.position..end];
            self.position = end;
            Some(GraphBatch::from_graphs(
                chunk,
                self.num_edge_types,
                self.device,
            ))
        }
    }
}
