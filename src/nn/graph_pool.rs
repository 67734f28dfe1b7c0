use candle_core::{Result, Tensor};
use candle_nn::{Module, VarBuilder};

use super::{
    embedding::Embedding,
    utils::{masked_softmax, vertex_mask, WeightDecay},
};

/// Learned soft assignment of the `N` vertices of each graph onto `P`
/// pooled vertices.
///
/// The assignment ("factors") is an embedding of `V` normalised over the
/// vertex axis. Pooled features are `factorsᵀ V`; the pooled adjacency is
/// `factorsᵀ A factors`, computed per edge kind.
pub struct GraphEmbedPool {
    factors: Embedding,
    no_vertices: usize,
}
impl GraphEmbedPool {
    pub fn new(
        in_dim: usize,
        no_vertices: usize,
        bias_init: f64,
        wd: f64,
        vs: VarBuilder,
        decay: &mut WeightDecay,
    ) -> Result<Self> {
        Ok(Self {
            factors: Embedding::new(in_dim, no_vertices, bias_init, wd, vs.pp("factors"), decay)?,
            no_vertices,
        })
    }

    /// Returns the pooled `(V, A)`.
    ///
    /// With a single output vertex `V` collapses to `[B, F]` and `A` is
    /// passed through untouched.
    pub fn forward(
        &self,
        v: &Tensor,
        a: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (b, n, f) = v.dims3()?;
        let factors = self.factors.forward(v)?;
        let factors = match mask {
            Some(mask) => masked_softmax(&factors, &vertex_mask(mask)?, 1)?,
            None => candle_nn::ops::softmax(&factors, 1)?,
        };
        let factors_t = factors.transpose(1, 2)?.contiguous()?;
        let pooled = factors_t.matmul(&v.contiguous()?)?;
        if self.no_vertices == 1 {
            return Ok((pooled.reshape((b, f))?, a.cloned()));
        }
        let a = match a {
            Some(a) => {
                let (_, _, l, _) = a.dims4()?;
                let p = self.no_vertices;
                let pooled_a = a.reshape((b, n * l, n))?.matmul(&factors)?;
                let pooled_a = pooled_a.reshape((b, n, l * p))?;
                Some(factors_t.matmul(&pooled_a)?.reshape((b, p, l, p))?)
            }
            None => None,
        };
        Ok((pooled, a))
    }
}
