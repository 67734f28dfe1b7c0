use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::utils::{bias, decayed_weight, WeightDecay};

/// Hyper-parameters of [`GraphConv`] initialisation.
#[derive(Debug, Clone, Copy)]
pub struct GraphConvInit {
    pub init_factor: f64,
    pub i_factor: f64,
    pub bias_init: f64,
    pub weight_decay: f64,
}

/// Graph convolution over a dense, multi-relational adjacency.
///
/// For `V: [B, N, F]` and `A: [B, N, L, N]` the layer aggregates the
/// neighbours of every vertex once per edge kind, concatenates the `L`
/// aggregates and mixes them together with the vertex' own features:
///
/// ```text
/// out = reshape(A V, [B, N, L*F]) W + V W_I + b
/// ```
pub struct GraphConv {
    weight: Tensor,
    weight_i: Tensor,
    bias: Tensor,
}
impl GraphConv {
    pub fn new(
        in_dim: usize,
        num_edge_types: usize,
        out_dim: usize,
        init: GraphConvInit,
        vs: VarBuilder,
        decay: &mut WeightDecay,
    ) -> Result<Self> {
        let fan_in = (in_dim * (num_edge_types + 1)) as f64 * init.init_factor;
        let weight = decayed_weight(
            &vs,
            (in_dim * num_edge_types, out_dim),
            "weights",
            (1.0 / fan_in).sqrt(),
            init.weight_decay,
            decay,
        )?;
        let weight_i = decayed_weight(
            &vs,
            (in_dim, out_dim),
            "weights_i",
            (init.i_factor / fan_in).sqrt(),
            init.weight_decay,
            decay,
        )?;
        let bias = bias(&vs, out_dim, init.bias_init)?;
        Ok(Self {
            weight,
            weight_i,
            bias,
        })
    }

    pub fn forward(&self, v: &Tensor, a: &Tensor) -> Result<Tensor> {
        let (b, n, f) = v.dims3()?;
        let (_, _, l, _) = a.dims4()?;
        let neighbours = a
            .reshape((b, n * l, n))?
            .matmul(&v.contiguous()?)?
            .reshape((b, n, l * f))?;
        neighbours
            .broadcast_matmul(&self.weight)?
            .add(&v.broadcast_matmul(&self.weight_i)?)?
            .broadcast_add(&self.bias)
    }
}
