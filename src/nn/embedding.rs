use candle_core::{Result, Tensor, D};
use candle_nn::{Module, VarBuilder};

use super::utils::{bias, decayed_weight, WeightDecay};

/// Dense projection of the last axis, i.e. a graph filter with zero hops.
///
/// Any number of leading axes is allowed: `[.., F] -> [.., out]`.
pub struct Embedding {
    weight: Tensor,
    bias: Tensor,
}
impl Embedding {
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        bias_init: f64,
        wd: f64,
        vs: VarBuilder,
        decay: &mut WeightDecay,
    ) -> Result<Self> {
        let stdev = 1.0 / (in_dim as f64).sqrt();
        let weight = decayed_weight(&vs, (in_dim, out_dim), "weights", stdev, wd, decay)?;
        let bias = bias(&vs, out_dim, bias_init)?;
        Ok(Self { weight, bias })
    }
    pub fn out_dim(&self) -> usize {
        self.bias.dims1().unwrap_or(0)
    }
}
impl Module for Embedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let in_dim = xs.dim(D::Minus1)?;
        let mut dims = xs.dims().to_vec();
        let (_, out_dim) = self.weight.dims2()?;
        if let Some(last) = dims.last_mut() {
            *last = out_dim;
        }
        xs.reshape(((), in_dim))?
            .matmul(&self.weight)?
            .broadcast_add(&self.bias)?
            .reshape(dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ParamStore;
    use candle_core::Device;

    #[test]
    fn keeps_leading_axes() -> Result<()> {
        let store = ParamStore::new(&Device::Cpu);
        let mut decay = WeightDecay::new();
        let embed = Embedding::new(3, 5, 0.1, 0.0005, store.var_builder().pp("e"), &mut decay)?;
        assert_eq!(embed.out_dim(), 5);
        assert_eq!(decay.len(), 1);

        let xs = Tensor::zeros((2, 4, 3), candle_core::DType::F32, &Device::Cpu)?;
        let ys = embed.forward(&xs)?;
        assert_eq!(ys.dims(), &[2, 4, 5]);
        // zero input leaves only the bias
        let ys = ys.flatten_all()?.to_vec1::<f32>()?;
        assert!(ys.iter().all(|y| (y - 0.1).abs() < 1e-6));
        Ok(())
    }
}
