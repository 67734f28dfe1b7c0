use candle_core::{DType, Result, Shape, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// Collects the weights that contribute to the L2 regularisation term.
#[derive(Debug, Default, Clone)]
pub struct WeightDecay {
    terms: Vec<(Tensor, f64)>,
}
impl WeightDecay {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn register(&mut self, weight: &Tensor, wd: f64) {
        if wd > 0.0 {
            self.terms.push((weight.clone(), wd));
        }
    }
    pub fn len(&self) -> usize {
        self.terms.len()
    }
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
    /// `sum(wd * sum(w^2) / 2)`, a scalar; zero when nothing is registered.
    pub fn loss(&self) -> Result<Option<Tensor>> {
        let mut total: Option<Tensor> = None;
        for (w, wd) in &self.terms {
            let term = (w.sqr()?.sum_all()? * (wd * 0.5))?;
            total = Some(match total {
                Some(t) => (t + term)?,
                None => term,
            });
        }
        Ok(total)
    }
}

/// Normally initialised weight that is registered for weight decay.
pub(crate) fn decayed_weight<S: Into<Shape>>(
    vs: &VarBuilder,
    shape: S,
    name: &str,
    stdev: f64,
    wd: f64,
    decay: &mut WeightDecay,
) -> Result<Tensor> {
    let w = vs.get_with_hints(shape, name, Init::Randn { mean: 0.0, stdev })?;
    decay.register(&w, wd);
    Ok(w)
}

pub(crate) fn bias<S: Into<Shape>>(vs: &VarBuilder, shape: S, init: f64) -> Result<Tensor> {
    vs.get_with_hints(shape, "bias", Init::Const(init))
}

/// Brings a `[B, N]` or `[B, N, 1]` vertex mask to `[B, N, 1]`.
pub(crate) fn vertex_mask(mask: &Tensor) -> Result<Tensor> {
    match mask.rank() {
        2 => mask.unsqueeze(2),
        _ => Ok(mask.clone()),
    }
}

/// Softmax along `dim` in which positions with a zero mask get zero weight.
///
/// `mask` must broadcast against `xs`.
pub(crate) fn masked_softmax(xs: &Tensor, mask: &Tensor, dim: usize) -> Result<Tensor> {
    let mask = mask.to_dtype(xs.dtype())?.broadcast_as(xs.shape())?;
    // push masked logits far below the rest before normalising
    let penalty = ((&mask - 1.0)? * 1e9)?;
    let logits = (xs.mul(&mask)? + penalty)?;
    let max = logits.max_keepdim(dim)?;
    let exp = logits.broadcast_sub(&max)?.exp()?.mul(&mask)?;
    let sum = exp.sum_keepdim(dim)?.maximum(1e-12)?;
    exp.broadcast_div(&sum)
}

/// Mean and variance of every channel (last axis), optionally weighted by a
/// mask covering the leading axes. Returns two `[C]` tensors.
pub fn moments(xs: &Tensor, mask: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
    let channels = xs.dim(D::Minus1)?;
    let flat = xs.reshape(((), channels))?;
    let weights = match mask {
        Some(mask) => mask
            .to_dtype(xs.dtype())?
            .flatten_all()?
            .reshape(((), 1))?
            .broadcast_as(flat.shape())?
            .contiguous()?,
        None => flat.ones_like()?,
    };
    let total = weights.sum(0)?.maximum(1e-12)?;
    let mean = flat.mul(&weights)?.sum(0)?.div(&total)?;
    let centered = flat.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mul(&weights)?.sum(0)?.div(&total)?;
    Ok((mean, var))
}

pub(crate) fn ensure_f32(xs: &Tensor) -> Result<Tensor> {
    if xs.dtype() == DType::F32 {
        Ok(xs.clone())
    } else {
        xs.to_dtype(DType::F32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn masked_softmax_ignores_padding() -> Result<()> {
        let xs = Tensor::new(&[[[1f32], [2.], [50.]]], &Device::Cpu)?;
        let mask = Tensor::new(&[[[1f32], [1.], [0.]]], &Device::Cpu)?;
        let p = masked_softmax(&xs, &mask, 1)?.flatten_all()?.to_vec1::<f32>()?;
        let e = (1f32).exp();
        assert!((p[0] - 1.0 / (1.0 + e)).abs() < 1e-5);
        assert!((p[1] - e / (1.0 + e)).abs() < 1e-5);
        assert_eq!(p[2], 0.0);
        Ok(())
    }

    #[test]
    fn weighted_moments() -> Result<()> {
        let xs = Tensor::new(&[[[1f32, 10.], [3., 10.], [100., -4.]]], &Device::Cpu)?;
        let mask = Tensor::new(&[[1f32, 1., 0.]], &Device::Cpu)?;
        let (mean, var) = moments(&xs, Some(&mask))?;
        assert_eq!(mean.to_vec1::<f32>()?, vec![2., 10.]);
        assert_eq!(var.to_vec1::<f32>()?, vec![1., 0.]);

        let (mean, _) = moments(&xs, None)?;
        assert_eq!(mean.to_vec1::<f32>()?, vec![104. / 3., 16. / 3.]);
        Ok(())
    }

    #[test]
    fn weight_decay_is_half_squared_norm() -> Result<()> {
        let mut decay = WeightDecay::new();
        assert!(decay.loss()?.is_none());
        decay.register(&Tensor::new(&[1f32, 2.], &Device::Cpu)?, 0.1);
        decay.register(&Tensor::new(&[3f32], &Device::Cpu)?, 0.0);
        assert_eq!(decay.len(), 1);
        let loss = decay.loss()?.unwrap().to_scalar::<f32>()?;
        assert!((loss - 0.25).abs() < 1e-6);
        Ok(())
    }
}
