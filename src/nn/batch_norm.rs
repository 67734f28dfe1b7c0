use candle_core::{Result, Tensor, Var, D};
use candle_nn::{Init, VarBuilder};

use super::utils::{moments, vertex_mask};
use crate::store::ParamStore;

#[derive(Debug, Clone, Copy)]
pub struct BatchNormConfig {
    pub decay: f64,
    pub eps: f64,
    pub beta_init: f64,
}

/// Batch normalisation over every axis but the last, with optional
/// per-vertex weights so that padding does not leak into the statistics.
///
/// The moving statistics are kept outside of the trainable parameters.
pub struct MaskedBatchNorm {
    gamma: Tensor,
    beta: Tensor,
    moving_mean: Var,
    moving_var: Var,
    config: BatchNormConfig,
}
impl MaskedBatchNorm {
    pub fn new(
        num_features: usize,
        config: BatchNormConfig,
        vs: VarBuilder,
        store: &ParamStore,
    ) -> Result<Self> {
        let gamma = vs.get_with_hints(num_features, "gamma", Init::Const(1.0))?;
        let beta = vs.get_with_hints(num_features, "beta", Init::Const(config.beta_init))?;
        let prefix = vs.prefix();
        let moving_mean =
            store.moving_stat(&format!("{prefix}.moving_mean"), num_features, Init::Const(0.0))?;
        let moving_var =
            store.moving_stat(&format!("{prefix}.moving_variance"), num_features, Init::Const(1.0))?;
        Ok(Self {
            gamma,
            beta,
            moving_mean,
            moving_var,
            config,
        })
    }

    /// Moving-average decay, warmed up over the first updates when the
    /// number of updates is known.
    pub fn decay(&self, num_updates: Option<u64>) -> f64 {
        match num_updates {
            Some(n) => {
                let n = n as f64;
                self.config.decay.min((1.0 + n) / (10.0 + n))
            }
            None => self.config.decay,
        }
    }

    pub fn moving_stats(&self) -> (&Tensor, &Tensor) {
        (self.moving_mean.as_tensor(), self.moving_var.as_tensor())
    }

    pub fn forward_t(
        &self,
        xs: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
        num_updates: Option<u64>,
    ) -> Result<Tensor> {
        let (mean, var) = if train {
            let mask = match mask {
                Some(mask) if mask.rank() + 1 == xs.rank() => Some(mask.clone()),
                Some(mask) => Some(vertex_mask(mask)?.squeeze(D::Minus1)?),
                None => None,
            };
            let (mean, var) = moments(xs, mask.as_ref())?;
            let decay = self.decay(num_updates);
            self.moving_mean
                .set(&self.ema(self.moving_mean.as_tensor(), &mean, decay)?)?;
            self.moving_var
                .set(&self.ema(self.moving_var.as_tensor(), &var, decay)?)?;
            (mean, var)
        } else {
            (
                self.moving_mean.as_tensor().clone(),
                self.moving_var.as_tensor().clone(),
            )
        };
        let scale = (var + self.config.eps)?.sqrt()?.recip()?.mul(&self.gamma)?;
        xs.broadcast_sub(&mean)?
            .broadcast_mul(&scale)?
            .broadcast_add(&self.beta)
    }

    fn ema(&self, average: &Tensor, value: &Tensor, decay: f64) -> Result<Tensor> {
        (average * decay)? + (value.detach() * (1.0 - decay))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn config() -> BatchNormConfig {
        BatchNormConfig {
            decay: 0.999,
            eps: 1e-3,
            beta_init: 0.0,
        }
    }

    #[test]
    fn normalises_in_training() -> Result<()> {
        let dev = Device::Cpu;
        let store = ParamStore::new(&dev);
        let bn = MaskedBatchNorm::new(2, config(), store.var_builder().pp("bn"), &store)?;
        let xs = Tensor::new(&[[1f32, 10.], [3., 20.]], &dev)?;
        let ys = bn.forward_t(&xs, None, true, None)?;
        let (mean, _) = moments(&ys, None)?;
        for m in mean.to_vec1::<f32>()? {
            assert!(m.abs() < 1e-5);
        }
        let ys = ys.to_vec2::<f32>()?;
        assert!(ys[1][0] > 0.99 && ys[1][0] < 1.0);
        Ok(())
    }

    #[test]
    fn updates_moving_statistics() -> Result<()> {
        let dev = Device::Cpu;
        let store = ParamStore::new(&dev);
        let bn = MaskedBatchNorm::new(1, config(), store.var_builder().pp("bn"), &store)?;
        assert_eq!(bn.decay(Some(0)), 0.1);
        assert_eq!(bn.decay(None), 0.999);

        let xs = Tensor::new(&[[[2f32], [4.], [100.]]], &dev)?;
        let mask = Tensor::new(&[[1f32, 1., 0.]], &dev)?;
        bn.forward_t(&xs, Some(&mask), true, Some(0))?;
        let (mean, var) = bn.moving_stats();
        // decay 0.1: 0.1 * 0 + 0.9 * 3 and 0.1 * 1 + 0.9 * 1
        assert!((mean.to_vec1::<f32>()?[0] - 2.7).abs() < 1e-5);
        assert!((var.to_vec1::<f32>()?[0] - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn inference_uses_moving_statistics() -> Result<()> {
        let dev = Device::Cpu;
        let store = ParamStore::new(&dev);
        let bn = MaskedBatchNorm::new(1, config(), store.var_builder().pp("bn"), &store)?;
        let xs = Tensor::new(&[[5f32], [7.]], &dev)?;
        let ys = bn.forward_t(&xs, None, false, None)?.flatten_all()?.to_vec1::<f32>()?;
        let scale = 1.0 / (1.0f32 + 1e-3).sqrt();
        assert!((ys[0] - 5.0 * scale).abs() < 1e-4);
        assert!((ys[1] - 7.0 * scale).abs() < 1e-4);

        // a second layer under the same name sees the same statistics
        let again = MaskedBatchNorm::new(1, config(), store.var_builder().pp("bn"), &store)?;
        again.forward_t(&xs, None, true, None)?;
        let (mean, _) = bn.moving_stats();
        assert!(mean.to_vec1::<f32>()?[0] > 0.0);
        Ok(())
    }
}
