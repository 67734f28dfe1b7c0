use std::{fmt, str::FromStr};

use candle_core::{bail, Result, Tensor};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

use super::utils::{bias, decayed_weight, WeightDecay};

/// Border handling of convolutions and pooling, with TensorFlow semantics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    /// Output size is `ceil(in / stride)`; odd padding goes to the end.
    #[default]
    Same,
    /// No padding; windows that do not fit are dropped.
    Valid,
}
impl Padding {
    /// `(before, after)` padding of one spatial axis.
    pub fn amounts(&self, size: usize, kernel: usize, stride: usize) -> (usize, usize) {
        match self {
            Padding::Valid => (0, 0),
            Padding::Same => {
                let stride = stride.max(1);
                let out = size.div_ceil(stride);
                let total = (out.saturating_sub(1) * stride + kernel).saturating_sub(size);
                (total / 2, total - total / 2)
            }
        }
    }
}
impl fmt::Display for Padding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Padding::Same => write!(f, "same"),
            Padding::Valid => write!(f, "valid"),
        }
    }
}
impl FromStr for Padding {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "same" => Ok(Padding::Same),
            "valid" => Ok(Padding::Valid),
            other => Err(format!("unknown padding {other}")),
        }
    }
}

/// Pads the spatial axes (2 and 3) of an NCHW tensor.
fn pad_spatial(
    xs: &Tensor,
    kernel: usize,
    stride: usize,
    padding: Padding,
    replicate: bool,
) -> Result<Tensor> {
    let (_, _, h, w) = xs.dims4()?;
    if h == 0 || w == 0 {
        bail!("empty spatial axes {h}x{w}")
    }
    let mut xs = xs.clone();
    for (dim, size) in [(2, h), (3, w)] {
        let (before, after) = padding.amounts(size, kernel, stride);
        if before + after > 0 {
            xs = if replicate {
                xs.pad_with_same(dim, before, after)?
            } else {
                xs.pad_with_zeros(dim, before, after)?
            };
        }
    }
    Ok(xs)
}

/// 2D convolution over channels-last input `[B, H, W, C]`.
pub struct Conv2dLayer {
    kernel: Tensor,
    bias: Tensor,
    filter_size: usize,
    stride: usize,
    padding: Padding,
}
impl Conv2dLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        filter_size: usize,
        stride: usize,
        padding: Padding,
        bias_init: f64,
        wd: f64,
        vs: VarBuilder,
        decay: &mut WeightDecay,
    ) -> Result<Self> {
        if filter_size == 0 || stride == 0 {
            bail!("convolution needs a positive filter size and stride, got {filter_size} and {stride}")
        }
        let stdev = (1.0 / (out_channels * filter_size * filter_size) as f64).sqrt();
        let kernel = decayed_weight(
            &vs,
            (out_channels, in_channels, filter_size, filter_size),
            "weights",
            stdev,
            wd,
            decay,
        )?;
        let bias = bias(&vs, out_channels, bias_init)?;
        Ok(Self {
            kernel,
            bias,
            filter_size,
            stride,
            padding,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = xs.permute((0, 3, 1, 2))?.contiguous()?;
        let xs = pad_spatial(&xs, self.filter_size, self.stride, self.padding, false)?;
        let out_channels = self.bias.dims1()?;
        xs.conv2d(&self.kernel, 0, self.stride, 1, 1)?
            .broadcast_add(&self.bias.reshape((1, out_channels, 1, 1))?)?
            .permute((0, 2, 3, 1))?
            .contiguous()
    }
}

/// 3x3 max pooling with stride 2 over channels-last input.
pub fn max_pool(xs: &Tensor, padding: Padding) -> Result<Tensor> {
    const KERNEL: usize = 3;
    const STRIDE: usize = 2;
    let xs = xs.permute((0, 3, 1, 2))?.contiguous()?;
    // edge replication never wins over the edge value itself inside a window
    let xs = pad_spatial(&xs, KERNEL, STRIDE, padding, true)?;
    xs.max_pool2d_with_stride(KERNEL, STRIDE)?
        .permute((0, 2, 3, 1))?
        .contiguous()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ParamStore;
    use candle_core::{DType, Device};

    #[test]
    fn same_padding_amounts() {
        assert_eq!(Padding::Same.amounts(5, 3, 1), (1, 1));
        assert_eq!(Padding::Same.amounts(5, 3, 2), (1, 1));
        assert_eq!(Padding::Same.amounts(4, 3, 2), (0, 1));
        assert_eq!(Padding::Same.amounts(4, 1, 1), (0, 0));
        assert_eq!(Padding::Valid.amounts(5, 3, 1), (0, 0));
        assert_eq!(Padding::Same.amounts(0, 3, 0), (1, 2));
        assert_eq!("VALID".parse::<Padding>(), Ok(Padding::Valid));
        assert!("full".parse::<Padding>().is_err());
    }

    #[test]
    fn conv_output_shapes() -> Result<()> {
        let dev = Device::Cpu;
        let store = ParamStore::new(&dev);
        let mut decay = WeightDecay::new();
        let xs = Tensor::randn(0f32, 1., (2, 7, 7, 3), &dev)?;
        let same = Conv2dLayer::new(
            3, 4, 3, 2, Padding::Same, 0.1, 0.0005, store.var_builder().pp("a"), &mut decay,
        )?;
        assert_eq!(same.forward(&xs)?.dims(), &[2, 4, 4, 4]);
        let valid = Conv2dLayer::new(
            3, 4, 3, 1, Padding::Valid, 0.1, 0.0005, store.var_builder().pp("b"), &mut decay,
        )?;
        assert_eq!(valid.forward(&xs)?.dims(), &[2, 5, 5, 4]);
        assert_eq!(decay.len(), 2);
        Ok(())
    }

    #[test]
    fn rejects_degenerate_convolutions() -> Result<()> {
        let dev = Device::Cpu;
        let store = ParamStore::new(&dev);
        let mut decay = WeightDecay::new();
        let vs = store.var_builder();
        assert!(Conv2dLayer::new(2, 2, 3, 0, Padding::Same, 0.1, 0.0, vs.pp("s"), &mut decay).is_err());
        assert!(Conv2dLayer::new(2, 2, 0, 1, Padding::Same, 0.1, 0.0, vs.pp("k"), &mut decay).is_err());

        let conv = Conv2dLayer::new(2, 2, 3, 1, Padding::Same, 0.1, 0.0, vs.pp("ok"), &mut decay)?;
        let empty = Tensor::zeros((1, 0, 4, 2), DType::F32, &dev)?;
        assert!(conv.forward(&empty).is_err());
        assert!(max_pool(&empty, Padding::Same).is_err());
        Ok(())
    }

    #[test]
    fn pooling_takes_window_maximum() -> Result<()> {
        let dev = Device::Cpu;
        let xs = Tensor::arange(0f32, 16., &dev)?.reshape((1, 4, 4, 1))?;
        let same = max_pool(&xs, Padding::Same)?;
        assert_eq!(same.dims(), &[1, 2, 2, 1]);
        assert_eq!(same.flatten_all()?.to_vec1::<f32>()?, vec![10., 11., 14., 15.]);
        let valid = max_pool(&xs, Padding::Valid)?;
        assert_eq!(valid.flatten_all()?.to_vec1::<f32>()?, vec![10.]);

        let neg = (Tensor::ones((1, 3, 3, 2), DType::F32, &dev)? * -5.0)?;
        let pooled = max_pool(&neg, Padding::Same)?;
        assert_eq!(pooled.dims(), &[1, 2, 2, 2]);
        assert!(pooled.flatten_all()?.to_vec1::<f32>()?.iter().all(|&x| x == -5.0));
        Ok(())
    }
}
