use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation;

/// Conv2d -> BatchNorm -> SiLU with "same" padding.
#[derive(Module, Debug)]
pub struct Conv<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> Conv<B> {
    pub fn new(
        device: &B::Device,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
    ) -> Self {
        let padding = kernel_size / 2;

        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        activation::silu(self.bn.forward(self.conv.forward(x)))
    }
}

/// Downsampling stage: a stride-2 conv followed by a 3x3 refinement conv.
#[derive(Module, Debug)]
pub struct DownStage<B: Backend> {
    down: Conv<B>,
    refine: Conv<B>,
}

impl<B: Backend> DownStage<B> {
    pub fn new(device: &B::Device, in_channels: usize, out_channels: usize) -> Self {
        Self {
            down: Conv::new(device, in_channels, out_channels, 3, 2),
            refine: Conv::new(device, out_channels, out_channels, 3, 1),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.refine.forward(self.down.forward(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_stride_two_halves_resolution() {
        let device = Default::default();
        let stage = DownStage::<TestBackend>::new(&device, 3, 8);
        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 48], &device);
        assert_eq!(stage.forward(x).dims(), [2, 8, 16, 24]);
    }

    #[test]
    fn test_pointwise_conv_keeps_resolution() {
        let device = Default::default();
        let conv = Conv::<TestBackend>::new(&device, 4, 6, 1, 1);
        let x = Tensor::<TestBackend, 4>::zeros([1, 4, 10, 10], &device);
        assert_eq!(conv.forward(x).dims(), [1, 6, 10, 10]);
    }
}
