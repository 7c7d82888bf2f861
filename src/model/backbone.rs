use burn::prelude::*;

use crate::model::blocks::{Conv, DownStage};

/// Five stride-2 stages; returns the stride 8, 16 and 32 feature maps.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    stem: Conv<B>,
    stage1: DownStage<B>,
    stage2: DownStage<B>,
    stage3: DownStage<B>,
    stage4: DownStage<B>,
}

impl<B: Backend> Backbone<B> {
    pub fn new(device: &B::Device, width: usize) -> Self {
        Self {
            stem: Conv::new(device, 3, width, 3, 2),             // /2
            stage1: DownStage::new(device, width, width * 2),     // /4
            stage2: DownStage::new(device, width * 2, width * 4), // /8
            stage3: DownStage::new(device, width * 4, width * 8), // /16
            stage4: DownStage::new(device, width * 8, width * 16), // /32
        }
    }

    /// Channel counts of the three returned maps.
    pub fn out_channels(width: usize) -> [usize; 3] {
        [width * 4, width * 8, width * 16]
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>, Tensor<B, 4>) {
        let x = self.stem.forward(x);
        let x = self.stage1.forward(x);
        let p3 = self.stage2.forward(x);
        let p4 = self.stage3.forward(p3.clone());
        let p5 = self.stage4.forward(p4.clone());
        (p3, p4, p5)
    }
}
