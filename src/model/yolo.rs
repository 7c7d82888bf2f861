use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::prelude::*;

use super::backbone::Backbone;
use super::config::YoloConfig;
use super::head::{DecodedBox, YoloHead};
use super::nms::Nms;
use crate::error::{Result, YoloError};

/// Base channel width of [`YoloNet`].
const BASE_WIDTH: usize = 16;

/// Strides produced by the backbone, finest first.
pub const NETWORK_STRIDES: [usize; 3] = [8, 16, 32];

/// Anything that maps an NCHW image batch to per-scale raw predictions of
/// shape `[batch, grid_h, grid_w, anchors, 5 + num_classes]`, finest scale
/// first.
pub trait YoloNetwork<B: Backend> {
    fn forward(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 5>>;
}

#[derive(Module, Debug)]
pub struct YoloNet<B: Backend> {
    pub backbone: Backbone<B>,
    preds: Vec<Conv2d<B>>,
    num_classes: usize,
}

impl<B: Backend> YoloNet<B> {
    pub fn new(device: &B::Device, config: &YoloConfig) -> Result<Self> {
        config.validate()?;
        if config.strides != NETWORK_STRIDES {
            return Err(YoloError::invalid(
                "strides",
                format!("network produces {:?}, config has {:?}", NETWORK_STRIDES, config.strides),
            ));
        }

        let channels = config.num_channels();
        let preds = Backbone::<B>::out_channels(BASE_WIDTH)
            .iter()
            .zip(&config.anchor_masks)
            .map(|(&in_ch, mask)| Conv2dConfig::new([in_ch, mask.len() * channels], [1, 1]).init(device))
            .collect();

        log::info!(
            "YoloNet: {} classes, anchors per scale {:?}",
            config.num_classes,
            config.anchor_masks.iter().map(Vec::len).collect::<Vec<_>>()
        );

        Ok(Self {
            backbone: Backbone::new(device, BASE_WIDTH),
            preds,
            num_classes: config.num_classes,
        })
    }

    /// `[B, A*(5+C), H, W]` -> `[B, H, W, A, 5+C]`.
    fn to_anchor_layout(&self, x: Tensor<B, 4>) -> Tensor<B, 5> {
        let [b, ch, h, w] = x.dims();
        let channels = 5 + self.num_classes;
        x.reshape([b, ch / channels, channels, h, w])
            .permute([0, 3, 4, 1, 2])
    }

    /// Runs the network, decodes every scale and applies NMS per image.
    pub fn predict(&self, images: Tensor<B, 4>, config: &YoloConfig) -> Result<Vec<Vec<DecodedBox>>> {
        let head = YoloHead::new(config)?;
        let nms = Nms::new(config.nms_iou_thres)
            .with_min_confidence(config.conf_thres)
            .with_policy(config.nms_policy);
        let decoded = head.decode_boxes(&self.forward(images))?;
        Ok(nms.apply_batch(&decoded))
    }
}

impl<B: Backend> YoloNetwork<B> for YoloNet<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 5>> {
        let (p3, p4, p5) = self.backbone.forward(images);
        [p3, p4, p5]
            .into_iter()
            .zip(&self.preds)
            .map(|(feature, pred)| self.to_anchor_layout(pred.forward(feature)))
            .collect()
    }
}
