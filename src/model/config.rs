use serde::{Deserialize, Serialize};

use crate::error::{Result, YoloError};
use crate::model::nms::SuppressionPolicy;

/// Reference side the default anchors were measured against.
const DEFAULT_ANCHOR_BASE: f32 = 640.0;

const DEFAULT_ANCHORS_PX: [[f32; 2]; 9] = [
    [10.0, 13.0],
    [16.0, 30.0],
    [33.0, 23.0],
    [30.0, 61.0],
    [62.0, 45.0],
    [59.0, 119.0],
    [116.0, 90.0],
    [156.0, 198.0],
    [373.0, 326.0],
];

/// Detector geometry and loss hyper-parameters.
///
/// All coordinates handed to the core (anchors, ground-truth boxes) are
/// normalized by `image_size[0]`, the reference side. Scale `i` predicts with
/// the anchors in `anchor_masks[i]` at `strides[i]`.
///
/// The value is captured once by every component at construction and never
/// mutated afterwards; call [`YoloConfig::validate`] (constructors do) before
/// use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YoloConfig {
    /// Network input as `[height, width]` in pixels.
    pub image_size: [usize; 2],
    pub num_classes: usize,
    pub batch_size: usize,

    pub anchors: Vec<[f32; 2]>,
    pub anchor_masks: Vec<Vec<usize>>,
    pub strides: Vec<usize>,

    // Assignment
    pub anchor_ratio_thres: f32,
    pub only_best_anchor: bool,
    pub iou_ignore_thres: f32,

    // Loss
    pub balanced_rate: f32,

    // Inference
    pub nms_iou_thres: f32,
    pub nms_policy: SuppressionPolicy,
    pub conf_thres: f32,
}

impl Default for YoloConfig {
    fn default() -> Self {
        Self {
            image_size: [640, 640],
            num_classes: 91,
            batch_size: 3,
            anchors: DEFAULT_ANCHORS_PX
                .iter()
                .map(|[w, h]| [w / DEFAULT_ANCHOR_BASE, h / DEFAULT_ANCHOR_BASE])
                .collect(),
            anchor_masks: vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7, 8]],
            strides: vec![8, 16, 32],
            anchor_ratio_thres: 4.0,
            only_best_anchor: false,
            iou_ignore_thres: 0.5,
            balanced_rate: 20.0,
            nms_iou_thres: 0.3,
            nms_policy: SuppressionPolicy::Global,
            conf_thres: 0.5,
        }
    }
}

impl YoloConfig {
    pub fn validate(&self) -> Result<()> {
        if self.anchors.is_empty() {
            return Err(YoloError::NoAnchors);
        }
        for (index, wh) in self.anchors.iter().enumerate() {
            if !wh.iter().all(|v| v.is_finite() && *v > 0.0) {
                return Err(YoloError::InvalidAnchor { index, wh: *wh });
            }
        }

        let mut seen = vec![false; self.anchors.len()];
        for (group, mask) in self.anchor_masks.iter().enumerate() {
            if mask.is_empty() {
                return Err(YoloError::EmptyMaskGroup(group));
            }
            for &idx in mask {
                match seen.get_mut(idx) {
                    None => return Err(YoloError::MaskIndexOutOfRange(idx)),
                    Some(true) => return Err(YoloError::DuplicateMaskIndex(idx)),
                    Some(slot) => *slot = true,
                }
            }
        }
        if let Some(missing) = seen.iter().position(|s| !s) {
            return Err(YoloError::UnassignedAnchor(missing));
        }

        if self.strides.len() != self.anchor_masks.len() {
            return Err(YoloError::StrideCount {
                strides: self.strides.len(),
                scales: self.anchor_masks.len(),
            });
        }
        if self.image_size.contains(&0) {
            return Err(YoloError::invalid(
                "image_size",
                format!("{:?} has a zero side", self.image_size),
            ));
        }
        for &stride in &self.strides {
            if stride == 0
                || self.image_size[0] % stride != 0
                || self.image_size[1] % stride != 0
            {
                return Err(YoloError::StrideMismatch {
                    image_size: self.image_size,
                    stride,
                });
            }
        }

        if self.num_classes == 0 {
            return Err(YoloError::invalid("num_classes", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(YoloError::invalid("batch_size", "must be at least 1"));
        }
        if !(self.anchor_ratio_thres >= 1.0) {
            return Err(YoloError::invalid(
                "anchor_ratio_thres",
                format!("{} is below 1", self.anchor_ratio_thres),
            ));
        }
        if !(self.balanced_rate > 0.0 && self.balanced_rate.is_finite()) {
            return Err(YoloError::invalid(
                "balanced_rate",
                format!("{} is not a positive number", self.balanced_rate),
            ));
        }
        for (name, value) in [
            ("iou_ignore_thres", self.iou_ignore_thres),
            ("nms_iou_thres", self.nms_iou_thres),
            ("conf_thres", self.conf_thres),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(YoloError::invalid(name, format!("{value} is outside [0, 1]")));
            }
        }
        Ok(())
    }

    pub fn num_scales(&self) -> usize {
        self.anchor_masks.len()
    }

    /// Side length used to normalize anchors and boxes.
    pub fn reference_side(&self) -> f32 {
        self.image_size[0] as f32
    }

    /// `(grid_h, grid_w)` of a scale.
    pub fn grid_size(&self, scale: usize) -> (usize, usize) {
        let stride = self.strides[scale];
        (self.image_size[0] / stride, self.image_size[1] / stride)
    }

    /// Width of one grid cell of `scale` in normalized units.
    pub fn cell_size(&self, scale: usize) -> f32 {
        self.strides[scale] as f32 / self.reference_side()
    }

    pub fn num_channels(&self) -> usize {
        5 + self.num_classes
    }

    /// Expected raw prediction shape of `scale` for a batch.
    pub fn prediction_shape(&self, scale: usize, batch: usize) -> [usize; 5] {
        let (gh, gw) = self.grid_size(scale);
        [
            batch,
            gh,
            gw,
            self.anchor_masks[scale].len(),
            self.num_channels(),
        ]
    }

    /// Anchor sizes of a scale, in mask order.
    pub fn scale_anchors(&self, scale: usize) -> Vec<[f32; 2]> {
        self.anchor_masks[scale]
            .iter()
            .map(|&idx| self.anchors[idx])
            .collect()
    }

    /// `(scale, local index)` for every anchor index.
    pub fn anchor_locations(&self) -> Vec<(usize, usize)> {
        let mut out = vec![(0, 0); self.anchors.len()];
        for (scale, mask) in self.anchor_masks.iter().enumerate() {
            for (local, &idx) in mask.iter().enumerate() {
                out[idx] = (scale, local);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = YoloConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.grid_size(0), (80, 80));
        assert_eq!(config.grid_size(2), (20, 20));
        assert_eq!(config.prediction_shape(1, 3), [3, 40, 40, 3, 96]);
    }

    #[test]
    fn test_anchor_locations() {
        let config = YoloConfig::default();
        let locations = config.anchor_locations();
        assert_eq!(locations[0], (0, 0));
        assert_eq!(locations[4], (1, 1));
        assert_eq!(locations[8], (2, 2));
    }

    #[test]
    fn test_mask_must_partition_anchors() {
        let mut config = YoloConfig::default();
        config.anchor_masks = vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7, 7]];
        assert_eq!(config.validate(), Err(YoloError::DuplicateMaskIndex(7)));

        config.anchor_masks = vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7]];
        assert_eq!(config.validate(), Err(YoloError::UnassignedAnchor(8)));

        config.anchor_masks = vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7, 9]];
        assert_eq!(config.validate(), Err(YoloError::MaskIndexOutOfRange(9)));
    }

    #[test]
    fn test_stride_count_must_match_scales() {
        let config = YoloConfig {
            strides: vec![8, 16],
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(YoloError::StrideCount {
                strides: 2,
                scales: 3
            })
        );
    }

    #[test]
    fn test_stride_must_divide_image() {
        let config = YoloConfig {
            image_size: [600, 640],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(YoloError::StrideMismatch { stride: 16, .. })
        ));

        for image_size in [[0, 0], [0, 640], [640, 0]] {
            let config = YoloConfig {
                image_size,
                ..Default::default()
            };
            assert!(matches!(
                config.validate(),
                Err(YoloError::InvalidValue {
                    name: "image_size",
                    ..
                })
            ));
        }
    }

    #[test]
    fn test_thresholds_are_checked() {
        let config = YoloConfig {
            iou_ignore_thres: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(YoloError::InvalidValue {
                name: "iou_ignore_thres",
                ..
            })
        ));
    }
}
