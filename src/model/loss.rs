use burn::prelude::*;
use burn::tensor::ElementConversion;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::data::GroundTruthBatch;
use crate::error::{Result, YoloError};
use crate::model::assigner::TargetAssigner;
use crate::model::config::YoloConfig;
use crate::model::geometry::ciou_loss_tensor;
use crate::model::head::YoloHead;

/// Numerically stable binary cross-entropy on logits, element-wise.
pub fn bce_with_logits<B: Backend, const D: usize>(
    logits: Tensor<B, D>,
    targets: Tensor<B, D>,
) -> Tensor<B, D> {
    logits.clone().clamp_min(0.0) - logits.clone() * targets + logits.abs().neg().exp().log1p()
}

/// The five loss terms of one batch, each a scalar tensor.
///
/// `xy` and `wh` are reported for monitoring; [`LossOutput::total`] optimizes
/// `box_loss + obj + cls`.
#[derive(Debug, Clone)]
pub struct LossOutput<B: Backend> {
    pub xy: Tensor<B, 1>,
    pub wh: Tensor<B, 1>,
    pub box_loss: Tensor<B, 1>,
    pub obj: Tensor<B, 1>,
    pub cls: Tensor<B, 1>,
    pub num_positive: usize,
}

impl<B: Backend> LossOutput<B> {
    pub fn total(&self) -> Tensor<B, 1> {
        self.box_loss.clone() + self.obj.clone() + self.cls.clone()
    }

    pub fn summary(&self) -> LossSummary {
        let scalar = |t: &Tensor<B, 1>| t.clone().into_scalar().elem::<f32>();
        let box_loss = scalar(&self.box_loss);
        let obj = scalar(&self.obj);
        let cls = scalar(&self.cls);
        LossSummary {
            xy: scalar(&self.xy),
            wh: scalar(&self.wh),
            box_loss,
            obj,
            cls,
            total: box_loss + obj + cls,
            num_positive: self.num_positive,
        }
    }
}

/// Host-side copy of a [`LossOutput`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LossSummary {
    pub xy: f32,
    pub wh: f32,
    pub box_loss: f32,
    pub obj: f32,
    pub cls: f32,
    pub total: f32,
    pub num_positive: usize,
}

impl fmt::Display for LossSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total {:.4} | box {:.4} obj {:.4} cls {:.4} | xy {:.4} wh {:.4} | pos {}",
            self.total, self.box_loss, self.obj, self.cls, self.xy, self.wh, self.num_positive
        )
    }
}

/// Assigns targets and evaluates all loss terms over every scale.
#[derive(Debug, Clone)]
pub struct YoloLoss {
    assigner: TargetAssigner,
    head: YoloHead,
    /// Background weight per scale, `cells(coarsest) / cells(scale)`.
    neg_weights: Vec<f32>,
    balanced_rate: f32,
}

impl YoloLoss {
    pub fn new(config: &YoloConfig) -> Result<Self> {
        let assigner = TargetAssigner::new(config)?;
        let head = YoloHead::new(config)?;
        let cells: Vec<usize> = (0..config.num_scales())
            .map(|s| {
                let (gh, gw) = config.grid_size(s);
                gh * gw
            })
            .collect();
        let coarsest = cells.iter().copied().min().unwrap_or(1);
        let neg_weights = cells.iter().map(|&c| coarsest as f32 / c as f32).collect();
        Ok(Self {
            assigner,
            head,
            neg_weights,
            balanced_rate: config.balanced_rate,
        })
    }

    pub fn config(&self) -> &YoloConfig {
        self.head.config()
    }

    pub fn compute<B: Backend>(
        &self,
        preds: &[Tensor<B, 5>],
        gt: &GroundTruthBatch,
    ) -> Result<LossOutput<B>> {
        let num_scales = self.config().num_scales();
        if preds.len() != num_scales {
            return Err(YoloError::ScaleCount {
                expected: num_scales,
                actual: preds.len(),
            });
        }
        let batch = gt.batch_size();
        for (scale, pred) in preds.iter().enumerate() {
            self.head.check_shape(scale, pred.dims(), batch)?;
        }

        let device = preds[0].device();
        let targets = self.assigner.assign(gt);
        let num_positive: usize = targets.iter().map(|t| t.num_positive()).sum();

        let mut xy = Tensor::<B, 1>::zeros([1], &device);
        let mut wh = Tensor::<B, 1>::zeros([1], &device);
        let mut box_loss = Tensor::<B, 1>::zeros([1], &device);
        let mut obj = Tensor::<B, 1>::zeros([1], &device);
        let mut cls = Tensor::<B, 1>::zeros([1], &device);

        for (scale, (pred, scale_targets)) in preds.iter().zip(&targets).enumerate() {
            let head = self.head.decode_scale(scale, pred.clone())?;
            let target = scale_targets.target_tensor::<B>(&device);
            let gt_boxes = scale_targets.box_tensor::<B>(&device);
            let ignore = scale_targets.ignore_tensor::<B>(&device);

            let pos = target.clone().narrow(4, 4, 1);
            let neg = (pos.clone().neg() + 1.0) * (ignore.neg() + 1.0);
            let num_classes = target.dims()[4] - 5;

            xy = xy + (bce_with_logits(head.txy, target.clone().narrow(4, 0, 2)) * pos.clone()).sum();

            let wh_diff = head.twh - target.clone().narrow(4, 2, 2);
            wh = wh + (wh_diff.clone() * wh_diff * pos.clone()).sum();

            box_loss = box_loss + (ciou_loss_tensor(head.boxes, gt_boxes) * pos.clone()).sum();

            cls = cls
                + (bce_with_logits(head.cls, target.narrow(4, 5, num_classes)) * pos.clone()).sum();

            let obj_weight = pos.clone() * self.balanced_rate + neg * self.neg_weights[scale];
            obj = obj + (bce_with_logits(head.obj, pos) * obj_weight).sum();
        }

        // Every term is exactly zero when the batch holds no positives.
        let pos_norm = if num_positive > 0 {
            1.0 / num_positive as f32
        } else {
            0.0
        };
        let obj_norm = if num_positive > 0 { 1.0 / batch as f32 } else { 0.0 };

        let output = LossOutput {
            xy: xy * pos_norm,
            wh: wh * pos_norm,
            box_loss: box_loss * pos_norm,
            obj: obj * obj_norm,
            cls: cls * pos_norm,
            num_positive,
        };
        log::debug!("loss over {} images, {} positives", batch, num_positive);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::GroundTruth;
    use crate::model::geometry::BBox;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray;
    type TestAutodiffBackend = Autodiff<NdArray>;

    fn small_config() -> YoloConfig {
        YoloConfig {
            image_size: [64, 64],
            num_classes: 3,
            batch_size: 2,
            ..Default::default()
        }
    }

    fn zero_preds<B: Backend>(config: &YoloConfig, batch: usize) -> Vec<Tensor<B, 5>> {
        let device = Default::default();
        (0..config.num_scales())
            .map(|s| Tensor::zeros(config.prediction_shape(s, batch), &device))
            .collect()
    }

    fn one_box_batch() -> GroundTruthBatch {
        GroundTruthBatch::from_instances(
            &[
                vec![GroundTruth::new(BBox::new(0.3, 0.3, 0.6, 0.7), 1)],
                vec![],
            ],
            4,
        )
    }

    #[test]
    fn test_bce_with_logits_matches_reference() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 1>::from_floats([0.0, 2.0, -3.0], &device);
        let targets = Tensor::<TestBackend, 1>::from_floats([1.0, 0.0, 1.0], &device);
        let out = bce_with_logits(logits, targets)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        let reference = |x: f32, z: f32| {
            let p = 1.0 / (1.0 + (-x).exp());
            -(z * p.ln() + (1.0 - z) * (1.0 - p).ln())
        };
        assert!((out[0] - reference(0.0, 1.0)).abs() < 1e-5);
        assert!((out[1] - reference(2.0, 0.0)).abs() < 1e-5);
        assert!((out[2] - reference(-3.0, 1.0)).abs() < 1e-5);
    }

    #[test]
    fn test_no_ground_truth_gives_exact_zero() {
        let config = small_config();
        let loss = YoloLoss::new(&config).unwrap();
        let preds = zero_preds::<TestBackend>(&config, 2);
        let empty = GroundTruthBatch::from_instances(&[vec![], vec![]], 4);

        let summary = loss.compute(&preds, &empty).unwrap().summary();
        assert_eq!(summary.num_positive, 0);
        assert_eq!(summary.xy, 0.0);
        assert_eq!(summary.wh, 0.0);
        assert_eq!(summary.box_loss, 0.0);
        assert_eq!(summary.obj, 0.0);
        assert_eq!(summary.cls, 0.0);
        assert_eq!(summary.total, 0.0);
    }

    #[test]
    fn test_losses_are_finite_and_non_negative() {
        let config = small_config();
        let loss = YoloLoss::new(&config).unwrap();
        let preds = zero_preds::<TestBackend>(&config, 2);

        let summary = loss.compute(&preds, &one_box_batch()).unwrap().summary();
        assert!(summary.num_positive >= 1 && summary.num_positive <= 3);
        for value in [summary.xy, summary.wh, summary.box_loss, summary.obj, summary.cls] {
            assert!(value.is_finite());
            assert!(value >= 0.0);
        }
        assert!(summary.obj > 0.0);
        assert!(summary.cls > 0.0);
        assert!((summary.total - (summary.box_loss + summary.obj + summary.cls)).abs() < 1e-5);
    }

    #[test]
    fn test_random_predictions_stay_finite() {
        let config = small_config();
        let loss = YoloLoss::new(&config).unwrap();
        let device = Default::default();
        let preds: Vec<Tensor<TestBackend, 5>> = (0..3)
            .map(|s| {
                Tensor::random(
                    config.prediction_shape(s, 2),
                    burn::tensor::Distribution::Uniform(-20.0, 20.0),
                    &device,
                )
            })
            .collect();
        let summary = loss.compute(&preds, &one_box_batch()).unwrap().summary();
        assert!(summary.total.is_finite());
    }

    #[test]
    fn test_gradients_reach_predictions() {
        let config = small_config();
        let loss = YoloLoss::new(&config).unwrap();
        let preds: Vec<Tensor<TestAutodiffBackend, 5>> = zero_preds(&config, 2)
            .into_iter()
            .map(|p| p.require_grad())
            .collect();

        let output = loss.compute(&preds, &one_box_batch()).unwrap();
        let grads = output.total().backward();
        let grad_norms: Vec<f32> = preds
            .iter()
            .map(|p| {
                let g = p.grad(&grads).expect("gradient");
                g.abs().sum().into_scalar().elem::<f32>()
            })
            .collect();
        assert!(grad_norms.iter().all(|g| g.is_finite()));
        assert!(grad_norms.iter().sum::<f32>() > 0.0);
    }

    #[test]
    fn test_rejects_mismatched_inputs() {
        let config = small_config();
        let loss = YoloLoss::new(&config).unwrap();
        let preds = zero_preds::<TestBackend>(&config, 2);

        assert!(matches!(
            loss.compute(&preds[..2], &one_box_batch()),
            Err(YoloError::ScaleCount { .. })
        ));

        let single = GroundTruthBatch::from_instances(&[vec![]], 4);
        assert!(matches!(
            loss.compute(&preds, &single),
            Err(YoloError::ShapeMismatch { scale: 0, .. })
        ));
    }
}
