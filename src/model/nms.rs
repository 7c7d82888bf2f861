use serde::{Deserialize, Serialize};

use crate::model::geometry::iou;
use crate::model::head::DecodedBox;

/// Which boxes may suppress each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionPolicy {
    /// Any kept box suppresses overlapping boxes regardless of class.
    #[default]
    Global,
    /// Only boxes of the same class suppress each other.
    PerClass,
}

/// Greedy non-maximum suppression.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Nms {
    pub iou_thres: f32,
    /// Boxes below this confidence are dropped before suppression.
    pub min_confidence: Option<f32>,
    pub policy: SuppressionPolicy,
}

impl Nms {
    pub fn new(iou_thres: f32) -> Self {
        Self {
            iou_thres,
            min_confidence: None,
            policy: SuppressionPolicy::Global,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = Some(min_confidence);
        self
    }

    pub fn with_policy(mut self, policy: SuppressionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Kept boxes in descending confidence. Equal confidences keep input order.
    pub fn apply(&self, detections: &[DecodedBox]) -> Vec<DecodedBox> {
        let mut valid: Vec<DecodedBox> = detections
            .iter()
            .filter(|d| self.min_confidence.map_or(true, |c| d.confidence >= c))
            .copied()
            .collect();

        if valid.is_empty() {
            return Vec::new();
        }

        valid.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let mut used = vec![false; valid.len()];
        let mut result = Vec::new();

        for i in 0..valid.len() {
            if used[i] {
                continue;
            }
            let current = valid[i];
            result.push(current);
            let current_box = current.bbox();

            for j in (i + 1)..valid.len() {
                if used[j] {
                    continue;
                }
                if self.policy == SuppressionPolicy::PerClass
                    && valid[j].class_id != current.class_id
                {
                    continue;
                }
                if iou(&current_box, &valid[j].bbox()) > self.iou_thres {
                    used[j] = true;
                }
            }
        }

        log::trace!("nms kept {} of {} boxes", result.len(), valid.len());
        result
    }

    pub fn apply_batch(&self, images: &[Vec<DecodedBox>]) -> Vec<Vec<DecodedBox>> {
        images.iter().map(|dets| self.apply(dets)).collect()
    }
}

/// Class-agnostic NMS without a confidence floor.
pub fn nms(detections: &[DecodedBox], iou_thres: f32) -> Vec<DecodedBox> {
    Nms::new(iou_thres).apply(detections)
}
