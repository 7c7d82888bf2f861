use crate::error::{Result, YoloError};
use crate::model::geometry::BBox;

/// One labelled object, box normalized by the reference side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundTruth {
    pub bbox: BBox,
    pub class_id: usize,
}

impl GroundTruth {
    pub fn new(bbox: BBox, class_id: usize) -> Self {
        Self { bbox, class_id }
    }
}

/// Ground truth for a batch, padded to a fixed number of instances per image
/// the way the data loader hands it over.
///
/// Instance `i` of image `b` is valid when `i < valid_nums[b]` and its box is
/// not the all-zero padding box.
#[derive(Debug, Clone, PartialEq)]
pub struct GroundTruthBatch {
    boxes: Vec<[f32; 4]>,
    classes: Vec<usize>,
    valid_nums: Vec<usize>,
    max_instances: usize,
}

impl GroundTruthBatch {
    /// Wraps padded loader output. `boxes` and `classes` are row-major
    /// `[batch, max_instances]`.
    pub fn new(
        boxes: Vec<[f32; 4]>,
        classes: Vec<usize>,
        valid_nums: Vec<usize>,
        max_instances: usize,
    ) -> Result<Self> {
        let expected = valid_nums.len() * max_instances;
        if boxes.len() != expected || classes.len() != expected {
            return Err(YoloError::GroundTruth(format!(
                "expected {} padded instances ({} images x {}), got {} boxes and {} classes",
                expected,
                valid_nums.len(),
                max_instances,
                boxes.len(),
                classes.len()
            )));
        }
        if let Some(n) = valid_nums.iter().find(|&&n| n > max_instances) {
            return Err(YoloError::GroundTruth(format!(
                "valid count {n} exceeds max_instances {max_instances}"
            )));
        }
        Ok(Self {
            boxes,
            classes,
            valid_nums,
            max_instances,
        })
    }

    /// Pads (or truncates) per-image instance lists to `max_instances`.
    pub fn from_instances(images: &[Vec<GroundTruth>], max_instances: usize) -> Self {
        let mut boxes = Vec::with_capacity(images.len() * max_instances);
        let mut classes = Vec::with_capacity(images.len() * max_instances);
        let mut valid_nums = Vec::with_capacity(images.len());

        for instances in images {
            if instances.len() > max_instances {
                log::warn!(
                    "dropping {} instances beyond max_instances={}",
                    instances.len() - max_instances,
                    max_instances
                );
            }
            let kept = instances.len().min(max_instances);
            for gt in &instances[..kept] {
                boxes.push(gt.bbox.to_xyxy());
                classes.push(gt.class_id);
            }
            for _ in kept..max_instances {
                boxes.push([0.0; 4]);
                classes.push(0);
            }
            valid_nums.push(kept);
        }

        Self {
            boxes,
            classes,
            valid_nums,
            max_instances,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.valid_nums.len()
    }

    pub fn max_instances(&self) -> usize {
        self.max_instances
    }

    pub fn valid_nums(&self) -> &[usize] {
        &self.valid_nums
    }

    /// Valid instances of image `b`, in loader order.
    pub fn instances(&self, b: usize) -> impl Iterator<Item = GroundTruth> + '_ {
        let start = b * self.max_instances;
        let valid = self.valid_nums.get(b).copied().unwrap_or(0);
        (start..start + valid)
            .filter(move |&i| self.boxes[i] != [0.0; 4])
            .map(move |i| GroundTruth::new(BBox::from_xyxy(self.boxes[i]), self.classes[i]))
    }

    pub fn num_valid(&self) -> usize {
        (0..self.batch_size()).map(|b| self.instances(b).count()).sum()
    }
}
