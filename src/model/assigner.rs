//! Ground-truth to (scale, grid cell, anchor) assignment.
//!
//! For every valid box the assigner picks the anchors whose shape is close
//! enough (`anchor_ratio <= anchor_ratio_thres`), writes encoded regression,
//! objectness and class targets into the slot of the box's center cell, and
//! marks background slots whose anchor already overlaps an object well as
//! ignored.

use burn::prelude::*;
use std::cmp::Ordering;

use crate::data::{GroundTruth, GroundTruthBatch};
use crate::error::Result;
use crate::model::config::YoloConfig;
use crate::model::geometry::{anchor_ratio, iou, BBox};

/// Index of a slot inside one scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub batch: usize,
    pub y: usize,
    pub x: usize,
    pub anchor: usize,
}

/// Targets of one detection scale for a whole batch.
///
/// `target` has the raw prediction layout `[batch, grid_h, grid_w, anchors,
/// 5 + num_classes]`: `(fx, fy, ln(w/aw), ln(h/ah), 1, one-hot class)` at
/// positive slots, zero elsewhere. `boxes` holds the assigned ground-truth box
/// (xyxy, normalized) per slot for the CIoU term.
#[derive(Debug, Clone)]
pub struct ScaleTargets {
    scale: usize,
    shape: [usize; 5],
    target: Vec<f32>,
    boxes: Vec<f32>,
    ignore: Vec<bool>,
    positives: Vec<Location>,
}

impl ScaleTargets {
    fn empty(scale: usize, shape: [usize; 5]) -> Self {
        let slots = shape[..4].iter().product::<usize>();
        Self {
            scale,
            shape,
            target: vec![0.0; slots * shape[4]],
            boxes: vec![0.0; slots * 4],
            ignore: vec![false; slots],
            positives: Vec::new(),
        }
    }

    fn slot(&self, loc: Location) -> usize {
        let [_, gh, gw, na, _] = self.shape;
        ((loc.batch * gh + loc.y) * gw + loc.x) * na + loc.anchor
    }

    pub fn scale(&self) -> usize {
        self.scale
    }

    /// `[batch, grid_h, grid_w, anchors, channels]`.
    pub fn shape(&self) -> [usize; 5] {
        self.shape
    }

    pub fn target(&self) -> &[f32] {
        &self.target
    }

    pub fn ignore_mask(&self) -> &[bool] {
        &self.ignore
    }

    pub fn num_positive(&self) -> usize {
        self.positives.len()
    }

    /// Positive slots in row-major order.
    pub fn positive_locations(&self) -> &[Location] {
        &self.positives
    }

    pub fn is_positive(&self, loc: Location) -> bool {
        self.target_at(loc)[4] > 0.0
    }

    pub fn is_ignored(&self, loc: Location) -> bool {
        self.ignore[self.slot(loc)]
    }

    /// The `5 + num_classes` target channels of a slot.
    pub fn target_at(&self, loc: Location) -> &[f32] {
        let channels = self.shape[4];
        let start = self.slot(loc) * channels;
        &self.target[start..start + channels]
    }

    pub fn box_at(&self, loc: Location) -> BBox {
        let start = self.slot(loc) * 4;
        BBox::from_xyxy([
            self.boxes[start],
            self.boxes[start + 1],
            self.boxes[start + 2],
            self.boxes[start + 3],
        ])
    }

    pub fn target_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 5> {
        Tensor::from_data(TensorData::new(self.target.clone(), self.shape), device)
    }

    /// Assigned boxes as `[batch, grid_h, grid_w, anchors, 4]`.
    pub fn box_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 5> {
        let [b, gh, gw, na, _] = self.shape;
        Tensor::from_data(TensorData::new(self.boxes.clone(), [b, gh, gw, na, 4]), device)
    }

    /// Ignore mask as `[batch, grid_h, grid_w, anchors, 1]` of 0/1.
    pub fn ignore_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 5> {
        let [b, gh, gw, na, _] = self.shape;
        let data: Vec<f32> = self
            .ignore
            .iter()
            .map(|&ignored| if ignored { 1.0 } else { 0.0 })
            .collect();
        Tensor::from_data(TensorData::new(data, [b, gh, gw, na, 1]), device)
    }
}

/// A ground-truth box competing for a slot.
#[derive(Debug, Clone, Copy)]
struct Claim {
    gt: GroundTruth,
    ratio: f32,
    anchor_wh: [f32; 2],
    offset: [f32; 2],
}

impl Claim {
    /// Total order deciding slot conflicts independently of input order:
    /// better anchor fit, then larger box, then smaller class id, then
    /// smaller coordinates.
    fn priority(&self, other: &Claim) -> Ordering {
        self.ratio
            .total_cmp(&other.ratio)
            .then_with(|| other.gt.bbox.area().total_cmp(&self.gt.bbox.area()))
            .then_with(|| self.gt.class_id.cmp(&other.gt.class_id))
            .then_with(|| {
                self.gt
                    .bbox
                    .to_xyxy()
                    .iter()
                    .zip(other.gt.bbox.to_xyxy().iter())
                    .map(|(a, b)| a.total_cmp(b))
                    .find(|o| o.is_ne())
                    .unwrap_or(Ordering::Equal)
            })
    }
}

#[derive(Debug, Clone)]
pub struct TargetAssigner {
    config: YoloConfig,
    anchor_locations: Vec<(usize, usize)>,
}

impl TargetAssigner {
    pub fn new(config: &YoloConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            anchor_locations: config.anchor_locations(),
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &YoloConfig {
        &self.config
    }

    /// Builds targets and ignore masks for every scale.
    pub fn assign(&self, gt: &GroundTruthBatch) -> Vec<ScaleTargets> {
        let batch = gt.batch_size();
        let num_scales = self.config.num_scales();

        let mut targets: Vec<ScaleTargets> = (0..num_scales)
            .map(|s| ScaleTargets::empty(s, self.config.prediction_shape(s, batch)))
            .collect();
        let mut claims: Vec<Vec<Option<Claim>>> = targets
            .iter()
            .map(|t| vec![None; t.ignore.len()])
            .collect();

        let mut objects: Vec<Vec<GroundTruth>> = Vec::with_capacity(batch);
        for b in 0..batch {
            let mut kept = Vec::new();
            for instance in gt.instances(b) {
                if instance.class_id >= self.config.num_classes {
                    log::warn!(
                        "image {}: skipping box with class id {} (num_classes = {})",
                        b,
                        instance.class_id,
                        self.config.num_classes
                    );
                    continue;
                }
                if instance.bbox.is_degenerate() {
                    log::debug!("image {}: skipping degenerate box {:?}", b, instance.bbox);
                    continue;
                }
                kept.push(instance);
            }

            for instance in &kept {
                for (anchor_idx, ratio) in self.select_anchors(&instance.bbox) {
                    let (scale, local) = self.anchor_locations[anchor_idx];
                    let (loc, offset) = self.center_cell(scale, b, local, &instance.bbox);
                    let claim = Claim {
                        gt: *instance,
                        ratio,
                        anchor_wh: self.config.anchors[anchor_idx],
                        offset,
                    };
                    let slot = targets[scale].slot(loc);
                    let replace = match &claims[scale][slot] {
                        Some(current) => claim.priority(current) == Ordering::Less,
                        None => true,
                    };
                    if replace {
                        claims[scale][slot] = Some(claim);
                    } else {
                        log::debug!("scale {} slot {:?}: conflict lost by {:?}", scale, loc, claim.gt);
                    }
                }
            }
            objects.push(kept);
        }

        for (scale_targets, scale_claims) in targets.iter_mut().zip(claims) {
            self.write_claims(scale_targets, &scale_claims);
            self.fill_ignore(scale_targets, &objects);
            log::debug!(
                "scale {}: {} positive slots, {} ignored",
                scale_targets.scale,
                scale_targets.num_positive(),
                scale_targets.ignore.iter().filter(|&&i| i).count()
            );
        }

        targets
    }

    /// Anchors responsible for a box as `(anchor index, ratio)`.
    ///
    /// Best-anchor mode keeps the single best fit and does not apply
    /// `anchor_ratio_thres` at all, so even a poorly fitting box gets its
    /// closest anchor. Otherwise every scale contributes its best compatible
    /// anchor; a box with no compatible anchor falls back to the global best
    /// so it is never dropped.
    fn select_anchors(&self, bbox: &BBox) -> Vec<(usize, f32)> {
        let wh = [bbox.width(), bbox.height()];
        let ratios: Vec<f32> = self
            .config
            .anchors
            .iter()
            .map(|anchor| anchor_ratio(wh, *anchor))
            .collect();

        let mut best = 0;
        for (idx, ratio) in ratios.iter().enumerate() {
            if *ratio < ratios[best] {
                best = idx;
            }
        }
        if !ratios[best].is_finite() {
            return Vec::new();
        }
        if self.config.only_best_anchor {
            return vec![(best, ratios[best])];
        }

        let mut chosen = Vec::new();
        for mask in &self.config.anchor_masks {
            let mut scale_best: Option<usize> = None;
            for &idx in mask {
                if ratios[idx] > self.config.anchor_ratio_thres {
                    continue;
                }
                if scale_best.map_or(true, |current| ratios[idx] < ratios[current]) {
                    scale_best = Some(idx);
                }
            }
            if let Some(idx) = scale_best {
                chosen.push((idx, ratios[idx]));
            }
        }
        if chosen.is_empty() {
            chosen.push((best, ratios[best]));
        }
        chosen
    }

    /// Cell containing the box center and the fractional offset inside it.
    fn center_cell(&self, scale: usize, batch: usize, anchor: usize, bbox: &BBox) -> (Location, [f32; 2]) {
        let (gh, gw) = self.config.grid_size(scale);
        let cell = self.config.cell_size(scale);
        let (cx, cy) = bbox.center();
        let fx = cx / cell;
        let fy = cy / cell;
        let x = (fx.floor().max(0.0) as usize).min(gw - 1);
        let y = (fy.floor().max(0.0) as usize).min(gh - 1);
        let offset = [
            (fx - x as f32).clamp(0.0, 1.0),
            (fy - y as f32).clamp(0.0, 1.0),
        ];
        (
            Location {
                batch,
                y,
                x,
                anchor,
            },
            offset,
        )
    }

    fn write_claims(&self, targets: &mut ScaleTargets, claims: &[Option<Claim>]) {
        let channels = targets.shape[4];
        let [_, gh, gw, na, _] = targets.shape;
        for (slot, claim) in claims.iter().enumerate() {
            let Some(claim) = claim else { continue };

            let bbox = claim.gt.bbox;
            let t = &mut targets.target[slot * channels..(slot + 1) * channels];
            t[0] = claim.offset[0];
            t[1] = claim.offset[1];
            t[2] = (bbox.width() / claim.anchor_wh[0]).ln();
            t[3] = (bbox.height() / claim.anchor_wh[1]).ln();
            t[4] = 1.0;
            t[5 + claim.gt.class_id] = 1.0;
            targets.boxes[slot * 4..slot * 4 + 4].copy_from_slice(&bbox.to_xyxy());

            let anchor = slot % na;
            let x = (slot / na) % gw;
            let y = (slot / (na * gw)) % gh;
            let batch = slot / (na * gw * gh);
            targets.positives.push(Location {
                batch,
                y,
                x,
                anchor,
            });
        }
    }

    /// Marks non-positive slots whose anchor box, centered on the cell,
    /// overlaps a ground truth of the same image above `iou_ignore_thres`.
    fn fill_ignore(&self, targets: &mut ScaleTargets, objects: &[Vec<GroundTruth>]) {
        let scale = targets.scale;
        let cell = self.config.cell_size(scale);
        let anchors = self.config.scale_anchors(scale);
        let channels = targets.shape[4];
        let [_, gh, gw, na, _] = targets.shape;

        for (b, gts) in objects.iter().enumerate() {
            if gts.is_empty() {
                continue;
            }
            for y in 0..gh {
                for x in 0..gw {
                    let cx = (x as f32 + 0.5) * cell;
                    let cy = (y as f32 + 0.5) * cell;
                    for (a, wh) in anchors.iter().enumerate() {
                        let slot = ((b * gh + y) * gw + x) * na + a;
                        if targets.target[slot * channels + 4] > 0.0 {
                            continue;
                        }
                        let anchor_box = BBox::from_center(cx, cy, wh[0], wh[1]);
                        let best = gts
                            .iter()
                            .map(|gt| iou(&anchor_box, &gt.bbox))
                            .fold(0.0f32, f32::max);
                        if best > self.config.iou_ignore_thres {
                            targets.ignore[slot] = true;
                        }
                    }
                }
            }
        }
    }
}
