//! Overlap and shape measures on axis-aligned boxes.
//!
//! Scalar versions are used by the target assigner and NMS; the tensor
//! version of CIoU is the differentiable box-regression term of the loss.

use burn::prelude::*;
use serde::{Deserialize, Serialize};
use std::f32::consts::{FRAC_PI_4, PI};

const EPS: f32 = 1e-7;

/// Axis-aligned box as `(xmin, ymin, xmax, ymax)`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl BBox {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    pub fn from_xyxy(xyxy: [f32; 4]) -> Self {
        Self::new(xyxy[0], xyxy[1], xyxy[2], xyxy[3])
    }

    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    pub fn to_xyxy(self) -> [f32; 4] {
        [self.xmin, self.ymin, self.xmax, self.ymax]
    }

    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.xmin + self.xmax) * 0.5,
            (self.ymin + self.ymax) * 0.5,
        )
    }

    /// Zero or negative extent on either axis, or non-finite coordinates.
    pub fn is_degenerate(&self) -> bool {
        !(self.width() > 0.0 && self.height() > 0.0)
            || !self.to_xyxy().iter().all(|v| v.is_finite())
    }

    /// Area, zero for degenerate boxes.
    pub fn area(&self) -> f32 {
        if self.is_degenerate() {
            0.0
        } else {
            self.width() * self.height()
        }
    }
}

/// Intersection over union; 0 when the union is empty.
pub fn iou(a: &BBox, b: &BBox) -> f32 {
    let inter_w = (a.xmax.min(b.xmax) - a.xmin.max(b.xmin)).max(0.0);
    let inter_h = (a.ymax.min(b.ymax) - a.ymin.max(b.ymin)).max(0.0);
    let intersection = if a.is_degenerate() || b.is_degenerate() {
        0.0
    } else {
        inter_w * inter_h
    };
    let union = a.area() + b.area() - intersection;
    if union > 0.0 {
        (intersection / union).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Complete IoU: IoU minus the normalized center distance and an
/// aspect-ratio consistency term. Lies in `(-1.5, 1]`.
pub fn ciou(pred: &BBox, gt: &BBox) -> f32 {
    let iou = iou(pred, gt);

    let (pcx, pcy) = pred.center();
    let (gcx, gcy) = gt.center();
    let center_dist = (pcx - gcx).powi(2) + (pcy - gcy).powi(2);

    let outer_w = pred.xmax.max(gt.xmax) - pred.xmin.min(gt.xmin);
    let outer_h = pred.ymax.max(gt.ymax) - pred.ymin.min(gt.ymin);
    let diagonal = outer_w.powi(2) + outer_h.powi(2) + EPS;

    let pred_angle = (pred.width().max(0.0) / (pred.height().max(0.0) + EPS)).atan();
    let gt_angle = (gt.width().max(0.0) / (gt.height().max(0.0) + EPS)).atan();
    let v = 4.0 / (PI * PI) * (gt_angle - pred_angle).powi(2);
    let alpha = v / (1.0 - iou + v + EPS);

    iou - center_dist / diagonal - alpha * v
}

/// Box regression penalty `1 - CIoU`, in `[0, 3)`. Stays above 1 for
/// disjoint boxes and keeps growing with their center distance.
pub fn box_loss_metric(pred: &BBox, gt: &BBox) -> f32 {
    (1.0 - ciou(pred, gt)).max(0.0)
}

/// `max(w/aw, aw/w, h/ah, ah/h)`. Non-positive sides give `f32::INFINITY`,
/// which no threshold accepts.
pub fn anchor_ratio(gt_wh: [f32; 2], anchor_wh: [f32; 2]) -> f32 {
    let valid = gt_wh
        .iter()
        .chain(anchor_wh.iter())
        .all(|v| v.is_finite() && *v > 0.0);
    if !valid {
        return f32::INFINITY;
    }
    let rw = gt_wh[0] / anchor_wh[0];
    let rh = gt_wh[1] / anchor_wh[1];
    rw.max(1.0 / rw).max(rh).max(1.0 / rh)
}

/// `atan(x)` for `x >= 0` built from element-wise ops: maps `x` to
/// `t = (x - 1) / (x + 1)` in `[-1, 1)` and uses a rational fit of `atan(t)`
/// (max error about 1.5e-3 rad).
fn atan_non_negative<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let t = (x.clone() - 1.0) / (x + 1.0);
    let abs_t = t.clone().abs();
    let correction = t.clone() * (abs_t.clone() - 1.0) * (abs_t * 0.0663 + 0.2447);
    t * FRAC_PI_4 - correction + FRAC_PI_4
}

/// Element-wise `1 - CIoU` over the last dimension.
///
/// Both inputs hold `(xmin, ymin, xmax, ymax)` in the last dimension; the
/// output keeps the leading dimensions and has a last dimension of 1. The
/// aspect-ratio weight `alpha` is detached from the graph.
pub fn ciou_loss_tensor<B: Backend, const D: usize>(
    pred: Tensor<B, D>,
    gt: Tensor<B, D>,
) -> Tensor<B, D> {
    let last = D - 1;
    let coord = |t: &Tensor<B, D>, i: usize| t.clone().narrow(last, i, 1);

    let (px0, py0, px1, py1) = (
        coord(&pred, 0),
        coord(&pred, 1),
        coord(&pred, 2),
        coord(&pred, 3),
    );
    let (gx0, gy0, gx1, gy1) = (coord(&gt, 0), coord(&gt, 1), coord(&gt, 2), coord(&gt, 3));

    let pw = (px1.clone() - px0.clone()).clamp_min(0.0);
    let ph = (py1.clone() - py0.clone()).clamp_min(0.0);
    let gw = (gx1.clone() - gx0.clone()).clamp_min(0.0);
    let gh = (gy1.clone() - gy0.clone()).clamp_min(0.0);

    let inter_w = (px1.clone().min_pair(gx1.clone()) - px0.clone().max_pair(gx0.clone()))
        .clamp_min(0.0);
    let inter_h = (py1.clone().min_pair(gy1.clone()) - py0.clone().max_pair(gy0.clone()))
        .clamp_min(0.0);
    let intersection = inter_w * inter_h;
    let union = pw.clone() * ph.clone() + gw.clone() * gh.clone() - intersection.clone() + EPS;
    let iou = intersection / union;

    let outer_w = px1.clone().max_pair(gx1.clone()) - px0.clone().min_pair(gx0.clone());
    let outer_h = py1.clone().max_pair(gy1.clone()) - py0.clone().min_pair(gy0.clone());
    let diagonal = outer_w.clone() * outer_w + outer_h.clone() * outer_h + EPS;

    let dx = (px0 + px1 - gx0 - gx1) * 0.5;
    let dy = (py0 + py1 - gy0 - gy1) * 0.5;
    let center_dist = dx.clone() * dx + dy.clone() * dy;

    let pred_angle = atan_non_negative(pw / (ph + EPS));
    let gt_angle = atan_non_negative(gw / (gh + EPS));
    let angle_diff = gt_angle - pred_angle;
    let v = angle_diff.clone() * angle_diff * (4.0 / (PI * PI));
    let alpha = (v.clone() / (iou.clone().neg() + v.clone() + (1.0 + EPS))).detach();

    let ciou = iou - center_dist / diagonal - alpha * v;
    ciou.neg() + 1.0
}
