pub mod assigner;
pub mod backbone;
pub mod blocks;
pub mod config;
pub mod geometry;
pub mod head;
pub mod loss;
pub mod nms;
pub mod yolo;

pub use assigner::{Location, ScaleTargets, TargetAssigner};
pub use backbone::Backbone;
pub use config::YoloConfig;
pub use geometry::{anchor_ratio, box_loss_metric, ciou, iou, BBox};
pub use head::{DecodedBox, HeadOutput, ScaleHead, YoloHead};
pub use loss::{LossOutput, LossSummary, YoloLoss};
pub use nms::{nms, Nms, SuppressionPolicy};
pub use yolo::{YoloNet, YoloNetwork};
