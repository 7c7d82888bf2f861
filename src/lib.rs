pub mod data;
pub mod error;
pub mod model;
pub mod training;

// Re-exports for convenience
pub use data::{GroundTruth, GroundTruthBatch, SyntheticBatches, YoloBatch};
pub use error::{Result, YoloError};
pub use model::{
    nms, BBox, DecodedBox, HeadOutput, LossOutput, LossSummary, Nms, SuppressionPolicy,
    TargetAssigner, YoloConfig, YoloHead, YoloLoss, YoloNet, YoloNetwork,
};
pub use training::{Trainer, TrainingConfig};
