pub mod batch;
pub mod synthetic;

pub use batch::{GroundTruth, GroundTruthBatch};
pub use synthetic::{SyntheticBatches, YoloBatch};
