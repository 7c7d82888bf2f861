use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum YoloError {
    #[error("anchor list is empty")]
    NoAnchors,
    #[error("anchor {index} has non-positive or non-finite size {wh:?}")]
    InvalidAnchor { index: usize, wh: [f32; 2] },
    #[error("anchor mask group {0} is empty")]
    EmptyMaskGroup(usize),
    #[error("anchor index {0} in mask is out of range")]
    MaskIndexOutOfRange(usize),
    #[error("anchor index {0} appears in more than one mask group")]
    DuplicateMaskIndex(usize),
    #[error("anchor index {0} is not assigned to any scale")]
    UnassignedAnchor(usize),
    #[error("{strides} strides configured for {scales} scales")]
    StrideCount { strides: usize, scales: usize },
    #[error("image size {image_size:?} is not divisible by stride {stride}")]
    StrideMismatch { image_size: [usize; 2], stride: usize },
    #[error("invalid config value `{name}`: {reason}")]
    InvalidValue { name: &'static str, reason: String },
    #[error("expected {expected} prediction scales, got {actual}")]
    ScaleCount { expected: usize, actual: usize },
    #[error("scale {scale}: expected prediction shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        scale: usize,
        expected: [usize; 5],
        actual: [usize; 5],
    },
    #[error("ground truth is inconsistent: {0}")]
    GroundTruth(String),
    #[error("tensor data error: {0}")]
    TensorData(String),
}

impl YoloError {
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        YoloError::InvalidValue {
            name,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, YoloError>;
