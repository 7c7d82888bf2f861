pub mod conv;

pub use conv::{Conv, DownStage};
