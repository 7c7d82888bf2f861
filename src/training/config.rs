use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::model::config::YoloConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    // Training
    pub epochs: usize,
    pub batches_per_epoch: usize,
    pub learning_rate: f64,
    pub max_instances: usize,
    pub seed: u64,

    // Checkpointing
    pub save_dir: String,
    pub save_interval: usize,

    pub yolo: YoloConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 300,
            batches_per_epoch: 100,
            learning_rate: 1e-4,
            max_instances: 100,
            seed: 42,
            save_dir: "runs/train".to_string(),
            save_interval: 20,
            yolo: YoloConfig::default(),
        }
    }
}

impl TrainingConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: TrainingConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.yolo.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("configs/train.yaml");
        let mut config = TrainingConfig::default();
        config.epochs = 3;
        config.yolo.only_best_anchor = true;

        config.save(&path).unwrap();
        assert_eq!(TrainingConfig::from_yaml(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_yolo_section_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        let mut config = TrainingConfig::default();
        config.yolo.strides = vec![8, 16];
        config.save(&path).unwrap();
        assert!(TrainingConfig::from_yaml(&path).is_err());
    }
}
