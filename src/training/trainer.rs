use anyhow::anyhow;
use burn::module::Module;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::data::YoloBatch;
use crate::error::Result;
use crate::model::{DecodedBox, LossSummary, Nms, YoloHead, YoloLoss, YoloNet, YoloNetwork};
use crate::training::TrainingConfig;

pub struct Trainer<B: AutodiffBackend> {
    pub model: YoloNet<B>,
    optimizer: OptimizerAdaptor<Adam, YoloNet<B>, B>,
    loss_fn: YoloLoss,
    head: YoloHead,
    nms: Nms,
    config: TrainingConfig,
    device: B::Device,
    rng: StdRng,
    /// Image index and post-NMS boxes of the latest visualization pass.
    last_visual: Option<(usize, Vec<DecodedBox>)>,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(config: TrainingConfig, device: B::Device) -> Result<Self> {
        let model = YoloNet::new(&device, &config.yolo)?;
        let loss_fn = YoloLoss::new(&config.yolo)?;
        let head = YoloHead::new(&config.yolo)?;
        let nms = Nms::new(config.yolo.nms_iou_thres).with_policy(config.yolo.nms_policy);
        let optimizer = AdamConfig::new().init();

        Ok(Self {
            model,
            optimizer,
            loss_fn,
            head,
            nms,
            rng: StdRng::seed_from_u64(config.seed),
            last_visual: None,
            config,
            device,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Forward, loss, backward and one Adam step. A non-finite total skips the
    /// update.
    pub fn train_step(&mut self, batch: &YoloBatch<B>) -> Result<LossSummary> {
        let preds = self.model.forward(batch.images.clone());
        let loss = self.loss_fn.compute(&preds, &batch.ground_truth)?;
        let summary = loss.summary();

        if !summary.total.is_finite() {
            log::warn!("non-finite loss, skipping update: {}", summary);
            return Ok(summary);
        }

        let grads = loss.total().backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        self.model = self
            .optimizer
            .step(self.config.learning_rate, self.model.clone(), grads);

        self.visualize(&preds)?;
        Ok(summary)
    }

    /// Decodes one random image of the batch and returns its post-NMS boxes
    /// above `conf_thres`.
    pub fn visualize(&mut self, preds: &[Tensor<B, 5>]) -> Result<(usize, Vec<DecodedBox>)> {
        let batch = preds.first().map_or(0, |p| p.dims()[0]);
        if batch == 0 {
            return Ok((0, Vec::new()));
        }
        let image = self.rng.gen_range(0..batch);
        let single: Vec<Tensor<B::InnerBackend, 5>> = preds
            .iter()
            .map(|p| p.clone().inner().narrow(0, image, 1))
            .collect();

        let conf_thres = self.config.yolo.conf_thres;
        // Only higher-confidence boxes can suppress, so filtering first keeps
        // the same survivors.
        let candidates: Vec<DecodedBox> = self
            .head
            .decode_boxes(&single)?
            .into_iter()
            .flatten()
            .filter(|d| d.confidence > conf_thres)
            .collect();
        let kept = self.nms.apply(&candidates);

        log::debug!("image {}: {} boxes after nms", image, kept.len());
        for det in &kept {
            log::trace!(
                "  class {} conf {:.3} [{:.1}, {:.1}, {:.1}, {:.1}]",
                det.class_id,
                det.confidence,
                det.xmin,
                det.ymin,
                det.xmax,
                det.ymax
            );
        }
        self.last_visual = Some((image, kept.clone()));
        Ok((image, kept))
    }

    /// Mean total loss over the finite steps of one epoch.
    pub fn train_epoch<I>(&mut self, batches: &mut I, epoch: usize) -> Result<f32>
    where
        I: Iterator<Item = YoloBatch<B>>,
    {
        let mut total_loss = 0.0;
        let mut count = 0;

        for (step, batch) in batches.take(self.config.batches_per_epoch).enumerate() {
            let summary = self.train_step(&batch)?;
            log::info!("epoch {} step {}: {}", epoch, step + 1, summary);
            if summary.total.is_finite() {
                total_loss += summary.total;
                count += 1;
            }
        }

        Ok(if count > 0 { total_loss / count as f32 } else { 0.0 })
    }

    pub fn train<I>(&mut self, mut batches: I) -> anyhow::Result<()>
    where
        I: Iterator<Item = YoloBatch<B>>,
    {
        log::info!(
            "training for {} epochs x {} batches",
            self.config.epochs,
            self.config.batches_per_epoch
        );
        std::fs::create_dir_all(&self.config.save_dir)?;

        let pb = ProgressBar::new(self.config.epochs as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?,
        );

        for epoch in 1..=self.config.epochs {
            let epoch_start = Instant::now();
            let mean_loss = self.train_epoch(&mut batches, epoch)?;

            pb.set_message(format!("epoch {}: loss={:.4}", epoch, mean_loss));
            pb.inc(1);

            if self.config.save_interval > 0 && epoch % self.config.save_interval == 0 {
                self.save_checkpoint(&format!("epoch_{}", epoch), epoch, mean_loss)?;
            }
            log::info!(
                "epoch {} done in {:.2}s, mean loss {:.4}",
                epoch,
                epoch_start.elapsed().as_secs_f32(),
                mean_loss
            );
        }

        pb.finish_with_message("training completed");
        log::info!("checkpoints saved in {}", self.config.save_dir);
        Ok(())
    }

    /// Writes `<save_dir>/<name>/model.bin` and `config.json`; the JSON also
    /// carries the latest visualization boxes.
    pub fn save_checkpoint(&self, name: &str, epoch: usize, loss: f32) -> anyhow::Result<PathBuf> {
        let checkpoint_dir = Path::new(&self.config.save_dir).join(name);
        std::fs::create_dir_all(&checkpoint_dir)?;

        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        recorder
            .record(self.model.clone().into_record(), checkpoint_dir.join("model"))
            .map_err(|e| anyhow!("failed to save model: {:?}", e))?;

        let metadata = serde_json::json!({
            "checkpoint_name": name,
            "epoch": epoch,
            "loss": loss,
            "yolo": self.config.yolo,
            "visualization": self.last_visual.as_ref().map(|(image, boxes)| {
                serde_json::json!({ "image": image, "detections": boxes })
            }),
        });
        std::fs::write(
            checkpoint_dir.join("config.json"),
            serde_json::to_string_pretty(&metadata)?,
        )?;

        log::info!("checkpoint '{}' saved to {}", name, checkpoint_dir.display());
        Ok(checkpoint_dir)
    }

    pub fn load_checkpoint(&mut self, checkpoint_dir: impl AsRef<Path>) -> anyhow::Result<()> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        self.model = self
            .model
            .clone()
            .load_file(checkpoint_dir.as_ref().join("model"), &recorder, &self.device)
            .map_err(|e| anyhow!("failed to load model: {:?}", e))?;
        Ok(())
    }
}
