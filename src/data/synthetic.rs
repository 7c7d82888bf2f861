use burn::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::data::{GroundTruth, GroundTruthBatch};
use crate::model::config::YoloConfig;
use crate::model::geometry::BBox;

/// Smallest and largest side of a generated box, normalized.
const BOX_SIDE_RANGE: (f32, f32) = (0.04, 0.45);

pub struct YoloBatch<B: Backend> {
    /// `[batch, 3, height, width]` in `[0, 1]`.
    pub images: Tensor<B, 4>,
    pub ground_truth: GroundTruthBatch,
}

/// Endless stream of random images with random boxes, reproducible from a seed.
pub struct SyntheticBatches<B: Backend> {
    image_size: [usize; 2],
    num_classes: usize,
    batch_size: usize,
    max_instances: usize,
    rng: StdRng,
    device: B::Device,
}

impl<B: Backend> SyntheticBatches<B> {
    pub fn new(config: &YoloConfig, max_instances: usize, seed: u64, device: B::Device) -> Self {
        Self {
            image_size: config.image_size,
            num_classes: config.num_classes,
            batch_size: config.batch_size,
            max_instances,
            rng: StdRng::seed_from_u64(seed),
            device,
        }
    }

    fn random_instance(&mut self) -> GroundTruth {
        let [h, w] = self.image_size;
        let extent_x = w as f32 / h as f32;
        let (lo, hi) = BOX_SIDE_RANGE;

        let bw = self.rng.gen_range(lo..hi).min(extent_x);
        let bh = self.rng.gen_range(lo..hi);
        let cx = self.rng.gen_range(bw / 2.0..=extent_x - bw / 2.0);
        let cy = self.rng.gen_range(bh / 2.0..=1.0 - bh / 2.0);
        let class_id = self.rng.gen_range(0..self.num_classes);

        GroundTruth::new(BBox::from_center(cx, cy, bw, bh), class_id)
    }

    pub fn next_batch(&mut self) -> YoloBatch<B> {
        let [h, w] = self.image_size;
        let pixels: Vec<f32> = (0..self.batch_size * 3 * h * w)
            .map(|_| self.rng.gen::<f32>())
            .collect();
        let images = Tensor::from_data(TensorData::new(pixels, [self.batch_size, 3, h, w]), &self.device);

        let instances: Vec<Vec<GroundTruth>> = (0..self.batch_size)
            .map(|_| {
                let count = self.rng.gen_range(0..=self.max_instances);
                (0..count).map(|_| self.random_instance()).collect()
            })
            .collect();

        YoloBatch {
            images,
            ground_truth: GroundTruthBatch::from_instances(&instances, self.max_instances),
        }
    }
}

impl<B: Backend> Iterator for SyntheticBatches<B> {
    type Item = YoloBatch<B>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}
