use burn::prelude::*;
use burn::tensor::activation::sigmoid;
use serde::{Deserialize, Serialize};

use crate::error::{Result, YoloError};
use crate::model::config::YoloConfig;
use crate::model::geometry::BBox;

/// `tw`/`th` are clamped to this before `exp` when building boxes.
const MAX_WH_LOGIT: f32 = 10.0;

/// Per-scale head output in the form the loss consumes.
///
/// Regression and classification channels stay raw (pre-activation);
/// `boxes` is the differentiable decoded box in normalized xyxy.
#[derive(Debug, Clone)]
pub struct ScaleHead<B: Backend> {
    pub txy: Tensor<B, 5>,
    pub twh: Tensor<B, 5>,
    pub obj: Tensor<B, 5>,
    pub cls: Tensor<B, 5>,
    pub boxes: Tensor<B, 5>,
}

/// A detection in input-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecodedBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
    /// `objectness * max class probability`.
    pub confidence: f32,
    pub class_id: usize,
}

impl DecodedBox {
    pub fn bbox(&self) -> BBox {
        BBox::new(self.xmin, self.ymin, self.xmax, self.ymax)
    }
}

#[derive(Debug, Clone)]
pub enum HeadOutput<B: Backend> {
    Training(Vec<ScaleHead<B>>),
    /// One list per image, every scale and anchor, unfiltered.
    Inference(Vec<Vec<DecodedBox>>),
}

/// Decodes raw `[batch, grid_h, grid_w, anchors, 5 + classes]` predictions.
#[derive(Debug, Clone)]
pub struct YoloHead {
    config: YoloConfig,
}

impl YoloHead {
    pub fn new(config: &YoloConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &YoloConfig {
        &self.config
    }

    pub fn decode<B: Backend>(
        &self,
        preds: &[Tensor<B, 5>],
        is_training: bool,
    ) -> Result<HeadOutput<B>> {
        if is_training {
            let heads = preds
                .iter()
                .enumerate()
                .map(|(scale, raw)| self.decode_scale(scale, raw.clone()))
                .collect::<Result<Vec<_>>>()?;
            self.check_scale_count(heads.len())?;
            Ok(HeadOutput::Training(heads))
        } else {
            Ok(HeadOutput::Inference(self.decode_boxes(preds)?))
        }
    }

    /// Validates the raw shape of a scale against the configuration.
    pub fn check_shape(&self, scale: usize, dims: [usize; 5], batch: usize) -> Result<()> {
        let expected = self.config.prediction_shape(scale, batch);
        if dims != expected {
            return Err(YoloError::ShapeMismatch {
                scale,
                expected,
                actual: dims,
            });
        }
        Ok(())
    }

    fn check_scale_count(&self, actual: usize) -> Result<()> {
        let expected = self.config.num_scales();
        if actual != expected {
            return Err(YoloError::ScaleCount { expected, actual });
        }
        Ok(())
    }

    pub fn decode_scale<B: Backend>(&self, scale: usize, raw: Tensor<B, 5>) -> Result<ScaleHead<B>> {
        if scale >= self.config.num_scales() {
            return Err(YoloError::ScaleCount {
                expected: self.config.num_scales(),
                actual: scale + 1,
            });
        }
        let dims = raw.dims();
        self.check_shape(scale, dims, dims[0])?;
        let device = raw.device();

        let txy = raw.clone().narrow(4, 0, 2);
        let twh = raw.clone().narrow(4, 2, 2);
        let obj = raw.clone().narrow(4, 4, 1);
        let cls = raw.narrow(4, 5, self.config.num_classes);

        let cell = self.config.cell_size(scale);
        let grid = self.grid_tensor::<B>(scale, dims[0], &device);
        let anchors = self.anchor_tensor::<B>(scale, dims[0], &device);

        let center = (sigmoid(txy.clone()) + grid) * cell;
        let half = twh.clone().clamp_max(MAX_WH_LOGIT).exp() * anchors * 0.5;
        let boxes = Tensor::cat(vec![center.clone() - half.clone(), center + half], 4);

        Ok(ScaleHead {
            txy,
            twh,
            obj,
            cls,
            boxes,
        })
    }

    /// Fully decoded boxes per image, in pixels and clamped to the image.
    pub fn decode_boxes<B: Backend>(&self, preds: &[Tensor<B, 5>]) -> Result<Vec<Vec<DecodedBox>>> {
        self.check_scale_count(preds.len())?;
        let batch = preds[0].dims()[0];
        if batch == 0 {
            for (scale, raw) in preds.iter().enumerate() {
                self.check_shape(scale, raw.dims(), 0)?;
            }
            return Ok(Vec::new());
        }
        let side = self.config.reference_side();
        let [img_h, img_w] = self.config.image_size;
        let num_classes = self.config.num_classes;

        let mut out = vec![Vec::new(); batch];
        for (scale, raw) in preds.iter().enumerate() {
            self.check_shape(scale, raw.dims(), batch)?;
            let head = self.decode_scale(scale, raw.clone())?;

            let boxes = to_host(head.boxes)?;
            let obj = to_host(sigmoid(head.obj))?;
            let cls = to_host(sigmoid(head.cls))?;

            let slots = obj.len();
            let per_image = slots / batch;
            for slot in 0..slots {
                let scores = &cls[slot * num_classes..(slot + 1) * num_classes];
                let (class_id, class_prob) = scores.iter().enumerate().fold(
                    (0usize, f32::MIN),
                    |best, (c, &p)| if p > best.1 { (c, p) } else { best },
                );
                let b = &boxes[slot * 4..slot * 4 + 4];
                out[slot / per_image].push(DecodedBox {
                    xmin: (b[0] * side).clamp(0.0, img_w as f32),
                    ymin: (b[1] * side).clamp(0.0, img_h as f32),
                    xmax: (b[2] * side).clamp(0.0, img_w as f32),
                    ymax: (b[3] * side).clamp(0.0, img_h as f32),
                    confidence: obj[slot] * class_prob,
                    class_id,
                });
            }
        }

        log::debug!(
            "decoded {} boxes for {} images",
            out.iter().map(Vec::len).sum::<usize>(),
            batch
        );
        Ok(out)
    }

    /// `(x, y)` cell index of every slot as `[batch, grid_h, grid_w, anchors, 2]`.
    fn grid_tensor<B: Backend>(&self, scale: usize, batch: usize, device: &B::Device) -> Tensor<B, 5> {
        let (gh, gw) = self.config.grid_size(scale);
        let na = self.config.anchor_masks[scale].len();
        let mut data = Vec::with_capacity(batch * gh * gw * na * 2);
        for _ in 0..batch {
            for y in 0..gh {
                for x in 0..gw {
                    for _ in 0..na {
                        data.push(x as f32);
                        data.push(y as f32);
                    }
                }
            }
        }
        Tensor::from_data(TensorData::new(data, [batch, gh, gw, na, 2]), device)
    }

    /// Anchor `(w, h)` of every slot as `[batch, grid_h, grid_w, anchors, 2]`.
    fn anchor_tensor<B: Backend>(&self, scale: usize, batch: usize, device: &B::Device) -> Tensor<B, 5> {
        let (gh, gw) = self.config.grid_size(scale);
        let anchors = self.config.scale_anchors(scale);
        let na = anchors.len();
        let mut data = Vec::with_capacity(batch * gh * gw * na * 2);
        for _ in 0..batch * gh * gw {
            for wh in &anchors {
                data.extend_from_slice(wh);
            }
        }
        Tensor::from_data(TensorData::new(data, [batch, gh, gw, na, 2]), device)
    }
}

fn to_host<B: Backend>(tensor: Tensor<B, 5>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| YoloError::TensorData(format!("{e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn small_config() -> YoloConfig {
        YoloConfig {
            image_size: [64, 64],
            num_classes: 2,
            batch_size: 1,
            ..Default::default()
        }
    }

    fn zero_preds(config: &YoloConfig, batch: usize) -> Vec<Tensor<TestBackend, 5>> {
        let device = Default::default();
        (0..config.num_scales())
            .map(|s| Tensor::zeros(config.prediction_shape(s, batch), &device))
            .collect()
    }

    #[test]
    fn test_zero_logits_decode_to_anchor_at_cell_center() {
        let config = small_config();
        let head = YoloHead::new(&config).unwrap();
        let preds = zero_preds(&config, 1);

        let scale_head = head.decode_scale(1, preds[1].clone()).unwrap();
        let boxes = scale_head.boxes.into_data().to_vec::<f32>().unwrap();
        // Stride 16 on 64 px gives a 4x4 grid; slot (y=2, x=1, anchor=1) is anchor 4.
        let slot = (2 * 4 + 1) * 3 + 1;
        let b = &boxes[slot * 4..slot * 4 + 4];
        let [aw, ah] = config.anchors[4];
        let cx = 1.5 * 16.0 / 64.0;
        let cy = 2.5 * 16.0 / 64.0;
        assert!((b[0] - (cx - aw / 2.0)).abs() < 1e-6);
        assert!((b[1] - (cy - ah / 2.0)).abs() < 1e-6);
        assert!((b[2] - (cx + aw / 2.0)).abs() < 1e-6);
        assert!((b[3] - (cy + ah / 2.0)).abs() < 1e-6);
    }

    #[test]
    fn test_inference_confidence_is_objectness_times_class() {
        let config = small_config();
        let head = YoloHead::new(&config).unwrap();
        let preds = zero_preds(&config, 2);

        let HeadOutput::Inference(images) = head.decode(&preds, false).unwrap() else {
            panic!("expected inference output");
        };
        assert_eq!(images.len(), 2);
        let per_image: usize = (0..3)
            .map(|s| {
                let (gh, gw) = config.grid_size(s);
                gh * gw * 3
            })
            .sum();
        assert_eq!(images[0].len(), per_image);
        for det in &images[1] {
            assert!((det.confidence - 0.25).abs() < 1e-6);
            assert_eq!(det.class_id, 0);
            assert!(det.xmin >= 0.0 && det.xmax <= 64.0);
            assert!(det.ymin >= 0.0 && det.ymax <= 64.0);
        }
    }

    #[test]
    fn test_training_output_keeps_raw_channels() {
        let config = small_config();
        let head = YoloHead::new(&config).unwrap();
        let preds = zero_preds(&config, 1);
        let HeadOutput::Training(scales) = head.decode(&preds, true).unwrap() else {
            panic!("expected training output");
        };
        assert_eq!(scales.len(), 3);
        assert_eq!(scales[0].txy.dims(), [1, 8, 8, 3, 2]);
        assert_eq!(scales[0].obj.dims(), [1, 8, 8, 3, 1]);
        assert_eq!(scales[0].cls.dims(), [1, 8, 8, 3, 2]);
        assert_eq!(scales[0].boxes.dims(), [1, 8, 8, 3, 4]);
    }

    #[test]
    fn test_empty_batch_decodes_to_nothing() {
        let config = small_config();
        let head = YoloHead::new(&config).unwrap();
        let preds = zero_preds(&config, 0);

        let HeadOutput::Inference(images) = head.decode(&preds, false).unwrap() else {
            panic!("expected inference output");
        };
        assert!(images.is_empty());
        assert!(head.decode_boxes(&preds).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_wrong_shape() {
        let config = small_config();
        let head = YoloHead::new(&config).unwrap();
        let device = Default::default();
        let bad = Tensor::<TestBackend, 5>::zeros([1, 8, 8, 3, 6], &device);
        assert!(matches!(
            head.decode_scale(1, bad),
            Err(YoloError::ShapeMismatch { scale: 1, .. })
        ));

        let preds = zero_preds(&config, 1);
        assert!(matches!(
            head.decode(&preds[..2], false),
            Err(YoloError::ScaleCount { .. })
        ));
    }
}
