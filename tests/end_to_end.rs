use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;
use yolov5_detection::model::Location;
use yolov5_detection::{
    nms, BBox, DecodedBox, GroundTruth, GroundTruthBatch, SyntheticBatches, TargetAssigner,
    YoloConfig, YoloLoss, YoloNet, YoloNetwork,
};

type TestBackend = NdArray;

#[test]
fn anchor_shaped_box_gets_single_positive() {
    let config = YoloConfig {
        only_best_anchor: true,
        ..Default::default()
    };
    let cell = config.cell_size(1);
    let [aw, ah] = config.anchors[4];
    let gt = GroundTruth::new(BBox::from_center(5.5 * cell, 5.5 * cell, aw, ah), 7);
    let batch = GroundTruthBatch::from_instances(&[vec![gt]], 10);

    let targets = TargetAssigner::new(&config).unwrap().assign(&batch);
    let positives: usize = targets.iter().map(|t| t.num_positive()).sum();
    assert_eq!(positives, 1);

    let loc = Location {
        batch: 0,
        y: 5,
        x: 5,
        anchor: 1,
    };
    assert_eq!(targets[1].positive_locations(), &[loc]);
    let t = targets[1].target_at(loc);
    assert!((t[0] - 0.5).abs() < 1e-4);
    assert!((t[1] - 0.5).abs() < 1e-4);
    assert!(t[2].abs() < 1e-5);
    assert!(t[3].abs() < 1e-5);
    assert_eq!(t[4], 1.0);
    assert_eq!(t[5 + 7], 1.0);
}

#[test]
fn overlapping_detections_keep_the_confident_one() {
    let strong = DecodedBox {
        xmin: 100.0,
        ymin: 100.0,
        xmax: 200.0,
        ymax: 190.0,
        confidence: 0.9,
        class_id: 3,
    };
    let weak = DecodedBox {
        xmin: 100.0,
        ymin: 100.0,
        xmax: 200.0,
        ymax: 200.0,
        confidence: 0.6,
        class_id: 3,
    };
    assert_eq!(nms(&[weak, strong], 0.3), vec![strong]);
}

#[test]
fn positives_stay_within_three_per_box_and_are_never_ignored() {
    let config = YoloConfig {
        image_size: [128, 128],
        num_classes: 6,
        batch_size: 4,
        ..Default::default()
    };
    let assigner = TargetAssigner::new(&config).unwrap();
    let mut batches = SyntheticBatches::<TestBackend>::new(&config, 8, 11, Default::default());

    for _ in 0..5 {
        let batch = batches.next_batch();
        let valid = batch.ground_truth.num_valid();
        let targets = assigner.assign(&batch.ground_truth);

        let positives: usize = targets.iter().map(|t| t.num_positive()).sum();
        assert!(positives <= 3 * valid);
        for scale_targets in &targets {
            for &loc in scale_targets.positive_locations() {
                assert!(!scale_targets.is_ignored(loc));
            }
        }
    }
}

#[test]
fn empty_batch_gives_zero_loss_through_the_network() {
    let config = YoloConfig {
        image_size: [64, 64],
        num_classes: 3,
        batch_size: 2,
        ..Default::default()
    };
    let device = Default::default();
    let net = YoloNet::<TestBackend>::new(&device, &config).unwrap();
    let loss = YoloLoss::new(&config).unwrap();

    let images = Tensor::<TestBackend, 4>::ones([2, 3, 64, 64], &device);
    let empty = GroundTruthBatch::from_instances(&[vec![], vec![]], 5);
    let summary = loss.compute(&net.forward(images), &empty).unwrap().summary();
    assert_eq!(summary.total, 0.0);
    assert_eq!(summary.xy + summary.wh, 0.0);
}

#[test]
fn training_step_reduces_loss_on_a_fixed_batch() {
    type TrainBackend = Autodiff<NdArray>;
    let config = yolov5_detection::TrainingConfig {
        learning_rate: 5e-3,
        yolo: YoloConfig {
            image_size: [32, 32],
            num_classes: 2,
            batch_size: 2,
            ..Default::default()
        },
        ..Default::default()
    };
    let gt = vec![
        vec![GroundTruth::new(BBox::new(0.2, 0.2, 0.6, 0.7), 0)],
        vec![GroundTruth::new(BBox::new(0.5, 0.1, 0.9, 0.4), 1)],
    ];
    let device = Default::default();
    let batch = yolov5_detection::YoloBatch {
        images: Tensor::<TrainBackend, 4>::random(
            [2, 3, 32, 32],
            burn::tensor::Distribution::Uniform(0.0, 1.0),
            &device,
        ),
        ground_truth: GroundTruthBatch::from_instances(&gt, 2),
    };

    let mut trainer = yolov5_detection::Trainer::<TrainBackend>::new(config, device).unwrap();
    let first = trainer.train_step(&batch).unwrap();
    let mut last = first;
    for _ in 0..20 {
        last = trainer.train_step(&batch).unwrap();
    }
    assert!(first.total.is_finite() && last.total.is_finite());
    assert!(last.total < first.total);
}
