use image::{Rgb, RgbImage};

use pollinator_inference::ingest::DirectorySource;
use pollinator_inference::storage::FileResultStore;
use pollinator_inference::{
    BoundingBox, Cascade, Detection, DetectionStage, ModelSettings, Outcome, Pipeline,
    ResultMessage, StubBackend,
};

fn det(x0: f32, y0: f32, x1: f32, y1: f32, confidence: f32, name: &str) -> Detection {
    Detection::new(BoundingBox::new(x0, y0, x1, y1), confidence, 0).with_name(name)
}

fn settings(name: &str, margin: u32, multi_label: bool) -> ModelSettings {
    ModelSettings {
        weights_path: format!("stub://{}", name),
        model_name: name.to_string(),
        margin,
        multi_label,
        multi_label_iou_threshold: 0.5,
        ..ModelSettings::default()
    }
}

fn two_flower_cascade() -> Cascade {
    let flowers = StubBackend::new().respond(vec![
        det(10.0, 10.0, 110.0, 90.0, 0.95, "daisy"),
        det(150.0, 20.0, 230.0, 100.0, 0.81, "clover"),
    ]);
    // Crop of flower 0: boxes 0 and 1 overlap, box 2 stands alone.
    // Crop of flower 1: a single box.
    let pollinators = StubBackend::new()
        .respond(vec![
            det(5.0, 5.0, 35.0, 35.0, 0.9, "honeybee"),
            det(6.0, 6.0, 36.0, 36.0, 0.7, "bumblebee"),
            det(60.0, 40.0, 80.0, 60.0, 0.66, "hoverfly"),
        ])
        .respond(vec![det(10.0, 10.0, 30.0, 40.0, 0.55, "butterfly")]);
    Cascade::new(
        DetectionStage::new(Box::new(flowers), settings("flowers.onnx", 0, false)),
        DetectionStage::new(Box::new(pollinators), settings("pollinators.onnx", 2, true)),
    )
}

#[test]
fn indexes_pollinators_across_flower_crops() {
    let input = tempfile::tempdir().expect("input dir");
    let output = tempfile::tempdir().expect("output dir");
    let image_path = input.path().join("nodeA_2023-05-01T10-00-00Z.png");
    RgbImage::from_pixel(320, 200, Rgb([30, 120, 40]))
        .save(&image_path)
        .expect("write image");

    let mut pipeline = Pipeline::new(
        Box::new(DirectorySource::new(input.path(), ".png")),
        two_flower_cascade(),
    )
    .with_store(Box::new(FileResultStore::new(output.path(), true)));

    let outcome = pipeline.process_next().expect("process image");
    let stored = match outcome {
        Outcome::Delivered {
            flowers,
            pollinators,
            stored,
            failed_sinks,
        } => {
            assert_eq!((flowers, pollinators, failed_sinks), (2, 3, 0));
            stored.expect("result stored")
        }
        other => panic!("unexpected outcome {:?}", other),
    };
    assert_eq!(
        stored,
        output
            .path()
            .join("nodeA/2023-05-01/10/nodeA_2023-05-01T10-00-00Z.json")
    );

    let message =
        ResultMessage::from_json(&std::fs::read_to_string(&stored).expect("read result"))
            .expect("parse result");

    let flowers: Vec<(usize, &str, [u32; 2])> = message
        .detections
        .flowers
        .iter()
        .map(|f| (f.index, f.class_name.as_str(), f.size))
        .collect();
    assert_eq!(
        flowers,
        vec![(0, "daisy", [100, 80]), (1, "clover", [80, 80])]
    );

    let pollinators: Vec<(usize, usize, &str, f64)> = message
        .detections
        .pollinators
        .iter()
        .map(|p| (p.index, p.flower_index, p.class_name.as_str(), p.score))
        .collect();
    assert_eq!(
        pollinators,
        vec![
            (0, 0, "honeybee", 0.9),
            (1, 0, "hoverfly", 0.66),
            (2, 1, "butterfly", 0.55),
        ]
    );
    assert!(message
        .detections
        .pollinators
        .iter()
        .all(|p| p.crop.is_some()));

    let meta = &message.metadata;
    assert_eq!(meta.original_image.size, [320, 200]);
    assert_eq!(meta.flower_inference.model_name, "flowers.onnx");
    assert_eq!(meta.flower_inference.inference_times.len(), 1);
    assert_eq!(meta.pollinator_inference.inference_times.len(), 2);
    assert!(meta.pollinator_inference.multi_label);
    assert_eq!(meta.source.node_id, "nodeA");

    assert_eq!(pipeline.process_next().expect("idle"), Outcome::Idle);
}

#[test]
fn unparseable_filename_still_produces_a_result() {
    let input = tempfile::tempdir().expect("input dir");
    let output = tempfile::tempdir().expect("output dir");
    RgbImage::new(64, 64)
        .save(input.path().join("garbage.png"))
        .expect("write image");

    let cascade = Cascade::new(
        DetectionStage::new(Box::new(StubBackend::new()), settings("f", 0, false)),
        DetectionStage::new(Box::new(StubBackend::new()), settings("p", 0, false)),
    );
    let mut pipeline = Pipeline::new(
        Box::new(DirectorySource::new(input.path(), ".png")),
        cascade,
    )
    .with_store(Box::new(FileResultStore::new(output.path(), false)));

    match pipeline.process_next().expect("process image") {
        Outcome::Delivered { stored, .. } => assert_eq!(
            stored.expect("result stored"),
            output
                .path()
                .join("unknown-garbage/1970-01-01/00/unknown-garbage_1970-01-01T00-00-00Z.json")
        ),
        other => panic!("unexpected outcome {:?}", other),
    }
}
