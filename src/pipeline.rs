//! Per-image driver: source → cascade → result → sinks.
//!
//! `Pipeline::process_next` handles exactly one work item. Per-image failures
//! (undecodable image, flower-stage failure, broken invariants) abandon that image
//! and are reported through the returned `Outcome`; only a failing work source is
//! returned as an error. Sink failures are logged and counted, never retried.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::cascade::{Cascade, DetectionStage};
use crate::config::PipelineConfig;
use crate::detect::load_backend;
use crate::error::PipelineError;
use crate::frame::SourceImage;
use crate::ingest::{open_source, WorkItem, WorkSource};
use crate::message::{DetectionResult, SourceIdentity};
use crate::storage::{FileResultStore, ResultStore};
use crate::transport::{local_hostname, HttpSender, MqttSender, ResultSender, Substitutions};

/// What happened to one work item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The source had nothing to hand out.
    Idle,
    /// The result was handed to every configured sink.
    Delivered {
        flowers: usize,
        pollinators: usize,
        stored: Option<PathBuf>,
        failed_sinks: usize,
    },
    /// No pollinators were found and empty results are ignored.
    SkippedEmpty,
    /// The image could not be processed.
    Abandoned,
}

/// Counts of outcomes over several items.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub delivered: usize,
    pub skipped_empty: usize,
    pub abandoned: usize,
}

impl RunSummary {
    pub fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Idle => {}
            Outcome::Delivered { .. } => self.delivered += 1,
            Outcome::SkippedEmpty => self.skipped_empty += 1,
            Outcome::Abandoned => self.abandoned += 1,
        }
    }

    pub fn processed(&self) -> usize {
        self.delivered + self.skipped_empty + self.abandoned
    }
}

pub struct Pipeline {
    source: Box<dyn WorkSource>,
    cascade: Cascade,
    store: Option<Box<dyn ResultStore>>,
    senders: Vec<Box<dyn ResultSender>>,
    hostname: String,
    ignore_empty_results: bool,
    remove_after_processing: bool,
}

impl Pipeline {
    pub fn new(source: Box<dyn WorkSource>, cascade: Cascade) -> Self {
        Self {
            source,
            cascade,
            store: None,
            senders: Vec::new(),
            hostname: "localhost".to_string(),
            ignore_empty_results: false,
            remove_after_processing: false,
        }
    }

    /// Wire up backends, source and sinks from a validated configuration.
    pub fn from_config(cfg: &PipelineConfig) -> Result<Self> {
        let hostname = local_hostname();
        let flower = DetectionStage::new(load_backend(&cfg.flower)?, cfg.flower.clone());
        let pollinator =
            DetectionStage::new(load_backend(&cfg.pollinator)?, cfg.pollinator.clone());
        let mut cascade = Cascade::new(flower, pollinator);
        cascade.warm_up()?;

        let mut pipeline = Self::new(open_source(&cfg.input.source)?, cascade)
            .with_hostname(hostname.clone())
            .ignore_empty_results(cfg.output.ignore_empty_results)
            .remove_after_processing(cfg.input.remove_after_processing);
        if cfg.input.remove_after_processing {
            log::warn!("input files are removed after processing");
        }

        if let Some(file) = &cfg.output.file {
            log::info!("storing results below {}", file.base_dir.display());
            pipeline = pipeline.with_store(Box::new(FileResultStore::new(
                &file.base_dir,
                file.save_crops,
            )));
        }
        if let Some(mqtt) = &cfg.output.mqtt {
            pipeline = pipeline.with_sender(Box::new(MqttSender::connect(mqtt, &hostname)?));
        }
        if let Some(http) = &cfg.output.http {
            log::info!("sending results with {} {}", http.method.as_str(), http.url);
            pipeline = pipeline.with_sender(Box::new(HttpSender::new(http, &hostname)));
        }
        Ok(pipeline)
    }

    pub fn with_store(mut self, store: Box<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_sender(mut self, sender: Box<dyn ResultSender>) -> Self {
        self.senders.push(sender);
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn ignore_empty_results(mut self, ignore: bool) -> Self {
        self.ignore_empty_results = ignore;
        self
    }

    pub fn remove_after_processing(mut self, remove: bool) -> Self {
        self.remove_after_processing = remove;
        self
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// Pull and process one item.
    pub fn process_next(&mut self) -> Result<Outcome> {
        match self.next_item()? {
            Some(item) => self.process_item(&item),
            None => Ok(Outcome::Idle),
        }
    }

    pub fn next_item(&mut self) -> Result<Option<WorkItem>> {
        self.source.next_item()
    }

    /// Process an item obtained from [`Pipeline::next_item`] and report it complete.
    pub fn process_item(&mut self, item: &WorkItem) -> Result<Outcome> {
        let outcome = self.process_path(item.path());
        self.finish(item, &outcome)?;
        Ok(outcome)
    }

    /// Process items until the source reports idle.
    pub fn drain(&mut self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        loop {
            let outcome = self.process_next()?;
            if outcome == Outcome::Idle {
                return Ok(summary);
            }
            summary.record(&outcome);
        }
    }

    /// Run one image through the cascade and hand the result to every sink.
    pub fn process_path(&mut self, path: &Path) -> Outcome {
        let source = SourceIdentity::from_path(path);
        log::info!(
            "processing {}",
            path.file_name()
                .map(|n| n.to_string_lossy())
                .unwrap_or_default()
        );

        let result = match self.detect(path, source) {
            Ok(result) => result,
            Err(e) => {
                log::error!("abandoning {}: {}", path.display(), e);
                return Outcome::Abandoned;
            }
        };

        if self.ignore_empty_results && result.is_empty() {
            log::info!("no pollinators detected, skipping");
            return Outcome::SkippedEmpty;
        }

        let (stored, failed_sinks) = self.deliver(&result);
        Outcome::Delivered {
            flowers: result.flowers().len(),
            pollinators: result.pollinators().len(),
            stored,
            failed_sinks,
        }
    }

    fn detect(
        &mut self,
        path: &Path,
        source: SourceIdentity,
    ) -> Result<DetectionResult, PipelineError> {
        let image = SourceImage::open(path)?;
        let output = self.cascade.run(&image)?;
        log::info!(
            "found {} flowers in {} ms",
            output.flowers.len(),
            output.flower_timing.total_millis()
        );
        log::info!(
            "found {} pollinators in {} ms",
            output.pollinators.len(),
            output.pollinator_timing.total_millis()
        );
        DetectionResult::assemble(
            source,
            output,
            self.cascade.flower_stage().settings(),
            self.cascade.pollinator_stage().settings(),
        )
    }

    fn deliver(&mut self, result: &DetectionResult) -> (Option<PathBuf>, usize) {
        let filename = result.source().output_filename();
        let mut failed = 0;

        let stored = self.store.as_mut().and_then(|store| {
            match store.store(result, &result.source().storage_dir(), &filename) {
                Ok(path) => Some(path),
                Err(e) => {
                    failed += 1;
                    log::warn!("{}", PipelineError::transport("file", e));
                    None
                }
            }
        });

        if self.senders.is_empty() {
            return (stored, failed);
        }
        let message = match result.to_message(true) {
            Ok(message) => message,
            Err(e) => {
                log::error!("cannot serialize result for sending: {}", e);
                return (stored, failed + self.senders.len());
            }
        };
        let vars = Substitutions {
            filename: &filename,
            node_id: &result.source().node_id,
            hostname: &self.hostname,
        };
        for sender in &mut self.senders {
            if let Err(e) = sender.send(&message, &vars) {
                failed += 1;
                log::warn!("{}", PipelineError::transport(sender.name(), e));
            }
        }
        (stored, failed)
    }

    fn finish(&mut self, item: &WorkItem, outcome: &Outcome) -> Result<()> {
        let processed = matches!(outcome, Outcome::Delivered { .. } | Outcome::SkippedEmpty);
        if processed && self.remove_after_processing {
            log::info!("removing {}", item.path().display());
            if let Err(e) = std::fs::remove_file(item.path()) {
                log::warn!("failed to remove {}: {}", item.path().display(), e);
            }
        }
        self.source.complete(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelSettings;
    use crate::detect::{Detection, StubBackend};
    use crate::geometry::BoundingBox;
    use crate::message::ResultMessage;
    use crate::storage::InMemoryResultStore;
    use image::RgbImage;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    struct ListSource(VecDeque<PathBuf>);

    impl WorkSource for ListSource {
        fn name(&self) -> &str {
            "list"
        }

        fn next_item(&mut self) -> Result<Option<WorkItem>> {
            Ok(self.0.pop_front().map(WorkItem::new))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSender {
        sent: Arc<Mutex<Vec<(String, ResultMessage)>>>,
        fail: bool,
    }

    impl ResultSender for RecordingSender {
        fn name(&self) -> &str {
            "recording"
        }

        fn send(&mut self, message: &ResultMessage, vars: &Substitutions<'_>) -> Result<()> {
            if self.fail {
                anyhow::bail!("broker down");
            }
            self.sent
                .lock()
                .unwrap()
                .push((vars.apply("${hostname}/${node_id}/${filename}"), message.clone()));
            Ok(())
        }
    }

    fn det(x0: f32, y0: f32, x1: f32, y1: f32) -> Detection {
        Detection::new(BoundingBox::new(x0, y0, x1, y1), 0.8, 0)
    }

    fn write_image(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        RgbImage::new(64, 48).save(&path).unwrap();
        path
    }

    fn cascade(flowers: StubBackend, pollinators: StubBackend) -> Cascade {
        let settings = ModelSettings {
            margin: 0,
            ..ModelSettings::default()
        };
        Cascade::new(
            DetectionStage::new(Box::new(flowers), settings.clone()),
            DetectionStage::new(Box::new(pollinators), settings),
        )
    }

    #[test]
    fn delivers_to_store_and_senders() {
        let dir = tempfile::tempdir().unwrap();
        let image = write_image(dir.path(), "nodeA_2023-05-01T10-00-00Z.png");
        let sender = RecordingSender::default();
        let sent = Arc::clone(&sender.sent);

        let mut pipeline = Pipeline::new(
            Box::new(ListSource(VecDeque::from([image]))),
            cascade(
                StubBackend::new().respond(vec![det(0.0, 0.0, 20.0, 20.0)]),
                StubBackend::new().respond(vec![det(2.0, 2.0, 6.0, 6.0)]),
            ),
        )
        .with_store(Box::new(InMemoryResultStore::new(false)))
        .with_sender(Box::new(sender))
        .with_hostname("edge-01");

        let outcome = pipeline.process_next().unwrap();
        assert_eq!(
            outcome,
            Outcome::Delivered {
                flowers: 1,
                pollinators: 1,
                stored: Some(PathBuf::from(
                    "nodeA/2023-05-01/10/nodeA_2023-05-01T10-00-00Z.json"
                )),
                failed_sinks: 0,
            }
        );
        let sent = sent.lock().unwrap();
        assert_eq!(sent[0].0, "edge-01/nodeA/nodeA_2023-05-01T10-00-00Z.json");
        assert!(sent[0].1.detections.pollinators[0].crop.is_some());
        assert_eq!(pipeline.process_next().unwrap(), Outcome::Idle);
    }

    #[test]
    fn pollinator_indices_restart_for_each_image() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_image(dir.path(), "nodeA_2023-05-01T10-00-00Z.png");
        let second = write_image(dir.path(), "nodeA_2023-05-01T10-05-00Z.png");
        let sender = RecordingSender::default();
        let sent = Arc::clone(&sender.sent);

        let mut pipeline = Pipeline::new(
            Box::new(ListSource(VecDeque::from([first, second]))),
            cascade(
                StubBackend::new()
                    .respond(vec![det(0.0, 0.0, 20.0, 20.0), det(30.0, 10.0, 50.0, 30.0)])
                    .respond(vec![det(10.0, 10.0, 40.0, 40.0)]),
                StubBackend::new()
                    .respond(vec![det(1.0, 1.0, 5.0, 5.0), det(10.0, 10.0, 15.0, 15.0)])
                    .respond(vec![det(2.0, 2.0, 8.0, 8.0)])
                    .respond(vec![det(3.0, 3.0, 9.0, 9.0), det(12.0, 12.0, 20.0, 20.0)]),
            ),
        )
        .with_sender(Box::new(sender));

        let summary = pipeline.drain().unwrap();
        assert_eq!(summary.delivered, 2);

        let sent = sent.lock().unwrap();
        let indices: Vec<Vec<(usize, usize)>> = sent
            .iter()
            .map(|(_, message)| {
                message
                    .detections
                    .pollinators
                    .iter()
                    .map(|p| (p.index, p.flower_index))
                    .collect()
            })
            .collect();
        assert_eq!(
            indices,
            vec![vec![(0, 0), (1, 0), (2, 1)], vec![(0, 0), (1, 0)]]
        );
    }

    #[test]
    fn empty_results_are_skipped_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let image = write_image(dir.path(), "nodeA_2023-05-01T10-00-00Z.png");
        let mut pipeline = Pipeline::new(
            Box::new(ListSource(VecDeque::from([image.clone()]))),
            cascade(
                StubBackend::new().respond(vec![det(0.0, 0.0, 20.0, 20.0)]),
                StubBackend::new(),
            ),
        )
        .ignore_empty_results(true)
        .remove_after_processing(true);

        assert_eq!(pipeline.process_next().unwrap(), Outcome::SkippedEmpty);
        assert!(!image.exists());
    }

    #[test]
    fn undecodable_image_is_abandoned_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("nodeA_2023-05-01T10-00-00Z.jpg");
        std::fs::write(&broken, b"not an image").unwrap();
        let mut pipeline = Pipeline::new(
            Box::new(ListSource(VecDeque::from([broken.clone()]))),
            cascade(StubBackend::new(), StubBackend::new()),
        )
        .remove_after_processing(true);

        assert_eq!(pipeline.process_next().unwrap(), Outcome::Abandoned);
        assert!(broken.exists());
    }

    #[test]
    fn sender_failure_is_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let image = write_image(dir.path(), "nodeA_2023-05-01T10-00-00Z.png");
        let failing = RecordingSender {
            fail: true,
            ..RecordingSender::default()
        };
        let mut pipeline = Pipeline::new(
            Box::new(ListSource(VecDeque::from([image]))),
            cascade(StubBackend::new(), StubBackend::new()),
        )
        .with_sender(Box::new(failing));

        match pipeline.process_next().unwrap() {
            Outcome::Delivered { failed_sinks, .. } => assert_eq!(failed_sinks, 1),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn drain_counts_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_image(dir.path(), "nodeA_2023-05-01T10-00-00Z.png");
        let missing = dir.path().join("nodeA_2023-05-01T11-00-00Z.png");
        let mut pipeline = Pipeline::new(
            Box::new(ListSource(VecDeque::from([good, missing]))),
            cascade(StubBackend::new(), StubBackend::new()),
        );
        let summary = pipeline.drain().unwrap();
        assert_eq!(
            summary,
            RunSummary {
                delivered: 1,
                skipped_empty: 0,
                abandoned: 1,
            }
        );
        assert_eq!(summary.processed(), 2);
    }
}
