//! In-memory doubles for every client trait, and a harness wiring them into
//! a pipeline the way the worker binary wires the real clients.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use detect_worker::app_state::AppState;
use detect_worker::consumer::{ConsumerLoop, LoopSettings};
use detect_worker::db::{DocumentStoreError, PredictionStore};
use detect_worker::models::prediction::{PredictionId, PredictionRecord};
use detect_worker::pipeline::{JobPipeline, PipelineSettings};
use detect_worker::services::class_names::ClassNameTable;
use detect_worker::services::detector::{
    labels_path, rendered_path, DetectionArtifacts, Detector, DetectorError,
};
use detect_worker::services::notifier::{NotifyError, Notifier};
use detect_worker::services::queue::{AckToken, MessageQueue, QueueError, QueueMessage};
use detect_worker::services::retry::RetryPolicy;
use detect_worker::services::storage::{ObjectStore, StorageError};

use crate::fixtures;

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QueueInner {
    pending: VecDeque<String>,
    leased: HashMap<String, String>,
    acked: Vec<String>,
    next_token: u64,
}

/// Lease-based queue: received messages stay leased until deleted, and
/// `redeliver_unacked` plays the part of an expired visibility timeout.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<QueueInner>,
    fail_receives: AtomicU32,
    fail_next_delete: AtomicBool,
    receives: AtomicU32,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, body: impl Into<String>) {
        self.inner.lock().unwrap().pending.push_back(body.into());
    }

    pub fn redeliver_unacked(&self) {
        let mut inner = self.inner.lock().unwrap();
        let leased: Vec<String> = inner.leased.drain().map(|(_, body)| body).collect();
        inner.pending.extend(leased);
    }

    pub fn acked(&self) -> Vec<String> {
        self.inner.lock().unwrap().acked.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap().leased.len()
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn receives(&self) -> u32 {
        self.receives.load(Ordering::SeqCst)
    }

    pub fn fail_receives(&self, count: u32) {
        self.fail_receives.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_delete(&self) {
        self.fail_next_delete.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn receive(&self, _wait: Duration) -> Result<Option<QueueMessage>, QueueError> {
        self.receives.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_receives
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(QueueError::Unavailable("connection reset".into()));
        }

        let mut inner = self.inner.lock().unwrap();
        let Some(body) = inner.pending.pop_front() else {
            return Ok(None);
        };
        inner.next_token += 1;
        let token = format!("lease-{}", inner.next_token);
        inner.leased.insert(token.clone(), body.clone());
        Ok(Some(QueueMessage {
            body,
            ack_token: AckToken::new(token),
        }))
    }

    async fn delete(&self, token: AckToken) -> Result<(), QueueError> {
        if self.fail_next_delete.swap(false, Ordering::SeqCst) {
            return Err(QueueError::Unavailable("delete timed out".into()));
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(body) = inner.leased.remove(token.as_str()) {
            inner.acked.push(body);
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Object store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    uploads: Mutex<Vec<(String, String)>>,
    downloads: Mutex<Vec<String>>,
    fail_uploads: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    /// `(key, content type)` of every successful upload.
    pub fn uploads(&self) -> Vec<(String, String)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }

    pub fn fail_uploads(&self) {
        self.fail_uploads.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.downloads.lock().unwrap().push(key.to_string());
        self.get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(StorageError::Status {
                key: key.to_string(),
                status: 503,
            });
        }
        self.put(key, data);
        self.uploads
            .lock()
            .unwrap()
            .push((key.to_string(), content_type.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Document store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryDocuments {
    records: Mutex<Vec<PredictionRecord>>,
    failures: Mutex<VecDeque<DocumentStoreError>>,
    always_not_primary: AtomicBool,
    attempts: AtomicU32,
}

impl MemoryDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next insert with `err`; queued failures are consumed in order.
    pub fn fail_next(&self, err: DocumentStoreError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn always_not_writable_primary(&self) {
        self.always_not_primary.store(true, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<PredictionRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PredictionStore for MemoryDocuments {
    async fn insert(&self, record: &PredictionRecord) -> Result<(), DocumentStoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.always_not_primary.load(Ordering::SeqCst) {
            return Err(DocumentStoreError::NotWritablePrimary(
                "cannot execute INSERT in a read-only transaction".into(),
            ));
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn health_check(&self) -> Result<(), DocumentStoreError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum DetectorBehavior {
    /// Write these raw label lines and a rendered copy of the input.
    Lines(String),
    /// Same, for output that is not necessarily UTF-8.
    Bytes(Vec<u8>),
    Fail,
    Panic,
}

/// Stands in for the ONNX engine: emits scripted output lines.
pub struct FakeDetector {
    behavior: Mutex<DetectorBehavior>,
    calls: AtomicU32,
}

impl FakeDetector {
    pub fn new(behavior: DetectorBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            calls: AtomicU32::new(0),
        }
    }

    pub fn lines(lines: &str) -> Self {
        Self::new(DetectorBehavior::Lines(lines.to_string()))
    }

    pub fn bytes(output: &[u8]) -> Self {
        Self::new(DetectorBehavior::Bytes(output.to_vec()))
    }

    pub fn set_behavior(&self, behavior: DetectorBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Detector for FakeDetector {
    fn detect(&self, image: &Path, output_dir: &Path) -> Result<DetectionArtifacts, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().unwrap().clone();

        let output = match behavior {
            DetectorBehavior::Lines(lines) => lines.into_bytes(),
            DetectorBehavior::Bytes(bytes) => bytes,
            DetectorBehavior::Fail => {
                return Err(DetectorError::Inference("execution provider crashed".into()))
            }
            DetectorBehavior::Panic => panic!("detector blew up"),
        };

        let labels = labels_path(image, output_dir);
        let rendered = rendered_path(image, output_dir);
        std::fs::create_dir_all(labels.parent().unwrap())?;
        if !output.is_empty() {
            std::fs::write(&labels, &output)?;
        }
        std::fs::copy(image, &rendered)?;

        Ok(DetectionArtifacts {
            labels_path: labels,
            rendered_path: rendered,
            detections: output
                .split(|b| *b == b'\n')
                .filter(|l| !l.trim_ascii().is_empty())
                .count(),
        })
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<PredictionId>>,
    fail: AtomicBool,
    panic_next: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let notifier = Self::default();
        notifier.fail.store(true, Ordering::SeqCst);
        notifier
    }

    /// Panic inside the next notify call, outside any stage's own guard.
    pub fn panic_next(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<PredictionId> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, prediction_id: &PredictionId) -> Result<(), NotifyError> {
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("notifier blew up");
        }
        self.sent.lock().unwrap().push(*prediction_id);
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Status(502));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub queue: Arc<MemoryQueue>,
    pub storage: Arc<MemoryStore>,
    pub documents: Arc<MemoryDocuments>,
    pub detector: Arc<FakeDetector>,
    pub notifier: Arc<RecordingNotifier>,
    pub pipeline: Arc<JobPipeline>,
    pub scratch: TempDir,
}

pub const PERSIST_ATTEMPTS: u32 = 3;

impl Harness {
    pub fn new(detector: FakeDetector) -> Self {
        Self::with_notifier(detector, RecordingNotifier::new())
    }

    pub fn with_notifier(detector: FakeDetector, notifier: RecordingNotifier) -> Self {
        let queue = Arc::new(MemoryQueue::new());
        let storage = Arc::new(MemoryStore::new());
        let documents = Arc::new(MemoryDocuments::new());
        let detector = Arc::new(detector);
        let notifier = Arc::new(notifier);
        let scratch = tempfile::tempdir().expect("create scratch dir");

        let class_names =
            ClassNameTable::new(fixtures::coco_names()).expect("class table is non-empty");
        let state = AppState::new(
            queue.clone(),
            storage.clone(),
            documents.clone(),
            detector.clone(),
            class_names,
        )
        .with_notifier(notifier.clone());

        let settings = PipelineSettings {
            scratch_dir: scratch.path().to_path_buf(),
            persist_policy: RetryPolicy::new(PERSIST_ATTEMPTS, Duration::from_millis(1)),
            upload_policy: RetryPolicy::once(),
        };
        let pipeline = Arc::new(JobPipeline::new(state, settings));

        Self {
            queue,
            storage,
            documents,
            detector,
            notifier,
            pipeline,
            scratch,
        }
    }

    pub fn consumer(&self) -> ConsumerLoop {
        self.consumer_with_concurrency(1)
    }

    pub fn consumer_with_concurrency(&self, concurrency: usize) -> ConsumerLoop {
        ConsumerLoop::new(
            self.queue.clone(),
            self.pipeline.clone(),
            LoopSettings {
                poll_wait: Duration::from_millis(1),
                idle_sleep: Duration::from_millis(1),
                error_pause: Duration::from_millis(1),
                concurrency,
            },
        )
    }

    /// Receive the next message and run it through the pipeline.
    pub async fn handle_next(
        &self,
    ) -> Result<detect_worker::pipeline::JobOutcome, detect_worker::error::PipelineError> {
        let message = self
            .queue
            .receive(Duration::ZERO)
            .await
            .expect("memory queue receive")
            .expect("a pending message");
        self.pipeline.handle(message).await
    }

    /// Scratch directories left behind by finished jobs.
    pub fn scratch_entries(&self) -> usize {
        std::fs::read_dir(self.scratch.path())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

/// Shared buffer a `tracing_subscriber::fmt` subscriber can write into.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    /// Install a subscriber writing to this buffer for the current thread.
    pub fn capture(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
