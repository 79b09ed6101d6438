//! Image annotation for stored frames.
//!
//! Every stored image can be queued for a describe call against an external
//! vision service. A fixed pool of workers drains the queue, merges the answer
//! and the pose parsed from the file name into a `<stem>.json` sidecar, and
//! reports failures on an error channel.

use crate::config::AnnotationConfig;
use crate::session_manager::{SessionError, SessionManager};
use async_trait::async_trait;
use chrono::Local;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Prompt recorded when the service does not echo one back.
pub const DEFAULT_PROMPT: &str = "Describe the objects in the image";

/// `.../x120y-40z300yaw1570796[__tag].jpg`: millimetres and micro-radians.
static COMPACT_POSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:^|/)x(?P<x>-?\d{1,6})y(?P<y>-?\d{1,6})z(?P<z>-?\d{1,6})yaw(?P<yaw>-?\d{1,9})(?:__[^/]+)?\.[A-Za-z0-9]+$",
    )
    .expect("compact pose regex should compile")
});

/// `..._x0.12_y-0.04_z0.3_yaw1.57.jpg`: metres and radians.
static UNDERSCORE_POSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"_x(?P<x>-?\d+(?:\.\d+)?)_y(?P<y>-?\d+(?:\.\d+)?)_z(?P<z>-?\d+(?:\.\d+)?)_yaw(?P<yaw>-?\d+(?:\.\d+)?)\.[A-Za-z0-9]+$",
    )
    .expect("underscore pose regex should compile")
});

#[derive(Debug, Error)]
pub enum AnnotateError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Annotation request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Annotation service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to write sidecar: {0}")]
    Sidecar(#[from] SessionError),

    #[error("Worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Camera pose encoded in an image file name, in metres and radians.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f64,
}

/// Parse the pose out of a file name; unknown layouts give the zero pose.
pub fn parse_pose(path: &Path) -> Pose {
    let text = path.to_string_lossy();

    if let Some(caps) = COMPACT_POSE.captures(&text) {
        let field = |name: &str| caps[name].parse::<i64>().unwrap_or(0) as f64;
        return Pose {
            x: field("x") / 1000.0,
            y: field("y") / 1000.0,
            z: field("z") / 1000.0,
            yaw: field("yaw") / 1_000_000.0,
        };
    }

    if let Some(caps) = UNDERSCORE_POSE.captures(&text) {
        let field = |name: &str| caps[name].parse::<f64>().unwrap_or(0.0);
        return Pose {
            x: field("x"),
            y: field("y"),
            z: field("z"),
            yaw: field("yaw"),
        };
    }

    Pose::default()
}

/// What the annotation service answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    /// Parsed body, when it was JSON.
    pub json: Option<Value>,
    pub raw: String,
}

impl Annotation {
    pub fn from_body(raw: String) -> Self {
        Self {
            json: serde_json::from_str(&raw).ok(),
            raw,
        }
    }

    fn prompt(&self) -> String {
        self.json
            .as_ref()
            .and_then(|v| v.get("auto_prompt"))
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_PROMPT)
            .to_string()
    }

    fn response(&self) -> Value {
        let from_json = self.json.as_ref().and_then(|v| {
            v.get("response_describe")
                .filter(|r| !r.is_null())
                .or_else(|| v.get("response").filter(|r| !r.is_null()))
        });
        from_json
            .cloned()
            .unwrap_or_else(|| Value::String(self.raw.clone()))
    }

    fn caption(&self) -> String {
        match &self.json {
            Some(value) => value.to_string(),
            None => self.raw.clone(),
        }
    }
}

/// The opaque describe call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Annotator: Send + Sync {
    async fn annotate(&self, image: &Path) -> Result<Annotation, AnnotateError>;
}

/// How the image reaches the annotation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationMode {
    /// JSON `{"image_path": ...}`; the service shares the filesystem.
    Path,
    /// Multipart `image` field with the file bytes.
    Upload,
}

impl AnnotationMode {
    pub fn parse(mode: &str) -> Option<Self> {
        match mode.to_ascii_lowercase().as_str() {
            "path" => Some(Self::Path),
            "upload" => Some(Self::Upload),
            _ => None,
        }
    }
}

/// Annotator backed by an HTTP describe endpoint.
pub struct HttpAnnotator {
    client: reqwest::Client,
    url: String,
    mode: AnnotationMode,
    remap: Option<(String, String)>,
}

impl HttpAnnotator {
    pub fn new(url: impl Into<String>, mode: AnnotationMode, timeout: Duration) -> Result<Self, AnnotateError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            mode,
            remap: None,
        })
    }

    pub fn from_config(config: &AnnotationConfig) -> Result<Self, AnnotateError> {
        let mode = AnnotationMode::parse(&config.mode).unwrap_or(AnnotationMode::Path);
        Ok(Self::new(config.url.clone(), mode, config.timeout())?.with_remap(config.remap()))
    }

    /// Rewrite a path prefix before sending it in `path` mode.
    pub fn with_remap(mut self, remap: Option<(String, String)>) -> Self {
        self.remap = remap;
        self
    }

    /// The path as the annotation service sees it.
    pub fn remote_path(&self, image: &Path) -> String {
        let local = image.to_string_lossy();
        match &self.remap {
            Some((src, dst)) if local.starts_with(src.as_str()) => {
                format!("{}{}", dst, &local[src.len()..])
            }
            _ => local.into_owned(),
        }
    }
}

#[async_trait]
impl Annotator for HttpAnnotator {
    #[instrument(skip(self), fields(mode = ?self.mode))]
    async fn annotate(&self, image: &Path) -> Result<Annotation, AnnotateError> {
        let request = match self.mode {
            AnnotationMode::Path => self
                .client
                .post(&self.url)
                .json(&json!({ "image_path": self.remote_path(image) })),
            AnnotationMode::Upload => {
                let bytes = tokio::fs::read(image)
                    .await
                    .map_err(|source| AnnotateError::Read {
                        path: image.to_path_buf(),
                        source,
                    })?;
                let file_name = image
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "image.jpg".to_string());
                let part = Part::bytes(bytes).file_name(file_name).mime_str("image/jpeg")?;
                self.client.post(&self.url).multipart(Form::new().part("image", part))
            }
        };

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AnnotateError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(Annotation::from_body(body))
    }
}

/// Merge one annotation attempt into a sidecar object.
///
/// Existing fields are kept; `pose` and `image` are overwritten, a new entry
/// is appended to `entries`, and `vlm_error` is only set the first time a
/// call fails. `outcome` carries the error message of a failed call.
pub fn apply_annotation(
    sidecar: &mut Map<String, Value>,
    image: &Path,
    outcome: &Result<Annotation, String>,
) {
    let pose = parse_pose(image);
    sidecar.insert("pose".to_string(), json!(pose));
    if let Some(name) = image.file_name() {
        sidecar.insert("image".to_string(), json!(name.to_string_lossy()));
    }

    let annotation = match outcome {
        Ok(annotation) => annotation.clone(),
        Err(message) => {
            if !sidecar.contains_key("vlm_error") {
                sidecar.insert("vlm_error".to_string(), json!(message));
            }
            Annotation {
                json: None,
                raw: String::new(),
            }
        }
    };

    let entry = json!({
        "timestamp": Local::now().to_rfc3339(),
        "prompt": annotation.prompt(),
        "response": annotation.response(),
    });
    match sidecar.get_mut("entries").and_then(Value::as_array_mut) {
        Some(entries) => entries.push(entry),
        None => {
            sidecar.insert("entries".to_string(), Value::Array(vec![entry]));
        }
    }

    sidecar.insert("vlm_caption".to_string(), json!(annotation.caption()));
}

/// A failed annotation job.
#[derive(Debug)]
pub struct AnnotationFailure {
    pub image: PathBuf,
    pub error: AnnotateError,
}

/// Producer side of the job queue.
#[derive(Clone)]
pub struct AnnotationQueue {
    jobs: mpsc::Sender<PathBuf>,
}

impl AnnotationQueue {
    /// Enqueue without waiting; a full or closed queue drops the job.
    pub fn try_submit(&self, image: PathBuf) -> bool {
        match self.jobs.try_send(image) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(image)) => {
                warn!(image = %image.display(), "Annotation queue full, dropping job");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Running annotation workers.
pub struct AnnotationPool {
    workers: Vec<JoinHandle<()>>,
}

impl AnnotationPool {
    /// Spawn `workers` tasks sharing one bounded queue.
    ///
    /// Returns the queue, the pool and the failure channel. Workers exit once
    /// every queue handle is dropped.
    pub fn start(
        annotator: Arc<dyn Annotator>,
        sessions: Arc<SessionManager>,
        workers: usize,
        queue_size: usize,
        settle: Duration,
    ) -> (AnnotationQueue, Self, mpsc::UnboundedReceiver<AnnotationFailure>) {
        let (jobs_tx, jobs_rx) = mpsc::channel::<PathBuf>(queue_size.max(1));
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));

        let workers = (0..workers.max(1))
            .map(|worker_id| {
                let jobs = jobs_rx.clone();
                let annotator = annotator.clone();
                let sessions = sessions.clone();
                let failures = failures_tx.clone();
                tokio::spawn(async move {
                    loop {
                        let next = jobs.lock().await.recv().await;
                        let Some(image) = next else { break };
                        if !settle.is_zero() {
                            tokio::time::sleep(settle).await;
                        }
                        if let Err(error) = run_job(annotator.as_ref(), &sessions, &image).await {
                            let _ = failures.send(AnnotationFailure { image, error });
                        }
                    }
                    debug!(worker_id, "Annotation worker stopped");
                })
            })
            .collect::<Vec<_>>();

        info!(workers = workers.len(), queue_size, "Annotation pool started");
        (AnnotationQueue { jobs: jobs_tx }, Self { workers }, failures_rx)
    }

    /// Wait for the workers to drain the queue and exit.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Annotation worker panicked");
            }
        }
    }
}

/// Annotate one image and record the attempt in its sidecar.
///
/// The sidecar is written for failed calls too; the annotate error is still
/// returned so it reaches the failure channel.
async fn run_job(
    annotator: &dyn Annotator,
    sessions: &Arc<SessionManager>,
    image: &Path,
) -> Result<(), AnnotateError> {
    let result = annotator.annotate(image).await;

    let dir = image.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let outcome = match &result {
        Ok(annotation) => Ok(annotation.clone()),
        Err(e) => Err(e.to_string()),
    };
    let sidecar = {
        let sessions = sessions.clone();
        let image = image.to_path_buf();
        tokio::task::spawn_blocking(move || {
            sessions.merge_sidecar(&dir, &stem, |sidecar| {
                apply_annotation(sidecar, &image, &outcome)
            })
        })
        .await??
    };

    debug!(image = %image.display(), sidecar = %sidecar.display(), "Annotation recorded");
    result.map(|_| ())
}

/// Drain the failure channel into the log.
pub fn log_failures(mut failures: mpsc::UnboundedReceiver<AnnotationFailure>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(failure) = failures.recv().await {
            metrics::counter!("camlink_annotation_failures_total").increment(1);
            warn!(
                image = %failure.image.display(),
                error = %failure.error,
                "Annotation failed"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_compact_pose() {
        let pose = parse_pose(Path::new("/s/x120y-40z300yaw1570796__cam0.jpg"));
        assert_eq!(
            pose,
            Pose {
                x: 0.12,
                y: -0.04,
                z: 0.3,
                yaw: 1.570796
            }
        );
        assert_eq!(parse_pose(Path::new("x1y2z3yaw4.png")).x, 0.001);
    }

    #[test]
    fn test_parse_underscore_pose() {
        let pose = parse_pose(Path::new("/s/shot_x0.5_y-1_z2.25_yaw3.1.jpg"));
        assert_eq!(
            pose,
            Pose {
                x: 0.5,
                y: -1.0,
                z: 2.25,
                yaw: 3.1
            }
        );
    }

    #[test]
    fn test_unknown_names_give_zero_pose() {
        assert_eq!(parse_pose(Path::new("/s/yard_0001_20240309_140500.jpg")), Pose::default());
        assert_eq!(parse_pose(Path::new("/s/x1y2z3.jpg")), Pose::default());
    }

    #[test]
    fn test_annotation_mode_parse() {
        assert_eq!(AnnotationMode::parse("Upload"), Some(AnnotationMode::Upload));
        assert_eq!(AnnotationMode::parse("path"), Some(AnnotationMode::Path));
        assert_eq!(AnnotationMode::parse("base64"), None);
    }

    #[test]
    fn test_remote_path_remap() {
        let annotator = HttpAnnotator::new("http://127.0.0.1:1/describe", AnnotationMode::Path, Duration::from_secs(1))
            .unwrap()
            .with_remap(Some(("/tmp/incoming_frames".to_string(), "/data".to_string())));
        assert_eq!(
            annotator.remote_path(Path::new("/tmp/incoming_frames/s/a.jpg")),
            "/data/s/a.jpg"
        );
        assert_eq!(annotator.remote_path(Path::new("/other/a.jpg")), "/other/a.jpg");
    }

    #[test]
    fn test_apply_annotation_json_response() {
        let mut sidecar = Map::new();
        sidecar.insert("operator".to_string(), json!("kim"));
        let result = Ok(Annotation::from_body(
            r#"{"auto_prompt":"List tools","response_describe":"a hammer"}"#.to_string(),
        ));

        apply_annotation(&mut sidecar, Path::new("/s/x0y0z0yaw0.jpg"), &result);

        assert_eq!(sidecar["operator"], "kim");
        assert_eq!(sidecar["image"], "x0y0z0yaw0.jpg");
        assert_eq!(sidecar["pose"], json!({"x": 0.0, "y": 0.0, "z": 0.0, "yaw": 0.0}));
        let entries = sidecar["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["prompt"], "List tools");
        assert_eq!(entries[0]["response"], "a hammer");
        assert!(sidecar["vlm_caption"].as_str().unwrap().contains("hammer"));
        assert!(!sidecar.contains_key("vlm_error"));
    }

    #[test]
    fn test_apply_annotation_raw_response_and_errors() {
        let mut sidecar = Map::new();
        let image = Path::new("/s/a.jpg");

        apply_annotation(&mut sidecar, image, &Ok(Annotation::from_body("plain words".to_string())));
        assert_eq!(sidecar["entries"][0]["prompt"], DEFAULT_PROMPT);
        assert_eq!(sidecar["entries"][0]["response"], "plain words");
        assert_eq!(sidecar["vlm_caption"], "plain words");

        apply_annotation(&mut sidecar, image, &Err("service returned 502".to_string()));
        let first_error = sidecar["vlm_error"].clone();
        apply_annotation(&mut sidecar, image, &Err("service returned 503".to_string()));

        assert_eq!(sidecar["entries"].as_array().unwrap().len(), 3);
        assert_eq!(sidecar["vlm_error"], first_error);
        assert!(first_error.as_str().unwrap().contains("502"));
    }

    #[tokio::test]
    async fn test_pool_writes_sidecars() {
        let tmp = TempDir::new().unwrap();
        let sessions = Arc::new(SessionManager::new(tmp.path(), Duration::from_secs(120)));
        let image = tmp.path().join("x10y20z30yaw0.jpg");
        std::fs::write(&image, b"jpeg").unwrap();

        let mut annotator = MockAnnotator::new();
        annotator
            .expect_annotate()
            .times(1)
            .returning(|_| Ok(Annotation::from_body(r#"{"response":"a crate"}"#.to_string())));

        let (queue, pool, mut failures) =
            AnnotationPool::start(Arc::new(annotator), sessions, 2, 4, Duration::ZERO);
        assert!(queue.try_submit(image.clone()));
        drop(queue);
        pool.join().await;

        let sidecar: Value =
            serde_json::from_slice(&std::fs::read(tmp.path().join("x10y20z30yaw0.json")).unwrap()).unwrap();
        assert_eq!(sidecar["entries"][0]["response"], "a crate");
        assert_eq!(sidecar["pose"]["y"], 0.02);
        assert!(failures.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_pool_reports_failures() {
        let tmp = TempDir::new().unwrap();
        let sessions = Arc::new(SessionManager::new(tmp.path(), Duration::from_secs(120)));
        let image = tmp.path().join("b.jpg");

        let mut annotator = MockAnnotator::new();
        annotator.expect_annotate().returning(|_| {
            Err(AnnotateError::Status {
                status: 500,
                body: "boom".to_string(),
            })
        });

        let (queue, pool, mut failures) =
            AnnotationPool::start(Arc::new(annotator), sessions, 1, 4, Duration::ZERO);
        queue.try_submit(image.clone());

        let failure = tokio::time::timeout(Duration::from_secs(2), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.image, image);
        assert!(matches!(failure.error, AnnotateError::Status { status: 500, .. }));

        drop(queue);
        pool.join().await;
        let sidecar: Value = serde_json::from_slice(&std::fs::read(tmp.path().join("b.json")).unwrap()).unwrap();
        assert!(sidecar["vlm_error"].as_str().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_full_queue_drops_jobs() {
        let tmp = TempDir::new().unwrap();
        let sessions = Arc::new(SessionManager::new(tmp.path(), Duration::from_secs(120)));

        let mut annotator = MockAnnotator::new();
        annotator
            .expect_annotate()
            .returning(|_| Ok(Annotation::from_body(String::new())));

        // A long settle keeps the single worker busy with the first job.
        let (queue, _pool, _failures) =
            AnnotationPool::start(Arc::new(annotator), sessions, 1, 1, Duration::from_secs(60));
        assert!(queue.try_submit(tmp.path().join("1.jpg")));
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.try_submit(tmp.path().join("2.jpg")));
        assert!(!queue.try_submit(tmp.path().join("3.jpg")));
    }
}
