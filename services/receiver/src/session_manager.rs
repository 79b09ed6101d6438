//! Session directories for incoming frames.
//!
//! Frames of one capture name land in the same timestamped directory while
//! they keep arriving within the reuse window; an explicit session hint
//! always pins the directory. The cache lives only in memory.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Sortable directory name of a fresh session.
pub const SESSION_DIR_FORMAT: &str = "%Y_%m_%d___%H_%M_%S";

/// Timestamp embedded in stored file names.
pub const FILE_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Cache key for uploads without a usable name.
const DEFAULT_KEY: &str = "_default";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid session hint '{0}'")]
    InvalidSessionHint(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode sidecar: {0}")]
    Json(#[from] serde_json::Error),
}

/// A cached time-windowed session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEntry {
    pub dir_path: PathBuf,
    pub created_at: DateTime<Local>,
    pub reuse_key: String,
}

#[derive(Debug)]
pub struct SessionManager {
    root: PathBuf,
    reuse_window: chrono::Duration,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    sidecars: Mutex<()>,
}

impl SessionManager {
    pub fn new(root: impl Into<PathBuf>, reuse_window: Duration) -> Self {
        Self {
            root: root.into(),
            reuse_window: chrono::Duration::from_std(reuse_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1000)),
            sessions: Mutex::new(HashMap::new()),
            sidecars: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Session directory for a frame of `name`, created if needed.
    pub fn resolve(&self, name: &str, hint: Option<&str>) -> Result<PathBuf, SessionError> {
        self.resolve_at(name, hint, Local::now())
    }

    pub fn resolve_at(
        &self,
        name: &str,
        hint: Option<&str>,
        now: DateTime<Local>,
    ) -> Result<PathBuf, SessionError> {
        if let Some(hint) = hint.map(str::trim).filter(|h| !h.is_empty()) {
            validate_hint(hint)?;
            let dir = self.root.join(hint);
            create_dir(&dir)?;
            return Ok(dir);
        }

        let key = match name.trim() {
            "" => DEFAULT_KEY.to_string(),
            trimmed => trimmed.to_string(),
        };

        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get(&key) {
            if now.signed_duration_since(entry.created_at) <= self.reuse_window {
                return Ok(entry.dir_path.clone());
            }
        }

        let dir = self.root.join(now.format(SESSION_DIR_FORMAT).to_string());
        create_dir(&dir)?;
        info!(session = %dir.display(), key = %key, "New session");

        sessions.insert(
            key.clone(),
            SessionEntry {
                dir_path: dir.clone(),
                created_at: now,
                reuse_key: key,
            },
        );
        Ok(dir)
    }

    /// Cached entry for `name`, expired or not.
    pub fn entry(&self, name: &str) -> Option<SessionEntry> {
        self.sessions.lock().get(name.trim()).cloned()
    }

    /// Read-modify-write `<dir>/<stem>.json`.
    ///
    /// A missing or unreadable sidecar starts out as an empty object. The
    /// result is written to a temp file and renamed into place.
    pub fn merge_sidecar<F>(&self, dir: &Path, stem: &str, update: F) -> Result<PathBuf, SessionError>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let path = dir.join(format!("{}.json", stem));
        let tmp = dir.join(format!("{}.json.tmp", stem));

        let _guard = self.sidecars.lock();
        let mut object = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
            .and_then(|value| match value {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .unwrap_or_default();

        update(&mut object);

        let encoded = serde_json::to_vec_pretty(&Value::Object(object))?;
        std::fs::write(&tmp, encoded).map_err(|source| SessionError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| SessionError::Io {
            path: path.clone(),
            source,
        })?;

        debug!(sidecar = %path.display(), "Sidecar updated");
        Ok(path)
    }
}

/// A hint is a single plain directory name under the root.
fn validate_hint(hint: &str) -> Result<(), SessionError> {
    let mut components = Path::new(hint).components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !single_normal || hint.contains(['/', '\\']) || hint.contains("..") {
        return Err(SessionError::InvalidSessionHint(hint.to_string()));
    }
    Ok(())
}

fn create_dir(dir: &Path) -> Result<(), SessionError> {
    std::fs::create_dir_all(dir).map_err(|source| SessionError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

/// Make a client-supplied string safe as part of a file name.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            c if c.is_alphanumeric() => c,
            '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    cleaned.trim_start_matches('.').to_string()
}

/// `<name>_<stamp>_<index>.jpg`, the name of an uploaded frame.
pub fn upload_file_stem(name: &str, index: &str, now: DateTime<Local>) -> String {
    format!(
        "{}_{}_{}",
        sanitize_component(name),
        now.format(FILE_STAMP_FORMAT),
        sanitize_component(index)
    )
}

/// `<frame name>_<stamp>`, the stem of a streamed frame.
pub fn stream_file_stem(frame_name: &str, now: DateTime<Local>) -> String {
    let name = match sanitize_component(frame_name) {
        n if n.is_empty() => "frame".to_string(),
        n => n,
    };
    format!("{}_{}", name, now.format(FILE_STAMP_FORMAT))
}
