//! TCP frame stream server.
//!
//! Each connection carries a sequence of frames. Every frame is stored in
//! the session of its capture name and acknowledged; a framing error ends
//! only the connection it occurred on.

use crate::annotation::AnnotationQueue;
use crate::session_manager::{stream_file_stem, SessionError, SessionManager};
use camlink::frame_transport::{split_indexed_name, write_ack, FrameCodec, FrameError, FrameMessage};
use chrono::Local;
use futures::StreamExt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Failed to bind frame server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Failed to store {path}: {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to acknowledge frame: {0}")]
    Ack(#[source] std::io::Error),
}

/// Accepts frame streams and stores their frames.
pub struct FrameServer {
    listener: TcpListener,
    sessions: Arc<SessionManager>,
    annotations: Option<AnnotationQueue>,
    max_image_len: usize,
}

impl FrameServer {
    pub async fn bind(
        addr: SocketAddr,
        sessions: Arc<SessionManager>,
        max_image_len: usize,
    ) -> Result<Self, StreamError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| StreamError::Bind { addr, source })?;
        Ok(Self {
            listener,
            sessions,
            annotations: None,
            max_image_len,
        })
    }

    /// Queue every stored frame for annotation.
    pub fn with_annotations(mut self, annotations: Option<AnnotationQueue>) -> Self {
        self.annotations = annotations;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop until the handle is stopped.
    pub fn spawn(self) -> FrameServerHandle {
        let running = Arc::new(AtomicBool::new(true));
        let local_addr = self.local_addr().ok();
        let task = tokio::spawn(self.run(running.clone()));
        FrameServerHandle {
            running,
            local_addr,
            task,
        }
    }

    async fn run(self, running: Arc<AtomicBool>) {
        info!(address = ?self.local_addr().ok(), "Frame server listening");

        while running.load(Ordering::SeqCst) {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let connection = Connection {
                        sessions: self.sessions.clone(),
                        annotations: self.annotations.clone(),
                        max_image_len: self.max_image_len,
                        peer,
                    };
                    tokio::spawn(async move {
                        match connection.serve(stream).await {
                            Ok(frames) => debug!(peer = %peer, frames, "Frame stream closed"),
                            Err(e) => warn!(peer = %peer, error = %e, "Frame stream aborted"),
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept frame connection");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

pub struct FrameServerHandle {
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    task: JoinHandle<()>,
}

impl FrameServerHandle {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop accepting. Connections already open run to completion.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

struct Connection {
    sessions: Arc<SessionManager>,
    annotations: Option<AnnotationQueue>,
    max_image_len: usize,
    peer: SocketAddr,
}

impl Connection {
    /// Store frames until the peer closes; returns how many were stored.
    #[instrument(skip(self, stream), fields(peer = %self.peer))]
    async fn serve(self, stream: TcpStream) -> Result<u64, StreamError> {
        let (read, mut write) = stream.into_split();
        let mut frames = FramedRead::new(read, FrameCodec::with_max_image_len(self.max_image_len));
        let mut stored = 0u64;

        while let Some(frame) = frames.next().await {
            let frame = frame?;
            let path = self.store(frame).await?;
            write_ack(&mut write).await.map_err(StreamError::Ack)?;

            stored += 1;
            metrics::counter!("camlink_frames_received_total").increment(1);
            if let Some(queue) = &self.annotations {
                queue.try_submit(path);
            }
        }

        Ok(stored)
    }

    async fn store(&self, frame: FrameMessage) -> Result<PathBuf, StreamError> {
        let (capture_name, index) = split_indexed_name(&frame.name);
        let now = Local::now();
        let dir = self.sessions.resolve_at(capture_name, None, now)?;
        let path = dir.join(format!("{}.jpg", stream_file_stem(&frame.name, now)));

        tokio::fs::write(&path, &frame.image)
            .await
            .map_err(|source| StreamError::Store {
                path: path.clone(),
                source,
            })?;

        info!(
            frame = %frame.name,
            index = ?index,
            bytes = frame.image.len(),
            path = %path.display(),
            "Stored frame"
        );
        Ok(path)
    }
}
