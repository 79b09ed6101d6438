//! Frame delivery to a receiver.
//!
//! A [`FrameSink`] opens one [`FrameConnection`] per capture request; every
//! frame of that request goes through it in order.

use async_trait::async_trait;
use bytes::Bytes;
use camlink::frame_transport::{indexed_name, read_ack, FrameCodec, FrameError, FrameMessage};
use camlink::registry::Registry;
use futures::SinkExt;
use metrics::counter;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace};

#[derive(Debug, Error)]
pub enum TransmitError {
    #[error("No receiver configured or discovered")]
    NoReceiver,

    #[error("Failed to connect to receiver {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Connecting to receiver {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("Frame stream error: {0}")]
    Frame(#[from] FrameError),

    #[error("Upload to {url} failed: {source}")]
    Upload {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Receiver returned {status}: {body}")]
    UploadStatus {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Where to deliver frames: a fixed address, else the newest discovered
/// `capture_receiver`. Resolved again for every request.
#[derive(Debug, Clone, Default)]
pub struct ReceiverResolver {
    frame_addr: Option<String>,
    upload_url: Option<String>,
    registry: Option<Arc<Registry>>,
    frame_port: u16,
    upload_port: u16,
}

impl ReceiverResolver {
    pub fn new(frame_port: u16, upload_port: u16) -> Self {
        Self {
            frame_port,
            upload_port,
            ..Default::default()
        }
    }

    pub fn with_frame_addr(mut self, addr: Option<String>) -> Self {
        self.frame_addr = addr.filter(|a| !a.trim().is_empty());
        self
    }

    pub fn with_upload_url(mut self, url: Option<String>) -> Self {
        self.upload_url = url.filter(|u| !u.trim().is_empty());
        self
    }

    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// `host:port` of the frame stream listener.
    pub fn frame_addr(&self) -> Result<String, TransmitError> {
        if let Some(addr) = &self.frame_addr {
            return Ok(addr.clone());
        }
        let peer = self.discovered()?;
        Ok(SocketAddr::new(peer.ip, self.frame_port).to_string())
    }

    /// Base URL of the upload API, without a trailing slash.
    pub fn upload_url(&self) -> Result<String, TransmitError> {
        if let Some(url) = &self.upload_url {
            return Ok(url.trim_end_matches('/').to_string());
        }
        let peer = self.discovered()?;
        Ok(match peer.url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}", SocketAddr::new(peer.ip, self.upload_port)),
        })
    }

    fn discovered(&self) -> Result<camlink::PeerRecord, TransmitError> {
        let peer = self
            .registry
            .as_ref()
            .and_then(|r| r.latest())
            .ok_or(TransmitError::NoReceiver)?;
        trace!(peer = %peer.key, "Using discovered receiver");
        Ok(peer)
    }
}

/// Opens connections to a receiver.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn FrameConnection>, TransmitError>;
}

/// One open delivery channel.
#[async_trait]
pub trait FrameConnection: Send {
    /// Deliver frame `index` of capture `name`.
    async fn send(&mut self, name: &str, index: u32, image: Bytes) -> Result<(), TransmitError>;

    /// Flush and close.
    async fn finish(self: Box<Self>) -> Result<(), TransmitError>;
}

/// Streams frames over one TCP connection per request.
#[derive(Debug, Clone)]
pub struct TcpFrameSink {
    resolver: ReceiverResolver,
    connect_timeout: Duration,
    ack_timeout: Duration,
}

impl TcpFrameSink {
    pub fn new(resolver: ReceiverResolver, connect_timeout: Duration, ack_timeout: Duration) -> Self {
        Self {
            resolver,
            connect_timeout,
            ack_timeout,
        }
    }
}

#[async_trait]
impl FrameSink for TcpFrameSink {
    async fn connect(&self) -> Result<Box<dyn FrameConnection>, TransmitError> {
        let addr = self.resolver.frame_addr()?;
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(TransmitError::Connect { addr, source }),
            Err(_) => {
                return Err(TransmitError::ConnectTimeout {
                    addr,
                    timeout: self.connect_timeout,
                })
            }
        };
        // Frames are written whole; don't hold the tail back.
        let _ = stream.set_nodelay(true);

        debug!(addr = %addr, "Frame stream connected");
        Ok(Box::new(TcpFrameConnection {
            framed: Framed::new(stream, FrameCodec::new()),
            ack_timeout: self.ack_timeout,
            addr,
        }))
    }
}

struct TcpFrameConnection {
    framed: Framed<TcpStream, FrameCodec>,
    ack_timeout: Duration,
    addr: String,
}

#[async_trait]
impl FrameConnection for TcpFrameConnection {
    async fn send(&mut self, name: &str, index: u32, image: Bytes) -> Result<(), TransmitError> {
        let bytes = image.len();
        let frame = FrameMessage::new(indexed_name(name, index), image);
        self.framed.send(frame).await?;

        let acked = read_ack(self.framed.get_mut(), self.ack_timeout)
            .await
            .map_err(FrameError::Io)?;
        counter!("camlink_frames_sent_total", "transport" => "tcp").increment(1);
        trace!(addr = %self.addr, index, bytes, acked, "Frame sent");
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<(), TransmitError> {
        self.framed.close().await?;
        debug!(addr = %self.addr, "Frame stream closed");
        Ok(())
    }
}

/// Posts each frame to `<receiver>/upload` as multipart form data.
#[derive(Debug, Clone)]
pub struct HttpUploadSink {
    client: Client,
    resolver: ReceiverResolver,
    session: Option<String>,
    timeout: Duration,
}

impl HttpUploadSink {
    pub fn new(resolver: ReceiverResolver, session: Option<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            resolver,
            session: session.filter(|s| !s.trim().is_empty()),
            timeout,
        }
    }
}

#[async_trait]
impl FrameSink for HttpUploadSink {
    async fn connect(&self) -> Result<Box<dyn FrameConnection>, TransmitError> {
        let url = format!("{}/upload", self.resolver.upload_url()?);
        info!(url = %url, "Uploading frames");
        Ok(Box::new(HttpUploadConnection {
            client: self.client.clone(),
            url,
            session: self.session.clone(),
            timeout: self.timeout,
        }))
    }
}

struct HttpUploadConnection {
    client: Client,
    url: String,
    session: Option<String>,
    timeout: Duration,
}

#[async_trait]
impl FrameConnection for HttpUploadConnection {
    async fn send(&mut self, name: &str, index: u32, image: Bytes) -> Result<(), TransmitError> {
        let part = Part::stream(image)
            .file_name("frame.jpg")
            .mime_str("image/jpeg")
            .map_err(|source| TransmitError::Upload {
                url: self.url.clone(),
                source,
            })?;
        let mut form = Form::new()
            .part("image", part)
            .text("name", name.to_string())
            .text("index", index.to_string());
        if let Some(session) = &self.session {
            form = form.text("session", session.clone());
        }

        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| TransmitError::Upload {
                url: self.url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransmitError::UploadStatus { status, body });
        }

        counter!("camlink_frames_sent_total", "transport" => "http").increment(1);
        trace!(url = %self.url, index, "Frame uploaded");
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<(), TransmitError> {
        Ok(())
    }
}
