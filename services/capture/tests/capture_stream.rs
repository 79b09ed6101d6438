//! End-to-end: `/capture` over HTTP, frames over a real TCP stream.

use camlink::frame_transport::{write_ack, FrameCodec, FrameMessage};
use camlink::trigger::{CaptureRequest, CaptureTrigger};
use camlink_capture::api::{create_router, AppState};
use camlink_capture::config::CameraConfig;
use camlink_capture::{CaptureWorker, JpegEncoder, ReceiverResolver, TcpFrameSink, TestPatternFactory};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

/// Accepts frame streams, acks every frame and forwards it.
async fn spawn_frame_receiver() -> (String, mpsc::UnboundedReceiver<FrameMessage>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let tx = tx.clone();
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut frames = FramedRead::new(read, FrameCodec::new());
                while let Some(Ok(frame)) = frames.next().await {
                    tx.send(frame).unwrap();
                    write_ack(&mut write).await.unwrap();
                }
            });
        }
    });

    (addr, rx)
}

async fn spawn_capture_api(frame_addr: String) -> u16 {
    let factory = TestPatternFactory::new(CameraConfig {
        width: 64,
        height: 48,
        warmup_ms: 0,
        ..Default::default()
    });
    let sink = TcpFrameSink::new(
        ReceiverResolver::new(5001, 5000).with_frame_addr(Some(frame_addr)),
        Duration::from_secs(2),
        Duration::from_millis(500),
    );
    let worker = CaptureWorker::new(
        Box::new(factory),
        Arc::new(JpegEncoder::new(80)),
        Arc::new(sink),
    );
    let router = create_router(AppState {
        worker: Arc::new(worker),
        host: "cam-test".to_string(),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    port
}

#[tokio::test]
async fn test_trigger_streams_jpeg_frames() {
    let (frame_addr, mut frames) = spawn_frame_receiver().await;
    let port = spawn_capture_api(frame_addr).await;

    let response = CaptureTrigger::new(port)
        .trigger_at("127.0.0.1".parse().unwrap(), &CaptureRequest::new("yard", 3, 0.05))
        .await
        .unwrap();
    assert!(response.ok);
    assert_eq!(response.sent, 3);

    let mut names = Vec::new();
    for _ in 0..3 {
        let frame = tokio::time::timeout(Duration::from_secs(2), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&frame.image[..2], &[0xff, 0xd8]);
        names.push(frame.name);
    }
    assert_eq!(names, ["yard_0000", "yard_0001", "yard_0002"]);
}

#[tokio::test]
async fn test_unreachable_receiver_fails_request_but_not_service() {
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap().to_string();
    drop(dead);

    let port = spawn_capture_api(dead_addr).await;
    let trigger = CaptureTrigger::new(port);
    let ip = "127.0.0.1".parse().unwrap();

    let err = trigger
        .trigger_at(ip, &CaptureRequest::new("x", 1, 0.0))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("500"));

    // Still serving after the failure.
    let err = trigger
        .trigger_at(ip, &CaptureRequest::new("y", 1, 0.0))
        .await
        .unwrap_err();
    assert!(matches!(err, camlink::TriggerError::Status { .. }));
}
