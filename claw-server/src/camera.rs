//! Built-in camera MJPEG fallback, grounded in `app/camera.py` but
//! deliberately not a binding to the same native library it used
//! (OpenCV): on a headless arcade box, shelling out to `ffmpeg` to grab
//! single frames from a V4L2 device is the idiomatic low-dependency way
//! to do this in Rust, and the original's `camera_max_consecutive_failures`
//! soft-fail shape carries over unchanged.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::process::Command;
use tokio::sync::RwLock;

use claw_core::Settings;

use crate::state::AppState;

/// Latest captured frame, refreshed on a timer. `None` until the first
/// successful capture, or permanently after too many consecutive failures
/// — callers treat both the same way: "unavailable right now".
pub struct Camera {
    device_path: String,
    width: u32,
    height: u32,
    jpeg_quality: u32,
    max_consecutive_failures: u32,
    latest_frame: RwLock<Option<Arc<Vec<u8>>>>,
}

impl Camera {
    pub fn new(settings: &Settings) -> Arc<Camera> {
        Arc::new(Camera {
            device_path: format!("/dev/video{}", settings.camera_device),
            width: settings.camera_width,
            height: settings.camera_height,
            jpeg_quality: settings.camera_jpeg_quality,
            max_consecutive_failures: settings.camera_max_consecutive_failures,
            latest_frame: RwLock::new(None),
        })
    }

    /// Spawn the capture loop. Soft-fails: a missing device or missing
    /// `ffmpeg` binary just means `latest_frame` never becomes `Some`, and
    /// `/stream/mjpeg` answers 503 — server startup is never blocked on
    /// camera availability.
    pub fn spawn_capture_loop(self: &Arc<Self>, fps: u32) {
        let this = Arc::clone(self);
        let period = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
        tokio::spawn(async move {
            let mut consecutive_failures = 0u32;
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                match this.capture_one_frame().await {
                    Ok(frame) => {
                        consecutive_failures = 0;
                        *this.latest_frame.write().await = Some(Arc::new(frame));
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        tracing::debug!(error = %e, consecutive_failures, "camera frame capture failed");
                        if consecutive_failures >= this.max_consecutive_failures {
                            tracing::warn!(
                                consecutive_failures,
                                "camera exceeded consecutive failure budget, marking unavailable"
                            );
                            *this.latest_frame.write().await = None;
                            return;
                        }
                    }
                }
            }
        });
    }

    async fn capture_one_frame(&self) -> std::io::Result<Vec<u8>> {
        let output = Command::new("ffmpeg")
            .args([
                "-f",
                "v4l2",
                "-i",
                &self.device_path,
                "-frames:v",
                "1",
                "-s",
                &format!("{}x{}", self.width, self.height),
                "-q:v",
                &jpeg_quality_to_ffmpeg_scale(self.jpeg_quality),
                "-f",
                "mjpeg",
                "-",
            ])
            .output()
            .await?;
        if !output.status.success() || output.stdout.is_empty() {
            return Err(std::io::Error::other(format!(
                "ffmpeg exited with {:?}",
                output.status.code()
            )));
        }
        Ok(output.stdout)
    }

    pub async fn latest_frame(&self) -> Option<Arc<Vec<u8>>> {
        self.latest_frame.read().await.clone()
    }
}

/// ffmpeg's `-q:v` is an inverted 2-31 scale (lower = better); our config
/// is the familiar 0-100 JPEG quality, so remap it.
fn jpeg_quality_to_ffmpeg_scale(quality: u32) -> String {
    let quality = quality.clamp(1, 100);
    let scale = 31 - ((quality * 29) / 100);
    scale.max(2).to_string()
}

const MJPEG_BOUNDARY: &str = "frame";

/// `multipart/x-mixed-replace` MJPEG stream, re-emitting whatever
/// [`Camera::latest_frame`] holds on the configured fps. 503s outright if
/// the camera has never produced a frame, rather than opening a stream
/// that would just hang.
pub async fn mjpeg_stream_handler(State(state): State<AppState>) -> Response {
    if state.camera.latest_frame().await.is_none() {
        return (StatusCode::SERVICE_UNAVAILABLE, "camera unavailable").into_response();
    }

    let fps = state.supervisor.settings.camera_fps.max(1);
    let period = Duration::from_secs_f64(1.0 / fps as f64);
    let camera = state.camera.clone();
    let stream = futures_util::stream::unfold(camera, move |camera| async move {
        tokio::time::sleep(period).await;
        let frame = camera.latest_frame().await?;
        let mut part = Vec::with_capacity(frame.len() + 64);
        part.extend_from_slice(format!("--{MJPEG_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n", frame.len()).as_bytes());
        part.extend_from_slice(&frame);
        part.extend_from_slice(b"\r\n");
        Some((Ok::<Bytes, std::io::Error>(Bytes::from(part)), camera))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, format!("multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}"))
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_scale_is_inverted_and_bounded() {
        assert_eq!(jpeg_quality_to_ffmpeg_scale(100), "2");
        assert_eq!(jpeg_quality_to_ffmpeg_scale(1), "31");
    }

    #[tokio::test]
    async fn no_frame_until_first_capture() {
        let settings = Settings::default();
        let camera = Camera::new(&settings);
        assert!(camera.latest_frame().await.is_none());
    }
}
