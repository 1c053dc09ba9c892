//! Shared application state handed to every axum handler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnet::IpNet;

use claw_core::supervisor::Supervisor;

use crate::camera::Camera;
use crate::wled::ReqwestWledSink;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub started_at: Instant,
    pub wled: Option<Arc<ReqwestWledSink>>,
    pub camera: Arc<Camera>,
    pub http_client: reqwest::Client,
    pub trusted_proxy_cidrs: Arc<Vec<IpNet>>,
}

impl AppState {
    pub fn new(
        supervisor: Arc<Supervisor>,
        wled: Option<Arc<ReqwestWledSink>>,
        camera: Arc<Camera>,
        trusted_proxy_cidrs: Vec<IpNet>,
    ) -> AppState {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client builder should never fail with no TLS/proxy overrides");
        AppState {
            supervisor,
            started_at: Instant::now(),
            wled,
            camera,
            http_client,
            trusted_proxy_cidrs: Arc::new(trusted_proxy_cidrs),
        }
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// `None` when `stream_proxy_base_url` is unset — the stream routes
    /// then answer 503 instead of proxying anywhere.
    pub fn stream_base_url(&self) -> Option<&str> {
        let base = self.supervisor.settings.stream_proxy_base_url.trim();
        if base.is_empty() {
            None
        } else {
            Some(base.trim_end_matches('/'))
        }
    }
}
