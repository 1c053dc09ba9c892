//! Decorative-LED event client: fire-and-forget HTTP calls to a WLED
//! controller on turn events, grounded in `app/wled.py`'s `WLEDClient`.
//! Never lets an HTTP failure reach the turn state machine — every error
//! path here ends in a `tracing::warn!`, not a propagated `Result`.

use std::sync::Arc;
use std::time::Duration;

use claw_core::turn::WledSink;
use claw_core::Settings;

/// One HTTP call per event, posting a JSON preset-select payload to
/// `/json/state`. Disabled entirely (a no-op `on_event`) unless both
/// `wled_enabled` and `wled_device_ip` are set.
pub struct ReqwestWledSink {
    client: reqwest::Client,
    base_url: String,
    enabled: bool,
    preset_win: i64,
    preset_loss: i64,
    preset_drop: i64,
    preset_start_turn: i64,
    preset_idle: i64,
    preset_expire: i64,
}

impl ReqwestWledSink {
    pub fn new(settings: &Settings) -> Arc<ReqwestWledSink> {
        let enabled = settings.wled_enabled && !settings.wled_device_ip.trim().is_empty();
        let base_url = normalize_base_url(&settings.wled_device_ip);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .expect("reqwest client builder should never fail with no TLS/proxy overrides");
        Arc::new(ReqwestWledSink {
            client,
            base_url,
            enabled,
            preset_win: settings.wled_preset_win,
            preset_loss: settings.wled_preset_loss,
            preset_drop: settings.wled_preset_drop,
            preset_start_turn: settings.wled_preset_start_turn,
            preset_idle: settings.wled_preset_idle,
            preset_expire: settings.wled_preset_expire,
        })
    }

    fn preset_for_event(&self, event: &str) -> Option<i64> {
        let preset = match event {
            "win" => self.preset_win,
            "loss" => self.preset_loss,
            "drop" => self.preset_drop,
            "start_turn" => self.preset_start_turn,
            "idle" => self.preset_idle,
            "expire" => self.preset_expire,
            _ => return None,
        };
        if preset > 0 {
            Some(preset)
        } else {
            None
        }
    }

}

#[async_trait::async_trait]
impl WledSink for ReqwestWledSink {
    async fn on_event(&self, event: &str) {
        if !self.enabled {
            return;
        }
        let Some(preset) = self.preset_for_event(event) else { return };
        let client = self.client.clone();
        let url = format!("{}/json/state", self.base_url);
        // Fire-and-forget: the caller (the turn state machine) must never
        // wait on a WLED controller that's slow or unplugged.
        tokio::spawn(async move {
            match client.post(&url).json(&serde_json::json!({ "ps": preset })).send().await {
                Ok(resp) if !resp.status().is_success() => {
                    tracing::warn!(status = %resp.status(), %url, "wled request returned non-success status");
                }
                Ok(_) => {}
                Err(e) if e.is_timeout() => tracing::warn!(%url, "wled request timed out"),
                Err(e) => tracing::warn!(error = %e, %url, "wled request failed"),
            }
        });
    }
}

/// Prepend `http://` if the configured device IP doesn't already name a
/// scheme, matching `WLEDClient._base_url`.
fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_scheme_prepended() {
        assert_eq!(normalize_base_url("192.168.1.50"), "http://192.168.1.50");
        assert_eq!(normalize_base_url("http://192.168.1.50/"), "http://192.168.1.50");
    }

    #[tokio::test]
    async fn disabled_sink_never_builds_a_request() {
        let settings = Settings { wled_enabled: false, ..Settings::default() };
        let sink = ReqwestWledSink::new(&settings);
        // No panic, no network call — disabled short-circuits in `on_event`.
        sink.on_event("win").await;
    }

    #[tokio::test]
    async fn zero_preset_is_treated_as_disabled_for_that_event() {
        let settings =
            Settings { wled_enabled: true, wled_device_ip: "127.0.0.1".into(), wled_preset_win: 0, ..Settings::default() };
        let sink = ReqwestWledSink::new(&settings);
        assert_eq!(sink.preset_for_event("win"), None);
    }
}
