//! Out-of-process GPIO watchdog, grounded in `watchdog/main.py`.
//!
//! Polls the game server's health endpoint on an interval; after
//! `WATCHDOG_FAIL_THRESHOLD` consecutive failed checks it claims the
//! output pins directly via `rppal` and drives them low, independent of
//! and unaware of `claw-server`'s own hardware gate and lock state. This
//! process deliberately never links against `claw-core` — it is the last-
//! resort physical safe-off that does not depend on the main server's
//! internal correctness to still work.

use std::time::Duration;

use rppal::gpio::{Gpio, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct WatchdogConfig {
    health_url: String,
    check_interval: Duration,
    fail_threshold: u32,
    output_pins: Vec<u8>,
}

impl WatchdogConfig {
    /// Reads its own environment directly — this binary has no config
    /// file and no dependency on `claw_core::config::Settings`, by design.
    fn from_env() -> WatchdogConfig {
        WatchdogConfig {
            health_url: env_or("WATCHDOG_HEALTH_URL", "http://127.0.0.1:8000/api/health"),
            check_interval: Duration::from_secs(env_parse_or("WATCHDOG_CHECK_INTERVAL_S", 2)),
            fail_threshold: env_parse_or("WATCHDOG_FAIL_THRESHOLD", 3),
            output_pins: vec![
                env_parse_or("PIN_COIN", 17),
                env_parse_or("PIN_NORTH", 27),
                env_parse_or("PIN_SOUTH", 5),
                env_parse_or("PIN_WEST", 6),
                env_parse_or("PIN_EAST", 24),
                env_parse_or("PIN_DROP", 25),
            ],
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Claim every output pin directly through `rppal` and drive it low.
/// Claiming a pin this process never owned during normal operation is
/// exactly the point: it does not go through `claw-server`'s hardware
/// gate or its lock, because that gate might be the thing that's wedged.
fn force_all_pins_off(pins: &[u8]) {
    let gpio = match Gpio::new() {
        Ok(gpio) => gpio,
        Err(e) => {
            tracing::error!(error = %e, "WATCHDOG: gpio init failed — cannot force pins off");
            return;
        }
    };

    for &pin in pins {
        match gpio.get(pin) {
            Ok(raw) => {
                let mut output = raw.into_output();
                output.write(Level::Low);
                // `output` is dropped here, which releases the pin back to
                // the kernel at the level it was just set to — low.
            }
            Err(e) => tracing::warn!(pin, error = %e, "WATCHDOG: could not claim pin"),
        }
    }
    tracing::error!("WATCHDOG: all pins forced off");
}

async fn check_once(client: &reqwest::Client, health_url: &str) -> bool {
    match client.get(health_url).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(e) => {
            tracing::warn!(error = %e, "health check request failed");
            false
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();

    let config = WatchdogConfig::from_env();
    tracing::info!(health_url = %config.health_url, "watchdog started");
    tracing::info!(check_interval_s = config.check_interval.as_secs(), fail_threshold = config.fail_threshold, "watchdog config");
    tracing::info!(pins = ?config.output_pins, "monitoring pins");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .expect("reqwest client builder should never fail with no TLS/proxy overrides");

    let mut fail_count = 0u32;
    let mut triggered = false;
    let mut interval = tokio::time::interval(config.check_interval);

    loop {
        interval.tick().await;

        if check_once(&client, &config.health_url).await {
            fail_count = 0;
            if triggered {
                tracing::info!("server recovered, resetting watchdog");
                triggered = false;
            }
        } else {
            fail_count += 1;
            tracing::warn!(fail_count, threshold = config.fail_threshold, "health check failed");
        }

        if fail_count >= config.fail_threshold && !triggered {
            force_all_pins_off(&config.output_pins);
            triggered = true;
        }
    }
}
