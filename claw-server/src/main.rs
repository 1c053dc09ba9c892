mod admin;
mod camera;
mod error;
mod ip;
mod rest;
mod state;
mod stream_proxy;
mod wled;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "gpio")]
use claw_core::hardware::gpio::GpioPins;
use claw_core::hardware::mock::{ConflictMode, MockGate};
use claw_core::hardware::HardwareGate;
use claw_core::supervisor::Supervisor;
use claw_core::turn::WledSink;
use claw_core::Settings;

use crate::camera::Camera;
use crate::state::AppState;
use crate::wled::ReqwestWledSink;

/// Single-instance guard: a second process pointed at the same database
/// would double-drive the same GPIO pins, which spec.md calls out as the
/// one startup condition that must be fatal. `rusqlite`'s own file lock on
/// `database_path` already serializes writers at the OS level; this just
/// fails fast with a readable message instead of the first write hanging.
fn enforce_single_instance(database_path: &str) -> std::io::Result<()> {
    let lock_path = format!("{database_path}.lock");
    if let Some(parent) = std::path::Path::new(&lock_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new().write(true).create_new(true).open(&lock_path).map(|_| ()).map_err(|e| {
        if e.kind() == std::io::ErrorKind::AlreadyExists {
            std::io::Error::other(format!(
                "{lock_path} already exists — another claw-server instance may be running against the same database"
            ))
        } else {
            e
        }
    })
}

fn conflict_mode(settings: &Settings) -> ConflictMode {
    match settings.direction_conflict_mode.as_str() {
        "replace" => ConflictMode::Replace,
        _ => ConflictMode::IgnoreNew,
    }
}

fn build_hardware(settings: &Settings) -> claw_core::error::CoreResult<Arc<dyn HardwareGate>> {
    if settings.mock_gpio {
        return Ok(MockGate::new(
            conflict_mode(settings),
            Duration::from_millis(settings.direction_hold_max_ms),
            Duration::from_millis(settings.min_inter_pulse_ms),
            Duration::from_millis(settings.coin_pulse_ms),
            Duration::from_millis(settings.drop_pulse_ms),
        ) as Arc<dyn HardwareGate>);
    }

    #[cfg(feature = "gpio")]
    {
        let pins = GpioPins {
            coin: settings.pin_coin,
            north: settings.pin_north,
            south: settings.pin_south,
            east: settings.pin_east,
            west: settings.pin_west,
            drop: settings.pin_drop,
            win: settings.pin_win,
        };
        let gate = claw_core::hardware::gpio::GpioGate::new(
            pins,
            settings.relay_active_low,
            conflict_mode(settings),
            Duration::from_millis(settings.hardware_call_timeout_ms),
            Duration::from_millis(settings.direction_hold_max_ms),
            Duration::from_millis(settings.min_inter_pulse_ms),
            Duration::from_millis(settings.coin_pulse_ms),
            Duration::from_millis(settings.drop_pulse_ms),
        )?;
        return Ok(gate as Arc<dyn HardwareGate>);
    }

    #[cfg(not(feature = "gpio"))]
    {
        Err(claw_core::CoreError::Config(
            "mock_gpio=false requires the server to be built with the `gpio` feature".into(),
        ))
    }
}

fn build_cors(settings: &Settings) -> CorsLayer {
    let raw = settings.cors_origins.trim();
    let allow_origin = if raw.is_empty() || raw == "*" {
        AllowOrigin::mirror_request()
    } else {
        let origins: Vec<axum::http::HeaderValue> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse().ok())
            .collect();
        AllowOrigin::list(origins)
    };
    CorsLayer::new().allow_origin(allow_origin).allow_methods(tower_http::cors::Any).allow_headers(tower_http::cors::Any)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
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

    let settings = Arc::new(Settings::load(Settings::resolve_path())?);
    enforce_single_instance(&settings.database_path)?;

    let hardware = build_hardware(&settings)?;
    let wled = ReqwestWledSink::new(&settings);
    let camera = Camera::new(&settings);
    camera.spawn_capture_loop(settings.camera_fps);
    let trusted_proxy_cidrs = ip::parse_trusted_cidrs(&settings.trusted_proxy_cidrs);

    let supervisor = Supervisor::start(settings.clone(), hardware, Some(wled.clone() as Arc<dyn WledSink>)).await?;
    let app_state = AppState::new(supervisor.clone(), Some(wled), camera, trusted_proxy_cidrs);

    let app = Router::new()
        .route("/api/queue/join", post(rest::join))
        .route("/api/queue/leave", axum::routing::delete(rest::leave))
        .route("/api/queue/status", get(rest::queue_status))
        .route("/api/queue", get(rest::list_queue))
        .route("/api/session/me", get(rest::session_me))
        .route("/api/history", get(rest::history))
        .route("/api/health", get(rest::health))
        .route("/admin/advance", post(admin::advance))
        .route("/admin/pause", post(admin::pause))
        .route("/admin/resume", post(admin::resume))
        .route("/admin/emergency-stop", post(admin::emergency_stop))
        .route("/admin/unlock", post(admin::unlock))
        .route("/admin/kick/{entry_id}", post(admin::kick))
        .route("/admin/dashboard", get(admin::dashboard))
        .route("/admin/queue-details", get(admin::queue_details))
        .route("/admin/config", get(admin::get_config).put(admin::put_config))
        .route("/ws/status", get(ws::status_handler))
        .route("/ws/control", get(ws::control_handler))
        .route("/stream/mjpeg", get(camera::mjpeg_stream_handler))
        .route("/stream/{*path}", get(stream_proxy::proxy_stream))
        .with_state(app_state)
        .layer(build_cors(&supervisor.settings))
        .layer(TraceLayer::new_for_http())
        .fallback_service(ServeDir::new("./static").not_found_service(ServeFile::new("./static/index.html")))
        .into_make_service_with_connect_info::<std::net::SocketAddr>();

    let bind_addr = format!("{}:{}", supervisor.settings.host, supervisor.settings.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(host = %supervisor.settings.host, port = supervisor.settings.port, "claw-server listening");

    let shutdown_supervisor = supervisor.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown_supervisor.shutdown().await;
        })
        .await?;

    Ok(())
}
