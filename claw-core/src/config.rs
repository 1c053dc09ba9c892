//! Runtime configuration, loaded from a `KEY=VALUE` file (the same on-disk
//! format the original Python service's operators already use) and mutable
//! at runtime through the admin config endpoint.
//!
//! Every field has a default and, where it matters, an admissible range
//! enforced by [`Settings::validate`]. Writes go through a temp-file +
//! rename so a crash mid-write never leaves a truncated config behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{CoreError, CoreResult};

macro_rules! settings_fields {
    (
        $(#[$meta:meta])*
        pub struct Settings {
            $( $field:ident : $ty:ty = $default:expr ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        pub struct Settings {
            $( pub $field: $ty, )*
        }

        impl Default for Settings {
            fn default() -> Self {
                Settings {
                    $( $field: $default, )*
                }
            }
        }

        impl Settings {
            /// Parse a `KEY=VALUE` map into a `Settings`, filling in defaults
            /// for anything absent and returning an error on a malformed value.
            fn from_map(map: &HashMap<String, String>) -> CoreResult<Settings> {
                let mut s = Settings::default();
                $(
                    if let Some(raw) = map.get(stringify!($field)) {
                        s.$field = parse_value(stringify!($field), raw)?;
                    }
                )*
                Ok(s)
            }

            /// Serialize back to `KEY=VALUE` lines, one field per line, in
            /// declaration order, so round-trips are diff-friendly.
            fn to_lines(&self) -> Vec<String> {
                vec![
                    $( format!("{}={}", stringify!($field), ToConfigValue::to_config_value(&self.$field)), )*
                ]
            }
        }
    };
}

trait FromConfigValue: Sized {
    fn from_config_value(field: &str, raw: &str) -> CoreResult<Self>;
}

impl FromConfigValue for String {
    fn from_config_value(_field: &str, raw: &str) -> CoreResult<Self> {
        Ok(raw.to_string())
    }
}

impl FromConfigValue for bool {
    fn from_config_value(field: &str, raw: &str) -> CoreResult<Self> {
        match raw {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(CoreError::Config(format!(
                "{field}: expected true/false, got {other:?}"
            ))),
        }
    }
}

macro_rules! impl_from_config_value_num {
    ($($t:ty),*) => {
        $(
            impl FromConfigValue for $t {
                fn from_config_value(field: &str, raw: &str) -> CoreResult<Self> {
                    raw.parse::<$t>()
                        .map_err(|e| CoreError::Config(format!("{field}: {e}")))
                }
            }
        )*
    };
}
impl_from_config_value_num!(u8, u16, u32, u64, i64, f64);

trait ToConfigValue {
    fn to_config_value(&self) -> String;
}
impl ToConfigValue for String {
    fn to_config_value(&self) -> String {
        self.clone()
    }
}
impl ToConfigValue for bool {
    fn to_config_value(&self) -> String {
        self.to_string()
    }
}
macro_rules! impl_to_config_value_num {
    ($($t:ty),*) => {
        $( impl ToConfigValue for $t { fn to_config_value(&self) -> String { self.to_string() } } )*
    };
}
impl_to_config_value_num!(u8, u16, u32, u64, i64, f64);

fn parse_value<T: FromConfigValue>(field: &str, raw: &str) -> CoreResult<T> {
    T::from_config_value(field, raw.trim())
}

settings_fields! {
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    // Timing
    tries_per_player: u32 = 2,
    turn_time_seconds: u64 = 90,
    try_move_seconds: u64 = 30,
    post_drop_wait_seconds: u64 = 8,
    ready_prompt_seconds: u64 = 15,
    queue_grace_period_seconds: u64 = 300,
    ghost_player_age_s: u64 = 30,

    // GPIO pulse/hold
    coin_pulse_ms: u64 = 150,
    drop_pulse_ms: u64 = 200,
    drop_hold_max_ms: u64 = 10_000,
    min_inter_pulse_ms: u64 = 500,
    direction_hold_max_ms: u64 = 30_000,
    coin_each_try: bool = true,
    coin_pulses_per_credit: u32 = 1,
    coin_post_pulse_delay_s: f64 = 0.3,
    emergency_stop_timeout_s: u64 = 10,
    hardware_call_timeout_ms: u64 = 2_000,
    hardware_init_timeout_ms: u64 = 10_000,

    // Control
    command_rate_limit_hz: u32 = 25,
    direction_conflict_mode: String = "ignore_new".to_string(),
    win_sensor_enabled: bool = true,

    // Pins (BCM numbering)
    pin_coin: u8 = 17,
    pin_north: u8 = 27,
    pin_south: u8 = 5,
    pin_west: u8 = 6,
    pin_east: u8 = 24,
    pin_drop: u8 = 25,
    pin_win: u8 = 16,
    relay_active_low: bool = true,

    // Server
    host: String = "127.0.0.1".to_string(),
    port: u16 = 8000,
    database_path: String = "./data/claw.db".to_string(),
    admin_api_key: String = "changeme".to_string(),
    cors_origins: String = "*".to_string(),
    db_retention_hours: u64 = 168,
    max_control_connections: u32 = 100,
    max_viewer_connections: u32 = 500,
    join_rate_limit_per_ip_per_hour: u32 = 5,
    join_rate_limit_per_email_per_hour: u32 = 3,
    // Comma-separated CIDR blocks (e.g. "10.0.0.0/8,127.0.0.1/32"). A
    // forwarded-for header is only trusted when the direct peer address
    // falls inside one of these. Empty (the default) means never trust it.
    trusted_proxy_cidrs: String = String::new(),
    control_ping_interval_s: u64 = 10,
    control_liveness_timeout_s: u64 = 30,
    control_send_timeout_ms: u64 = 3_000,
    status_ping_interval_s: u64 = 20,
    status_send_timeout_ms: u64 = 3_000,

    // Watchdog
    watchdog_health_url: String = "http://127.0.0.1:8000/api/health".to_string(),
    watchdog_check_interval_s: u64 = 2,
    watchdog_fail_threshold: u32 = 3,

    // Camera / stream
    mediamtx_health_url: String = "http://127.0.0.1:8889/v3/paths/list".to_string(),
    camera_device: u32 = 0,
    camera_width: u32 = 640,
    camera_height: u32 = 480,
    camera_fps: u32 = 15,
    camera_jpeg_quality: u32 = 80,
    camera_warmup_frames: u32 = 5,
    camera_max_consecutive_failures: u32 = 30,
    stream_proxy_base_url: String = String::new(),

    // WLED
    wled_enabled: bool = false,
    wled_device_ip: String = String::new(),
    wled_preset_win: i64 = 0,
    wled_preset_loss: i64 = 0,
    wled_preset_drop: i64 = 0,
    wled_preset_start_turn: i64 = 0,
    wled_preset_idle: i64 = 0,
    wled_preset_expire: i64 = 0,

    // Mock mode: run without real GPIO hardware
    mock_gpio: bool = true,
}
}

impl Settings {
    /// Load settings from a file, falling back to defaults for any field
    /// the file doesn't mention. Returns an error only on a malformed value,
    /// never on a missing file (a missing file just means "use defaults").
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Settings> {
        let path = path.as_ref();
        let map = match std::fs::read_to_string(path) {
            Ok(contents) => parse_kv(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(CoreError::Io(e)),
        };
        let settings = Settings::from_map(&map)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Resolve the config path: `$ECLAW_CONFIG_FILE` if set, else `./claw.conf`.
    pub fn resolve_path() -> PathBuf {
        std::env::var("ECLAW_CONFIG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./claw.conf"))
    }

    /// Atomically write the current settings back to `path`: write to a
    /// sibling temp file, then rename over the target. A crash mid-write
    /// never leaves a truncated config on disk.
    pub fn save(&self, path: impl AsRef<Path>) -> CoreResult<()> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("tmp");
        let body = self.to_lines().join("\n") + "\n";
        std::fs::write(&tmp_path, body)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Range-validate fields where an out-of-range value would be
    /// dangerous (hold timeouts of zero, an admin key left at the
    /// well-known default in a non-mock deployment, etc).
    pub fn validate(&self) -> CoreResult<()> {
        if self.tries_per_player == 0 {
            return Err(CoreError::Config("tries_per_player must be >= 1".into()));
        }
        if self.command_rate_limit_hz == 0 {
            return Err(CoreError::Config("command_rate_limit_hz must be >= 1".into()));
        }
        if self.drop_hold_max_ms == 0 || self.direction_hold_max_ms == 0 {
            return Err(CoreError::Config("hold timeouts must be > 0".into()));
        }
        if !matches!(self.direction_conflict_mode.as_str(), "ignore_new" | "replace") {
            return Err(CoreError::Config(
                "direction_conflict_mode must be 'ignore_new' or 'replace'".into(),
            ));
        }
        Ok(())
    }

    /// Log a warning (the caller logs it via `tracing`) if this looks like
    /// an unattended, insecure default deployment.
    pub fn is_insecure_default(&self) -> bool {
        self.admin_api_key == "changeme"
    }

    /// Apply a partial `field=value` patch on top of the current settings
    /// and validate the result, without touching disk or any running
    /// component. Used by the admin config endpoint: the caller is
    /// responsible for persisting (`save`) and for deciding whether the
    /// process needs restarting to pick the change up.
    pub fn apply_patch(&self, patch: &HashMap<String, String>) -> CoreResult<Settings> {
        let mut merged: HashMap<String, String> = self
            .to_lines()
            .into_iter()
            .filter_map(|line| line.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
            .collect();
        for (key, value) in patch {
            merged.insert(key.clone(), value.clone());
        }
        let settings = Settings::from_map(&merged)?;
        settings.validate()?;
        Ok(settings)
    }
}

fn parse_kv(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn round_trips_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("claw.conf");
        let mut settings = Settings::default();
        settings.port = 9001;
        settings.mock_gpio = false;
        settings.admin_api_key = "super-secret".into();
        settings.coin_post_pulse_delay_s = 0.75;
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let loaded = Settings::load("/nonexistent/path/claw.conf").unwrap();
        assert_eq!(loaded, Settings::default());
    }

    #[test]
    fn rejects_bad_bool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("claw.conf");
        std::fs::write(&path, "mock_gpio=sortof\n").unwrap();
        assert!(Settings::load(&path).is_err());
    }

    #[test]
    fn rejects_invalid_direction_conflict_mode() {
        let mut s = Settings::default();
        s.direction_conflict_mode = "nonsense".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn apply_patch_overrides_only_named_fields() {
        let base = Settings::default();
        let mut patch = HashMap::new();
        patch.insert("port".to_string(), "9100".to_string());
        let patched = base.apply_patch(&patch).unwrap();
        assert_eq!(patched.port, 9100);
        assert_eq!(patched.tries_per_player, base.tries_per_player);
    }

    #[test]
    fn apply_patch_rejects_values_that_fail_validation() {
        let base = Settings::default();
        let mut patch = HashMap::new();
        patch.insert("tries_per_player".to_string(), "0".to_string());
        assert!(base.apply_patch(&patch).is_err());
    }

    #[test]
    fn insecure_default_flagged() {
        assert!(Settings::default().is_insecure_default());
        let mut s = Settings::default();
        s.admin_api_key = "actually-random".into();
        assert!(!s.is_insecure_default());
    }
}
