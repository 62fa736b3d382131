use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file, then `ROLLCALL_*`
/// environment variables, each layer overriding the previous one.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Path to the ONNX face embedding model.
    pub model_path: PathBuf,
    /// Path to the SQLite database holding the roster.
    pub db_path: PathBuf,
    /// Directory for enrollment thumbnails.
    pub thumbnail_dir: PathBuf,
    /// Maximum cosine distance accepted as a match.
    pub match_threshold: f32,
    /// Seconds before the same person is announced again.
    pub cooldown_secs: u64,
    /// Still-capture period when streaming is unavailable.
    pub fallback_interval_ms: u64,
    /// Use still captures even if the camera can stream.
    pub force_still_capture: bool,
    /// Side length of enrollment thumbnails, in pixels.
    pub thumbnail_size: u32,
    /// HTTP endpoint receiving recognition events. Unset disables the sink.
    pub event_endpoint: Option<String>,
    /// Timeout for a single event delivery.
    pub event_timeout_secs: u64,
    /// Attempts at opening the camera and model before giving up.
    pub startup_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            model_path: data_dir.join("models/mobilefacenet.onnx"),
            db_path: data_dir.join("roster.db"),
            thumbnail_dir: data_dir.join("thumbnails"),
            match_threshold: 0.20,
            cooldown_secs: 5,
            fallback_interval_ms: 400,
            force_still_capture: false,
            thumbnail_size: 128,
            event_endpoint: None,
            event_timeout_secs: 5,
            startup_retries: 3,
        }
    }
}

impl Config {
    /// Load configuration from the config file (if any) and `ROLLCALL_*`
    /// environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match config_file() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from environment-style variables. Unparseable
    /// values are ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = var("ROLLCALL_MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Some(v) = var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("ROLLCALL_THUMBNAIL_DIR") {
            self.thumbnail_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ROLLCALL_EVENT_ENDPOINT") {
            self.event_endpoint = if v.is_empty() { None } else { Some(v) };
        }
        if let Some(v) = var("ROLLCALL_FORCE_STILL_CAPTURE") {
            self.force_still_capture = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        override_parsed(&var, "ROLLCALL_MATCH_THRESHOLD", &mut self.match_threshold);
        override_parsed(&var, "ROLLCALL_COOLDOWN_SECS", &mut self.cooldown_secs);
        override_parsed(&var, "ROLLCALL_FALLBACK_INTERVAL_MS", &mut self.fallback_interval_ms);
        override_parsed(&var, "ROLLCALL_THUMBNAIL_SIZE", &mut self.thumbnail_size);
        override_parsed(&var, "ROLLCALL_EVENT_TIMEOUT_SECS", &mut self.event_timeout_secs);
        override_parsed(&var, "ROLLCALL_STARTUP_RETRIES", &mut self.startup_retries);
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn fallback_interval(&self) -> Duration {
        Duration::from_millis(self.fallback_interval_ms)
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_secs(self.event_timeout_secs)
    }

    /// Path to the embedding model, as ort expects it.
    pub fn model_path_str(&self) -> String {
        self.model_path.to_string_lossy().into_owned()
    }
}

fn override_parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, field: &mut T) {
    if let Some(raw) = var(key) {
        match raw.parse() {
            Ok(v) => *field = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable config override"),
        }
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("ROLLCALL_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let config_home = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
        .ok()?;
    Some(config_home.join("rollcall/config.toml"))
}
