use gatewatch_core::pipeline::PipelineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Daemon configuration: an optional TOML file, then `GATEWATCH_*`
/// environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory holding `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// SQLite file backing the durable identity cache.
    pub db_path: PathBuf,
    /// Visitor service base URL, e.g. `http://host:5000/api/v1`.
    pub api_base_url: Option<String>,
    pub tick_interval_ms: u64,
    /// Euclidean distance under which a cached identity matches a face.
    ///
    /// The default of 0.6 is calibrated for 128-d descriptors. Two captures
    /// of one person under the 512-d normalized recognizer are often further
    /// apart than that, so deployments should tune this against their own
    /// camera and model.
    pub match_threshold: f32,
    /// Distance under which a face counts as already tracked. Falls back to
    /// `match_threshold` when unset; tune the two together.
    pub novelty_threshold: Option<f32>,
    pub history_capacity: usize,
    pub snapshot_capacity: usize,
    pub debounce_ms: u64,
    pub request_timeout_secs: u64,
    /// Frames discarded at startup while exposure settles.
    pub warmup_frames: usize,
    pub snapshot_padding: f32,
    pub jpeg_quality: u8,
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("gatewatch")
}

impl Default for Config {
    fn default() -> Self {
        let pipeline = PipelineConfig::default();
        let data_dir = data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("identities.db"),
            api_base_url: None,
            tick_interval_ms: pipeline.tick_interval.as_millis() as u64,
            match_threshold: pipeline.match_threshold,
            novelty_threshold: None,
            history_capacity: pipeline.history_capacity,
            snapshot_capacity: pipeline.snapshot_capacity,
            debounce_ms: pipeline.debounce.as_millis() as u64,
            request_timeout_secs: 10,
            warmup_frames: 4,
            snapshot_padding: pipeline.snapshot_padding,
            jpeg_quality: pipeline.jpeg_quality,
        }
    }
}

impl Config {
    /// Load `GATEWATCH_CONFIG` (or the XDG default, if present), then apply
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("GATEWATCH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_config_path());
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
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

    /// Override fields from `GATEWATCH_<FIELD>` variables. Unparsable values
    /// are logged and ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(&format!("GATEWATCH_{key}"));

        if let Some(v) = get("CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = get("MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = get("DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("API_BASE_URL") {
            self.api_base_url = Some(v);
        }
        override_parsed(&mut self.camera_width, "CAMERA_WIDTH", &get);
        override_parsed(&mut self.camera_height, "CAMERA_HEIGHT", &get);
        override_parsed(&mut self.tick_interval_ms, "TICK_INTERVAL_MS", &get);
        override_parsed(&mut self.match_threshold, "MATCH_THRESHOLD", &get);
        if get("NOVELTY_THRESHOLD").is_some() {
            let mut novelty = self.novelty_threshold.unwrap_or(self.match_threshold);
            override_parsed(&mut novelty, "NOVELTY_THRESHOLD", &get);
            self.novelty_threshold = Some(novelty);
        }
        override_parsed(&mut self.history_capacity, "HISTORY_CAPACITY", &get);
        override_parsed(&mut self.snapshot_capacity, "SNAPSHOT_CAPACITY", &get);
        override_parsed(&mut self.debounce_ms, "DEBOUNCE_MS", &get);
        override_parsed(&mut self.request_timeout_secs, "REQUEST_TIMEOUT_SECS", &get);
        override_parsed(&mut self.warmup_frames, "WARMUP_FRAMES", &get);
        override_parsed(&mut self.snapshot_padding, "SNAPSHOT_PADDING", &get);
        override_parsed(&mut self.jpeg_quality, "JPEG_QUALITY", &get);
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms.max(1)),
            match_threshold: self.match_threshold,
            novelty_threshold: self.novelty_threshold.unwrap_or(self.match_threshold),
            history_capacity: self.history_capacity,
            snapshot_capacity: self.snapshot_capacity,
            debounce: Duration::from_millis(self.debounce_ms),
            snapshot_padding: self.snapshot_padding,
            jpeg_quality: self.jpeg_quality.clamp(1, 100),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("gatewatch/gatewatch.toml")
}

fn override_parsed<T: FromStr>(field: &mut T, key: &str, get: &impl Fn(&str) -> Option<String>) {
    let Some(raw) = get(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *field = value,
        Err(_) => tracing::warn!(key = %format!("GATEWATCH_{key}"), value = %raw, "ignoring unparsable setting"),
    }
}
