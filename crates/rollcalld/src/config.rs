use rollcall_core::{default_cascade_path, DetectionParams, LbphParams};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Optional TOML file layer. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub bind_addr: Option<SocketAddr>,
    pub faces_dir: Option<PathBuf>,
    pub cascade_path: Option<PathBuf>,
    pub scale_factor: Option<f64>,
    pub min_neighbors: Option<u32>,
    pub lbph_radius: Option<u32>,
    pub lbph_neighbors: Option<u32>,
    pub lbph_grid_x: Option<u32>,
    pub lbph_grid_y: Option<u32>,
    pub recognition_threshold: Option<f64>,
    pub max_body_bytes: Option<usize>,
}

impl FileConfig {
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
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: 127.0.0.1:5000).
    pub bind_addr: SocketAddr,
    /// Root of the per-identity face directories.
    pub faces_dir: PathBuf,
    /// Haar cascade XML; `None` when nothing was configured or found.
    pub cascade_path: Option<PathBuf>,
    pub detection: DetectionParams,
    pub lbph: LbphParams,
    /// Largest accepted request body in bytes.
    pub max_body_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            faces_dir: PathBuf::from("faces"),
            cascade_path: None,
            detection: DetectionParams::default(),
            lbph: LbphParams::default(),
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load defaults, then the `ROLLCALL_CONFIG` file if set, then `ROLLCALL_*`
    /// environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var_os("ROLLCALL_CONFIG") {
            Some(path) => FileConfig::from_file(Path::new(&path))?,
            None => FileConfig::default(),
        };
        let mut config = Self::resolve(file, |key| std::env::var(key).ok())?;
        if config.cascade_path.is_none() {
            config.cascade_path = default_cascade_path();
        }
        Ok(config)
    }

    /// Layer `file` and the variables returned by `env` over the defaults.
    pub fn resolve(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = file.bind_addr {
            config.bind_addr = v;
        }
        if let Some(v) = file.faces_dir {
            config.faces_dir = v;
        }
        config.cascade_path = file.cascade_path;
        if let Some(v) = file.scale_factor {
            config.detection.scale_factor = v;
        }
        if let Some(v) = file.min_neighbors {
            config.detection.min_neighbors = v;
        }
        if let Some(v) = file.lbph_radius {
            config.lbph.radius = v;
        }
        if let Some(v) = file.lbph_neighbors {
            config.lbph.neighbors = v;
        }
        if let Some(v) = file.lbph_grid_x {
            config.lbph.grid_x = v;
        }
        if let Some(v) = file.lbph_grid_y {
            config.lbph.grid_y = v;
        }
        if let Some(v) = file.recognition_threshold {
            config.lbph.threshold = v;
        }
        if let Some(v) = file.max_body_bytes {
            config.max_body_bytes = v;
        }

        if let Some(v) = env_parse(&env, "ROLLCALL_BIND_ADDR")? {
            config.bind_addr = v;
        }
        if let Some(v) = env("ROLLCALL_FACES_DIR") {
            config.faces_dir = PathBuf::from(v);
        }
        if let Some(v) = env("ROLLCALL_CASCADE_PATH") {
            config.cascade_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env_parse(&env, "ROLLCALL_SCALE_FACTOR")? {
            config.detection.scale_factor = v;
        }
        if let Some(v) = env_parse(&env, "ROLLCALL_MIN_NEIGHBORS")? {
            config.detection.min_neighbors = v;
        }
        if let Some(v) = env_parse(&env, "ROLLCALL_LBPH_RADIUS")? {
            config.lbph.radius = v;
        }
        if let Some(v) = env_parse(&env, "ROLLCALL_LBPH_NEIGHBORS")? {
            config.lbph.neighbors = v;
        }
        if let Some(v) = env_parse(&env, "ROLLCALL_LBPH_GRID_X")? {
            config.lbph.grid_x = v;
        }
        if let Some(v) = env_parse(&env, "ROLLCALL_LBPH_GRID_Y")? {
            config.lbph.grid_y = v;
        }
        if let Some(v) = env_parse(&env, "ROLLCALL_RECOGNITION_THRESHOLD")? {
            config.lbph.threshold = v;
        }
        if let Some(v) = env_parse(&env, "ROLLCALL_MAX_BODY_BYTES")? {
            config.max_body_bytes = v;
        }

        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match env(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}
