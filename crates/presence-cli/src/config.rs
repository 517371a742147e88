use anyhow::{Context, Result};
use presence_core::extractor::{DEFAULT_EMBEDDING_DIM, DEFAULT_INPUT_SIZE};
use presence_core::EngineSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
const EMBEDDING_MODEL_FILE: &str = "facenet_vggface2.onnx";

/// CLI configuration: an optional TOML file, overridden by `PRESENCE_*` variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite enrollment database.
    pub db_path: PathBuf,
    /// Square input size of the embedding model, in pixels.
    pub embedding_input_size: u32,
    /// Output dimension of the embedding model.
    pub embedding_dim: usize,
    pub engine: EngineSettings,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("faces.db"),
            embedding_input_size: DEFAULT_INPUT_SIZE,
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            engine: EngineSettings::default(),
        }
    }
}

impl Config {
    /// Load `$PRESENCE_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var_os("PRESENCE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    fn apply_env(&mut self) {
        if let Some(dir) = std::env::var_os("PRESENCE_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(path) = std::env::var_os("PRESENCE_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        env_override("PRESENCE_EMBEDDING_INPUT_SIZE", &mut self.embedding_input_size);
        env_override("PRESENCE_EMBEDDING_DIM", &mut self.embedding_dim);
        env_override("PRESENCE_SIMILARITY_THRESHOLD", &mut self.engine.similarity_threshold);
        env_override("PRESENCE_CONFIDENCE_FLOOR", &mut self.engine.confidence_floor);
        env_override("PRESENCE_MIN_FACE_FRACTION", &mut self.engine.min_face_fraction);
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(DETECTOR_MODEL_FILE)
    }

    /// Path to the face embedding model.
    pub fn embedding_model_path(&self) -> PathBuf {
        self.model_dir.join(EMBEDDING_MODEL_FILE)
    }
}

fn data_dir() -> PathBuf {
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = std::env::var_os("HOME").unwrap_or_else(|| "/tmp".into());
            PathBuf::from(home).join(".local/share")
        })
        .join("presence")
}

fn env_override<T: std::str::FromStr>(key: &str, slot: &mut T) {
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
    }
}
