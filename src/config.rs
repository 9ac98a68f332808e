//! Session configuration
//!
//! Loads the JSON artifact that names the model and its runtime settings.
//!
//! ```json
//! {
//!   "model": { "path": "model.gguf", "gpu_layers": 99 },
//!   "context": { "size": 4096, "batch": 512, "threads": null },
//!   "sampler": { "max_length": 4096, "temp": 1.2, "top_k": 25, "top_p": 0.8, "seed": 0 },
//!   "chat_template": false,
//!   "library_dirs": []
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::Parameters;

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Model file not found: {0}")]
    ModelMissing(PathBuf),
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Model location and placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    /// Path to the GGUF model, relative to the config file's directory
    pub path: PathBuf,
    /// Number of layers to offload to the GPU (0 = CPU only)
    #[serde(default = "default_gpu_layers")]
    pub gpu_layers: u32,
}

fn default_gpu_layers() -> u32 {
    99
}

/// Context window settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    /// Context window size (0 = the model's training context)
    pub size: u32,
    /// Tokens decoded per batch during prompt evaluation
    pub batch: u32,
    /// Generation threads (None = llama.cpp default)
    pub threads: Option<i32>,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            size: 4096,
            batch: 512,
            threads: None,
        }
    }
}

/// Initial sampler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerSection {
    pub max_length: u32,
    pub temp: f32,
    pub top_k: u32,
    pub top_p: f32,
    /// Random seed for sampling (0 = random)
    pub seed: u32,
}

impl Default for SamplerSection {
    fn default() -> Self {
        let params = Parameters::default();
        Self {
            max_length: params.max_length,
            temp: params.temperature,
            top_k: params.top_k,
            top_p: params.top_p,
            seed: 0,
        }
    }
}

/// Parsed configuration artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub model: ModelSection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub sampler: SamplerSection,
    /// Wrap prompts in the model's chat template
    #[serde(default)]
    pub chat_template: bool,
    /// Extra shared-library directories, relative to the config file
    #[serde(default)]
    pub library_dirs: Vec<PathBuf>,
    /// File this configuration was read from
    #[serde(skip)]
    pub source: PathBuf,
}

impl SessionConfig {
    /// Reads, parses and validates the configuration at `path`.
    ///
    /// Relative paths inside the file are resolved against its directory.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_json(&json).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        config.source = path.to_path_buf();
        config.resolve_paths();
        config.validate()?;

        tracing::debug!("Loaded session config from {}", path.display());
        Ok(config)
    }

    /// Parses a configuration without touching the filesystem.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })
    }

    /// Directory relative paths are resolved against
    pub fn base_dir(&self) -> &Path {
        self.source.parent().unwrap_or_else(|| Path::new(""))
    }

    fn resolve_paths(&mut self) {
        let base = self.base_dir().to_path_buf();
        if self.model.path.is_relative() {
            self.model.path = base.join(&self.model.path);
        }
        for dir in &mut self.library_dirs {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }

    /// Checks value ranges and that the model file exists.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parameters()
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("sampler: {e}")))?;

        if self.context.batch == 0 {
            return Err(ConfigError::Invalid("context.batch must be greater than 0".to_string()));
        }

        if !self.model.path.is_file() {
            return Err(ConfigError::ModelMissing(self.model.path.clone()));
        }

        Ok(())
    }

    /// Initial generation parameters from the sampler section
    pub fn parameters(&self) -> Parameters {
        Parameters {
            max_length: self.sampler.max_length,
            temperature: self.sampler.temp,
            top_k: self.sampler.top_k,
            top_p: self.sampler.top_p,
        }
    }
}
