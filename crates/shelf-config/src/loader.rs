//! Loading configuration from disk or strings

use crate::config::PipelineConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::Path;
use tracing::debug;

/// Loads and validates [`PipelineConfig`] values
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a `.toml` or `.json` file
    ///
    /// The format is chosen from the file extension. The loaded config is
    /// validated before it is returned.
    pub async fn load_from_file(path: impl AsRef<Path>) -> ConfigResult<PipelineConfig> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Io {
                path: path.to_path_buf(),
                error: e.to_string(),
            })?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&content)?,
            Some("json") => Self::from_json_str(&content)?,
            _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        };

        debug!(
            path = %path.display(),
            max_concurrent = config.max_concurrent_pipelines,
            "Loaded pipeline config"
        );
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> ConfigResult<PipelineConfig> {
        let config: PipelineConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
            format: "toml",
            error: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a JSON string
    pub fn from_json_str(content: &str) -> ConfigResult<PipelineConfig> {
        let config: PipelineConfig =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse {
                format: "json",
                error: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }
}
