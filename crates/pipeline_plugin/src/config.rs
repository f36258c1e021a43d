use std::path::Path;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::plugin::PluginError;

pub const DEFAULT_BUFFER_SIZE: usize = 20_000;
pub const DEFAULT_REGISTRATION_RETRIES: u32 = 5;

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_registration_retries() -> u32 {
    DEFAULT_REGISTRATION_RETRIES
}

/// The `plugin:` block every stage configuration carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelinePluginConfiguration {
    pub id: String,
    pub plugin_manager: String,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_registration_retries")]
    pub registration_retries: u32,
}

impl PipelinePluginConfiguration {
    pub fn new(id: impl Into<String>, plugin_manager: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            plugin_manager: plugin_manager.into(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            registration_retries: DEFAULT_REGISTRATION_RETRIES,
        }
    }

    pub fn verify(&self) -> Result<(), PluginError> {
        if self.id.trim().is_empty() {
            return Err(PluginError::Configuration("plugin.id must not be empty".into()));
        }
        if self.plugin_manager.trim().is_empty() {
            return Err(PluginError::Configuration(format!(
                "plugin.pluginManager must not be empty for `{}`",
                self.id
            )));
        }
        if self.buffer_size == 0 {
            return Err(PluginError::Configuration(format!(
                "plugin.bufferSize must be positive for `{}`",
                self.id
            )));
        }
        Ok(())
    }
}

/// Implemented by every stage configuration so the shared startup code can
/// reach the `plugin:` block.
pub trait HasPipelineConfig {
    fn pipeline(&self) -> &PipelinePluginConfiguration;

    /// Stage specific checks, run after the `plugin:` block is verified.
    fn verify_stage(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Configuration for stages with nothing beyond the `plugin:` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfiguration {
    #[serde(rename = "plugin")]
    pub pipeline: PipelinePluginConfiguration,
}

impl HasPipelineConfig for StageConfiguration {
    fn pipeline(&self) -> &PipelinePluginConfiguration {
        &self.pipeline
    }
}

pub fn parse_yaml_config<T: DeserializeOwned>(content: &str) -> Result<T, PluginError> {
    serde_yaml_bw::from_str(content)
        .map_err(|e| PluginError::Configuration(format!("invalid configuration: {e}")))
}

pub fn read_yaml_config<T: DeserializeOwned>(path: &Path) -> Result<T, PluginError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        PluginError::Configuration(format!("cannot read {}: {e}", path.display()))
    })?;
    parse_yaml_config(&content)
}

/// Reads a stage configuration and runs every check on it.
pub fn load_stage_config<C>(path: &Path) -> Result<C, PluginError>
where
    C: DeserializeOwned + HasPipelineConfig,
{
    let config: C = read_yaml_config(path)?;
    config.pipeline().verify()?;
    config.verify_stage()?;
    Ok(config)
}
