use std::{collections::HashSet, fs, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid plugin manager configuration: {0}")]
    Parse(#[from] serde_yaml_bw::Error),
    #[error("a pipeline needs at least 2 plugins, found {0}")]
    TooFewPlugins(usize),
    #[error("plugin id `{0}` is declared twice")]
    DuplicateId(String),
    #[error("plugin `{0}` has no host")]
    MissingHost(String),
    #[error("plugin manager host must not be empty")]
    MissingManagerHost,
}

/// One stage in declaration order, together with the address it binds its
/// downstream side on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub id: String,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManagerConfiguration {
    /// Address of the registration endpoint.
    pub host: String,
    pub plugins: Vec<PipelineStage>,
}

impl PluginManagerConfiguration {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::parse(&content)?;
        config.verify()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml_bw::from_str(content)?)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingManagerHost);
        }
        if self.plugins.len() < 2 {
            return Err(ConfigError::TooFewPlugins(self.plugins.len()));
        }
        let mut seen = HashSet::new();
        for stage in &self.plugins {
            if !seen.insert(stage.id.as_str()) {
                return Err(ConfigError::DuplicateId(stage.id.clone()));
            }
            if stage.host.trim().is_empty() {
                return Err(ConfigError::MissingHost(stage.id.clone()));
            }
        }
        Ok(())
    }
}
