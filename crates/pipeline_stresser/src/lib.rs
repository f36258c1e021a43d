use async_trait::async_trait;
use pipeline_plugin::{HasPipelineConfig, PipelinePluginConfiguration, PluginError, SourcePlugin};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StresserConfiguration {
    #[serde(rename = "plugin")]
    pub pipeline: PipelinePluginConfiguration,
    pub message: String,
    /// Stop after this many messages. Without it the stresser runs until cancelled.
    #[serde(default)]
    pub iterations: Option<u64>,
}

impl HasPipelineConfig for StresserConfiguration {
    fn pipeline(&self) -> &PipelinePluginConfiguration {
        &self.pipeline
    }

    fn verify_stage(&self) -> Result<(), PluginError> {
        if self.message.is_empty() {
            return Err(PluginError::Configuration("stresser message must not be empty".into()));
        }
        Ok(())
    }
}

pub struct StresserPlugin {
    message: String,
    iterations: Option<u64>,
    sent: u64,
}

impl StresserPlugin {
    pub fn new(config: StresserConfiguration) -> Self {
        Self {
            message: config.message,
            iterations: config.iterations,
            sent: 0,
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
}

#[async_trait]
impl SourcePlugin for StresserPlugin {
    async fn next_message(&mut self) -> anyhow::Result<Option<String>> {
        if let Some(limit) = self.iterations {
            if self.sent >= limit {
                info!(sent = self.sent, "all iterations published");
                return Ok(None);
            }
        }
        self.sent += 1;
        Ok(Some(self.message.clone()))
    }
}
