pub mod watcher;

use async_trait::async_trait;
use pipeline_plugin::{
    HasPipelineConfig, PipelinePlugin, PipelinePluginConfiguration, PluginError,
    plugin_helpers::{ensure_parent, parse_object, split_path},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::warn;

fn default_overwrite_null() -> bool {
    true
}

/// One field to add. `key` may be a dotted path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddConfiguration {
    pub key: String,
    pub value: String,
    /// Replace the field when it is present but `null`.
    #[serde(default = "default_overwrite_null", alias = "overwrite-null")]
    pub overwrite_null: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdderConfiguration {
    #[serde(rename = "plugin")]
    pub pipeline: PipelinePluginConfiguration,
    #[serde(default)]
    pub add: Vec<AddConfiguration>,
}

impl HasPipelineConfig for AdderConfiguration {
    fn pipeline(&self) -> &PipelinePluginConfiguration {
        &self.pipeline
    }

    fn verify_stage(&self) -> Result<(), PluginError> {
        match self.add.iter().find(|item| item.key.split('.').any(str::is_empty)) {
            Some(item) => Err(PluginError::Configuration(format!(
                "invalid key `{}` in add",
                item.key
            ))),
            None => Ok(()),
        }
    }
}

/// Adds every configured field that is not already set. Returns `None` when
/// `input` is not a JSON object or a path runs into a non-object value.
pub fn add_fields(input: &str, items: &[AddConfiguration]) -> Option<String> {
    let mut root = parse_object(input)?;
    for item in items {
        let parts = split_path(&item.key);
        let (field, path) = parts.split_last()?;
        let parent = ensure_parent(&mut root, path)?;
        let vacant = match parent.get(*field) {
            None => true,
            Some(Value::Null) => item.overwrite_null,
            Some(_) => false,
        };
        if vacant {
            parent.insert(field.to_string(), Value::String(item.value.clone()));
        }
    }
    Some(Value::Object(root).to_string())
}

pub struct AdderPlugin {
    id: String,
    add: watch::Receiver<Vec<AddConfiguration>>,
}

impl AdderPlugin {
    pub fn new(config: AdderConfiguration) -> Self {
        Self::watching(config).0
    }

    /// The plugin plus a sender that swaps its `add` list while it runs.
    pub fn watching(config: AdderConfiguration) -> (Self, watch::Sender<Vec<AddConfiguration>>) {
        let (updates, add) = watch::channel(config.add);
        let plugin = Self {
            id: config.pipeline.id,
            add,
        };
        (plugin, updates)
    }

    fn apply(&self, input: &str) -> Option<String> {
        add_fields(input, &self.add.borrow())
    }
}

#[async_trait]
impl PipelinePlugin for AdderPlugin {
    async fn process(&mut self, input: String) -> anyhow::Result<Option<String>> {
        match self.apply(&input) {
            Some(output) => Ok(Some(output)),
            None => {
                warn!(id = %self.id, "message is not a JSON object, passing it through");
                Ok(Some(input))
            }
        }
    }
}
