use async_trait::async_trait;
use pipeline_plugin::{
    HasPipelineConfig, PipelinePlugin, PipelinePluginConfiguration, PluginError,
    plugin_helpers::{ensure_parent, find_parent_mut, parse_object, split_path},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Moves the value at `from` to `to`. Both may be dotted paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rename {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenamerConfiguration {
    #[serde(rename = "plugin")]
    pub pipeline: PipelinePluginConfiguration,
    #[serde(default)]
    pub rename: Vec<Rename>,
}

impl HasPipelineConfig for RenamerConfiguration {
    fn pipeline(&self) -> &PipelinePluginConfiguration {
        &self.pipeline
    }

    fn verify_stage(&self) -> Result<(), PluginError> {
        for rename in &self.rename {
            let invalid = [&rename.from, &rename.to]
                .iter()
                .any(|path| path.split('.').any(str::is_empty));
            if invalid {
                return Err(PluginError::Configuration(format!(
                    "invalid rename `{}` -> `{}`",
                    rename.from, rename.to
                )));
            }
        }
        Ok(())
    }
}

/// Applies every rename in order. A missing source path leaves the message as
/// it is. Returns `None` when `input` is not a JSON object.
pub fn rename_fields(input: &str, renames: &[Rename]) -> Option<String> {
    let mut root = parse_object(input)?;
    for rename in renames {
        let from = split_path(&rename.from);
        let to = split_path(&rename.to);
        let (Some((from_field, from_path)), Some((to_field, to_path))) =
            (from.split_last(), to.split_last())
        else {
            continue;
        };

        let Some(value) = find_parent_mut(&mut root, from_path).and_then(|p| p.remove(*from_field))
        else {
            debug!(from = %rename.from, "field not present, nothing to rename");
            continue;
        };

        match ensure_parent(&mut root, to_path) {
            Some(target) => {
                target.insert(to_field.to_string(), value);
            }
            None => {
                // target path is blocked by a scalar, put the value back
                if let Some(parent) = find_parent_mut(&mut root, from_path) {
                    parent.insert(from_field.to_string(), value);
                }
                warn!(from = %rename.from, to = %rename.to, "cannot rename into a non-object");
            }
        }
    }
    Some(Value::Object(root).to_string())
}

pub struct RenamerPlugin {
    id: String,
    rename: Vec<Rename>,
}

impl RenamerPlugin {
    pub fn new(config: RenamerConfiguration) -> Self {
        Self {
            id: config.pipeline.id,
            rename: config.rename,
        }
    }
}

#[async_trait]
impl PipelinePlugin for RenamerPlugin {
    async fn process(&mut self, input: String) -> anyhow::Result<Option<String>> {
        match rename_fields(&input, &self.rename) {
            Some(output) => Ok(Some(output)),
            None => {
                warn!(id = %self.id, "message is not a JSON object, passing it through");
                Ok(Some(input))
            }
        }
    }
}
