use async_trait::async_trait;
use pipeline_plugin::{
    HasPipelineConfig, PipelinePlugin, PipelinePluginConfiguration, PluginError,
    plugin_helpers::{find_parent_mut, parse_object, split_path},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathExtractorConfiguration {
    #[serde(rename = "plugin")]
    pub pipeline: PipelinePluginConfiguration,
    /// Field holding a fully qualified class name. May be a dotted path.
    pub field: String,
    /// Source root the package directories live under, e.g. `src/main/java`.
    #[serde(alias = "relative-source-path")]
    pub relative_source_path: String,
    /// File extension including the dot, e.g. `.java`.
    #[serde(default)]
    pub postfix: String,
}

impl HasPipelineConfig for PathExtractorConfiguration {
    fn pipeline(&self) -> &PipelinePluginConfiguration {
        &self.pipeline
    }

    fn verify_stage(&self) -> Result<(), PluginError> {
        if self.field.split('.').any(str::is_empty) {
            return Err(PluginError::Configuration(format!(
                "invalid field `{}`",
                self.field
            )));
        }
        Ok(())
    }
}

/// `com.example.FooKt` under `src/main/kotlin` with `.kt` becomes
/// `src/main/kotlin/com/example/Foo.kt`. The `Kt` suffix of Kotlin file
/// classes is dropped from every segment.
pub fn source_path(class_name: &str, relative_source_path: &str, postfix: &str) -> String {
    let segments: Vec<&str> = class_name
        .split('.')
        .map(|segment| segment.strip_suffix("Kt").unwrap_or(segment))
        .collect();
    format!("{relative_source_path}/{}{postfix}", segments.join("/"))
}

/// Replaces the class name in `config.field` with its source path. A missing or
/// non-string field leaves the message as it is. Returns `None` when `input` is
/// not a JSON object.
pub fn extract_path(input: &str, config: &PathExtractorConfiguration) -> Option<String> {
    let mut root = parse_object(input)?;
    let parts = split_path(&config.field);
    if let Some((field, path)) = parts.split_last() {
        let parent = find_parent_mut(&mut root, path);
        match parent.and_then(|p| p.get_mut(*field)) {
            Some(Value::String(class_name)) => {
                *class_name = source_path(class_name, &config.relative_source_path, &config.postfix);
            }
            Some(_) => debug!(field = %config.field, "field is not a string, leaving it"),
            None => debug!(field = %config.field, "field not present"),
        }
    }
    Some(Value::Object(root).to_string())
}

pub struct PathExtractorPlugin {
    config: PathExtractorConfiguration,
}

impl PathExtractorPlugin {
    pub fn new(config: PathExtractorConfiguration) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PipelinePlugin for PathExtractorPlugin {
    async fn process(&mut self, input: String) -> anyhow::Result<Option<String>> {
        match extract_path(&input, &self.config) {
            Some(output) => Ok(Some(output)),
            None => {
                warn!(id = %self.config.pipeline.id, "message is not a JSON object, passing it through");
                Ok(Some(input))
            }
        }
    }
}
