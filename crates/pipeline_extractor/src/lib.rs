use async_trait::async_trait;
use pipeline_plugin::{
    HasPipelineConfig, PipelinePlugin, PipelinePluginConfiguration, PluginError,
    plugin_helpers::{ensure_parent, find_value, parse_object, split_path},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractType {
    String,
    Number,
    Double,
}

impl ExtractType {
    /// `None` when the captured text does not fit the type.
    pub fn convert(&self, text: &str) -> Option<Value> {
        match self {
            ExtractType::String => Some(Value::String(text.to_string())),
            ExtractType::Number => text.trim().parse::<i64>().ok().map(Value::from),
            ExtractType::Double => text
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number),
        }
    }
}

/// Where capture group `n` (counting from 1) is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extract {
    pub to: String,
    #[serde(rename = "type", default = "default_type")]
    pub kind: ExtractType,
}

fn default_type() -> ExtractType {
    ExtractType::String
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractableField {
    pub field: String,
    #[serde(rename = "match")]
    pub pattern: String,
    pub extract: Vec<Extract>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractorConfiguration {
    #[serde(rename = "plugin")]
    pub pipeline: PipelinePluginConfiguration,
    #[serde(default)]
    pub fields: Vec<ExtractableField>,
}

impl HasPipelineConfig for ExtractorConfiguration {
    fn pipeline(&self) -> &PipelinePluginConfiguration {
        &self.pipeline
    }

    fn verify_stage(&self) -> Result<(), PluginError> {
        compile(&self.fields).map(|_| ())
    }
}

#[derive(Debug, Clone)]
pub struct CompiledField {
    field: String,
    regex: Regex,
    extract: Vec<Extract>,
}

pub fn compile(fields: &[ExtractableField]) -> Result<Vec<CompiledField>, PluginError> {
    fields
        .iter()
        .map(|field| {
            let regex = Regex::new(&field.pattern).map_err(|e| {
                PluginError::Configuration(format!("invalid match for `{}`: {e}", field.field))
            })?;
            Ok(CompiledField {
                field: field.field.clone(),
                regex,
                extract: field.extract.clone(),
            })
        })
        .collect()
}

/// Runs every field's regex over its current value and writes the typed
/// captures. A field that is missing or does not match is skipped. Returns
/// `None` when `input` is not a JSON object.
pub fn extract_fields(input: &str, fields: &[CompiledField]) -> Option<String> {
    let mut root = parse_object(input)?;
    for field in fields {
        let text = match find_value(&root, &field.field) {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => {
                debug!(field = %field.field, "field not present");
                continue;
            }
        };
        let Some(captures) = field.regex.captures(&text) else {
            debug!(field = %field.field, "no match");
            continue;
        };
        for (group, extract) in captures.iter().skip(1).zip(&field.extract) {
            let Some(group) = group else {
                continue;
            };
            let Some(value) = extract.kind.convert(group.as_str()) else {
                debug!(to = %extract.to, capture = group.as_str(), "capture does not fit its type");
                continue;
            };
            let path = split_path(&extract.to);
            let Some((leaf, parents)) = path.split_last() else {
                continue;
            };
            match ensure_parent(&mut root, parents) {
                Some(target) => {
                    target.insert(leaf.to_string(), value);
                }
                None => debug!(to = %extract.to, "target path blocked by a non-object"),
            }
        }
    }
    Some(Value::Object(root).to_string())
}

pub struct ExtractorPlugin {
    id: String,
    fields: Vec<CompiledField>,
}

impl ExtractorPlugin {
    pub fn new(config: ExtractorConfiguration) -> Result<Self, PluginError> {
        Ok(Self {
            fields: compile(&config.fields)?,
            id: config.pipeline.id,
        })
    }
}

#[async_trait]
impl PipelinePlugin for ExtractorPlugin {
    async fn process(&mut self, input: String) -> anyhow::Result<Option<String>> {
        match extract_fields(&input, &self.fields) {
            Some(output) => Ok(Some(output)),
            None => {
                warn!(id = %self.id, "message is not a JSON object, passing it through");
                Ok(Some(input))
            }
        }
    }
}
