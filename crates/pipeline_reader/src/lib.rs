use std::path::PathBuf;

use async_trait::async_trait;
use pipeline_plugin::{HasPipelineConfig, PipelinePluginConfiguration, SourcePlugin};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderConfiguration {
    #[serde(rename = "plugin")]
    pub pipeline: PipelinePluginConfiguration,
    /// Read this file instead of stdin.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl HasPipelineConfig for ReaderConfiguration {
    fn pipeline(&self) -> &PipelinePluginConfiguration {
        &self.pipeline
    }
}

type BoxedInput = Box<dyn AsyncBufRead + Unpin + Send>;

/// Publishes each input line as one message until end of input.
///
/// A line ends at `\n` or `\r\n`; the terminator is not part of the message.
/// Bytes that are not valid UTF-8 are replaced with U+FFFD.
pub struct ReaderPlugin {
    input: BoxedInput,
    buf: Vec<u8>,
    line_number: u64,
}

impl ReaderPlugin {
    pub fn from_reader(reader: impl AsyncBufRead + Unpin + Send + 'static) -> Self {
        Self {
            input: Box::new(reader),
            buf: Vec::new(),
            line_number: 0,
        }
    }

    pub fn stdin() -> Self {
        Self::from_reader(BufReader::new(tokio::io::stdin()))
    }

    pub async fn open(config: &ReaderConfiguration) -> anyhow::Result<Self> {
        match &config.file {
            Some(path) => {
                let file = tokio::fs::File::open(path).await?;
                Ok(Self::from_reader(BufReader::new(file)))
            }
            None => Ok(Self::stdin()),
        }
    }
}

#[async_trait]
impl SourcePlugin for ReaderPlugin {
    async fn next_message(&mut self) -> anyhow::Result<Option<String>> {
        self.buf.clear();
        if self.input.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }
        self.line_number += 1;
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        let line = match String::from_utf8(std::mem::take(&mut self.buf)) {
            Ok(line) => line,
            Err(e) => {
                warn!(line = self.line_number, "line is not valid UTF-8, replacing invalid bytes");
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        };
        debug!(bytes = line.len(), "read line");
        Ok(Some(line))
    }
}
