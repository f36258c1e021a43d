use async_trait::async_trait;
use pipeline_plugin::{PipelinePlugin, StageRole};

/// Writes every message to stdout and forwards it when there is a downstream.
#[derive(Debug, Default)]
pub struct PrinterPlugin {
    printed: u64,
}

impl PrinterPlugin {
    pub fn printed(&self) -> u64 {
        self.printed
    }
}

#[async_trait]
impl PipelinePlugin for PrinterPlugin {
    async fn process(&mut self, input: String) -> anyhow::Result<Option<String>> {
        println!("{input}");
        self.printed += 1;
        Ok(Some(input))
    }

    fn role(&self) -> StageRole {
        StageRole::Sink
    }
}
