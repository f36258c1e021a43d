use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use pipeline_plugin::{
    HasPipelineConfig, PeriodicTask, PipelinePlugin, PipelinePluginConfiguration, PluginError,
    StageRole,
};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const DEFAULT_RATE_SECONDS: u64 = 10;

fn default_rate() -> u64 {
    DEFAULT_RATE_SECONDS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateConfiguration {
    #[serde(rename = "plugin")]
    pub pipeline: PipelinePluginConfiguration,
    /// Seconds between reports.
    #[serde(default = "default_rate")]
    pub rate: u64,
}

impl HasPipelineConfig for RateConfiguration {
    fn pipeline(&self) -> &PipelinePluginConfiguration {
        &self.pipeline
    }

    fn verify_stage(&self) -> Result<(), PluginError> {
        if self.rate == 0 {
            return Err(PluginError::Configuration("rate must be at least 1 second".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateReport {
    pub count: u64,
    pub per_second: f64,
    pub total: u64,
}

/// Message counter shared by the message loop and the reporting task.
#[derive(Debug)]
pub struct RateCounter {
    throughput: AtomicU64,
    total: AtomicU64,
    period: Duration,
}

impl RateCounter {
    pub fn new(period: Duration) -> Self {
        Self {
            throughput: AtomicU64::new(0),
            total: AtomicU64::new(0),
            period,
        }
    }

    pub fn record(&self) {
        self.throughput.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Messages seen since the last report.
    pub fn current(&self) -> u64 {
        self.throughput.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Takes the count since the last report and resets it.
    pub fn report(&self) -> RateReport {
        let count = self.throughput.swap(0, Ordering::AcqRel);
        let seconds = self.period.as_secs_f64();
        let per_second = if seconds > 0.0 {
            count as f64 / seconds
        } else {
            0.0
        };
        let report = RateReport {
            count,
            per_second,
            total: self.total(),
        };
        info!(
            "{} messages in {:?} ({:.2} msg/s), {} in total",
            report.count, self.period, report.per_second, report.total
        );
        report
    }
}

#[async_trait]
impl PeriodicTask for RateCounter {
    fn period(&self) -> Duration {
        self.period
    }

    async fn tick(&self) {
        self.report();
    }
}

/// Counts messages and forwards them unchanged.
pub struct RatePlugin {
    counter: Arc<RateCounter>,
}

impl RatePlugin {
    pub fn new(config: &RateConfiguration) -> Self {
        Self {
            counter: Arc::new(RateCounter::new(Duration::from_secs(config.rate))),
        }
    }

    pub fn counter(&self) -> Arc<RateCounter> {
        self.counter.clone()
    }
}

#[async_trait]
impl PipelinePlugin for RatePlugin {
    async fn process(&mut self, input: String) -> anyhow::Result<Option<String>> {
        self.counter.record();
        Ok(Some(input))
    }

    fn role(&self) -> StageRole {
        StageRole::Sink
    }
}
