//! Sinks for per-round training metrics (`fit_loss_3`, `val_accuracy_glob`, ...).

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::Result;
use crate::protocol::Metrics;
use crate::registry::{typed_config, Category, Component, ConfigVariant, PluginModule};

pub trait MetricsLogger: Send {
    fn log_metrics(&mut self, metrics: &Metrics, step: Option<u64>);
}

/// Shared between the strategy, its decorators and the server-side evaluation.
pub type SharedMetricsLogger = Arc<Mutex<Box<dyn MetricsLogger>>>;

pub fn shared(logger: Box<dyn MetricsLogger>) -> SharedMetricsLogger { Arc::new(Mutex::new(logger)) }

pub trait MetricsLoggerFactory: Send + Sync {
    /// `root_dir` is the session's reporting directory.
    fn build(&self, root_dir: &Path, config: &Value) -> Result<Box<dyn MetricsLogger>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetricsLogger;

impl MetricsLogger for NullMetricsLogger {
    fn log_metrics(&mut self, _metrics: &Metrics, _step: Option<u64>) {}
}

/// Forwards every call to each of its sinks, in order.
pub struct MultipleMetricsLogger {
    sinks: Vec<Box<dyn MetricsLogger>>,
}

impl MultipleMetricsLogger {
    pub fn new(sinks: Vec<Box<dyn MetricsLogger>>) -> Self { Self { sinks } }
}

impl MetricsLogger for MultipleMetricsLogger {
    fn log_metrics(&mut self, metrics: &Metrics, step: Option<u64>) {
        for sink in &mut self.sinks { sink.log_metrics(metrics, step); }
    }
}

/// Null for no sinks, the sink itself for one, a fan-out otherwise.
pub fn combine(mut sinks: Vec<Box<dyn MetricsLogger>>) -> Box<dyn MetricsLogger> {
    match sinks.len() {
        0 => Box::new(NullMetricsLogger),
        1 => sinks.remove(0),
        _ => Box::new(MultipleMetricsLogger::new(sinks)),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricsLevel {
    #[default]
    Info,
    Debug,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TracingMetricsLoggerConfig {
    pub level: MetricsLevel,
}

/// Emits one `biscus::metrics` event per metric.
#[derive(Debug, Clone)]
pub struct TracingMetricsLogger {
    level: MetricsLevel,
}

impl TracingMetricsLogger {
    pub fn new(level: MetricsLevel) -> Self { Self { level } }
}

impl MetricsLogger for TracingMetricsLogger {
    fn log_metrics(&mut self, metrics: &Metrics, step: Option<u64>) {
        for (name, value) in metrics {
            match self.level {
                MetricsLevel::Info => info!(target: "biscus::metrics", step, metric = %name, %value),
                MetricsLevel::Debug => debug!(target: "biscus::metrics", step, metric = %name, %value),
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NullMetricsLoggerConfig {}

struct TracingMetricsLoggerFactory;

impl MetricsLoggerFactory for TracingMetricsLoggerFactory {
    fn build(&self, _root_dir: &Path, config: &Value) -> Result<Box<dyn MetricsLogger>> {
        let config: TracingMetricsLoggerConfig = typed_config("tracing", config)?;
        Ok(Box::new(TracingMetricsLogger::new(config.level)))
    }
}

struct NullMetricsLoggerFactory;

impl MetricsLoggerFactory for NullMetricsLoggerFactory {
    fn build(&self, _root_dir: &Path, _config: &Value) -> Result<Box<dyn MetricsLogger>> { Ok(Box::new(NullMetricsLogger)) }
}

pub fn modules_and_configs() -> anyhow::Result<PluginModule> {
    Ok(PluginModule::new()
        .register(
            "tracing",
            Component::MetricsLogger(Arc::new(TracingMetricsLoggerFactory)),
            ConfigVariant::<TracingMetricsLoggerConfig>::new(Category::MetricsLogger, "tracing", "Tracing events"),
        )
        .register(
            "null",
            Component::MetricsLogger(Arc::new(NullMetricsLoggerFactory)),
            ConfigVariant::<NullMetricsLoggerConfig>::new(Category::MetricsLogger, "null", "Discard"),
        ))
}
