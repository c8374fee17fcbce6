//! Process-wide tracing setup.
//!
//! Plugin loading happens before the session config (and therefore the
//! configured loggers) is known, so it runs under [`bootstrap_subscriber`]
//! via `tracing::subscriber::with_default`. The session subscriber is then
//! assembled from the `logger` components named in `server_run.loggers`.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, Subscriber};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::error::{Error, Result};
use crate::registry::{typed_config, Category, Component, ConfigVariant, PluginModule};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

pub type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

pub trait LoggerFactory: Send + Sync {
    fn layer(&self, config: &Value) -> Result<BoxedLayer>;
}

/// `RUST_LOG` when set, `info` otherwise.
fn env_filter() -> EnvFilter { EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy() }

fn json_requested() -> bool {
    std::env::var("BISCUS_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

/// Scoped stderr subscriber for the bootstrap phase; honours `RUST_LOG` and `BISCUS_JSON_LOG`.
pub fn bootstrap_subscriber() -> Box<dyn Subscriber + Send + Sync> {
    let builder = fmt().with_env_filter(env_filter()).with_target(true).with_writer(std::io::stderr);
    if json_requested() { Box::new(builder.json().flatten_event(true).finish()) } else { Box::new(builder.finish()) }
}

/// Installs the global subscriber from the session's logger layers. Only the
/// first call has an effect.
pub fn init_tracing(layers: Vec<BoxedLayer>) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let count = layers.len();
        tracing_subscriber::registry()
            .with(layers)
            .with(env_filter())
            .try_init()
            .map_err(|e| Error::External(anyhow::Error::new(e)))?;
        info!(layers = count, "tracing initialized");
        Ok::<(), Error>(())
    })?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConsoleLoggerConfig {
    pub with_target: bool,
    pub ansi: bool,
    pub line_number: bool,
}

impl Default for ConsoleLoggerConfig {
    fn default() -> Self { Self { with_target: true, ansi: true, line_number: false } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct JsonLoggerConfig {
    pub flatten_event: bool,
    pub current_span: bool,
}

impl Default for JsonLoggerConfig {
    fn default() -> Self { Self { flatten_event: true, current_span: true } }
}

pub struct ConsoleLogger;

impl LoggerFactory for ConsoleLogger {
    fn layer(&self, config: &Value) -> Result<BoxedLayer> {
        let c: ConsoleLoggerConfig = typed_config("console", config)?;
        let layer: BoxedLayer = Box::new(fmt::layer::<Registry>().with_target(c.with_target).with_ansi(c.ansi).with_line_number(c.line_number));
        Ok(layer)
    }
}

pub struct JsonLogger;

impl LoggerFactory for JsonLogger {
    fn layer(&self, config: &Value) -> Result<BoxedLayer> {
        let c: JsonLoggerConfig = typed_config("json", config)?;
        let layer: BoxedLayer = Box::new(fmt::layer::<Registry>().json().flatten_event(c.flatten_event).with_current_span(c.current_span).with_span_list(false));
        Ok(layer)
    }
}

pub fn modules_and_configs() -> anyhow::Result<PluginModule> {
    Ok(PluginModule::new()
        .register("console", Component::Logger(Arc::new(ConsoleLogger)), ConfigVariant::<ConsoleLoggerConfig>::new(Category::Logger, "console", "Console"))
        .register("json", Component::Logger(Arc::new(JsonLogger)), ConfigVariant::<JsonLoggerConfig>::new(Category::Logger, "json", "JSON lines")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logger_layers_build() {
        assert!(ConsoleLogger.layer(&serde_json::json!({"ansi": false})).is_ok());
        assert!(JsonLogger.layer(&Value::Null).is_ok());
        assert!(JsonLogger.layer(&serde_json::json!({"pretty": true})).is_err());
    }

    #[test]
    fn bootstrap_subscriber_scopes() {
        tracing::subscriber::with_default(bootstrap_subscriber(), || info!("inside bootstrap"));
    }

    #[test]
    fn warnings_are_visible_without_rust_log() {
        if std::env::var_os("RUST_LOG").is_some() { return; }
        let (warn, info) = tracing::subscriber::with_default(bootstrap_subscriber(), || (tracing::enabled!(tracing::Level::WARN), tracing::enabled!(tracing::Level::INFO)));
        assert!(warn && info);
        assert!(!tracing::subscriber::with_default(bootstrap_subscriber(), || tracing::enabled!(tracing::Level::DEBUG)));
    }
}
