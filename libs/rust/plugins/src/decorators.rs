//! `basicstrategydecorator`: decorators that watch evaluation rounds go by.

use std::sync::Arc;
use std::time::Instant;

use biscus_core::registry::{typed_config, Category, Component, ConfigVariant, PluginModule};
use biscus_core::strategy::{Decorated, StrategyDecorator, StrategyDecoratorFactory};
use biscus_core::{ClientProxy, EvaluateRes, Failure, Metrics, Result, Strategy};
use once_cell::sync::Lazy;
use opentelemetry::metrics::{Histogram, Meter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

static METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("biscus_plugins"));

static METRIC_DELTA: Lazy<Histogram<f64>> =
    Lazy::new(|| METER.f64_histogram("biscus_evaluate_metric_delta").with_description("Absolute change of the aggregated evaluation metric between rounds").build());

static ROUND_INTERVAL: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("biscus_evaluate_round_interval_seconds")
        .with_description("Wall-clock time between two evaluation aggregations")
        .with_unit("s")
        .build()
});

/// Which value `metricdiffcompute` hands back as the round's metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Report {
    /// The value stored from the previous round; `None` on the first one.
    #[default]
    Previous,
    Current,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MetricDiffConfig {
    pub empty_configuration: bool,
    pub report: Report,
}

impl Default for MetricDiffConfig {
    fn default() -> Self { Self { empty_configuration: true, report: Report::Previous } }
}

/// Logs how much the aggregated evaluation metric moved since the last round.
pub struct MetricDiffCompute {
    base: Box<dyn Strategy>,
    report: Report,
    previous: Option<f64>,
}

impl MetricDiffCompute {
    pub fn new(base: Box<dyn Strategy>, config: &MetricDiffConfig) -> Self { Self { base, report: config.report, previous: None } }
}

impl StrategyDecorator for MetricDiffCompute {
    fn base_strategy(&mut self) -> &mut dyn Strategy { self.base.as_mut() }

    fn aggregate_evaluate(&mut self, server_round: u64, results: &[(ClientProxy, EvaluateRes)], failures: &[Failure<EvaluateRes>]) -> (Option<f64>, Metrics) {
        let (metric, metrics) = self.base.aggregate_evaluate(server_round, results, failures);
        let Some(current) = metric else {
            info!(round = server_round, "aggregated evaluation metric is none");
            return (None, metrics);
        };
        if let Some(previous) = self.previous {
            let delta = (previous - current).abs();
            info!(round = server_round, delta, "evaluation metric diff");
            METRIC_DELTA.record(delta, &[]);
        }
        let previous = self.previous.replace(current);
        match self.report {
            Report::Previous => (previous, metrics),
            Report::Current => (Some(current), metrics),
        }
    }
}

pub struct MetricDiffComputeFactory;

impl StrategyDecoratorFactory for MetricDiffComputeFactory {
    fn decorate(&self, base: Box<dyn Strategy>, config: &Value) -> Result<Box<dyn Strategy>> {
        let config: MetricDiffConfig = typed_config("metricdiffcompute", config)?;
        debug!(report = ?config.report, "decorating strategy with metricdiffcompute");
        Ok(Box::new(Decorated(MetricDiffCompute::new(base, &config))))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TimeDiffConfig {
    pub empty_configuration: bool,
}

impl Default for TimeDiffConfig {
    fn default() -> Self { Self { empty_configuration: true } }
}

/// Logs the wall-clock time between consecutive evaluation aggregations.
pub struct TimeDiffCompute {
    base: Box<dyn Strategy>,
    previous: Option<Instant>,
}

impl TimeDiffCompute {
    pub fn new(base: Box<dyn Strategy>) -> Self { Self { base, previous: None } }

    /// Seconds since the previous call, `None` on the first one.
    fn tick(&mut self) -> Option<f64> {
        let now = Instant::now();
        self.previous.replace(now).map(|p| now.duration_since(p).as_secs_f64())
    }
}

impl StrategyDecorator for TimeDiffCompute {
    fn base_strategy(&mut self) -> &mut dyn Strategy { self.base.as_mut() }

    fn aggregate_evaluate(&mut self, server_round: u64, results: &[(ClientProxy, EvaluateRes)], failures: &[Failure<EvaluateRes>]) -> (Option<f64>, Metrics) {
        let outcome = self.base.aggregate_evaluate(server_round, results, failures);
        match self.tick() {
            Some(elapsed) => {
                info!(round = server_round, seconds = elapsed, "time since previous evaluation");
                ROUND_INTERVAL.record(elapsed, &[]);
            }
            None => info!(round = server_round, "no previous evaluation to time against"),
        }
        outcome
    }
}

pub struct TimeDiffComputeFactory;

impl StrategyDecoratorFactory for TimeDiffComputeFactory {
    fn decorate(&self, base: Box<dyn Strategy>, config: &Value) -> Result<Box<dyn Strategy>> {
        let _: TimeDiffConfig = typed_config("timediffcompute", config)?;
        Ok(Box::new(Decorated(TimeDiffCompute::new(base))))
    }
}

pub fn modules_and_configs() -> anyhow::Result<PluginModule> {
    Ok(PluginModule::new()
        .register(
            "metricdiffcompute",
            Component::StrategyDecorator(Arc::new(MetricDiffComputeFactory)),
            ConfigVariant::<MetricDiffConfig>::new(Category::StrategyDecorator, "metricdiffcompute", "MetricDiffCompute"),
        )
        .register(
            "timediffcompute",
            Component::StrategyDecorator(Arc::new(TimeDiffComputeFactory)),
            ConfigVariant::<TimeDiffConfig>::new(Category::StrategyDecorator, "timediffcompute", "TimeDiffCompute"),
        ))
}
