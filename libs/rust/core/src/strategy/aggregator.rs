//! Fit-results aggregators: turn a round's client parameters into one
//! consensus parameter set.

use std::time::Instant;

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::aggregate::{aggregate_unweighted, aggregate_weighted, WeightedTensors};
use crate::error::Result;
use crate::metrics_ext::FEDERATION_METRICS;
use crate::parameters::{ndarrays_to_parameters, parameters_to_ndarrays, Parameters};
use crate::protocol::{client_marker, ClientProxy, Failure, FitRes};
use crate::registry::{typed_config, Category, Component, ConfigVariant, PluginModule};

pub trait FitResultsAggregator: Send {
    /// Only called with a non-empty `results`.
    fn aggregate(&self, server_round: u64, results: &[(ClientProxy, FitRes)], failures: &[Failure<FitRes>]) -> Result<Parameters>;
}

pub trait FitResultsAggregatorFactory: Send + Sync {
    fn build(&self, config: &Value) -> Result<Box<dyn FitResultsAggregator>>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AggregatorConfig {}

fn decode(results: &[(ClientProxy, FitRes)]) -> Result<Vec<WeightedTensors>> {
    results
        .iter()
        .map(|(client, res)| {
            Ok(WeightedTensors { cid: client_marker(client, &res.metrics), tensors: parameters_to_ndarrays(&res.parameters)?, weight: res.num_examples })
        })
        .collect()
}

fn contributions(updates: &[WeightedTensors]) -> String {
    updates.iter().map(|u| format!("{}:{}", u.cid, u.weight)).collect::<Vec<_>>().join(" ")
}

/// Mean of client parameters weighted by their example counts.
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightedAverage;

impl FitResultsAggregator for WeightedAverage {
    fn aggregate(&self, server_round: u64, results: &[(ClientProxy, FitRes)], _failures: &[Failure<FitRes>]) -> Result<Parameters> {
        let started = Instant::now();
        let updates = decode(results)?;
        info!(round = server_round, clients = %contributions(&updates), "weighted average of fit results");
        let out = aggregate_weighted(&updates)?;
        FEDERATION_METRICS.aggregation_latency_ms.record(started.elapsed().as_secs_f64() * 1000.0, &[KeyValue::new("aggregator", "weightedaverage")]);
        Ok(ndarrays_to_parameters(&out))
    }
}

/// Plain mean of client parameters.
#[derive(Debug, Default, Clone, Copy)]
pub struct Average;

impl FitResultsAggregator for Average {
    fn aggregate(&self, server_round: u64, results: &[(ClientProxy, FitRes)], _failures: &[Failure<FitRes>]) -> Result<Parameters> {
        let started = Instant::now();
        let updates = decode(results)?;
        info!(round = server_round, clients = %contributions(&updates), "unweighted average of fit results");
        let out = aggregate_unweighted(&updates)?;
        FEDERATION_METRICS.aggregation_latency_ms.record(started.elapsed().as_secs_f64() * 1000.0, &[KeyValue::new("aggregator", "average")]);
        Ok(ndarrays_to_parameters(&out))
    }
}

pub struct WeightedAverageFactory;

impl FitResultsAggregatorFactory for WeightedAverageFactory {
    fn build(&self, config: &Value) -> Result<Box<dyn FitResultsAggregator>> {
        let _: AggregatorConfig = typed_config("weightedaverage", config)?;
        Ok(Box::new(WeightedAverage))
    }
}

pub struct AverageFactory;

impl FitResultsAggregatorFactory for AverageFactory {
    fn build(&self, config: &Value) -> Result<Box<dyn FitResultsAggregator>> {
        let _: AggregatorConfig = typed_config("average", config)?;
        Ok(Box::new(Average))
    }
}

pub fn weighted_average_module() -> anyhow::Result<PluginModule> {
    Ok(PluginModule::new().register(
        "weightedaverage",
        Component::FitResultsAggregator(std::sync::Arc::new(WeightedAverageFactory)),
        ConfigVariant::<AggregatorConfig>::new(Category::FitResultsAggregator, "weightedaverage", "Weighted average"),
    ))
}

pub fn average_module() -> anyhow::Result<PluginModule> {
    Ok(PluginModule::new().register(
        "average",
        Component::FitResultsAggregator(std::sync::Arc::new(AverageFactory)),
        ConfigVariant::<AggregatorConfig>::new(Category::FitResultsAggregator, "average", "Average"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::parameters::Tensor;
    use crate::protocol::Metrics;

    fn res(cid: &str, n: u64, v: f32) -> (ClientProxy, FitRes) {
        (ClientProxy::new(cid), FitRes { parameters: ndarrays_to_parameters(&[Tensor::from_vec(vec![v, 2.0 * v])]), num_examples: n, metrics: Metrics::new() })
    }

    fn first(p: &Parameters) -> Vec<f32> { parameters_to_ndarrays(p).unwrap()[0].data().to_vec() }

    #[test]
    fn weighted_and_unweighted() {
        let results = [res("a", 10, 2.0), res("b", 30, 6.0)];
        assert_eq!(first(&WeightedAverage.aggregate(1, &results, &[]).unwrap()), vec![5.0, 10.0]);
        assert_eq!(first(&Average.aggregate(1, &results, &[]).unwrap()), vec![4.0, 8.0]);
    }

    #[test]
    fn order_does_not_matter() {
        let forward = [res("a", 3, 0.1), res("b", 7, 0.7), res("c", 11, -0.3)];
        let mut backward = forward.clone();
        backward.reverse();
        for agg in [&WeightedAverage as &dyn FitResultsAggregator, &Average] {
            let x = first(&agg.aggregate(1, &forward, &[]).unwrap());
            let y = first(&agg.aggregate(1, &backward, &[]).unwrap());
            for (a, b) in x.iter().zip(&y) { assert!((a - b).abs() < 1e-6); }
        }
    }

    #[test]
    fn corrupt_parameters_are_codec_errors() {
        let mut bad = res("a", 1, 1.0);
        bad.1.parameters.tensors[0].truncate(3);
        assert!(matches!(WeightedAverage.aggregate(1, &[bad], &[]), Err(Error::Codec(_))));
    }

    #[test]
    fn factory_rejects_unknown_fields() {
        assert!(WeightedAverageFactory.build(&serde_json::json!({})).is_ok());
        assert!(AverageFactory.build(&serde_json::json!({"x": 1})).is_err());
    }
}
