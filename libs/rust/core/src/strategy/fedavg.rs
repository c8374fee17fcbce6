//! Federated averaging.

use std::sync::Arc;

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::aggregate::{weighted_average, weighted_loss_avg};
use crate::client_manager::ClientManager;
use crate::error::{Error, Result};
use crate::metrics_ext::FEDERATION_METRICS;
use crate::metrics_logger::{shared, NullMetricsLogger, SharedMetricsLogger};
use crate::parameters::{parameters_to_ndarrays, Parameters};
use crate::protocol::{client_marker, ClientProxy, Config, EvaluateIns, EvaluateRes, Failure, FitIns, FitRes, Metrics, CID_KEY};
use crate::registry::{typed_config, Category, Component, ConfigVariant, PluginModule};

use super::aggregator::{FitResultsAggregator, WeightedAverage};
use super::{evaluate_config, fit_config, EvaluateFn, MetricsAggregationFn, OnConfigFn, Strategy, StrategyContext, StrategyFactory};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FedAvgConfig {
    pub fraction_fit: f64,
    pub fraction_evaluate: f64,
    pub min_fit_clients: usize,
    pub min_evaluate_clients: usize,
    pub min_available_clients: usize,
    pub accept_failures: bool,
    pub local_epochs: u64,
}

impl Default for FedAvgConfig {
    fn default() -> Self {
        Self {
            fraction_fit: 1.0,
            fraction_evaluate: 1.0,
            min_fit_clients: 2,
            min_evaluate_clients: 2,
            min_available_clients: 2,
            accept_failures: true,
            local_epochs: 1,
        }
    }
}

impl FedAvgConfig {
    pub fn check(&self) -> std::result::Result<(), String> {
        for (field, v) in [("fraction_fit", self.fraction_fit), ("fraction_evaluate", self.fraction_evaluate)] {
            if !(0.0..=1.0).contains(&v) { return Err(format!("`{field}` must be within [0, 1], got {v}")); }
        }
        if self.local_epochs == 0 { return Err("`local_epochs` must be at least 1".into()); }
        Ok(())
    }
}

pub struct FedAvg {
    config: FedAvgConfig,
    initial_parameters: Option<Parameters>,
    evaluate_fn: Option<EvaluateFn>,
    on_fit_config_fn: Option<OnConfigFn>,
    on_evaluate_config_fn: Option<OnConfigFn>,
    fit_metrics_aggregation_fn: Option<MetricsAggregationFn>,
    evaluate_metrics_aggregation_fn: Option<MetricsAggregationFn>,
    aggregator: Box<dyn FitResultsAggregator>,
    metrics_logger: SharedMetricsLogger,
}

impl FedAvg {
    pub fn new(config: FedAvgConfig) -> Self {
        if config.min_available_clients < config.min_fit_clients || config.min_available_clients < config.min_evaluate_clients {
            warn!(
                min_available_clients = config.min_available_clients,
                min_fit_clients = config.min_fit_clients,
                min_evaluate_clients = config.min_evaluate_clients,
                "min_available_clients is lower than min_fit_clients or min_evaluate_clients"
            );
        }
        Self {
            config,
            initial_parameters: None,
            evaluate_fn: None,
            on_fit_config_fn: None,
            on_evaluate_config_fn: None,
            fit_metrics_aggregation_fn: None,
            evaluate_metrics_aggregation_fn: None,
            aggregator: Box::new(WeightedAverage),
            metrics_logger: shared(Box::new(NullMetricsLogger)),
        }
    }

    pub fn config(&self) -> &FedAvgConfig { &self.config }

    pub fn with_initial_parameters(mut self, parameters: Parameters) -> Self { self.initial_parameters = Some(parameters); self }
    pub fn with_evaluate_fn(mut self, f: EvaluateFn) -> Self { self.evaluate_fn = Some(f); self }
    pub fn with_on_fit_config_fn(mut self, f: OnConfigFn) -> Self { self.on_fit_config_fn = Some(f); self }
    pub fn with_on_evaluate_config_fn(mut self, f: OnConfigFn) -> Self { self.on_evaluate_config_fn = Some(f); self }
    pub fn with_fit_metrics_aggregation_fn(mut self, f: MetricsAggregationFn) -> Self { self.fit_metrics_aggregation_fn = Some(f); self }
    pub fn with_evaluate_metrics_aggregation_fn(mut self, f: MetricsAggregationFn) -> Self { self.evaluate_metrics_aggregation_fn = Some(f); self }
    pub fn with_aggregator(mut self, aggregator: Box<dyn FitResultsAggregator>) -> Self { self.aggregator = aggregator; self }
    pub fn with_metrics_logger(mut self, logger: SharedMetricsLogger) -> Self { self.metrics_logger = logger; self }

    /// `(sample size, minimum connected clients)` for a fit round.
    pub fn num_fit_clients(&self, num_available: usize) -> (usize, usize) {
        let n = (num_available as f64 * self.config.fraction_fit) as usize;
        (n.max(self.config.min_fit_clients), self.config.min_available_clients)
    }

    pub fn num_evaluation_clients(&self, num_available: usize) -> (usize, usize) {
        let n = (num_available as f64 * self.config.fraction_evaluate) as usize;
        (n.max(self.config.min_evaluate_clients), self.config.min_available_clients)
    }

    fn log_client_metrics<'a>(&self, prefix: &str, server_round: u64, results: impl Iterator<Item = (&'a ClientProxy, &'a Metrics)>) {
        let mut logger = self.metrics_logger.lock();
        for (client, metrics) in results {
            let marker = client_marker(client, metrics);
            let per_client: Metrics =
                metrics.iter().filter(|(k, _)| k.as_str() != CID_KEY).map(|(k, v)| (format!("{prefix}_{k}_{marker}"), v.clone())).collect();
            if !per_client.is_empty() { logger.log_metrics(&per_client, Some(server_round)); }
        }
    }
}

impl Strategy for FedAvg {
    fn initialize_parameters(&mut self, _client_manager: &dyn ClientManager) -> Option<Parameters> {
        // Handed out once so a large model is not kept twice.
        self.initial_parameters.take()
    }

    fn configure_fit(&mut self, server_round: u64, parameters: &Parameters, client_manager: &dyn ClientManager) -> Vec<(ClientProxy, FitIns)> {
        if self.config.fraction_fit == 0.0 { return Vec::new(); }
        let config = self.on_fit_config_fn.as_ref().map(|f| f(server_round)).unwrap_or_default();
        let (sample_size, min_num_clients) = self.num_fit_clients(client_manager.num_available());
        let clients = client_manager.sample(sample_size, min_num_clients);
        debug!(round = server_round, sampled = clients.len(), "configure_fit");
        let ins = FitIns { parameters: parameters.clone(), config };
        clients.into_iter().map(|c| (c, ins.clone())).collect()
    }

    fn aggregate_fit(&mut self, server_round: u64, results: &[(ClientProxy, FitRes)], failures: &[Failure<FitRes>]) -> Result<(Option<Parameters>, Metrics)> {
        let round_attr = [KeyValue::new("phase", "fit")];
        FEDERATION_METRICS.client_results.add(results.len() as u64, &round_attr);
        FEDERATION_METRICS.client_failures.add(failures.len() as u64, &round_attr);
        if results.is_empty() {
            debug!(round = server_round, "no fit results to aggregate");
            return Ok((None, Metrics::new()));
        }
        if !self.config.accept_failures && !failures.is_empty() {
            warn!(round = server_round, failures = failures.len(), "fit round rejected: failures are not accepted");
            FEDERATION_METRICS.rounds_rejected.add(1, &round_attr);
            return Ok((None, Metrics::new()));
        }

        let parameters = match self.aggregator.aggregate(server_round, results, failures) {
            Ok(p) => p,
            Err(Error::ZeroWeight) => {
                warn!(round = server_round, results = results.len(), "fit round rejected: clients reported no training examples");
                FEDERATION_METRICS.rounds_rejected.add(1, &round_attr);
                return Ok((None, Metrics::new()));
            }
            Err(e) => return Err(e),
        };
        FEDERATION_METRICS.rounds_aggregated.add(1, &round_attr);

        let mut metrics = Metrics::new();
        if let Some(aggregate) = &self.fit_metrics_aggregation_fn {
            self.log_client_metrics("fit", server_round, results.iter().map(|(c, r)| (c, &r.metrics)));
            let fit_metrics: Vec<(u64, Metrics)> = results.iter().map(|(_, r)| (r.num_examples, r.metrics.clone())).collect();
            metrics = aggregate(&fit_metrics);
        } else if server_round == 1 {
            warn!("no fit_metrics_aggregation_fn provided");
        }
        Ok((Some(parameters), metrics))
    }

    fn configure_evaluate(&mut self, server_round: u64, parameters: &Parameters, client_manager: &dyn ClientManager) -> Vec<(ClientProxy, EvaluateIns)> {
        if self.config.fraction_evaluate == 0.0 { return Vec::new(); }
        let config = self.on_evaluate_config_fn.as_ref().map(|f| f(server_round)).unwrap_or_default();
        let (sample_size, min_num_clients) = self.num_evaluation_clients(client_manager.num_available());
        let clients = client_manager.sample(sample_size, min_num_clients);
        debug!(round = server_round, sampled = clients.len(), "configure_evaluate");
        let ins = EvaluateIns { parameters: parameters.clone(), config };
        clients.into_iter().map(|c| (c, ins.clone())).collect()
    }

    fn aggregate_evaluate(&mut self, server_round: u64, results: &[(ClientProxy, EvaluateRes)], failures: &[Failure<EvaluateRes>]) -> (Option<f64>, Metrics) {
        let round_attr = [KeyValue::new("phase", "evaluate")];
        FEDERATION_METRICS.client_results.add(results.len() as u64, &round_attr);
        FEDERATION_METRICS.client_failures.add(failures.len() as u64, &round_attr);
        if results.is_empty() {
            debug!(round = server_round, "no evaluation results to aggregate");
            return (None, Metrics::new());
        }
        if !self.config.accept_failures && !failures.is_empty() {
            warn!(round = server_round, failures = failures.len(), "evaluation round rejected: failures are not accepted");
            FEDERATION_METRICS.rounds_rejected.add(1, &round_attr);
            return (None, Metrics::new());
        }

        let losses: Vec<(u64, f64)> = results.iter().map(|(_, r)| (r.num_examples, r.loss)).collect();
        let loss = weighted_loss_avg(&losses);

        let mut metrics = Metrics::new();
        if let Some(aggregate) = &self.evaluate_metrics_aggregation_fn {
            self.log_client_metrics("val", server_round, results.iter().map(|(c, r)| (c, &r.metrics)));
            let eval_metrics: Vec<(u64, Metrics)> = results.iter().map(|(_, r)| (r.num_examples, r.metrics.clone())).collect();
            metrics = aggregate(&eval_metrics);
        } else if server_round == 1 {
            warn!("no evaluate_metrics_aggregation_fn provided");
        }
        (loss, metrics)
    }

    fn evaluate(&mut self, server_round: u64, parameters: &Parameters) -> Result<Option<(f64, Metrics)>> {
        let Some(evaluate) = self.evaluate_fn.as_mut() else { return Ok(None) };
        let arrays = parameters_to_ndarrays(parameters)?;
        let Some((loss, metrics)) = evaluate(server_round, &arrays, &Config::new())? else { return Ok(None) };

        let global: Metrics = metrics.iter().map(|(k, v)| (format!("val_{k}_glob"), v.clone())).collect();
        if !global.is_empty() { self.metrics_logger.lock().log_metrics(&global, Some(server_round)); }
        info!(round = server_round, loss, "server-side evaluation");
        Ok(Some((loss, metrics)))
    }
}

/// Builds a `FedAvg` wired to the session: default metric averaging, round
/// configs carrying `local_epochs`, the configured aggregator and logger.
pub struct FedAvgFactory;

impl StrategyFactory for FedAvgFactory {
    fn build(&self, context: StrategyContext, config: &Value) -> Result<Box<dyn Strategy>> {
        let config: FedAvgConfig = typed_config("fedavg", config)?;
        let local_epochs = config.local_epochs;
        debug!(hardware = ?context.hardware, "building fedavg strategy");
        let mut strategy = FedAvg::new(config)
            .with_aggregator(context.aggregator)
            .with_metrics_logger(context.metrics_logger)
            .with_on_fit_config_fn(Box::new(move |round| fit_config(round, local_epochs)))
            .with_on_evaluate_config_fn(Box::new(evaluate_config))
            .with_fit_metrics_aggregation_fn(Box::new(weighted_average))
            .with_evaluate_metrics_aggregation_fn(Box::new(weighted_average));
        if let Some(p) = context.initial_parameters { strategy = strategy.with_initial_parameters(p); }
        if let Some(f) = context.evaluate_fn { strategy = strategy.with_evaluate_fn(f); }
        Ok(Box::new(strategy))
    }
}

pub fn modules_and_configs() -> anyhow::Result<PluginModule> {
    Ok(PluginModule::new().register(
        "fedavg",
        Component::Strategy(Arc::new(FedAvgFactory)),
        ConfigVariant::<FedAvgConfig>::new(Category::Strategy, "fedavg", "Federated averaging").with_check(FedAvgConfig::check),
    ))
}
