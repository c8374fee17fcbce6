//! Server-side federated strategies.
//!
//! A strategy decides which clients take part in each round, what they are
//! told, and how their answers are folded into the next global model.

pub mod aggregator;
pub mod decorator;
pub mod fedavg;

use serde_json::Value;

use crate::client_manager::ClientManager;
use crate::config::HardwareConfig;
use crate::error::Result;
use crate::metrics_logger::SharedMetricsLogger;
use crate::parameters::{Parameters, Tensor};
use crate::protocol::{ClientProxy, Config, EvaluateIns, EvaluateRes, Failure, FitIns, FitRes, Metrics, Scalar};

pub use aggregator::FitResultsAggregator;
pub use decorator::{Decorated, StrategyDecorator, StrategyDecoratorFactory};
pub use fedavg::{FedAvg, FedAvgConfig};

pub trait Strategy: Send {
    /// Parameters to start from; `None` lets the server ask a client.
    fn initialize_parameters(&mut self, client_manager: &dyn ClientManager) -> Option<Parameters>;

    fn configure_fit(&mut self, server_round: u64, parameters: &Parameters, client_manager: &dyn ClientManager) -> Vec<(ClientProxy, FitIns)>;

    /// `(None, {})` means no new global model this round.
    fn aggregate_fit(
        &mut self,
        server_round: u64,
        results: &[(ClientProxy, FitRes)],
        failures: &[Failure<FitRes>],
    ) -> Result<(Option<Parameters>, Metrics)>;

    fn configure_evaluate(&mut self, server_round: u64, parameters: &Parameters, client_manager: &dyn ClientManager) -> Vec<(ClientProxy, EvaluateIns)>;

    fn aggregate_evaluate(
        &mut self,
        server_round: u64,
        results: &[(ClientProxy, EvaluateRes)],
        failures: &[Failure<EvaluateRes>],
    ) -> (Option<f64>, Metrics);

    /// Server-side evaluation of the current global parameters.
    fn evaluate(&mut self, server_round: u64, parameters: &Parameters) -> Result<Option<(f64, Metrics)>>;
}

pub type MetricsAggregationFn = Box<dyn Fn(&[(u64, Metrics)]) -> Metrics + Send>;
pub type OnConfigFn = Box<dyn Fn(u64) -> Config + Send>;
pub type EvaluateFn = Box<dyn FnMut(u64, &[Tensor], &Config) -> anyhow::Result<Option<(f64, Metrics)>> + Send>;

/// Round instructions for fitting clients.
pub fn fit_config(server_round: u64, local_epochs: u64) -> Config {
    Config::from([("server_round".to_string(), Scalar::from(server_round)), ("local_epochs".to_string(), Scalar::from(local_epochs))])
}

/// Round instructions for evaluating clients.
pub fn evaluate_config(server_round: u64) -> Config { Config::from([("server_round".to_string(), Scalar::from(server_round))]) }

/// Everything the session hands a strategy factory besides the strategy's own config.
pub struct StrategyContext {
    pub initial_parameters: Option<Parameters>,
    pub evaluate_fn: Option<EvaluateFn>,
    pub aggregator: Box<dyn FitResultsAggregator>,
    pub metrics_logger: SharedMetricsLogger,
    pub hardware: HardwareConfig,
}

pub trait StrategyFactory: Send + Sync {
    fn build(&self, context: StrategyContext, config: &Value) -> Result<Box<dyn Strategy>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_configs() {
        let fit = fit_config(3, 2);
        assert_eq!(fit["server_round"], Scalar::Int(3));
        assert_eq!(fit["local_epochs"], Scalar::Int(2));
        assert_eq!(evaluate_config(4).len(), 1);
    }
}
