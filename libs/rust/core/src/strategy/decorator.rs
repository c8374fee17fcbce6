//! Strategy decorators wrap a base strategy and override a subset of its
//! operations; everything else forwards to the base unchanged.

use std::sync::Arc;

use serde_json::Value;

use crate::client_manager::ClientManager;
use crate::error::Result;
use crate::parameters::Parameters;
use crate::protocol::{ClientProxy, EvaluateIns, EvaluateRes, Failure, FitIns, FitRes, Metrics};

use super::Strategy;

/// Implement `base_strategy` plus whichever operations you want to change,
/// then wrap the value in [`Decorated`] to get a `Strategy`.
pub trait StrategyDecorator: Send {
    fn base_strategy(&mut self) -> &mut dyn Strategy;

    fn initialize_parameters(&mut self, client_manager: &dyn ClientManager) -> Option<Parameters> {
        self.base_strategy().initialize_parameters(client_manager)
    }

    fn configure_fit(&mut self, server_round: u64, parameters: &Parameters, client_manager: &dyn ClientManager) -> Vec<(ClientProxy, FitIns)> {
        self.base_strategy().configure_fit(server_round, parameters, client_manager)
    }

    fn aggregate_fit(&mut self, server_round: u64, results: &[(ClientProxy, FitRes)], failures: &[Failure<FitRes>]) -> Result<(Option<Parameters>, Metrics)> {
        self.base_strategy().aggregate_fit(server_round, results, failures)
    }

    fn configure_evaluate(&mut self, server_round: u64, parameters: &Parameters, client_manager: &dyn ClientManager) -> Vec<(ClientProxy, EvaluateIns)> {
        self.base_strategy().configure_evaluate(server_round, parameters, client_manager)
    }

    fn aggregate_evaluate(&mut self, server_round: u64, results: &[(ClientProxy, EvaluateRes)], failures: &[Failure<EvaluateRes>]) -> (Option<f64>, Metrics) {
        self.base_strategy().aggregate_evaluate(server_round, results, failures)
    }

    fn evaluate(&mut self, server_round: u64, parameters: &Parameters) -> Result<Option<(f64, Metrics)>> {
        self.base_strategy().evaluate(server_round, parameters)
    }
}

pub struct Decorated<D>(pub D);

impl<D: StrategyDecorator> Strategy for Decorated<D> {
    fn initialize_parameters(&mut self, client_manager: &dyn ClientManager) -> Option<Parameters> {
        StrategyDecorator::initialize_parameters(&mut self.0, client_manager)
    }

    fn configure_fit(&mut self, server_round: u64, parameters: &Parameters, client_manager: &dyn ClientManager) -> Vec<(ClientProxy, FitIns)> {
        StrategyDecorator::configure_fit(&mut self.0, server_round, parameters, client_manager)
    }

    fn aggregate_fit(&mut self, server_round: u64, results: &[(ClientProxy, FitRes)], failures: &[Failure<FitRes>]) -> Result<(Option<Parameters>, Metrics)> {
        StrategyDecorator::aggregate_fit(&mut self.0, server_round, results, failures)
    }

    fn configure_evaluate(&mut self, server_round: u64, parameters: &Parameters, client_manager: &dyn ClientManager) -> Vec<(ClientProxy, EvaluateIns)> {
        StrategyDecorator::configure_evaluate(&mut self.0, server_round, parameters, client_manager)
    }

    fn aggregate_evaluate(&mut self, server_round: u64, results: &[(ClientProxy, EvaluateRes)], failures: &[Failure<EvaluateRes>]) -> (Option<f64>, Metrics) {
        StrategyDecorator::aggregate_evaluate(&mut self.0, server_round, results, failures)
    }

    fn evaluate(&mut self, server_round: u64, parameters: &Parameters) -> Result<Option<(f64, Metrics)>> {
        StrategyDecorator::evaluate(&mut self.0, server_round, parameters)
    }
}

pub trait StrategyDecoratorFactory: Send + Sync {
    fn decorate(&self, base: Box<dyn Strategy>, config: &Value) -> Result<Box<dyn Strategy>>;
}

/// Wraps `base` with each decorator in order; the last one ends up outermost.
pub fn apply_decorators(base: Box<dyn Strategy>, chain: &[(Arc<dyn StrategyDecoratorFactory>, Value)]) -> Result<Box<dyn Strategy>> {
    chain.iter().try_fold(base, |strategy, (factory, config)| factory.decorate(strategy, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_manager::SimpleClientManager;
    use crate::parameters::{ndarrays_to_parameters, parameters_to_ndarrays, Tensor};
    use crate::protocol::Scalar;
    use crate::strategy::{fit_config, FedAvg, FedAvgConfig};

    /// Tags evaluation metrics with its label; leaves everything else alone.
    struct Tag {
        base: Box<dyn Strategy>,
        label: &'static str,
    }

    impl StrategyDecorator for Tag {
        fn base_strategy(&mut self) -> &mut dyn Strategy { self.base.as_mut() }

        fn aggregate_evaluate(&mut self, server_round: u64, results: &[(ClientProxy, EvaluateRes)], failures: &[Failure<EvaluateRes>]) -> (Option<f64>, Metrics) {
            let (loss, mut metrics) = self.base.aggregate_evaluate(server_round, results, failures);
            let order = metrics.get("order").map(|v| v.to_string()).unwrap_or_default();
            metrics.insert("order".into(), Scalar::from(format!("{order}{}", self.label)));
            (loss, metrics)
        }
    }

    struct TagFactory(&'static str);

    impl StrategyDecoratorFactory for TagFactory {
        fn decorate(&self, base: Box<dyn Strategy>, _config: &Value) -> Result<Box<dyn Strategy>> {
            Ok(Box::new(Decorated(Tag { base, label: self.0 })))
        }
    }

    fn fedavg() -> Box<dyn Strategy> {
        Box::new(
            FedAvg::new(FedAvgConfig::default())
                .with_initial_parameters(ndarrays_to_parameters(&[Tensor::scalar(0.5)]))
                .with_on_fit_config_fn(Box::new(|r| fit_config(r, 1))),
        )
    }

    fn clients() -> SimpleClientManager {
        let cm = SimpleClientManager::with_seed(11);
        for cid in ["a", "b", "c", "d"] { cm.register(ClientProxy::new(cid)); }
        cm
    }

    fn fit_results() -> Vec<(ClientProxy, FitRes)> {
        [("a", 4, 1.0), ("b", 12, 3.0)]
            .into_iter()
            .map(|(cid, n, v)| (ClientProxy::new(cid), FitRes { parameters: ndarrays_to_parameters(&[Tensor::from_vec(vec![v])]), num_examples: n, metrics: Metrics::new() }))
            .collect()
    }

    #[test]
    fn non_overridden_methods_are_transparent() {
        let mut plain = fedavg();
        let mut wrapped: Box<dyn Strategy> = Box::new(Decorated(Tag { base: fedavg(), label: "x" }));
        let (cm1, cm2) = (clients(), clients());

        let p1 = plain.initialize_parameters(&cm1).unwrap();
        let p2 = wrapped.initialize_parameters(&cm2).unwrap();
        assert_eq!(p1, p2);
        assert_eq!(plain.configure_fit(1, &p1, &cm1), wrapped.configure_fit(1, &p2, &cm2));
        assert_eq!(plain.configure_evaluate(1, &p1, &cm1), wrapped.configure_evaluate(1, &p2, &cm2));

        let (a1, m1) = plain.aggregate_fit(1, &fit_results(), &[]).unwrap();
        let (a2, m2) = wrapped.aggregate_fit(1, &fit_results(), &[]).unwrap();
        assert_eq!(a1, a2);
        assert_eq!(m1, m2);
        assert_eq!(parameters_to_ndarrays(&a1.unwrap()).unwrap()[0].data(), &[2.5]);
    }

    #[test]
    fn chain_applies_in_order() {
        let chain: Vec<(Arc<dyn StrategyDecoratorFactory>, Value)> =
            vec![(Arc::new(TagFactory("1")), Value::Null), (Arc::new(TagFactory("2")), Value::Null)];
        let mut strategy = apply_decorators(fedavg(), &chain).unwrap();
        let results = vec![(ClientProxy::new("a"), EvaluateRes { loss: 1.0, num_examples: 1, metrics: Metrics::new() })];
        let (loss, metrics) = strategy.aggregate_evaluate(1, &results, &[]);
        assert_eq!(loss, Some(1.0));
        // Innermost runs first, so the first declared tags first.
        assert_eq!(metrics["order"], Scalar::from("12"));
    }
}
