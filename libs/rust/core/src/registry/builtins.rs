//! Modules shipped with the core crate, listed per category.

use crate::{client, metrics_logger, ml, strategy, telemetry};

use super::{Category, ModuleSource};

pub fn modules(category: Category) -> Vec<ModuleSource> {
    match category {
        Category::Data => vec![ModuleSource::core("biscus.ml.randomvector", ml::randomvector::modules_and_configs)],
        Category::Model => vec![ModuleSource::core("biscus.ml.linear", ml::linear::modules_and_configs)],
        Category::Strategy => vec![ModuleSource::core("biscus.strategy.fedavg", strategy::fedavg::modules_and_configs)],
        Category::StrategyDecorator => Vec::new(),
        Category::Logger => vec![ModuleSource::core("biscus.telemetry", telemetry::modules_and_configs)],
        Category::MetricsLogger => vec![ModuleSource::core("biscus.metrics_logger", metrics_logger::modules_and_configs)],
        Category::Client => vec![ModuleSource::core("biscus.client", client::modules_and_configs)],
        Category::FitResultsAggregator => vec![
            ModuleSource::core("biscus.strategy.aggregator.weightedaverage", strategy::aggregator::weighted_average_module),
            ModuleSource::core("biscus.strategy.aggregator.average", strategy::aggregator::average_module),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Origin, PluginRegistry};

    #[test]
    fn builtin_registry_is_complete() {
        let registry = PluginRegistry::builtin();
        for category in Category::ALL {
            let union = registry.union(category);
            if category == Category::StrategyDecorator {
                assert!(union.is_none());
            } else {
                assert!(union.is_some(), "{category} has no variants");
            }
        }
        assert_eq!(registry.fit_results_aggregator.names().collect::<Vec<_>>(), vec!["average", "weightedaverage"]);
        assert!(registry.listing().iter().all(|c| c.origin == Origin::Core));
    }
}
