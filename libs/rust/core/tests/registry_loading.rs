use std::collections::BTreeMap;
use std::sync::Arc;

use biscus_core::registry::{
    load_plugins, Category, Component, ConfigVariant, ModuleSource, Origin, PluginCatalog, PluginDeclarations, PluginModule, PluginRegistry,
};
use biscus_core::strategy::aggregator::{AggregatorConfig, AverageFactory, WeightedAverageFactory};
use biscus_core::strategy::fedavg::{FedAvgConfig, FedAvgFactory};
use serde_json::json;

fn mixed_strategy_module() -> anyhow::Result<PluginModule> {
    Ok(PluginModule::new()
        .register("fedavg2", Component::Strategy(Arc::new(FedAvgFactory)), ConfigVariant::<FedAvgConfig>::new(Category::Strategy, "fedavg2", "Second fedavg"))
        .register(
            "sneaky",
            Component::FitResultsAggregator(Arc::new(AverageFactory)),
            ConfigVariant::<AggregatorConfig>::new(Category::Strategy, "sneaky", "Aggregator posing as a strategy"),
        ))
}

fn aggregator_override() -> anyhow::Result<PluginModule> {
    Ok(PluginModule::new().register(
        "average",
        Component::FitResultsAggregator(Arc::new(WeightedAverageFactory)),
        ConfigVariant::<AggregatorConfig>::new(Category::FitResultsAggregator, "average", "Plugin average"),
    ))
}

fn failing_module() -> anyhow::Result<PluginModule> { anyhow::bail!("missing native library") }

#[test]
fn wrong_interface_pairs_are_rejected_whole() {
    let sources = BTreeMap::from([(Category::Strategy, vec![ModuleSource::plugin("mixed", mixed_strategy_module)])]);
    let registry = PluginRegistry::from_sources(&sources);

    assert_eq!(registry.strategy.names().collect::<Vec<_>>(), vec!["fedavg2"]);
    let union = registry.union(Category::Strategy).unwrap();
    assert_eq!(union.names().collect::<Vec<_>>(), vec!["fedavg2"]);
    assert!(union.validate("server_strategy.strategy", &json!({"name": "sneaky"})).is_err());
    assert!(registry.fit_results_aggregator.is_empty());
}

#[test]
fn plugins_extend_and_override_builtins() {
    let tmp = std::env::temp_dir();
    let yaml = format!(
        "flowerfitresultsaggregator:\n  - path: {}\n    modules: [override, broken, absent]\n  - path: /no/such/dir\n    modules: [override]\n",
        tmp.display()
    );
    let declarations = PluginDeclarations::from_yaml_str(&yaml).unwrap();
    let mut catalog = PluginCatalog::new();
    catalog.provide("override", aggregator_override).provide("broken", failing_module);

    let loaded = load_plugins(&catalog, &declarations);
    assert_eq!(loaded.by_category()[&Category::FitResultsAggregator], vec!["override", "broken"]);
    let failed: Vec<_> = loaded.failures().iter().map(|f| (f.module.as_str(), f.path.is_some())).collect();
    assert_eq!(failed, vec![("absent", true), ("override", true)]);
    assert_eq!(loaded.search_path(), &[tmp]);

    let registry = PluginRegistry::build(&loaded);
    let average = registry.fit_results_aggregator.entry("average").unwrap();
    assert_eq!(average.origin, Origin::Plugin);
    assert_eq!(average.module, "override");
    assert_eq!(registry.fit_results_aggregator.entry("weightedaverage").unwrap().origin, Origin::Core);
    assert_eq!(registry.model.names().collect::<Vec<_>>(), vec!["linearregression"]);
}

#[test]
fn no_declarations_means_builtins_only() {
    let loaded = load_plugins(&PluginCatalog::new(), &PluginDeclarations::default());
    assert!(loaded.is_empty());
    let registry = PluginRegistry::build(&loaded);
    assert!(registry.strategy_decorator.is_empty());
    assert!(registry.listing().iter().all(|c| c.origin == Origin::Core));
}
