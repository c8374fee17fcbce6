use biscus_core::client_manager::SimpleClientManager;
use biscus_core::config::{ClientConfig, ServerConfig};
use biscus_core::registry::{load_plugins, Category, Origin, PluginDeclarations};
use biscus_core::server::{History, LocalTransport, Server};
use biscus_core::session::{build_client, build_server_session};
use biscus_core::{PluginCatalog, PluginRegistry};

const BASE: &str = r#"
server_run: { num_rounds: 3 }
server_strategy:
  strategy: { name: fedavg, config: { local_epochs: 2 } }
  decorators: DECORATORS
data: { name: randomvector, config: { seed: 5 } }
model: { name: linearregression, config: { seed: 2 } }
"#;

fn registry() -> PluginRegistry {
    let dir = std::env::temp_dir();
    let declarations = PluginDeclarations::from_yaml_str(&format!("strategydecorator:\n  - path: {}\n    modules: [basicstrategydecorator]\n", dir.display())).unwrap();
    let mut catalog = PluginCatalog::new();
    biscus_plugins::install(&mut catalog);
    let loaded = load_plugins(&catalog, &declarations);
    assert!(loaded.failures().is_empty());
    PluginRegistry::build(&loaded)
}

fn run(registry: &PluginRegistry, decorators: &str) -> History {
    let config = ServerConfig::from_yaml_str(&BASE.replace("DECORATORS", decorators), registry).unwrap();
    let session = build_server_session(registry, &config).unwrap();
    let manager = SimpleClientManager::with_seed(3);
    let mut transport = LocalTransport::new();
    for cid in 1..=3 {
        let yaml = format!("client_run: {{ cid: {cid} }}\ndata: {{ name: randomvector, config: {{ seed: {} }} }}\nmodel: {{ name: linearregression }}\n", 100 + cid);
        let (proxy, client) = build_client(registry, &ClientConfig::from_yaml_str(&yaml, registry).unwrap()).unwrap();
        manager.register(proxy.clone());
        transport.connect(proxy, client);
    }
    Server::new(session.strategy, Box::new(manager), Box::new(transport)).run(session.num_rounds).unwrap()
}

#[test]
fn plugin_decorators_are_registered() {
    let registry = registry();
    let names: Vec<_> = registry.strategy_decorator.names().collect();
    assert_eq!(names, vec!["metricdiffcompute", "timediffcompute"]);
    assert!(registry.listing().iter().filter(|c| c.category == Category::StrategyDecorator).all(|c| c.origin == Origin::Plugin));
}

#[test]
fn transparent_decorators_leave_the_session_unchanged() {
    let registry = registry();
    let plain = run(&registry, "[]");
    let decorated = run(&registry, "[{ name: timediffcompute }, { name: metricdiffcompute, config: { report: current } }]");

    assert_eq!(plain.losses_distributed, decorated.losses_distributed);
    assert_eq!(plain.losses_centralized, decorated.losses_centralized);
    assert_eq!(plain.metrics_distributed, decorated.metrics_distributed);
    assert_eq!(plain.losses_distributed.len(), 3);
}

#[test]
fn metric_diff_lags_one_round_by_default() {
    let registry = registry();
    let plain = run(&registry, "[]");
    let lagged = run(&registry, "[{ name: metricdiffcompute }]");

    let expected: Vec<(u64, f64)> = plain.losses_distributed.windows(2).map(|w| (w[1].0, w[0].1)).collect();
    assert_eq!(lagged.losses_distributed, expected);
}

#[test]
fn unknown_decorator_config_fails_with_a_path() {
    let registry = registry();
    let yaml = BASE.replace("DECORATORS", "[{ name: metricdiffcompute, config: { report: sometimes } }]");
    let err = ServerConfig::from_yaml_str(&yaml, &registry).unwrap_err();
    assert_eq!(err.path, "server_strategy.decorators[0].config");
    assert_eq!(err.candidate.as_deref(), Some("metricdiffcompute"));
}
