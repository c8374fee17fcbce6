use std::fs;
use std::path::Path;

use biscus_core::config::ServerConfig;
use biscus_core::session::{build_server_session, logger_layers, save_parameters};
use biscus_core::{ndarrays_to_parameters, parameters_to_ndarrays, Parameters, PluginRegistry, Tensor};

const MINIMAL: &str = r#"
server_run: {}
server_strategy:
  strategy: { name: fedavg }
data: { name: randomvector }
model: { name: linearregression, config: { input_dim: 3, output_dim: 3 } }
"#;

#[test]
fn defaults_fill_in_the_session() {
    let registry = PluginRegistry::builtin();
    let config = ServerConfig::from_yaml_str(MINIMAL, &registry).unwrap();
    assert_eq!(config.server_run.num_rounds, 10);
    assert!(config.server_compute_context.metrics_loggers.is_empty());
    assert_eq!(config.server_strategy.fit_results_aggregator.name, "weightedaverage");

    let session = build_server_session(&registry, &config).unwrap();
    assert_eq!(session.num_rounds, 10);
    assert_eq!(logger_layers(&registry, &config.server_run.loggers).unwrap().len(), 1);
}

#[test]
fn several_metrics_loggers_share_one_session() {
    let registry = PluginRegistry::builtin();
    let yaml = format!("{MINIMAL}server_compute_context:\n  metrics_loggers: [{{ name: tracing }}, {{ name: \"null\" }}]\n");
    let config = ServerConfig::from_yaml_str(&yaml, &registry).unwrap();
    assert_eq!(config.server_compute_context.metrics_loggers.len(), 2);
    let session = build_server_session(&registry, &config).unwrap();
    session.metrics_logger.lock().log_metrics(&Default::default(), Some(1));
}

#[test]
fn decorators_need_a_registered_decorator() {
    let registry = PluginRegistry::builtin();
    let yaml = format!("{MINIMAL}\n").replace("  strategy: { name: fedavg }", "  strategy: { name: fedavg }\n  decorators:\n    - name: basicstrategydecorator");
    let err = ServerConfig::from_yaml_str(&yaml, &registry).unwrap_err();
    assert!(err.to_string().contains("server_strategy.decorators"), "{err}");
}

#[test]
fn final_parameters_round_trip_through_disk() {
    let root = std::env::temp_dir().join(format!("biscus-save-{}", uuid::Uuid::new_v4()));
    let parameters: Parameters = ndarrays_to_parameters(&[Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap(), Tensor::from_vec(vec![0.5, -0.5])]);

    let path = save_parameters(&root, Path::new("weights/final.json"), &parameters).unwrap();
    assert!(path.starts_with(&root));

    let restored: Parameters = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    let arrays = parameters_to_ndarrays(&restored).unwrap();
    assert_eq!(arrays[0].shape(), &[2, 2]);
    assert_eq!(arrays[1].data(), &[0.5, -0.5]);
    fs::remove_dir_all(&root).unwrap();
}
