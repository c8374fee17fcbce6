//! Runs the `biscus` binary against the sample configs.

use std::path::Path;
use std::process::{Command, Output};

fn biscus(args: &[&str], envs: &[(&str, &str)]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_biscus"));
    cmd.current_dir(env!("CARGO_MANIFEST_DIR")).env("PYBISCUS_PLUGIN_CONF_PATH", "configs/pybiscus-plugins-conf.yml").env_remove("RUST_LOG").args(args);
    for (k, v) in envs { cmd.env(k, v); }
    cmd.output().unwrap()
}

#[test]
fn check_prints_filled_in_server_config() {
    let out = biscus(&["check", "server", "configs/server.yml"], &[("BISCUS_SERVER__SERVER_RUN__NUM_ROUNDS", "2")]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let config: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(config["server_run"]["num_rounds"], 2);
    assert_eq!(config["server_strategy"]["decorators"][1]["config"]["report"], "current");
    assert_eq!(config["server_strategy"]["strategy"]["config"]["fraction_fit"], 1.0);
}

#[test]
fn check_rejects_unknown_keys_with_their_path() {
    let out = biscus(&["check", "client", "configs/client_1.yml"], &[("BISCUS_CLIENT__CLIENT_RUN__EPOCHS", "3")]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("client_run"));
}

#[test]
fn plugins_lists_core_and_plugin_components() {
    let out = biscus(&["plugins", "--json"], &[]);
    assert!(out.status.success());
    let listing: Vec<serde_json::Value> = serde_json::from_slice(&out.stdout).unwrap();
    let origin = |name: &str| listing.iter().find(|c| c["name"] == name).map(|c| c["origin"].clone());
    assert_eq!(origin("fedavg"), Some("core".into()));
    assert_eq!(origin("metricdiffcompute"), Some("plugin".into()));
    assert_eq!(origin("noop"), Some("plugin".into()));
}

#[test]
fn simulate_saves_final_parameters() {
    let root = std::env::temp_dir().join(format!("biscus-cli-{}", std::process::id()));
    let history = root.join("history.json");
    let out = biscus(
        &["simulate", "configs/server.yml", "--seed", "4", "--history", history.to_str().unwrap()],
        &[("BISCUS_SERVER__ROOT_DIR", root.to_str().unwrap()), ("BISCUS_SERVER__SERVER_RUN__NUM_ROUNDS", "2")],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(Path::new(&root).join("final_parameters.json").is_file());
    let history: serde_json::Value = serde_json::from_slice(&std::fs::read(&history).unwrap()).unwrap();
    assert_eq!(history["losses_centralized"].as_array().unwrap().len(), 3);
    std::fs::remove_dir_all(&root).unwrap();
}
