//! Turns validated session configs into live components.

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::client::{Client, ClientContext};
use crate::config::{Accelerator, ClientConfig, HardwareConfig, ServerConfig};
use crate::error::Result;
use crate::metrics_logger::{combine, shared, SharedMetricsLogger};
use crate::ml::Split;
use crate::parameters::{ndarrays_to_parameters, Parameters, Tensor};
use crate::protocol::{ClientProxy, Config};
use crate::registry::{PluginRegistry, TaggedConfig};
use crate::strategy::{EvaluateFn, Strategy, StrategyContext};
use crate::telemetry::BoxedLayer;

pub const DEFAULT_CLIENT: &str = "local";

pub struct ServerSession {
    pub strategy: Box<dyn Strategy>,
    pub num_rounds: u64,
    pub metrics_logger: SharedMetricsLogger,
}

fn resolve_hardware(hardware: &HardwareConfig) -> HardwareConfig {
    if hardware.accelerator == Accelerator::Gpu { warn!("no GPU backend is available, running on cpu"); }
    hardware.clone()
}

/// Builds the strategy (with its decorator chain) for a server config.
///
/// The server keeps its own copy of the model and evaluates it on the data
/// module's test split after every round.
pub fn build_server_session(registry: &PluginRegistry, config: &ServerConfig) -> Result<ServerSession> {
    let hardware = resolve_hardware(&config.server_compute_context.hardware);

    let sinks = config
        .server_compute_context
        .metrics_loggers
        .iter()
        .map(|ml| registry.metrics_logger.resolve(&ml.name)?.build(&config.root_dir, &ml.config))
        .collect::<Result<Vec<_>>>()?;
    let metrics_logger = shared(combine(sinks));

    let mut model = registry.model.resolve(&config.model.name)?.build(&config.model.config)?;
    let data = registry.data.resolve(&config.data.name)?.build(&config.data.config)?;
    let initial_parameters = ndarrays_to_parameters(&model.get_parameters());
    let evaluate_fn: EvaluateFn = Box::new(move |_round: u64, arrays: &[Tensor], _config: &Config| {
        model.set_parameters(arrays)?;
        Ok(Some(model.evaluate(data.as_ref(), Split::Test)?))
    });

    let agg = &config.server_strategy.fit_results_aggregator;
    let aggregator = registry.fit_results_aggregator.resolve(&agg.name)?.build(&agg.config)?;

    let context = StrategyContext { initial_parameters: Some(initial_parameters), evaluate_fn: Some(evaluate_fn), aggregator, metrics_logger: metrics_logger.clone(), hardware };
    let strategy_config = &config.server_strategy.strategy;
    let mut strategy = registry.strategy.resolve(&strategy_config.name)?.build(context, &strategy_config.config)?;
    info!(strategy = %strategy_config.name, aggregator = %agg.name, "strategy built");

    for decorator in &config.server_strategy.decorators {
        strategy = registry.strategy_decorator.resolve(&decorator.name)?.decorate(strategy, &decorator.config)?;
        info!(decorator = %decorator.name, "strategy decorated");
    }

    Ok(ServerSession { strategy, num_rounds: config.server_run.num_rounds, metrics_logger })
}

/// Builds model, data module and client for one client config.
pub fn build_client(registry: &PluginRegistry, config: &ClientConfig) -> Result<(ClientProxy, Box<dyn Client>)> {
    let model = registry.model.resolve(&config.model.name)?.build(&config.model.config)?;
    let data = registry.data.resolve(&config.data.name)?.build(&config.data.config)?;
    let cid = config.client_run.cid.clone();
    let context = ClientContext {
        cid: cid.clone(),
        model,
        data,
        pre_train_val: config.client_run.pre_train_val,
        hardware: resolve_hardware(&config.client_compute_context.hardware),
    };
    let default_client = TaggedConfig { name: DEFAULT_CLIENT.to_string(), config: serde_json::Value::Null };
    let client_config = config.flower_client.alternate_client_class.as_ref().unwrap_or(&default_client);
    let client = registry.client.resolve(&client_config.name)?.build(context, &client_config.config)?;
    info!(%cid, client = %client_config.name, server = %config.flower_client.server_address, "client built");
    Ok((ClientProxy::new(cid), client))
}

/// Layers for the configured loggers; `console` when none are configured.
pub fn logger_layers(registry: &PluginRegistry, loggers: &[TaggedConfig]) -> Result<Vec<BoxedLayer>> {
    if loggers.is_empty() { return Ok(vec![registry.logger.resolve("console")?.layer(&serde_json::Value::Null)?]); }
    loggers.iter().map(|l| registry.logger.resolve(&l.name)?.layer(&l.config)).collect()
}

/// Writes the final global parameters as JSON under `root_dir`.
pub fn save_parameters(root_dir: &Path, file_path: &Path, parameters: &Parameters) -> Result<std::path::PathBuf> {
    let path = root_dir.join(file_path);
    if let Some(parent) = path.parent() { fs::create_dir_all(parent)?; }
    let json = serde_json::to_vec_pretty(parameters).map_err(anyhow::Error::from)?;
    fs::write(&path, json)?;
    info!(path = %path.display(), "final parameters saved");
    Ok(path)
}
