//! Client-side federated participant.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::HardwareConfig;
use crate::error::Result;
use crate::ml::{DataModule, Model, Split};
use crate::parameters::{ndarrays_to_parameters, parameters_to_ndarrays, Parameters};
use crate::protocol::{Config, EvaluateIns, EvaluateRes, FitIns, FitRes, Metrics, Scalar, CID_KEY};
use crate::registry::{typed_config, Category, Component, ConfigVariant, PluginModule};

pub trait Client: Send {
    fn get_parameters(&mut self, config: &Config) -> anyhow::Result<Parameters>;
    fn fit(&mut self, ins: &FitIns) -> anyhow::Result<FitRes>;
    fn evaluate(&mut self, ins: &EvaluateIns) -> anyhow::Result<EvaluateRes>;
}

/// What a client factory receives from the session besides its own config.
pub struct ClientContext {
    pub cid: String,
    pub model: Box<dyn Model>,
    pub data: Box<dyn DataModule>,
    pub pre_train_val: bool,
    pub hardware: HardwareConfig,
}

pub trait ClientFactory: Send + Sync {
    fn build(&self, context: ClientContext, config: &Value) -> Result<Box<dyn Client>>;
}

/// Trains the session model on local data; tags every metric map with its `cid`.
pub struct LocalClient {
    cid: String,
    model: Box<dyn Model>,
    data: Box<dyn DataModule>,
    pre_train_val: bool,
}

impl LocalClient {
    pub fn new(context: ClientContext) -> Self {
        Self { cid: context.cid, model: context.model, data: context.data, pre_train_val: context.pre_train_val }
    }

    pub fn cid(&self) -> &str { &self.cid }

    fn load(&mut self, parameters: &Parameters) -> anyhow::Result<()> {
        let arrays = parameters_to_ndarrays(parameters)?;
        self.model.set_parameters(&arrays)
    }
}

fn local_epochs(config: &Config) -> u64 {
    config.get("local_epochs").and_then(Scalar::as_i64).map(|e| e.max(1) as u64).unwrap_or(1)
}

impl Client for LocalClient {
    fn get_parameters(&mut self, _config: &Config) -> anyhow::Result<Parameters> { Ok(ndarrays_to_parameters(&self.model.get_parameters())) }

    fn fit(&mut self, ins: &FitIns) -> anyhow::Result<FitRes> {
        self.load(&ins.parameters)?;
        let mut metrics = Metrics::new();
        if self.pre_train_val {
            let (loss, pre) = self.model.evaluate(self.data.as_ref(), Split::Validation)?;
            info!(cid = %self.cid, loss, "pre-train validation");
            metrics.extend(pre.into_iter().map(|(k, v)| (format!("{k}_pre_train_val"), v)));
        }
        let epochs = local_epochs(&ins.config);
        metrics.extend(self.model.fit(self.data.as_ref(), epochs)?);
        metrics.insert(CID_KEY.to_string(), Scalar::from(self.cid.as_str()));
        debug!(cid = %self.cid, epochs, "local fit done");
        Ok(FitRes {
            parameters: ndarrays_to_parameters(&self.model.get_parameters()),
            num_examples: self.data.num_examples(Split::Train) as u64,
            metrics,
        })
    }

    fn evaluate(&mut self, ins: &EvaluateIns) -> anyhow::Result<EvaluateRes> {
        self.load(&ins.parameters)?;
        let (loss, mut metrics) = self.model.evaluate(self.data.as_ref(), Split::Validation)?;
        metrics.insert(CID_KEY.to_string(), Scalar::from(self.cid.as_str()));
        Ok(EvaluateRes { loss, num_examples: self.data.num_examples(Split::Validation) as u64, metrics })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LocalClientConfig {}

pub struct LocalClientFactory;

impl ClientFactory for LocalClientFactory {
    fn build(&self, context: ClientContext, config: &Value) -> Result<Box<dyn Client>> {
        let _: LocalClientConfig = typed_config("local", config)?;
        debug!(cid = %context.cid, hardware = ?context.hardware, "building local client");
        Ok(Box::new(LocalClient::new(context)))
    }
}

pub fn modules_and_configs() -> anyhow::Result<PluginModule> {
    Ok(PluginModule::new().register(
        "local",
        Component::Client(Arc::new(LocalClientFactory)),
        ConfigVariant::<LocalClientConfig>::new(Category::Client, "local", "In-process client"),
    ))
}
