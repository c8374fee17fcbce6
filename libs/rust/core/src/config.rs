//! Session configuration for the server and client processes.
//!
//! Files are YAML, overridable from the environment per document kind with
//! `BISCUS_SERVER__<SECTION>__<KEY>` or `BISCUS_CLIENT__<SECTION>__<KEY>`
//! (e.g. `BISCUS_SERVER__SERVER_RUN__NUM_ROUNDS=5`).
//! Static sections are plain serde types; tagged sections (`{name, config}`)
//! are validated against the registry's config union for their category.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::registry::{value_kind, Category, PluginRegistry, TaggedConfig};

pub const SERVER_ENV_PREFIX: &str = "BISCUS_SERVER";
pub const CLIENT_ENV_PREFIX: &str = "BISCUS_CLIENT";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    Cpu,
    Gpu,
    #[default]
    Auto,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Devices {
    Count(u32),
    Ids(Vec<u32>),
    Named(String),
}

impl Default for Devices {
    fn default() -> Self { Devices::Named("auto".into()) }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HardwareConfig {
    pub accelerator: Accelerator,
    pub devices: Devices,
}

impl HardwareConfig {
    fn check(&self) -> Result<(), String> {
        match &self.devices {
            Devices::Named(n) if n != "auto" => Err(format!("`devices` must be `auto`, a count or a list of ids, got `{n}`")),
            Devices::Count(0) => Err("`devices` count must be positive".into()),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSslConfig {
    pub root_certificate_path: Option<PathBuf>,
    pub server_certificate_path: Option<PathBuf>,
    pub server_private_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FlowerServerConfig {
    pub listen_address: String,
    pub ssl: Option<ServerSslConfig>,
}

impl Default for FlowerServerConfig {
    fn default() -> Self { Self { listen_address: "[::]:3333".into(), ssl: None } }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SaveWeightsConfig {
    pub file_path: PathBuf,
}

impl Default for SaveWeightsConfig {
    fn default() -> Self { Self { file_path: PathBuf::from("final_parameters.json") } }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerRunConfig {
    pub num_rounds: u64,
    pub client_configs: Vec<PathBuf>,
    pub save_on_train_end: Option<SaveWeightsConfig>,
    pub loggers: Vec<TaggedConfig>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServerRun {
    #[serde(default = "default_num_rounds")]
    num_rounds: u64,
    #[serde(default)]
    client_configs: Vec<PathBuf>,
    #[serde(default)]
    save_on_train_end: Option<SaveWeightsConfig>,
    #[serde(default)]
    loggers: Vec<Value>,
}

fn default_num_rounds() -> u64 { 10 }

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerComputeContext {
    pub hardware: HardwareConfig,
    /// No entries means metrics are discarded.
    pub metrics_loggers: Vec<TaggedConfig>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServerComputeContext {
    #[serde(default)]
    hardware: HardwareConfig,
    #[serde(default)]
    metrics_loggers: Vec<Value>,
    /// Single-sink shorthand, logged before the list entries.
    #[serde(default)]
    metrics_logger: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStrategyConfig {
    pub strategy: TaggedConfig,
    pub decorators: Vec<TaggedConfig>,
    pub fit_results_aggregator: TaggedConfig,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServerStrategy {
    strategy: Value,
    #[serde(default)]
    decorators: Vec<Value>,
    #[serde(default)]
    fit_results_aggregator: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerConfig {
    pub root_dir: PathBuf,
    pub flower_server: FlowerServerConfig,
    pub server_run: ServerRunConfig,
    pub server_compute_context: ServerComputeContext,
    pub server_strategy: ServerStrategyConfig,
    pub data: TaggedConfig,
    pub model: TaggedConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClientSslConfig {
    pub secure_cnx: bool,
    pub root_certificate: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowerClientConfig {
    pub server_address: String,
    pub ssl: Option<ClientSslConfig>,
    pub alternate_client_class: Option<TaggedConfig>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFlowerClient {
    #[serde(default = "default_server_address")]
    server_address: String,
    #[serde(default)]
    ssl: Option<ClientSslConfig>,
    #[serde(default)]
    alternate_client_class: Option<Value>,
}

fn default_server_address() -> String { "localhost:3333".into() }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientRunConfig {
    #[serde(deserialize_with = "client_id")]
    pub cid: String,
    #[serde(default)]
    pub pre_train_val: bool,
}

/// Client ids are opaque; YAML files usually spell them as integers.
fn client_id<'de, D: serde::Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }
    Ok(match Raw::deserialize(d)? {
        Raw::Int(v) => v.to_string(),
        Raw::Str(v) => v,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClientComputeContext {
    pub hardware: HardwareConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientConfig {
    pub root_dir: PathBuf,
    pub flower_client: FlowerClientConfig,
    pub client_run: ClientRunConfig,
    pub client_compute_context: ClientComputeContext,
    pub data: TaggedConfig,
    pub model: TaggedConfig,
}

/// Reads a YAML file and applies the `<env_prefix>__` environment overrides.
pub fn load_document(path: &Path, env_prefix: &str) -> Result<Value, ConfigError> {
    let source = path.display().to_string();
    let settings = config::Config::builder()
        .add_source(config::File::from(path).format(config::FileFormat::Yaml).required(true))
        .add_source(config::Environment::with_prefix(env_prefix).prefix_separator("__").separator("__").try_parsing(true))
        .build()
        .map_err(|e| ConfigError::new(&source, e.to_string()))?;
    let doc: Value = settings.try_deserialize().map_err(|e| ConfigError::new(&source, e.to_string()))?;
    debug!(path = %source, env_prefix, "session config loaded");
    Ok(doc)
}

pub fn parse_yaml(text: &str) -> Result<Value, ConfigError> {
    serde_yaml::from_str(text).map_err(|e| ConfigError::new("<document>", e.to_string()))
}

impl ServerConfig {
    pub fn load(path: &Path, registry: &PluginRegistry) -> Result<Self, ConfigError> { Self::from_value(load_document(path, SERVER_ENV_PREFIX)?, registry) }

    pub fn from_yaml_str(text: &str, registry: &PluginRegistry) -> Result<Self, ConfigError> { Self::from_value(parse_yaml(text)?, registry) }

    pub fn from_value(doc: Value, registry: &PluginRegistry) -> Result<Self, ConfigError> {
        let mut doc = Document::new(doc)?;
        let root_dir = doc.optional::<PathBuf>("root_dir")?.unwrap_or_else(|| PathBuf::from("."));
        let flower_server = doc.optional::<FlowerServerConfig>("flower_server")?.unwrap_or_default();

        let run: RawServerRun = doc.required("server_run")?;
        if run.num_rounds == 0 { return Err(ConfigError::new("server_run.num_rounds", "must be at least 1")); }
        let loggers = tagged_list(registry, Category::Logger, "server_run.loggers", &run.loggers)?;

        let compute: RawServerComputeContext =
            doc.optional("server_compute_context")?.unwrap_or(RawServerComputeContext { hardware: HardwareConfig::default(), metrics_loggers: Vec::new(), metrics_logger: None });
        compute.hardware.check().map_err(|m| ConfigError::new("server_compute_context.hardware", m))?;
        let mut metrics_loggers = match &compute.metrics_logger {
            None | Some(Value::Null) => Vec::new(),
            Some(v) => vec![tagged(registry, Category::MetricsLogger, "server_compute_context.metrics_logger", v)?],
        };
        metrics_loggers.extend(tagged_list(registry, Category::MetricsLogger, "server_compute_context.metrics_loggers", &compute.metrics_loggers)?);

        let strategy: RawServerStrategy = doc.required("server_strategy")?;
        let server_strategy = ServerStrategyConfig {
            strategy: tagged(registry, Category::Strategy, "server_strategy.strategy", &strategy.strategy)?,
            decorators: tagged_list(registry, Category::StrategyDecorator, "server_strategy.decorators", &strategy.decorators)?,
            fit_results_aggregator: tagged_or(registry, Category::FitResultsAggregator, "server_strategy.fit_results_aggregator", strategy.fit_results_aggregator, "weightedaverage")?,
        };

        let data = tagged(registry, Category::Data, "data", &doc.required::<Value>("data")?)?;
        let model = tagged(registry, Category::Model, "model", &doc.required::<Value>("model")?)?;
        doc.finish()?;

        Ok(Self {
            root_dir,
            flower_server,
            server_run: ServerRunConfig { num_rounds: run.num_rounds, client_configs: run.client_configs, save_on_train_end: run.save_on_train_end, loggers },
            server_compute_context: ServerComputeContext { hardware: compute.hardware, metrics_loggers },
            server_strategy,
            data,
            model,
        })
    }
}

impl ClientConfig {
    pub fn load(path: &Path, registry: &PluginRegistry) -> Result<Self, ConfigError> { Self::from_value(load_document(path, CLIENT_ENV_PREFIX)?, registry) }

    pub fn from_yaml_str(text: &str, registry: &PluginRegistry) -> Result<Self, ConfigError> { Self::from_value(parse_yaml(text)?, registry) }

    pub fn from_value(doc: Value, registry: &PluginRegistry) -> Result<Self, ConfigError> {
        let mut doc = Document::new(doc)?;
        let root_dir = doc.optional::<PathBuf>("root_dir")?.unwrap_or_else(|| PathBuf::from("."));

        let raw: RawFlowerClient = doc.optional("flower_client")?.unwrap_or(RawFlowerClient { server_address: default_server_address(), ssl: None, alternate_client_class: None });
        if let Some(ssl) = &raw.ssl {
            if ssl.secure_cnx && ssl.root_certificate.is_none() {
                warn!("secure connection requested without a root certificate, system roots will be used");
            }
        }
        let alternate_client_class = match &raw.alternate_client_class {
            None | Some(Value::Null) => None,
            Some(v) => Some(tagged(registry, Category::Client, "flower_client.alternate_client_class", v)?),
        };

        let client_run: ClientRunConfig = doc.required("client_run")?;
        let client_compute_context = doc.optional::<ClientComputeContext>("client_compute_context")?.unwrap_or_default();
        client_compute_context.hardware.check().map_err(|m| ConfigError::new("client_compute_context.hardware", m))?;

        let data = tagged(registry, Category::Data, "data", &doc.required::<Value>("data")?)?;
        let model = tagged(registry, Category::Model, "model", &doc.required::<Value>("model")?)?;
        doc.finish()?;

        Ok(Self {
            root_dir,
            flower_client: FlowerClientConfig { server_address: raw.server_address, ssl: raw.ssl, alternate_client_class },
            client_run,
            client_compute_context,
            data,
            model,
        })
    }
}

/// Top-level mapping consumed section by section; leftovers are unknown keys.
struct Document(Map<String, Value>);

impl Document {
    fn new(doc: Value) -> Result<Self, ConfigError> {
        match doc {
            Value::Object(map) => Ok(Self(map)),
            other => Err(ConfigError::new("<document>", format!("expected a mapping, found {}", value_kind(&other)))),
        }
    }

    fn optional<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.0.remove(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v).map(Some).map_err(|e| ConfigError::new(key, e.to_string())),
        }
    }

    fn required<T: DeserializeOwned>(&mut self, key: &str) -> Result<T, ConfigError> {
        self.optional(key)?.ok_or_else(|| ConfigError::new(key, "missing required section"))
    }

    fn finish(self) -> Result<(), ConfigError> {
        match self.0.keys().next() {
            Some(key) => Err(ConfigError::new(key.as_str(), "unknown section")),
            None => Ok(()),
        }
    }
}

fn tagged(registry: &PluginRegistry, category: Category, path: &str, value: &Value) -> Result<TaggedConfig, ConfigError> {
    let union = registry.union(category).ok_or_else(|| ConfigError::new(path, format!("no {category} variants are registered")))?;
    union.validate(path, value)
}

fn tagged_or(registry: &PluginRegistry, category: Category, path: &str, value: Option<Value>, default: &str) -> Result<TaggedConfig, ConfigError> {
    let value = match value {
        None | Some(Value::Null) => serde_json::json!({ "name": default }),
        Some(v) => v,
    };
    tagged(registry, category, path, &value)
}

fn tagged_list(registry: &PluginRegistry, category: Category, path: &str, values: &[Value]) -> Result<Vec<TaggedConfig>, ConfigError> {
    values.iter().enumerate().map(|(i, v)| tagged(registry, category, &format!("{path}[{i}]"), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER: &str = r#"
root_dir: /tmp/run
server_run:
  num_rounds: 3
  loggers:
    - name: console
server_compute_context:
  hardware: { accelerator: cpu, devices: 1 }
  metrics_loggers: [{ name: tracing }]
server_strategy:
  strategy:
    name: fedavg
    config: { min_fit_clients: 1, min_evaluate_clients: 1, min_available_clients: 1 }
data: { name: randomvector, config: { num_samples: 16 } }
model: { name: linearregression }
"#;

    #[test]
    fn server_config_parses_with_defaults() {
        let registry = PluginRegistry::builtin();
        let c = ServerConfig::from_yaml_str(SERVER, &registry).unwrap();
        assert_eq!(c.server_run.num_rounds, 3);
        assert_eq!(c.flower_server.listen_address, "[::]:3333");
        assert_eq!(c.server_strategy.fit_results_aggregator.name, "weightedaverage");
        assert_eq!(c.server_strategy.strategy.config["fraction_fit"], serde_json::json!(1.0));
        assert_eq!(c.data.config["batch_size"], serde_json::json!(32));
        assert_eq!(c.server_compute_context.hardware.devices, Devices::Count(1));
        assert_eq!(c.server_compute_context.metrics_loggers.len(), 1);
        assert_eq!(c.server_compute_context.metrics_loggers[0].name, "tracing");
    }

    #[test]
    fn metrics_loggers_accept_shorthand_and_list() {
        let registry = PluginRegistry::builtin();
        let text = SERVER.replace("metrics_loggers: [{ name: tracing }]", "metrics_logger: { name: \"null\" }\n  metrics_loggers: [{ name: tracing, config: { level: debug } }]");
        let c = ServerConfig::from_yaml_str(&text, &registry).unwrap();
        let names: Vec<_> = c.server_compute_context.metrics_loggers.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["null", "tracing"]);

        let none = ServerConfig::from_yaml_str(&SERVER.replace("  metrics_loggers: [{ name: tracing }]\n", ""), &registry).unwrap();
        assert!(none.server_compute_context.metrics_loggers.is_empty());

        let err = ServerConfig::from_yaml_str(&SERVER.replace("[{ name: tracing }]", "[{ name: tracing }, { name: wandb }]"), &registry).unwrap_err();
        assert_eq!(err.path, "server_compute_context.metrics_loggers[1].name");
    }

    #[test]
    fn errors_name_the_field_path() {
        let registry = PluginRegistry::builtin();
        let bad = SERVER.replace("min_fit_clients: 1,", "min_fit_clients: 1, foo: 2,");
        let err = ServerConfig::from_yaml_str(&bad, &registry).unwrap_err();
        assert_eq!(err.path, "server_strategy.strategy.config");
        assert_eq!(err.candidate.as_deref(), Some("fedavg"));
        assert!(err.message.contains("foo"));

        let err = ServerConfig::from_yaml_str(&SERVER.replace("name: randomvector", "name: mnist"), &registry).unwrap_err();
        assert_eq!(err.path, "data.name");

        let err = ServerConfig::from_yaml_str(&format!("{SERVER}\nsurprise: 1\n"), &registry).unwrap_err();
        assert_eq!(err.path, "surprise");

        let err = ServerConfig::from_yaml_str(&SERVER.replace("- name: console", "- name: console\n    - {}"), &registry).unwrap_err();
        assert_eq!(err.path, "server_run.loggers[1]");
    }

    #[test]
    fn decorators_need_registered_variants() {
        let registry = PluginRegistry::builtin();
        let text = SERVER.replace("server_strategy:\n", "server_strategy:\n  decorators: [{ name: metricdiffcompute }]\n");
        let err = ServerConfig::from_yaml_str(&text, &registry).unwrap_err();
        assert_eq!(err.path, "server_strategy.decorators[0]");
    }

    #[test]
    fn client_config_accepts_integer_cid() {
        let registry = PluginRegistry::builtin();
        let text = r#"
client_run: { cid: 4, pre_train_val: true }
flower_client: { server_address: "localhost:9999" }
data: { name: randomvector }
model: { name: linearregression, config: { learning_rate: 0.05 } }
"#;
        let c = ClientConfig::from_yaml_str(text, &registry).unwrap();
        assert_eq!(c.client_run.cid, "4");
        assert!(c.client_run.pre_train_val);
        assert!(c.flower_client.alternate_client_class.is_none());
        let err = ClientConfig::from_yaml_str(&text.replace("learning_rate: 0.05", "learning_rate: -1.0"), &registry).unwrap_err();
        assert_eq!(err.path, "model.config");
    }

    #[test]
    fn env_overrides_apply_to_their_document_kind() {
        let dir = std::env::temp_dir().join(format!("biscus-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let server = dir.join("server.yml");
        let client = dir.join("client.yml");
        std::fs::write(&server, SERVER).unwrap();
        std::fs::write(&client, "client_run: { cid: 1 }\ndata: { name: randomvector }\nmodel: { name: linearregression }\n").unwrap();
        let registry = PluginRegistry::builtin();

        std::env::set_var("BISCUS_SERVER__SERVER_RUN__NUM_ROUNDS", "7");
        std::env::set_var("BISCUS_CLIENT__CLIENT_RUN__PRE_TRAIN_VAL", "true");
        let s = ServerConfig::load(&server, &registry);
        let c = ClientConfig::load(&client, &registry);
        std::env::remove_var("BISCUS_SERVER__SERVER_RUN__NUM_ROUNDS");
        std::env::remove_var("BISCUS_CLIENT__CLIENT_RUN__PRE_TRAIN_VAL");

        assert_eq!(s.unwrap().server_run.num_rounds, 7);
        let c = c.unwrap();
        assert_eq!(c.client_run.cid, "1");
        assert!(c.client_run.pre_train_val);
        std::fs::remove_dir_all(&dir).ok();
    }
}
