//! Core of the biscus federated-learning server: parameter and metric
//! aggregation, strategies and their decorator chain, the component registry
//! with its plugin loader, session configuration and the round driver.

pub mod aggregate;
pub mod client;
pub mod client_manager;
pub mod config;
pub mod error;
pub mod metrics_ext;
pub mod metrics_logger;
pub mod ml;
pub mod parameters;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod strategy;
pub mod telemetry;

pub use error::{ConfigError, Error, Result};
pub use parameters::{ndarrays_to_parameters, parameters_to_ndarrays, Parameters, Tensor};
pub use protocol::{ClientProxy, EvaluateIns, EvaluateRes, Failure, FitIns, FitRes, Metrics, Scalar};
pub use registry::{Category, PluginCatalog, PluginRegistry};
pub use strategy::{Strategy, StrategyDecorator};
pub use telemetry::{bootstrap_subscriber, init_tracing};
