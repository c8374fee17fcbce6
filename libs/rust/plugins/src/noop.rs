//! `noop`: a parameterless identity model for wiring checks.

use std::sync::Arc;

use anyhow::ensure;
use biscus_core::ml::{DataModule, Model, ModelFactory, Split};
use biscus_core::registry::{typed_config, Category, Component, ConfigVariant, PluginModule};
use biscus_core::{Metrics, Result, Scalar, Tensor};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NoopConfig {
    pub empty_configuration: bool,
}

impl Default for NoopConfig {
    fn default() -> Self { Self { empty_configuration: true } }
}

/// Returns its input; training reports zero loss and full accuracy.
#[derive(Debug, Default)]
pub struct Noop;

fn perfect() -> Metrics { Metrics::from([("loss".to_string(), Scalar::Float(0.0)), ("accuracy".to_string(), Scalar::Float(1.0))]) }

impl Model for Noop {
    fn get_parameters(&self) -> Vec<Tensor> { Vec::new() }

    fn set_parameters(&mut self, parameters: &[Tensor]) -> anyhow::Result<()> {
        ensure!(parameters.is_empty(), "noop model has no parameters, got {} tensors", parameters.len());
        Ok(())
    }

    fn fit(&mut self, _data: &dyn DataModule, _epochs: u64) -> anyhow::Result<Metrics> { Ok(perfect()) }

    fn evaluate(&mut self, _data: &dyn DataModule, _split: Split) -> anyhow::Result<(f64, Metrics)> { Ok((0.0, perfect())) }
}

pub struct NoopFactory;

impl ModelFactory for NoopFactory {
    fn build(&self, config: &Value) -> Result<Box<dyn Model>> {
        let _: NoopConfig = typed_config("noop", config)?;
        Ok(Box::new(Noop))
    }
}

pub fn modules_and_configs() -> anyhow::Result<PluginModule> {
    Ok(PluginModule::new().register("noop", Component::Model(Arc::new(NoopFactory)), ConfigVariant::<NoopConfig>::new(Category::Model, "noop", "Noop")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use biscus_core::ml::randomvector::{RandomVectorConfig, RandomVectorData};

    #[test]
    fn noop_is_perfect_and_parameterless() {
        let data = RandomVectorData::new(&RandomVectorConfig::default());
        let mut model = NoopFactory.build(&Value::Null).unwrap();
        assert!(model.get_parameters().is_empty());
        assert_eq!(model.fit(&data, 3).unwrap()["accuracy"], Scalar::Float(1.0));
        assert_eq!(model.evaluate(&data, Split::Test).unwrap().0, 0.0);
        assert!(model.set_parameters(&[Tensor::scalar(1.0)]).is_err());
    }
}
