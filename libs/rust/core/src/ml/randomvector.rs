//! Seeded synthetic regression data where the target equals the input.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::registry::{typed_config, Category, Component, ConfigVariant, PluginModule};

use super::{DataModule, DataModuleFactory, Sample, Split};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RandomVectorConfig {
    pub num_samples: usize,
    pub feature_dim: usize,
    pub seed: u64,
    pub batch_size: usize,
}

impl Default for RandomVectorConfig {
    fn default() -> Self { Self { num_samples: 100, feature_dim: 1, seed: 42, batch_size: 32 } }
}

impl RandomVectorConfig {
    fn check(&self) -> std::result::Result<(), String> {
        if self.num_samples == 0 || self.feature_dim == 0 || self.batch_size == 0 {
            return Err("`num_samples`, `feature_dim` and `batch_size` must be positive".into());
        }
        Ok(())
    }
}

pub struct RandomVectorData {
    train: Vec<Sample>,
    validation: Vec<Sample>,
    test: Vec<Sample>,
    batch_size: usize,
}

fn generate(n: usize, dim: usize, seed: u64) -> Vec<Sample> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let features: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
            Sample { target: features.clone(), features }
        })
        .collect()
}

impl RandomVectorData {
    /// Validation and test splits hold half as many samples, drawn from `seed + 1` and `seed + 2`.
    pub fn new(config: &RandomVectorConfig) -> Self {
        let half = (config.num_samples / 2).max(1);
        Self {
            train: generate(config.num_samples, config.feature_dim, config.seed),
            validation: generate(half, config.feature_dim, config.seed.wrapping_add(1)),
            test: generate(half, config.feature_dim, config.seed.wrapping_add(2)),
            batch_size: config.batch_size,
        }
    }
}

impl DataModule for RandomVectorData {
    fn samples(&self, split: Split) -> &[Sample] {
        match split {
            Split::Train => &self.train,
            Split::Validation => &self.validation,
            Split::Test => &self.test,
        }
    }

    fn batch_size(&self) -> usize { self.batch_size }
}

pub struct RandomVectorFactory;

impl DataModuleFactory for RandomVectorFactory {
    fn build(&self, config: &Value) -> Result<Box<dyn DataModule>> {
        let config: RandomVectorConfig = typed_config("randomvector", config)?;
        debug!(?config, "generating random vector data");
        Ok(Box::new(RandomVectorData::new(&config)))
    }
}

pub fn modules_and_configs() -> anyhow::Result<PluginModule> {
    Ok(PluginModule::new().register(
        "randomvector",
        Component::Data(Arc::new(RandomVectorFactory)),
        ConfigVariant::<RandomVectorConfig>::new(Category::Data, "randomvector", "Random vectors").with_check(RandomVectorConfig::check),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_are_seeded_and_sized() {
        let config = RandomVectorConfig { num_samples: 10, feature_dim: 3, ..Default::default() };
        let a = RandomVectorData::new(&config);
        let b = RandomVectorData::new(&config);
        assert_eq!(a.samples(Split::Train), b.samples(Split::Train));
        assert_eq!(a.num_examples(Split::Train), 10);
        assert_eq!(a.num_examples(Split::Validation), 5);
        assert_ne!(a.samples(Split::Validation), a.samples(Split::Test));
        let s = &a.samples(Split::Train)[0];
        assert_eq!(s.features.len(), 3);
        assert_eq!(s.features, s.target);
    }

    #[test]
    fn zero_sizes_fail_validation() {
        assert!(RandomVectorConfig { batch_size: 0, ..Default::default() }.check().is_err());
    }
}
