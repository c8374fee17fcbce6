//! Dense linear regression `y = W x + b` trained with mini-batch SGD on MSE.

use std::sync::Arc;

use anyhow::{bail, ensure};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::parameters::Tensor;
use crate::protocol::{Metrics, Scalar};
use crate::registry::{typed_config, Category, Component, ConfigVariant, PluginModule};

use super::{DataModule, Model, ModelFactory, Sample, Split};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LinearRegressionConfig {
    pub input_dim: usize,
    pub output_dim: usize,
    pub learning_rate: f64,
    /// Absolute error under which a prediction counts as accurate.
    pub accuracy_threshold: f64,
    pub seed: u64,
}

impl Default for LinearRegressionConfig {
    fn default() -> Self { Self { input_dim: 1, output_dim: 1, learning_rate: 0.1, accuracy_threshold: 0.001, seed: 0 } }
}

impl LinearRegressionConfig {
    fn check(&self) -> std::result::Result<(), String> {
        if self.input_dim == 0 || self.output_dim == 0 { return Err("`input_dim` and `output_dim` must be positive".into()); }
        if !(self.learning_rate > 0.0) { return Err(format!("`learning_rate` must be positive, got {}", self.learning_rate)); }
        Ok(())
    }
}

pub struct LinearRegression {
    config: LinearRegressionConfig,
    /// Row-major `[output_dim, input_dim]`.
    weight: Vec<f32>,
    bias: Vec<f32>,
}

struct Score {
    loss: f64,
    accuracy: f64,
}

impl LinearRegression {
    pub fn new(config: LinearRegressionConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let bound = 1.0 / (config.input_dim as f32).sqrt();
        let weight = (0..config.input_dim * config.output_dim).map(|_| rng.gen_range(-bound..bound)).collect();
        let bias = (0..config.output_dim).map(|_| rng.gen_range(-bound..bound)).collect();
        Self { config, weight, bias }
    }

    fn predict(&self, x: &[f32]) -> Vec<f32> {
        let d = self.config.input_dim;
        self.bias.iter().enumerate().map(|(o, b)| b + self.weight[o * d..(o + 1) * d].iter().zip(x).map(|(w, v)| w * v).sum::<f32>()).collect()
    }

    fn check_sample(&self, s: &Sample) -> anyhow::Result<()> {
        ensure!(s.features.len() == self.config.input_dim, "sample has {} features, model expects {}", s.features.len(), self.config.input_dim);
        ensure!(s.target.len() == self.config.output_dim, "sample has {} targets, model expects {}", s.target.len(), self.config.output_dim);
        Ok(())
    }

    fn score(&self, samples: &[Sample]) -> anyhow::Result<Score> {
        let (mut sq, mut hits, mut count) = (0.0f64, 0usize, 0usize);
        for s in samples {
            self.check_sample(s)?;
            for (p, t) in self.predict(&s.features).iter().zip(&s.target) {
                let err = (*p - *t) as f64;
                sq += err * err;
                if err.abs() < self.config.accuracy_threshold { hits += 1; }
                count += 1;
            }
        }
        if count == 0 { return Ok(Score { loss: 0.0, accuracy: 0.0 }); }
        Ok(Score { loss: sq / count as f64, accuracy: hits as f64 / count as f64 })
    }

    fn step(&mut self, batch: &[Sample]) -> anyhow::Result<()> {
        let d = self.config.input_dim;
        let scale = 2.0 / (batch.len() * self.config.output_dim) as f32;
        let mut grad_w = vec![0f32; self.weight.len()];
        let mut grad_b = vec![0f32; self.bias.len()];
        for s in batch {
            self.check_sample(s)?;
            for (o, (p, t)) in self.predict(&s.features).iter().zip(&s.target).enumerate() {
                let g = scale * (p - t);
                grad_b[o] += g;
                for (gw, x) in grad_w[o * d..(o + 1) * d].iter_mut().zip(&s.features) { *gw += g * x; }
            }
        }
        let lr = self.config.learning_rate as f32;
        for (w, g) in self.weight.iter_mut().zip(&grad_w) { *w -= lr * g; }
        for (b, g) in self.bias.iter_mut().zip(&grad_b) { *b -= lr * g; }
        Ok(())
    }
}

fn to_metrics(score: &Score) -> Metrics {
    Metrics::from([("loss".to_string(), Scalar::Float(score.loss)), ("accuracy".to_string(), Scalar::Float(score.accuracy))])
}

impl Model for LinearRegression {
    fn get_parameters(&self) -> Vec<Tensor> {
        vec![
            Tensor::new(vec![self.config.output_dim, self.config.input_dim], self.weight.clone()).unwrap_or_else(|_| Tensor::from_vec(self.weight.clone())),
            Tensor::from_vec(self.bias.clone()),
        ]
    }

    fn set_parameters(&mut self, parameters: &[Tensor]) -> anyhow::Result<()> {
        let [weight, bias] = parameters else { bail!("linear regression takes 2 tensors, got {}", parameters.len()) };
        ensure!(weight.len() == self.weight.len(), "weight has {} values, expected {}", weight.len(), self.weight.len());
        ensure!(bias.len() == self.bias.len(), "bias has {} values, expected {}", bias.len(), self.bias.len());
        self.weight.copy_from_slice(weight.data());
        self.bias.copy_from_slice(bias.data());
        Ok(())
    }

    fn fit(&mut self, data: &dyn DataModule, epochs: u64) -> anyhow::Result<Metrics> {
        let train = data.samples(Split::Train);
        ensure!(!train.is_empty(), "train split is empty");
        for _ in 0..epochs {
            for batch in train.chunks(data.batch_size().max(1)) { self.step(batch)?; }
        }
        Ok(to_metrics(&self.score(train)?))
    }

    fn evaluate(&mut self, data: &dyn DataModule, split: Split) -> anyhow::Result<(f64, Metrics)> {
        let score = self.score(data.samples(split))?;
        Ok((score.loss, to_metrics(&score)))
    }
}

pub struct LinearRegressionFactory;

impl ModelFactory for LinearRegressionFactory {
    fn build(&self, config: &Value) -> Result<Box<dyn Model>> {
        let config: LinearRegressionConfig = typed_config("linearregression", config)?;
        Ok(Box::new(LinearRegression::new(config)))
    }
}

pub fn modules_and_configs() -> anyhow::Result<PluginModule> {
    Ok(PluginModule::new().register(
        "linearregression",
        Component::Model(Arc::new(LinearRegressionFactory)),
        ConfigVariant::<LinearRegressionConfig>::new(Category::Model, "linearregression", "Linear regression").with_check(LinearRegressionConfig::check),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::randomvector::{RandomVectorConfig, RandomVectorData};

    #[test]
    fn training_reduces_loss() {
        let data = RandomVectorData::new(&RandomVectorConfig::default());
        let mut model = LinearRegression::new(LinearRegressionConfig::default());
        let (before, _) = model.evaluate(&data, Split::Test).unwrap();
        model.fit(&data, 5).unwrap();
        let (after, metrics) = model.evaluate(&data, Split::Test).unwrap();
        assert!(after < before, "{after} >= {before}");
        assert!(metrics.contains_key("accuracy"));
    }

    #[test]
    fn parameters_have_fixed_shapes() {
        let mut model = LinearRegression::new(LinearRegressionConfig { input_dim: 3, output_dim: 2, ..Default::default() });
        let params = model.get_parameters();
        assert_eq!(params[0].shape(), &[2, 3]);
        assert_eq!(params[1].shape(), &[2]);
        model.set_parameters(&params).unwrap();
        assert!(model.set_parameters(&params[..1]).is_err());
    }

    #[test]
    fn mismatched_samples_are_errors() {
        let data = RandomVectorData::new(&RandomVectorConfig { feature_dim: 2, ..Default::default() });
        let mut model = LinearRegression::new(LinearRegressionConfig::default());
        assert!(model.fit(&data, 1).is_err());
    }
}
