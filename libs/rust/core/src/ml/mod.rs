//! Model and data-module interfaces, plus the small built-in pair used for
//! smoke tests and simulations.

pub mod linear;
pub mod randomvector;

use serde_json::Value;

use crate::error::Result;
use crate::parameters::Tensor;
use crate::protocol::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Validation,
    Test,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub features: Vec<f32>,
    pub target: Vec<f32>,
}

pub trait DataModule: Send {
    fn samples(&self, split: Split) -> &[Sample];
    fn batch_size(&self) -> usize;

    fn num_examples(&self, split: Split) -> usize { self.samples(split).len() }
}

pub trait Model: Send {
    /// Parameters in a fixed order; clients and server must agree on it.
    fn get_parameters(&self) -> Vec<Tensor>;
    fn set_parameters(&mut self, parameters: &[Tensor]) -> anyhow::Result<()>;
    /// Trains on the train split and reports the last epoch's metrics.
    fn fit(&mut self, data: &dyn DataModule, epochs: u64) -> anyhow::Result<Metrics>;
    /// Returns `(loss, metrics)` on `split`.
    fn evaluate(&mut self, data: &dyn DataModule, split: Split) -> anyhow::Result<(f64, Metrics)>;
}

pub trait ModelFactory: Send + Sync {
    fn build(&self, config: &Value) -> Result<Box<dyn Model>>;
}

pub trait DataModuleFactory: Send + Sync {
    fn build(&self, config: &Value) -> Result<Box<dyn DataModule>>;
}
