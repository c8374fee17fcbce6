//! Error taxonomy for the aggregation, registry and session layers.
//!
//! Round-level outcomes ("nothing to aggregate", "round rejected") are not
//! errors: they travel as `None` sentinels through the strategy API.

use thiserror::Error;

use crate::registry::Category;

#[derive(Debug, Error)]
pub enum Error {
    #[error("client `{cid}` sent {found} tensors, expected {expected}")]
    TensorCountMismatch { cid: String, expected: usize, found: usize },
    #[error("tensor {index} from client `{cid}` has shape {found:?}, expected {expected:?}")]
    ShapeMismatch { cid: String, index: usize, expected: Vec<usize>, found: Vec<usize> },
    #[error("total aggregation weight is zero")]
    ZeroWeight,
    #[error("shape {shape:?} needs {expected} values, got {found}")]
    InvalidTensor { shape: Vec<usize>, expected: usize, found: usize },
    #[error("parameter codec: {0}")]
    Codec(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no {category} component named `{name}` is registered")]
    UnknownComponent { category: Category, name: String },
    #[error("round {found} is out of sequence, expected {expected}")]
    RoundOutOfSequence { expected: u64, found: u64 },
    #[error("no initial parameters: the strategy provided none and no client is connected")]
    NoInitialParameters,
    #[error(transparent)]
    External(#[from] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A session configuration failure, qualified by the offending key path and,
/// for tagged sections, the variant that was tried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("`{path}`: {message}{}", candidate_suffix(.candidate))]
pub struct ConfigError {
    pub path: String,
    pub candidate: Option<String>,
    pub message: String,
}

impl ConfigError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self { path: path.into(), candidate: None, message: message.into() }
    }

    pub fn with_candidate(mut self, candidate: impl Into<String>) -> Self {
        self.candidate = Some(candidate.into());
        self
    }
}

fn candidate_suffix(candidate: &Option<String>) -> String {
    match candidate {
        Some(c) => format!(" (while validating variant `{c}`)"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_names_path_and_variant() {
        let e = ConfigError::new("server_strategy.strategy.config", "unknown field `foo`").with_candidate("fedavg");
        assert_eq!(e.to_string(), "`server_strategy.strategy.config`: unknown field `foo` (while validating variant `fedavg`)");
        let plain = ConfigError::new("server_run", "missing field `loggers`");
        assert_eq!(plain.to_string(), "`server_run`: missing field `loggers`");
    }
}
