//! Logical messages exchanged with clients each round.
//!
//! These are the objects the transport hands to the strategy after decoding a
//! client response; the wire format itself lives with the transport.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::parameters::Parameters;

/// Metric or config value carried alongside parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Scalar {
    /// Numeric view used by metric averaging. Booleans and strings are not numbers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(v) => Some(*v as f64),
            Scalar::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(v) => write!(f, "{v}"),
            Scalar::Int(v) => write!(f, "{v}"),
            Scalar::Float(v) => write!(f, "{v:.4}"),
            Scalar::Str(v) => write!(f, "{v}"),
            Scalar::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<bool> for Scalar { fn from(v: bool) -> Self { Scalar::Bool(v) } }
impl From<i64> for Scalar { fn from(v: i64) -> Self { Scalar::Int(v) } }
impl From<i32> for Scalar { fn from(v: i32) -> Self { Scalar::Int(v as i64) } }
impl From<u64> for Scalar { fn from(v: u64) -> Self { Scalar::Int(v as i64) } }
impl From<f64> for Scalar { fn from(v: f64) -> Self { Scalar::Float(v) } }
impl From<&str> for Scalar { fn from(v: &str) -> Self { Scalar::Str(v.to_string()) } }
impl From<String> for Scalar { fn from(v: String) -> Self { Scalar::Str(v) } }

/// Metric name -> value. Ordered so identical inputs render identically.
pub type Metrics = BTreeMap<String, Scalar>;
/// Per-round instructions sent with parameters (`server_round`, `local_epochs`, ...).
pub type Config = BTreeMap<String, Scalar>;

/// Metric key clients use to tag their results for logging. Never aggregated.
pub const CID_KEY: &str = "cid";

/// Server-side handle on a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientProxy {
    pub cid: String,
}

impl ClientProxy {
    pub fn new(cid: impl Into<String>) -> Self { Self { cid: cid.into() } }
}

impl fmt::Display for ClientProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.cid) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitIns {
    pub parameters: Parameters,
    pub config: Config,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitRes {
    pub parameters: Parameters,
    pub num_examples: u64,
    pub metrics: Metrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateIns {
    pub parameters: Parameters,
    pub config: Config,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateRes {
    pub loss: f64,
    pub num_examples: u64,
    pub metrics: Metrics,
}

/// A client response that did not make it into the round's results.
#[derive(Debug, Clone, PartialEq)]
pub enum Failure<R> {
    /// The client answered, but the transport marked the answer unusable.
    Result(ClientProxy, R),
    /// The call itself failed (timeout, disconnect, client-side error).
    Error(String),
}

impl<R> fmt::Display for Failure<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Result(client, _) => write!(f, "unusable result from client {client}"),
            Failure::Error(e) => f.write_str(e),
        }
    }
}

pub type FitResults = Vec<(ClientProxy, FitRes)>;
pub type FitFailures = Vec<Failure<FitRes>>;
pub type EvaluateResults = Vec<(ClientProxy, EvaluateRes)>;
pub type EvaluateFailures = Vec<Failure<EvaluateRes>>;

/// Reads the logging marker off a metric map, falling back to the proxy id.
pub fn client_marker(client: &ClientProxy, metrics: &Metrics) -> String {
    metrics.get(CID_KEY).map(|v| v.to_string()).unwrap_or_else(|| client.cid.clone())
}
