//! Averaging primitives behind the fit-results aggregators and the default
//! metrics aggregation.
//!
//! All sums are taken in `f64` in input order; tensor indices are independent
//! and computed in parallel.

use std::collections::BTreeSet;

use rayon::prelude::*;
use tracing::debug;

use crate::error::{Error, Result};
use crate::parameters::Tensor;
use crate::protocol::{Metrics, Scalar, CID_KEY};

/// One client's decoded parameters and its aggregation weight.
#[derive(Debug, Clone)]
pub struct WeightedTensors {
    pub cid: String,
    pub tensors: Vec<Tensor>,
    pub weight: u64,
}

/// `out[i] = Σ w_c · p_c[i] / Σ w_c`, with `w_c` the client's example count.
pub fn aggregate_weighted(updates: &[WeightedTensors]) -> Result<Vec<Tensor>> {
    let total: f64 = updates.iter().map(|u| u.weight as f64).sum();
    if total == 0.0 { return Err(Error::ZeroWeight); }
    combine(updates, |u| u.weight as f64, total)
}

/// `out[i] = mean_c p_c[i]`; example counts are ignored.
pub fn aggregate_unweighted(updates: &[WeightedTensors]) -> Result<Vec<Tensor>> {
    if updates.is_empty() { return Err(Error::ZeroWeight); }
    combine(updates, |_| 1.0, updates.len() as f64)
}

fn combine<W>(updates: &[WeightedTensors], weight: W, total: f64) -> Result<Vec<Tensor>>
where
    W: Fn(&WeightedTensors) -> f64 + Sync,
{
    let reference = &updates[0];
    check_shapes(updates)?;
    (0..reference.tensors.len())
        .into_par_iter()
        .map(|i| {
            let mut acc = vec![0f64; reference.tensors[i].len()];
            for u in updates {
                let w = weight(u);
                for (a, v) in acc.iter_mut().zip(u.tensors[i].data()) { *a += w * *v as f64; }
            }
            Tensor::new(reference.tensors[i].shape().to_vec(), acc.into_iter().map(|a| (a / total) as f32).collect())
        })
        .collect()
}

/// Every client must submit the same tensor count and per-index shapes as the first one.
fn check_shapes(updates: &[WeightedTensors]) -> Result<()> {
    let reference = &updates[0];
    for u in &updates[1..] {
        if u.tensors.len() != reference.tensors.len() {
            return Err(Error::TensorCountMismatch { cid: u.cid.clone(), expected: reference.tensors.len(), found: u.tensors.len() });
        }
        for (index, (r, t)) in reference.tensors.iter().zip(&u.tensors).enumerate() {
            if r.shape() != t.shape() {
                return Err(Error::ShapeMismatch { cid: u.cid.clone(), index, expected: r.shape().to_vec(), found: t.shape().to_vec() });
            }
        }
    }
    Ok(())
}

/// Example-weighted mean of client losses; `None` when no examples were reported.
pub fn weighted_loss_avg(results: &[(u64, f64)]) -> Option<f64> {
    let total: f64 = results.iter().map(|(n, _)| *n as f64).sum();
    if total == 0.0 { return None; }
    Some(results.iter().map(|(n, loss)| *n as f64 * loss).sum::<f64>() / total)
}

/// Weighted mean of every numeric metric reported by *all* clients.
///
/// Keys missing from any map are left out rather than treated as zero, and
/// the `cid` marker is never averaged.
pub fn weighted_average(metrics: &[(u64, Metrics)]) -> Metrics {
    let mut out = Metrics::new();
    let total: f64 = metrics.iter().map(|(n, _)| *n as f64).sum();
    let Some((_, first)) = metrics.first() else { return out };
    if total == 0.0 { return out; }

    let mut keys: BTreeSet<&str> = first.keys().map(String::as_str).filter(|k| *k != CID_KEY).collect();
    for (_, m) in &metrics[1..] { keys.retain(|k| m.contains_key(*k)); }

    'keys: for key in keys {
        let mut acc = 0.0;
        for (n, m) in metrics {
            match m.get(key).and_then(Scalar::as_f64) {
                Some(v) => acc += *n as f64 * v,
                None => {
                    debug!(metric = key, "non-numeric metric left out of aggregation");
                    continue 'keys;
                }
            }
        }
        out.insert(key.to_string(), Scalar::Float(acc / total));
    }
    debug!(?out, "averaged metrics");
    out
}
