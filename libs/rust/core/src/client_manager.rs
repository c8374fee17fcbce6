//! Book-keeping of connected clients and per-round sampling.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::protocol::ClientProxy;

pub trait ClientManager: Send + Sync {
    fn num_available(&self) -> usize;

    /// Picks `num_clients` distinct clients, or none at all when fewer than
    /// `min_num_clients` (or fewer than `num_clients`) are connected.
    fn sample(&self, num_clients: usize, min_num_clients: usize) -> Vec<ClientProxy>;

    fn all(&self) -> Vec<ClientProxy>;
}

pub struct SimpleClientManager {
    clients: Mutex<BTreeSet<ClientProxy>>,
    rng: Mutex<StdRng>,
}

impl Default for SimpleClientManager {
    fn default() -> Self { Self::new() }
}

impl SimpleClientManager {
    pub fn new() -> Self { Self { clients: Mutex::new(BTreeSet::new()), rng: Mutex::new(StdRng::from_entropy()) } }

    /// Deterministic sampling, for simulations and tests.
    pub fn with_seed(seed: u64) -> Self { Self { clients: Mutex::new(BTreeSet::new()), rng: Mutex::new(StdRng::seed_from_u64(seed)) } }

    pub fn register(&self, client: ClientProxy) -> bool { self.clients.lock().insert(client) }

    pub fn unregister(&self, client: &ClientProxy) -> bool { self.clients.lock().remove(client) }
}

impl ClientManager for SimpleClientManager {
    fn num_available(&self) -> usize { self.clients.lock().len() }

    fn sample(&self, num_clients: usize, min_num_clients: usize) -> Vec<ClientProxy> {
        let mut available: Vec<ClientProxy> = self.clients.lock().iter().cloned().collect();
        if available.len() < min_num_clients {
            warn!(available = available.len(), required = min_num_clients, "not enough clients connected to sample");
            return Vec::new();
        }
        if num_clients > available.len() {
            info!(available = available.len(), requested = num_clients, "sampling failed: fewer clients available than requested");
            return Vec::new();
        }
        available.shuffle(&mut *self.rng.lock());
        available.truncate(num_clients);
        available
    }

    fn all(&self) -> Vec<ClientProxy> { self.clients.lock().iter().cloned().collect() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(n: usize, seed: u64) -> SimpleClientManager {
        let cm = SimpleClientManager::with_seed(seed);
        for i in 0..n { cm.register(ClientProxy::new(format!("c{i}"))); }
        cm
    }

    #[test]
    fn samples_distinct_clients() {
        let cm = manager(5, 1);
        let picked = cm.sample(3, 2);
        assert_eq!(picked.len(), 3);
        let unique: BTreeSet<_> = picked.iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn refuses_when_below_minimum() {
        let cm = manager(2, 1);
        assert!(cm.sample(2, 3).is_empty());
        assert!(cm.sample(4, 1).is_empty());
    }

    #[test]
    fn same_seed_same_sample() {
        assert_eq!(manager(10, 7).sample(4, 1), manager(10, 7).sample(4, 1));
    }

    #[test]
    fn unregister_removes() {
        let cm = manager(2, 0);
        assert!(cm.unregister(&ClientProxy::new("c0")));
        assert_eq!(cm.num_available(), 1);
    }
}
