//! Round driver: runs fit and evaluate rounds against a transport and keeps
//! the session's global parameters.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::client::Client;
use crate::client_manager::ClientManager;
use crate::error::{Error, Result};
use crate::parameters::Parameters;
use crate::protocol::{ClientProxy, Config, EvaluateIns, EvaluateResults, EvaluateFailures, Failure, FitIns, FitResults, FitFailures, Metrics, Scalar};
use crate::strategy::Strategy;

/// Moves round instructions to clients and collects what comes back.
pub trait Transport: Send {
    fn fit_round(&mut self, server_round: u64, instructions: Vec<(ClientProxy, FitIns)>) -> (FitResults, FitFailures);
    fn evaluate_round(&mut self, server_round: u64, instructions: Vec<(ClientProxy, EvaluateIns)>) -> (EvaluateResults, EvaluateFailures);
    fn get_parameters(&mut self, client: &ClientProxy) -> anyhow::Result<Parameters>;
}

/// In-process transport over boxed clients, for simulations and tests.
#[derive(Default)]
pub struct LocalTransport {
    clients: BTreeMap<ClientProxy, Box<dyn Client>>,
}

impl LocalTransport {
    pub fn new() -> Self { Self::default() }

    pub fn connect(&mut self, proxy: ClientProxy, client: Box<dyn Client>) { self.clients.insert(proxy, client); }

    pub fn proxies(&self) -> impl Iterator<Item = &ClientProxy> { self.clients.keys() }
}

impl Transport for LocalTransport {
    fn fit_round(&mut self, server_round: u64, instructions: Vec<(ClientProxy, FitIns)>) -> (FitResults, FitFailures) {
        let (mut results, mut failures) = (Vec::new(), Vec::new());
        for (proxy, ins) in instructions {
            match self.clients.get_mut(&proxy).map(|c| c.fit(&ins)) {
                Some(Ok(res)) => results.push((proxy, res)),
                Some(Err(e)) => {
                    warn!(round = server_round, cid = %proxy, error = %e, "client fit failed");
                    failures.push(Failure::Error(format!("client {proxy}: {e:#}")));
                }
                None => failures.push(Failure::Error(format!("client {proxy} is not connected"))),
            }
        }
        (results, failures)
    }

    fn evaluate_round(&mut self, server_round: u64, instructions: Vec<(ClientProxy, EvaluateIns)>) -> (EvaluateResults, EvaluateFailures) {
        let (mut results, mut failures) = (Vec::new(), Vec::new());
        for (proxy, ins) in instructions {
            match self.clients.get_mut(&proxy).map(|c| c.evaluate(&ins)) {
                Some(Ok(res)) => results.push((proxy, res)),
                Some(Err(e)) => {
                    warn!(round = server_round, cid = %proxy, error = %e, "client evaluate failed");
                    failures.push(Failure::Error(format!("client {proxy}: {e:#}")));
                }
                None => failures.push(Failure::Error(format!("client {proxy} is not connected"))),
            }
        }
        (results, failures)
    }

    fn get_parameters(&mut self, client: &ClientProxy) -> anyhow::Result<Parameters> {
        match self.clients.get_mut(client) {
            Some(c) => c.get_parameters(&Config::new()),
            None => anyhow::bail!("client {client} is not connected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RoundPhase {
    Idle,
    ConfiguringFit,
    AwaitingFitResults,
    AggregatingFit,
    ConfiguringEvaluate,
    AwaitingEvaluateResults,
    AggregatingEvaluate,
    Terminal,
}

/// Per-round record of a session.
#[derive(Debug, Clone, Serialize)]
pub struct History {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub losses_distributed: Vec<(u64, f64)>,
    pub losses_centralized: Vec<(u64, f64)>,
    pub metrics_distributed_fit: BTreeMap<String, Vec<(u64, Scalar)>>,
    pub metrics_distributed: BTreeMap<String, Vec<(u64, Scalar)>>,
    pub metrics_centralized: BTreeMap<String, Vec<(u64, Scalar)>>,
    /// Rounds that kept the previous global parameters.
    pub stale_rounds: Vec<u64>,
}

impl History {
    fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            started_at: Utc::now(),
            finished_at: None,
            losses_distributed: Vec::new(),
            losses_centralized: Vec::new(),
            metrics_distributed_fit: BTreeMap::new(),
            metrics_distributed: BTreeMap::new(),
            metrics_centralized: BTreeMap::new(),
            stale_rounds: Vec::new(),
        }
    }

    fn record(into: &mut BTreeMap<String, Vec<(u64, Scalar)>>, round: u64, metrics: Metrics) {
        for (k, v) in metrics { into.entry(k).or_default().push((round, v)); }
    }
}

pub struct Server {
    strategy: Box<dyn Strategy>,
    client_manager: Box<dyn ClientManager>,
    transport: Box<dyn Transport>,
    parameters: Parameters,
    phase: RoundPhase,
    next_round: u64,
}

impl Server {
    pub fn new(strategy: Box<dyn Strategy>, client_manager: Box<dyn ClientManager>, transport: Box<dyn Transport>) -> Self {
        Self { strategy, client_manager, transport, parameters: Parameters::default(), phase: RoundPhase::Idle, next_round: 1 }
    }

    pub fn phase(&self) -> RoundPhase { self.phase }
    pub fn parameters(&self) -> &Parameters { &self.parameters }

    fn enter(&mut self, phase: RoundPhase) {
        debug!(from = ?self.phase, to = ?phase, "round phase");
        self.phase = phase;
    }

    fn initialize(&mut self) -> Result<()> {
        if let Some(p) = self.strategy.initialize_parameters(self.client_manager.as_ref()) {
            info!("using initial parameters provided by strategy");
            self.parameters = p;
            return Ok(());
        }
        let Some(client) = self.client_manager.sample(1, 1).into_iter().next() else { return Err(Error::NoInitialParameters) };
        info!(cid = %client, "requesting initial parameters from one random client");
        self.parameters = self.transport.get_parameters(&client)?;
        Ok(())
    }

    /// Runs `num_rounds` rounds after a round-0 server-side evaluation.
    pub fn run(&mut self, num_rounds: u64) -> Result<History> {
        let mut history = History::new(Uuid::new_v4());
        let span = info_span!("session", session_id = %history.session_id);
        let _guard = span.enter();

        self.initialize()?;
        if let Some((loss, metrics)) = self.strategy.evaluate(0, &self.parameters)? {
            info!(loss, "initial parameters evaluated");
            history.losses_centralized.push((0, loss));
            History::record(&mut history.metrics_centralized, 0, metrics);
        }
        for _ in 0..num_rounds {
            let round = self.next_round;
            self.run_round(round, &mut history)?;
        }
        self.enter(RoundPhase::Terminal);
        history.finished_at = Some(Utc::now());
        info!(rounds = num_rounds, stale = history.stale_rounds.len(), "session finished");
        Ok(history)
    }

    /// One fit + evaluate round. Rounds must be driven in order starting at 1.
    pub fn run_round(&mut self, server_round: u64, history: &mut History) -> Result<()> {
        if server_round != self.next_round { return Err(Error::RoundOutOfSequence { expected: self.next_round, found: server_round }); }
        let span = info_span!("round", round = server_round);
        let _guard = span.enter();

        self.enter(RoundPhase::ConfiguringFit);
        let instructions = self.strategy.configure_fit(server_round, &self.parameters, self.client_manager.as_ref());
        if instructions.is_empty() {
            info!("no clients selected for fit, keeping current parameters");
            history.stale_rounds.push(server_round);
        } else {
            self.enter(RoundPhase::AwaitingFitResults);
            let (results, failures) = self.transport.fit_round(server_round, instructions);
            info!(results = results.len(), failures = failures.len(), "fit results received");
            self.enter(RoundPhase::AggregatingFit);
            let (parameters, metrics) = self.strategy.aggregate_fit(server_round, &results, &failures)?;
            match parameters {
                Some(p) => self.parameters = p,
                None => {
                    warn!("fit round produced no new parameters, keeping the previous ones");
                    history.stale_rounds.push(server_round);
                }
            }
            History::record(&mut history.metrics_distributed_fit, server_round, metrics);
        }

        if let Some((loss, metrics)) = self.strategy.evaluate(server_round, &self.parameters)? {
            history.losses_centralized.push((server_round, loss));
            History::record(&mut history.metrics_centralized, server_round, metrics);
        }

        self.enter(RoundPhase::ConfiguringEvaluate);
        let instructions = self.strategy.configure_evaluate(server_round, &self.parameters, self.client_manager.as_ref());
        if instructions.is_empty() {
            debug!("no clients selected for evaluation");
        } else {
            self.enter(RoundPhase::AwaitingEvaluateResults);
            let (results, failures) = self.transport.evaluate_round(server_round, instructions);
            self.enter(RoundPhase::AggregatingEvaluate);
            let (loss, metrics) = self.strategy.aggregate_evaluate(server_round, &results, &failures);
            if let Some(loss) = loss {
                info!(loss, "distributed evaluation");
                history.losses_distributed.push((server_round, loss));
            }
            History::record(&mut history.metrics_distributed, server_round, metrics);
        }

        self.next_round += 1;
        self.enter(RoundPhase::Idle);
        Ok(())
    }

    /// Starts a fresh history without running anything, for callers driving rounds one by one.
    pub fn begin(&mut self) -> Result<History> {
        self.initialize()?;
        Ok(History::new(Uuid::new_v4()))
    }
}
