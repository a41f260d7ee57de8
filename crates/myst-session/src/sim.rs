//! Simulated node
//!
//! An in-process [`CoreHandle`] with scripted responses. Stands in for the
//! real node in tests and in the demo binary.
//!
//! Pushes (`push_balance`, `push_statistics`, `emit_status`) are delivered
//! with `try_send` to every live subscriber and return how many received
//! them; closed subscribers are pruned.

use crate::node::{
    BalanceUpdate, ConnectTarget, CoreConnectionStatus, CoreError, CoreHandle, CoreSignal,
    NodeIdentity,
};
use crate::statistics::ConnectionStatistic;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

/// How `create_connection` behaves
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectOutcome {
    /// Signal Connecting then Connected, and return Ok
    Connect,
    /// Return Ok without signalling; the test drives the status
    AcceptOnly,
    /// Reject with the given reason
    Fail(String),
    /// Never return
    Hang,
}

struct NodeState {
    identity: Result<NodeIdentity, String>,
    connect_outcome: ConnectOutcome,
    cancel_failure: Option<String>,
    status: CoreConnectionStatus,
    balances: HashMap<String, f64>,
    exchange_rates: HashMap<String, f64>,
    wallet_factor: f64,
    public_ip: Result<String, String>,
    signal_subscribe_failure: Option<String>,
    balance_sinks: Vec<mpsc::Sender<BalanceUpdate>>,
    statistics_sinks: Vec<mpsc::Sender<CoreSignal>>,
    status_sinks: Vec<mpsc::Sender<CoreSignal>>,
    identity_calls: usize,
    connect_calls: usize,
    cancel_calls: usize,
}

/// Scriptable in-process node
pub struct SimulatedNode {
    state: Mutex<NodeState>,
}

impl SimulatedNode {
    /// Node with a fresh registered identity
    pub fn new() -> Self {
        let identity = NodeIdentity {
            address: random_address(),
            channel_address: random_address(),
            registration_status: "Registered".to_string(),
        };
        let mut exchange_rates = HashMap::new();
        exchange_rates.insert("USD".to_string(), 0.35);

        Self {
            state: Mutex::new(NodeState {
                identity: Ok(identity),
                connect_outcome: ConnectOutcome::Connect,
                cancel_failure: None,
                status: CoreConnectionStatus::NotConnected,
                balances: HashMap::new(),
                exchange_rates,
                wallet_factor: 1.0,
                public_ip: Ok("192.0.2.10".to_string()),
                signal_subscribe_failure: None,
                balance_sinks: Vec::new(),
                statistics_sinks: Vec::new(),
                status_sinks: Vec::new(),
                identity_calls: 0,
                connect_calls: 0,
                cancel_calls: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Identity returned by subsequent queries
    pub fn set_identity(&self, identity: NodeIdentity) {
        self.lock().identity = Ok(identity);
    }

    /// Make identity queries fail until `set_identity` is called
    pub fn fail_identity(&self, reason: &str) {
        self.lock().identity = Err(reason.to_string());
    }

    /// Change only the registration status of the current identity
    pub fn set_registration_status(&self, status: &str) {
        if let Ok(identity) = self.lock().identity.as_mut() {
            identity.registration_status = status.to_string();
        }
    }

    pub fn set_connect_outcome(&self, outcome: ConnectOutcome) {
        self.lock().connect_outcome = outcome;
    }

    /// Make `cancel_connection` fail (`Some`) or succeed (`None`)
    pub fn fail_cancel(&self, reason: Option<String>) {
        self.lock().cancel_failure = reason;
    }

    /// Status returned by `connection_status`, without signalling
    pub fn set_status(&self, status: CoreConnectionStatus) {
        self.lock().status = status;
    }

    pub fn set_balance(&self, identity_address: &str, amount: f64) {
        self.lock()
            .balances
            .insert(identity_address.to_string(), amount);
    }

    pub fn set_exchange_rate(&self, currency: &str, rate: f64) {
        self.lock().exchange_rates.insert(currency.to_string(), rate);
    }

    pub fn set_wallet_factor(&self, factor: f64) {
        self.lock().wallet_factor = factor;
    }

    /// Address returned by subsequent `public_ip` calls
    pub fn set_public_ip(&self, ip: &str) {
        self.lock().public_ip = Ok(ip.to_string());
    }

    /// Make `public_ip` fail until `set_public_ip` is called
    pub fn fail_public_ip(&self, reason: &str) {
        self.lock().public_ip = Err(reason.to_string());
    }

    /// Make statistics and status subscriptions fail (`Some`) or succeed (`None`)
    pub fn fail_signal_subscriptions(&self, reason: Option<String>) {
        self.lock().signal_subscribe_failure = reason;
    }

    /// Push a balance change to subscribers
    pub fn push_balance(&self, identity_address: &str, amount: f64) -> usize {
        let mut state = self.lock();
        state
            .balances
            .insert(identity_address.to_string(), amount);
        let update = BalanceUpdate {
            identity_address: identity_address.to_string(),
            amount,
        };
        deliver(&mut state.balance_sinks, update)
    }

    /// Push a statistics tick to subscribers
    pub fn push_statistics(&self, statistics: ConnectionStatistic) -> usize {
        let mut state = self.lock();
        deliver(
            &mut state.statistics_sinks,
            CoreSignal::Statistics(statistics),
        )
    }

    /// Change status and signal it to subscribers
    pub fn emit_status(&self, status: CoreConnectionStatus) -> usize {
        let mut state = self.lock();
        state.status = status;
        deliver(&mut state.status_sinks, CoreSignal::Status(status))
    }

    pub fn identity_calls(&self) -> usize {
        self.lock().identity_calls
    }

    pub fn connect_calls(&self) -> usize {
        self.lock().connect_calls
    }

    pub fn cancel_calls(&self) -> usize {
        self.lock().cancel_calls
    }

    pub fn balance_subscribers(&self) -> usize {
        let mut state = self.lock();
        state.balance_sinks.retain(|sink| !sink.is_closed());
        state.balance_sinks.len()
    }
}

impl Default for SimulatedNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoreHandle for SimulatedNode {
    async fn identity(&self) -> Result<NodeIdentity, CoreError> {
        let mut state = self.lock();
        state.identity_calls += 1;
        state.identity.clone().map_err(CoreError::Rejected)
    }

    async fn create_connection(
        &self,
        consumer_id: &str,
        target: &ConnectTarget,
    ) -> Result<(), CoreError> {
        let outcome = {
            let mut state = self.lock();
            state.connect_calls += 1;
            state.connect_outcome.clone()
        };
        debug!("Simulated node: {} connecting to {}", consumer_id, target);

        match outcome {
            ConnectOutcome::Connect => {
                self.emit_status(CoreConnectionStatus::Connecting);
                self.emit_status(CoreConnectionStatus::Connected);
                Ok(())
            }
            ConnectOutcome::AcceptOnly => Ok(()),
            ConnectOutcome::Fail(reason) => Err(CoreError::Rejected(reason)),
            ConnectOutcome::Hang => std::future::pending().await,
        }
    }

    async fn cancel_connection(&self) -> Result<(), CoreError> {
        let failure = {
            let mut state = self.lock();
            state.cancel_calls += 1;
            state.cancel_failure.clone()
        };
        if let Some(reason) = failure {
            return Err(CoreError::Rejected(reason));
        }
        self.emit_status(CoreConnectionStatus::NotConnected);
        Ok(())
    }

    async fn connection_status(&self) -> Result<CoreConnectionStatus, CoreError> {
        Ok(self.lock().status)
    }

    async fn balance(&self, identity_address: &str) -> Result<f64, CoreError> {
        self.lock()
            .balances
            .get(identity_address)
            .copied()
            .ok_or_else(|| CoreError::Rejected(format!("no balance for {}", identity_address)))
    }

    async fn exchange_rate(&self, currency: &str) -> Result<f64, CoreError> {
        self.lock()
            .exchange_rates
            .get(currency)
            .copied()
            .ok_or_else(|| CoreError::Rejected(format!("no rate for {}", currency)))
    }

    async fn wallet_equivalent(&self, balance: f64) -> Result<f64, CoreError> {
        Ok(balance * self.lock().wallet_factor)
    }

    async fn public_ip(&self) -> Result<String, CoreError> {
        self.lock().public_ip.clone().map_err(CoreError::Rejected)
    }

    async fn subscribe_balance(&self, sink: mpsc::Sender<BalanceUpdate>) -> Result<(), CoreError> {
        self.lock().balance_sinks.push(sink);
        Ok(())
    }

    async fn subscribe_statistics(&self, sink: mpsc::Sender<CoreSignal>) -> Result<(), CoreError> {
        let mut state = self.lock();
        if let Some(reason) = state.signal_subscribe_failure.clone() {
            return Err(CoreError::Rejected(reason));
        }
        state.statistics_sinks.push(sink);
        Ok(())
    }

    async fn subscribe_connection_status(
        &self,
        sink: mpsc::Sender<CoreSignal>,
    ) -> Result<(), CoreError> {
        let mut state = self.lock();
        if let Some(reason) = state.signal_subscribe_failure.clone() {
            return Err(CoreError::Rejected(reason));
        }
        state.status_sinks.push(sink);
        Ok(())
    }
}

fn deliver<T: Clone>(sinks: &mut Vec<mpsc::Sender<T>>, item: T) -> usize {
    sinks.retain(|sink| !sink.is_closed());
    sinks
        .iter()
        .filter(|sink| sink.try_send(item.clone()).is_ok())
        .count()
}

fn random_address() -> String {
    let bytes: [u8; 20] = rand::random();
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("0x{}", hex)
}
