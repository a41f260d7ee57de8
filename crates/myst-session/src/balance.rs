//! Balance Tracker
//!
//! Keeps the latest balance of one identity. Pushes from the node and
//! explicit refreshes both overwrite the cached snapshot.
//!
//! # Ordering
//!
//! Every push is an unconditional overwrite keyed by arrival. A push that
//! arrives late wins even if the node produced it before the current value;
//! snapshots are not compared by `as_of`.

use crate::node::{with_timeout, BalanceUpdate, CoreError, CoreRef};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pushes buffered before the node is back-pressured
const PUSH_CAPACITY: usize = 64;

/// Balance of an identity at a point in time
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceSnapshot {
    pub identity_address: String,
    pub amount: f64,
    pub currency: String,
    pub as_of: SystemTime,
}

/// Balance errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BalanceError {
    #[error("Balance query failed: {0}")]
    QueryFailed(String),

    #[error("Balance subscription failed: {0}")]
    SubscribeFailed(CoreError),

    #[error("Balance subscription already started")]
    AlreadyStarted,
}

/// Balance tracker bound to a single identity
pub struct BalanceTracker {
    identity_address: String,
    currency: String,
    query_timeout: Duration,
    latest: Arc<watch::Sender<Option<BalanceSnapshot>>>,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BalanceTracker {
    pub fn new(
        identity_address: impl Into<String>,
        currency: impl Into<String>,
        query_timeout: Duration,
    ) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            identity_address: identity_address.into(),
            currency: currency.into(),
            query_timeout,
            latest: Arc::new(latest),
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub fn identity_address(&self) -> &str {
        &self.identity_address
    }

    /// Register the persistent balance subscription
    ///
    /// Every push for this identity replaces the cached snapshot and is then
    /// passed to `on_update`. Pushes for other identities are dropped.
    pub async fn start<F>(&self, core: &CoreRef, on_update: F) -> Result<(), BalanceError>
    where
        F: Fn(BalanceSnapshot) + Send + Sync + 'static,
    {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(BalanceError::AlreadyStarted);
        }

        let (tx, mut rx) = mpsc::channel::<BalanceUpdate>(PUSH_CAPACITY);
        if let Err(e) = core.subscribe_balance(tx).await {
            warn!("Balance subscription for {} failed: {}", self.identity_address, e);
            self.started.store(false, Ordering::Release);
            return Err(BalanceError::SubscribeFailed(e));
        }

        let latest = self.latest.clone();
        let address = self.identity_address.clone();
        let currency = self.currency.clone();

        let handle = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if update.identity_address != address {
                    debug!(
                        "Dropping balance push for {} (tracking {})",
                        update.identity_address, address
                    );
                    continue;
                }
                let snapshot = record(&latest, &address, &currency, update.amount);
                on_update(snapshot);
            }
            debug!("Balance subscription for {} closed", address);
        });

        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        info!("Balance subscription armed for {}", self.identity_address);
        Ok(())
    }

    /// Latest snapshot, if any. Never blocks on the node.
    pub fn cached(&self) -> Option<BalanceSnapshot> {
        self.latest.borrow().clone()
    }

    /// Read-only view of the latest snapshot
    pub fn watch(&self) -> watch::Receiver<Option<BalanceSnapshot>> {
        self.latest.subscribe()
    }

    /// Pull the balance from the node and overwrite the cache
    pub async fn refresh_now(&self, core: &CoreRef) -> Result<BalanceSnapshot, BalanceError> {
        let amount = with_timeout(self.query_timeout, core.balance(&self.identity_address))
            .await
            .map_err(|e| BalanceError::QueryFailed(e.to_string()))?;

        debug!("Refreshed balance for {}: {}", self.identity_address, amount);
        Ok(record(
            &self.latest,
            &self.identity_address,
            &self.currency,
            amount,
        ))
    }

    /// Drop the subscription
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
            debug!("Balance subscription for {} stopped", self.identity_address);
        }
    }
}

impl Drop for BalanceTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn record(
    latest: &watch::Sender<Option<BalanceSnapshot>>,
    address: &str,
    currency: &str,
    amount: f64,
) -> BalanceSnapshot {
    let snapshot = BalanceSnapshot {
        identity_address: address.to_string(),
        amount,
        currency: currency.to_string(),
        as_of: SystemTime::now(),
    };
    latest.send_replace(Some(snapshot.clone()));
    snapshot
}
