//! Core Handle
//!
//! The calling contract of the external VPN/payment node, plus the
//! deferred binding that becomes ready once the node service is bound.
//!
//! # Usage
//!
//! ```rust,ignore
//! let binding = CoreBinding::new();
//!
//! // Service connection callback:
//! binding.complete(Arc::new(node));
//!
//! // Anywhere else:
//! let core = binding.await_ready(Duration::from_secs(30)).await?;
//! let identity = core.identity().await?;
//! ```

use crate::statistics::ConnectionStatistic;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Shared reference to a bound core
pub type CoreRef = Arc<dyn CoreHandle>;

/// Identity as reported by the node, before status parsing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub address: String,
    pub channel_address: String,
    pub registration_status: String,
}

/// Provider to connect to (opaque proposal reference)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectTarget {
    pub provider_id: String,
    pub service_type: String,
}

impl ConnectTarget {
    pub fn new(provider_id: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            service_type: service_type.into(),
        }
    }

    /// Stable key for this provider offer, e.g. for the favourites list
    pub fn key(&self) -> String {
        format!("{}{}", self.provider_id, self.service_type)
    }
}

impl std::fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.service_type)
    }
}

/// Connection status as reported by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoreConnectionStatus {
    NotConnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Balance push from the node
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceUpdate {
    /// Identity the balance belongs to
    pub identity_address: String,
    pub amount: f64,
}

/// Unsolicited connection signals from the node
#[derive(Debug, Clone, PartialEq)]
pub enum CoreSignal {
    /// Periodic statistics while a connection is up
    Statistics(ConnectionStatistic),
    /// Connection status change
    Status(CoreConnectionStatus),
}

/// Calling contract of the external node
///
/// All calls may fail with [`CoreError::Unavailable`] if the node is not
/// running. Callers obtain a handle through [`CoreBinding::await_ready`].
#[async_trait]
pub trait CoreHandle: Send + Sync {
    /// Resolve (or create) the consumer identity
    async fn identity(&self) -> Result<NodeIdentity, CoreError>;

    async fn create_connection(
        &self,
        consumer_id: &str,
        target: &ConnectTarget,
    ) -> Result<(), CoreError>;

    async fn cancel_connection(&self) -> Result<(), CoreError>;

    /// Current connection status, used to resync after resume
    async fn connection_status(&self) -> Result<CoreConnectionStatus, CoreError>;

    async fn balance(&self, identity_address: &str) -> Result<f64, CoreError>;

    /// Value of one token in `currency`
    async fn exchange_rate(&self, currency: &str) -> Result<f64, CoreError>;

    /// Balance converted to wallet units
    async fn wallet_equivalent(&self, balance: f64) -> Result<f64, CoreError>;

    /// Public IP address as seen from outside, through the tunnel when connected
    async fn public_ip(&self) -> Result<String, CoreError>;

    async fn subscribe_balance(&self, sink: mpsc::Sender<BalanceUpdate>) -> Result<(), CoreError>;

    async fn subscribe_statistics(&self, sink: mpsc::Sender<CoreSignal>) -> Result<(), CoreError>;

    async fn subscribe_connection_status(
        &self,
        sink: mpsc::Sender<CoreSignal>,
    ) -> Result<(), CoreError>;
}

/// Core errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("Core not bound")]
    Unavailable,

    #[error("Core not ready after {0:?}")]
    ReadyTimeout(Duration),

    #[error("Core request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Core rejected request: {0}")]
    Rejected(String),
}

/// Run a core call with a deadline
pub(crate) async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, CoreError>
where
    F: Future<Output = Result<T, CoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::Timeout(limit)),
    }
}

/// Deferred core binding
///
/// Completed at most once, when the node service is bound. Cloning shares
/// the same slot.
#[derive(Clone)]
pub struct CoreBinding {
    slot: Arc<watch::Sender<Option<CoreRef>>>,
}

impl CoreBinding {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Bind the core. Returns `false` if a core was already bound.
    pub fn complete(&self, core: CoreRef) -> bool {
        let bound = self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(core);
            true
        });

        if bound {
            info!("Core service bound");
        } else {
            warn!("Core service already bound, ignoring second bind");
        }
        bound
    }

    pub fn is_ready(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Get the core without waiting
    pub fn try_get(&self) -> Result<CoreRef, CoreError> {
        self.slot.borrow().clone().ok_or(CoreError::Unavailable)
    }

    /// Wait until the core is bound, up to `limit`
    pub async fn await_ready(&self, limit: Duration) -> Result<CoreRef, CoreError> {
        let mut rx = self.slot.subscribe();
        debug!("Waiting up to {:?} for core service", limit);

        match tokio::time::timeout(limit, rx.wait_for(|slot| slot.is_some())).await {
            Ok(Ok(slot)) => (*slot).clone().ok_or(CoreError::Unavailable),
            Ok(Err(_)) => Err(CoreError::Unavailable),
            Err(_) => {
                warn!("Core service not bound after {:?}", limit);
                Err(CoreError::ReadyTimeout(limit))
            }
        }
    }
}

impl Default for CoreBinding {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedNode;

    #[test]
    fn test_target_key() {
        let target = ConnectTarget::new("0xprovider", "wireguard");
        assert_eq!(target.key(), "0xproviderwireguard");
        assert_eq!(target.to_string(), "0xprovider/wireguard");
    }

    #[test]
    fn test_unbound_core_is_unavailable() {
        let binding = CoreBinding::new();

        assert!(!binding.is_ready());
        assert!(matches!(binding.try_get(), Err(CoreError::Unavailable)));
    }

    #[test]
    fn test_complete_at_most_once() {
        let binding = CoreBinding::new();

        assert!(binding.complete(Arc::new(SimulatedNode::new())));
        assert!(!binding.complete(Arc::new(SimulatedNode::new())));
        assert!(binding.is_ready());
    }

    #[tokio::test]
    async fn test_await_ready_after_bind() {
        let binding = CoreBinding::new();
        let waiter = binding.clone();

        let handle =
            tokio::spawn(async move { waiter.await_ready(Duration::from_secs(5)).await.is_ok() });

        tokio::time::sleep(Duration::from_millis(20)).await;
        binding.complete(Arc::new(SimulatedNode::new()));

        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_await_ready_already_bound() {
        let binding = CoreBinding::new();
        binding.complete(Arc::new(SimulatedNode::new()));

        assert!(binding.await_ready(Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_await_ready_timeout() {
        let binding = CoreBinding::new();
        let result = binding.await_ready(Duration::from_millis(20)).await;

        assert!(matches!(result, Err(CoreError::ReadyTimeout(_))));
    }

    #[tokio::test]
    async fn test_with_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, CoreError>(())
        };
        let result = with_timeout(Duration::from_millis(10), slow).await;

        assert_eq!(result, Err(CoreError::Timeout(Duration::from_millis(10))));
    }
}
