//! Session events broadcast to observers.

use crate::balance::BalanceSnapshot;
use crate::connection::ConnectionState;
use crate::identity::Identity;
use crate::node::ConnectTarget;
use crate::statistics::ConnectionStatistic;
use tokio::sync::broadcast;

/// Events published by the session coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The node service has been bound
    CoreReady,
    /// Identity resolved with a usable registration status
    IdentityLoaded(Identity),
    /// Identity registration failed; a retry is possible
    RegistrationFailed(Identity),
    /// Balance, statistics and status subscriptions are live
    SubscriptionsArmed,
    /// Connection state transition
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Connection attempt failed
    ConnectFailed { target: ConnectTarget, reason: String },
    /// Connection dropped without the user asking for it
    ConnectionLost,
    /// User-requested disconnect completed
    UserDisconnected,
    /// Cancelling the connection failed; previous state restored
    DisconnectFailed { reason: String },
    BalanceChanged(BalanceSnapshot),
    StatisticsUpdated(ConnectionStatistic),
    /// Public IP changed (refreshed at arming, on Connected and on NotConnected)
    IpChanged(String),
}

/// What the user should be offered in response to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserNotice {
    /// Retry identity registration
    RetryRegistration,
    /// "Lost connection" notice
    ConnectionLost,
    /// "Choose another node" prompt
    ChooseAnotherNode,
    /// Disconnect did not go through
    RetryDisconnect,
    /// Device is offline; check the network before reconnecting
    NoNetwork,
}

impl SessionEvent {
    /// Map failure events to their user affordance.
    ///
    /// A lost or failed connection on a device without network is reported
    /// as [`UserNotice::NoNetwork`].
    pub fn notice(&self, network_available: bool) -> Option<UserNotice> {
        match self {
            SessionEvent::RegistrationFailed(_) => Some(UserNotice::RetryRegistration),
            SessionEvent::ConnectionLost | SessionEvent::ConnectFailed { .. }
                if !network_available =>
            {
                Some(UserNotice::NoNetwork)
            }
            SessionEvent::ConnectionLost => Some(UserNotice::ConnectionLost),
            SessionEvent::ConnectFailed { .. } => Some(UserNotice::ChooseAnotherNode),
            SessionEvent::DisconnectFailed { .. } => Some(UserNotice::RetryDisconnect),
            _ => None,
        }
    }
}

/// Broadcast bus owned by the coordinator; observers only receive.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Returns the number of receivers reached.
    pub fn emit(&self, event: SessionEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn emit_all(&self, events: Vec<SessionEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
