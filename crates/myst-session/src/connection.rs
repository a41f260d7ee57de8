//! Connection State Machine
//!
//! ```text
//!            request_connect            core: Connected
//! NotConnected ──────────────▶ Connecting ──────────────▶ Connected
//!      ▲                          │  │                        │
//!      │     connect failed       │  │ request_disconnect     │ request_disconnect
//!      ├──────────────────────────┘  └───────────┐            │ or core: Disconnecting
//!      │                                         ▼            ▼
//!      └────────────────────────────────────── Disconnecting ◀┘
//!                cancel done / core: NotConnected
//! ```
//!
//! [`ConnectionStateMachine`] holds the pure transitions and returns the
//! events each transition produces. [`ConnectionController`] drives the
//! node calls with deadlines and publishes those events.

use crate::events::{EventBus, SessionEvent};
use crate::node::{
    with_timeout, ConnectTarget, CoreConnectionStatus, CoreError, CoreRef, CoreSignal,
};
use crate::statistics::ConnectionStatistic;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Connection state visible to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Connecting or Connected
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl From<CoreConnectionStatus> for ConnectionState {
    fn from(status: CoreConnectionStatus) -> Self {
        match status {
            CoreConnectionStatus::NotConnected => ConnectionState::NotConnected,
            CoreConnectionStatus::Connecting => ConnectionState::Connecting,
            CoreConnectionStatus::Connected => ConnectionState::Connected,
            CoreConnectionStatus::Disconnecting => ConnectionState::Disconnecting,
        }
    }
}

/// Connect errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectError {
    #[error("Cannot connect while {0:?}")]
    InvalidState(ConnectionState),

    #[error("Connection failed: {0}")]
    Core(#[from] CoreError),
}

/// Cancel errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CancelError {
    #[error("Cannot disconnect while {0:?}")]
    InvalidState(ConnectionState),

    #[error("Disconnect failed: {0}")]
    Core(#[from] CoreError),
}

#[derive(Debug, Clone, Copy)]
struct PendingDisconnect {
    user_initiated: bool,
    previous: ConnectionState,
}

/// Pure connection state machine
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    /// Incremented for each connect cycle; stale completions are ignored
    attempt: u64,
    target: Option<ConnectTarget>,
    disconnect: Option<PendingDisconnect>,
    /// Node has reported Connecting/Connected during this attempt
    core_active: bool,
    statistics: Option<ConnectionStatistic>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::NotConnected,
            attempt: 0,
            target: None,
            disconnect: None,
            core_active: false,
            statistics: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn target(&self) -> Option<&ConnectTarget> {
        self.target.as_ref()
    }

    pub fn statistics(&self) -> Option<&ConnectionStatistic> {
        self.statistics.as_ref()
    }

    /// NotConnected -> Connecting. Returns the attempt number.
    pub fn begin_connect(
        &mut self,
        target: ConnectTarget,
    ) -> Result<(u64, Vec<SessionEvent>), ConnectError> {
        if self.state != ConnectionState::NotConnected {
            return Err(ConnectError::InvalidState(self.state));
        }
        self.attempt += 1;
        self.target = Some(target);
        self.core_active = false;
        self.disconnect = None;

        Ok((self.attempt, vec![self.set(ConnectionState::Connecting)]))
    }

    /// `create_connection` returned Ok for `attempt`
    ///
    /// From here on a NotConnected signal is a loss, not a leftover.
    pub fn connect_accepted(&mut self, attempt: u64) {
        if attempt == self.attempt && self.state == ConnectionState::Connecting {
            self.core_active = true;
        }
    }

    /// `create_connection` failed for `attempt`
    pub fn connect_failed(
        &mut self,
        attempt: u64,
        target: &ConnectTarget,
        reason: String,
    ) -> Vec<SessionEvent> {
        if attempt != self.attempt || self.state != ConnectionState::Connecting {
            debug!("Ignoring stale connect failure for attempt {}", attempt);
            return Vec::new();
        }
        vec![
            self.set(ConnectionState::NotConnected),
            SessionEvent::ConnectFailed {
                target: target.clone(),
                reason,
            },
        ]
    }

    /// Connecting/Connected -> Disconnecting. Returns the attempt number.
    pub fn begin_disconnect(
        &mut self,
        user_initiated: bool,
    ) -> Result<(u64, Vec<SessionEvent>), CancelError> {
        if !self.state.is_active() {
            return Err(CancelError::InvalidState(self.state));
        }
        self.disconnect = Some(PendingDisconnect {
            user_initiated,
            previous: self.state,
        });

        Ok((self.attempt, vec![self.set(ConnectionState::Disconnecting)]))
    }

    /// `cancel_connection` succeeded for `attempt`
    pub fn disconnect_completed(&mut self, attempt: u64) -> Vec<SessionEvent> {
        if attempt != self.attempt || self.state != ConnectionState::Disconnecting {
            return Vec::new();
        }
        self.finish_disconnect()
    }

    /// `cancel_connection` failed for `attempt`; restore the prior state
    pub fn disconnect_failed(&mut self, attempt: u64, reason: String) -> Vec<SessionEvent> {
        if attempt != self.attempt || self.state != ConnectionState::Disconnecting {
            return Vec::new();
        }
        let previous = self
            .disconnect
            .take()
            .map(|d| d.previous)
            .unwrap_or(ConnectionState::Connected);

        vec![self.set(previous), SessionEvent::DisconnectFailed { reason }]
    }

    /// Status signal from the node
    pub fn on_core_status(&mut self, status: CoreConnectionStatus) -> Vec<SessionEvent> {
        use self::ConnectionState as S;
        use crate::node::CoreConnectionStatus as C;

        match (self.state, status) {
            (S::Connecting, C::Connecting) => {
                self.core_active = true;
                Vec::new()
            }
            (S::Connecting, C::Connected) => {
                self.core_active = true;
                vec![self.set(S::Connected)]
            }
            (S::Connecting, C::NotConnected | C::Disconnecting) if !self.core_active => {
                // Left over from the previous cycle
                debug!("Ignoring {:?} before node picked up attempt {}", status, self.attempt);
                Vec::new()
            }
            (S::Connecting | S::Connected, C::Disconnecting) => {
                self.disconnect = Some(PendingDisconnect {
                    user_initiated: false,
                    previous: self.state,
                });
                vec![self.set(S::Disconnecting)]
            }
            (S::Connecting | S::Connected, C::NotConnected) => {
                warn!("Connection lost");
                vec![self.set(S::NotConnected), SessionEvent::ConnectionLost]
            }
            (S::Disconnecting, C::NotConnected) => self.finish_disconnect(),
            (state, status) => {
                debug!("Ignoring node status {:?} while {:?}", status, state);
                Vec::new()
            }
        }
    }

    /// Statistics tick; kept only while Connected
    pub fn on_statistics(&mut self, statistics: ConnectionStatistic) -> Vec<SessionEvent> {
        if !self.state.is_connected() {
            debug!("Dropping statistics while {:?}", self.state);
            return Vec::new();
        }
        self.statistics = Some(statistics.clone());
        vec![SessionEvent::StatisticsUpdated(statistics)]
    }

    /// Adopt the node's current status (e.g. after resume), without loss reports
    pub fn sync(&mut self, status: CoreConnectionStatus) -> Vec<SessionEvent> {
        let next = ConnectionState::from(status);
        if next == self.state {
            return Vec::new();
        }
        if next.is_active() && !self.state.is_active() {
            self.attempt += 1;
        }
        self.core_active = next.is_active();
        self.disconnect = None;
        vec![self.set(next)]
    }

    fn finish_disconnect(&mut self) -> Vec<SessionEvent> {
        let user_initiated = self
            .disconnect
            .take()
            .map(|d| d.user_initiated)
            .unwrap_or(false);

        let outcome = if user_initiated {
            SessionEvent::UserDisconnected
        } else {
            warn!("Connection lost");
            SessionEvent::ConnectionLost
        };
        vec![self.set(ConnectionState::NotConnected), outcome]
    }

    fn set(&mut self, to: ConnectionState) -> SessionEvent {
        let from = self.state;
        self.state = to;

        if from.is_connected() && !to.is_connected() {
            self.statistics = None;
        }
        if to == ConnectionState::NotConnected {
            self.target = None;
            self.core_active = false;
        }
        debug!("Connection state {:?} -> {:?}", from, to);
        SessionEvent::StateChanged { from, to }
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Deadlines for node calls made by the controller
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTimeouts {
    pub connect: Duration,
    pub cancel: Duration,
    pub query: Duration,
}

/// Drives the state machine against a bound core
///
/// The machine lock is never held across a node call; user requests and
/// node signals are applied one at a time under it.
pub struct ConnectionController {
    core: CoreRef,
    consumer_id: String,
    timeouts: ConnectionTimeouts,
    machine: Mutex<ConnectionStateMachine>,
    state_tx: watch::Sender<ConnectionState>,
    events: EventBus,
}

impl ConnectionController {
    pub fn new(
        core: CoreRef,
        consumer_id: impl Into<String>,
        timeouts: ConnectionTimeouts,
        events: EventBus,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::NotConnected);
        Self {
            core,
            consumer_id: consumer_id.into(),
            timeouts,
            machine: Mutex::new(ConnectionStateMachine::new()),
            state_tx,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub async fn statistics(&self) -> Option<ConnectionStatistic> {
        self.machine.lock().await.statistics().cloned()
    }

    pub async fn target(&self) -> Option<ConnectTarget> {
        self.machine.lock().await.target().cloned()
    }

    /// Start a connection to `target`
    ///
    /// Returns once the node accepted the request; Connected is reached when
    /// the node signals it.
    pub async fn request_connect(&self, target: ConnectTarget) -> Result<(), ConnectError> {
        let attempt = {
            let mut machine = self.machine.lock().await;
            let (attempt, events) = machine.begin_connect(target.clone())?;
            self.publish(&machine, events);
            attempt
        };

        info!("Connecting to {} (attempt {})", target, attempt);
        let result = with_timeout(
            self.timeouts.connect,
            self.core.create_connection(&self.consumer_id, &target),
        )
        .await;

        match result {
            Ok(()) => {
                debug!("Node accepted connection to {}", target);
                self.machine.lock().await.connect_accepted(attempt);
                Ok(())
            }
            Err(e) => {
                error!("Connection to {} failed: {}", target, e);
                if matches!(e, CoreError::Timeout(_)) {
                    // The node may still be dialing
                    if let Err(cancel) =
                        with_timeout(self.timeouts.cancel, self.core.cancel_connection()).await
                    {
                        warn!("Cancel after connect timeout failed: {}", cancel);
                    }
                }
                let mut machine = self.machine.lock().await;
                let events = machine.connect_failed(attempt, &target, e.to_string());
                self.publish(&machine, events);
                Err(ConnectError::Core(e))
            }
        }
    }

    /// Tear down the current connection
    ///
    /// `user_initiated` decides whether completion is reported as
    /// `UserDisconnected` or `ConnectionLost`.
    pub async fn request_disconnect(&self, user_initiated: bool) -> Result<(), CancelError> {
        let attempt = {
            let mut machine = self.machine.lock().await;
            let (attempt, events) = machine.begin_disconnect(user_initiated)?;
            self.publish(&machine, events);
            attempt
        };

        info!("Disconnecting (user initiated: {})", user_initiated);
        let result = with_timeout(self.timeouts.cancel, self.core.cancel_connection()).await;

        let mut machine = self.machine.lock().await;
        match result {
            Ok(()) => {
                let events = machine.disconnect_completed(attempt);
                self.publish(&machine, events);
                Ok(())
            }
            Err(e) => {
                error!("Disconnect failed: {}", e);
                let events = machine.disconnect_failed(attempt, e.to_string());
                self.publish(&machine, events);
                Err(CancelError::Core(e))
            }
        }
    }

    /// Apply a signal pushed by the node
    pub async fn on_signal(&self, signal: CoreSignal) {
        let mut machine = self.machine.lock().await;
        let events = match signal {
            CoreSignal::Status(status) => machine.on_core_status(status),
            CoreSignal::Statistics(statistics) => machine.on_statistics(statistics),
        };
        self.publish(&machine, events);
    }

    /// Query the node's status and adopt it
    pub async fn sync_status(&self) -> Result<ConnectionState, CoreError> {
        let status = with_timeout(self.timeouts.query, self.core.connection_status()).await?;

        let mut machine = self.machine.lock().await;
        let events = machine.sync(status);
        self.publish(&machine, events);
        Ok(machine.state())
    }

    fn publish(&self, machine: &ConnectionStateMachine, events: Vec<SessionEvent>) {
        if events.is_empty() {
            return;
        }
        self.state_tx.send_replace(machine.state());
        self.events.emit_all(events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ConnectOutcome, SimulatedNode};
    use std::sync::Arc;
    use tokio::sync::{broadcast, mpsc};

    fn target() -> ConnectTarget {
        ConnectTarget::new("0xprovider", "wireguard")
    }

    fn states(events: &[SessionEvent]) -> Vec<ConnectionState> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    fn connected_machine() -> ConnectionStateMachine {
        let mut machine = ConnectionStateMachine::new();
        machine.begin_connect(target()).unwrap();
        machine.on_core_status(CoreConnectionStatus::Connected);
        machine
    }

    #[test]
    fn test_state_helpers() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::Connecting.is_active());
        assert!(!ConnectionState::Disconnecting.is_active());
    }

    #[test]
    fn test_connect_then_core_connected() {
        let mut machine = ConnectionStateMachine::new();

        let (attempt, events) = machine.begin_connect(target()).unwrap();
        assert_eq!(attempt, 1);
        assert_eq!(states(&events), vec![ConnectionState::Connecting]);

        let events = machine.on_core_status(CoreConnectionStatus::Connecting);
        assert!(events.is_empty());

        let events = machine.on_core_status(CoreConnectionStatus::Connected);
        assert_eq!(states(&events), vec![ConnectionState::Connected]);

        // Repeated signal does not re-enter Connected
        assert!(machine.on_core_status(CoreConnectionStatus::Connected).is_empty());
    }

    #[test]
    fn test_connect_only_from_not_connected() {
        let mut machine = connected_machine();
        let result = machine.begin_connect(target());
        assert_eq!(
            result.unwrap_err(),
            ConnectError::InvalidState(ConnectionState::Connected)
        );
    }

    #[test]
    fn test_connect_failure_reverts() {
        let mut machine = ConnectionStateMachine::new();
        let (attempt, _) = machine.begin_connect(target()).unwrap();

        let events = machine.connect_failed(attempt, &target(), "no route".to_string());

        assert_eq!(machine.state(), ConnectionState::NotConnected);
        assert_eq!(states(&events), vec![ConnectionState::NotConnected]);
        assert!(matches!(events[1], SessionEvent::ConnectFailed { .. }));
    }

    #[test]
    fn test_stale_connect_failure_is_ignored() {
        let mut machine = ConnectionStateMachine::new();
        let (first, _) = machine.begin_connect(target()).unwrap();
        machine.begin_disconnect(true).unwrap();
        machine.disconnect_completed(first);
        machine.begin_connect(target()).unwrap();

        let events = machine.connect_failed(first, &target(), "late".to_string());

        assert!(events.is_empty());
        assert_eq!(machine.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_disconnect_only_when_active() {
        let mut machine = ConnectionStateMachine::new();
        assert_eq!(
            machine.begin_disconnect(true).unwrap_err(),
            CancelError::InvalidState(ConnectionState::NotConnected)
        );
    }

    #[test]
    fn test_user_disconnect() {
        let mut machine = connected_machine();

        let (attempt, events) = machine.begin_disconnect(true).unwrap();
        assert_eq!(states(&events), vec![ConnectionState::Disconnecting]);

        let events = machine.disconnect_completed(attempt);
        assert_eq!(states(&events), vec![ConnectionState::NotConnected]);
        assert_eq!(events[1], SessionEvent::UserDisconnected);
    }

    #[test]
    fn test_external_disconnect_reports_loss() {
        let mut machine = connected_machine();

        let (attempt, _) = machine.begin_disconnect(false).unwrap();
        let events = machine.disconnect_completed(attempt);

        assert_eq!(events[1], SessionEvent::ConnectionLost);
    }

    #[test]
    fn test_disconnect_failure_restores_state() {
        let mut machine = connected_machine();
        let (attempt, _) = machine.begin_disconnect(true).unwrap();

        let events = machine.disconnect_failed(attempt, "busy".to_string());

        assert_eq!(machine.state(), ConnectionState::Connected);
        assert!(matches!(events[1], SessionEvent::DisconnectFailed { .. }));
    }

    #[test]
    fn test_unsolicited_not_connected() {
        let mut machine = connected_machine();

        let events = machine.on_core_status(CoreConnectionStatus::NotConnected);

        assert_eq!(states(&events), vec![ConnectionState::NotConnected]);
        assert_eq!(events[1], SessionEvent::ConnectionLost);
    }

    #[test]
    fn test_unsolicited_disconnecting_then_not_connected() {
        let mut machine = connected_machine();

        machine.on_core_status(CoreConnectionStatus::Disconnecting);
        assert_eq!(machine.state(), ConnectionState::Disconnecting);

        let events = machine.on_core_status(CoreConnectionStatus::NotConnected);
        assert_eq!(events[1], SessionEvent::ConnectionLost);
    }

    #[test]
    fn test_core_completes_user_disconnect() {
        let mut machine = connected_machine();
        let (attempt, _) = machine.begin_disconnect(true).unwrap();

        let events = machine.on_core_status(CoreConnectionStatus::NotConnected);
        assert_eq!(events[1], SessionEvent::UserDisconnected);

        // Cancel returning afterwards is a no-op
        assert!(machine.disconnect_completed(attempt).is_empty());
    }

    #[test]
    fn test_stale_not_connected_while_connecting() {
        let mut machine = ConnectionStateMachine::new();
        machine.begin_connect(target()).unwrap();

        let events = machine.on_core_status(CoreConnectionStatus::NotConnected);

        assert!(events.is_empty());
        assert_eq!(machine.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_not_connected_after_accept_is_a_loss() {
        let mut machine = ConnectionStateMachine::new();
        let (attempt, _) = machine.begin_connect(target()).unwrap();

        machine.connect_accepted(attempt);
        let events = machine.on_core_status(CoreConnectionStatus::NotConnected);

        assert_eq!(states(&events), vec![ConnectionState::NotConnected]);
        assert!(events.contains(&SessionEvent::ConnectionLost));
    }

    #[test]
    fn test_stale_accept_is_ignored() {
        let mut machine = ConnectionStateMachine::new();
        let (first, _) = machine.begin_connect(target()).unwrap();
        machine.connect_failed(first, &target(), "rejected".to_string());
        machine.begin_connect(target()).unwrap();

        machine.connect_accepted(first);

        assert!(machine.on_core_status(CoreConnectionStatus::NotConnected).is_empty());
        assert_eq!(machine.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_statistics_only_while_connected() {
        let mut machine = ConnectionStateMachine::new();
        let tick = ConnectionStatistic {
            bytes_sent: 10,
            ..ConnectionStatistic::default()
        };

        assert!(machine.on_statistics(tick.clone()).is_empty());

        machine.begin_connect(target()).unwrap();
        machine.on_core_status(CoreConnectionStatus::Connected);
        assert_eq!(machine.on_statistics(tick.clone()).len(), 1);
        assert_eq!(machine.statistics(), Some(&tick));

        machine.on_core_status(CoreConnectionStatus::NotConnected);
        assert!(machine.statistics().is_none());
    }

    #[test]
    fn test_sync_adopts_status() {
        let mut machine = ConnectionStateMachine::new();

        let events = machine.sync(CoreConnectionStatus::Connected);

        assert_eq!(states(&events), vec![ConnectionState::Connected]);
        assert!(!events.contains(&SessionEvent::ConnectionLost));
        assert!(machine.sync(CoreConnectionStatus::Connected).is_empty());
    }

    // Controller against the simulated node

    fn timeouts() -> ConnectionTimeouts {
        ConnectionTimeouts {
            connect: Duration::from_millis(200),
            cancel: Duration::from_millis(200),
            query: Duration::from_millis(200),
        }
    }

    async fn controller(node: &Arc<SimulatedNode>) -> (Arc<ConnectionController>, EventBus) {
        let events = EventBus::new(64);
        let core: CoreRef = node.clone();
        let controller = Arc::new(ConnectionController::new(
            core.clone(),
            "0xAA",
            timeouts(),
            events.clone(),
        ));

        let (tx, mut rx) = mpsc::channel(64);
        core.subscribe_connection_status(tx.clone()).await.unwrap();
        core.subscribe_statistics(tx).await.unwrap();

        let pump = controller.clone();
        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                pump.on_signal(signal).await;
            }
        });
        (controller, events)
    }

    async fn next_state(rx: &mut broadcast::Receiver<SessionEvent>) -> ConnectionState {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("no event")
                .unwrap();
            if let SessionEvent::StateChanged { to, .. } = event {
                return to;
            }
        }
    }

    #[tokio::test]
    async fn test_controller_connect_success() {
        let node = Arc::new(SimulatedNode::new());
        let (controller, events) = controller(&node).await;
        let mut rx = events.subscribe();

        controller.request_connect(target()).await.unwrap();

        assert_eq!(next_state(&mut rx).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut rx).await, ConnectionState::Connected);
        assert_eq!(controller.state(), ConnectionState::Connected);
        assert_eq!(controller.target().await, Some(target()));
    }

    #[tokio::test]
    async fn test_controller_accepted_then_dropped() {
        let node = Arc::new(SimulatedNode::new());
        node.set_connect_outcome(ConnectOutcome::AcceptOnly);
        let (controller, events) = controller(&node).await;
        let mut rx = events.subscribe();

        controller.request_connect(target()).await.unwrap();
        assert_eq!(next_state(&mut rx).await, ConnectionState::Connecting);

        node.emit_status(CoreConnectionStatus::NotConnected);

        assert_eq!(next_state(&mut rx).await, ConnectionState::NotConnected);
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap(),
            SessionEvent::ConnectionLost
        );
        assert_eq!(controller.state(), ConnectionState::NotConnected);
    }

    #[tokio::test]
    async fn test_controller_connect_rejected() {
        let node = Arc::new(SimulatedNode::new());
        node.set_connect_outcome(ConnectOutcome::Fail("provider offline".to_string()));
        let (controller, events) = controller(&node).await;
        let mut rx = events.subscribe();

        let result = controller.request_connect(target()).await;

        assert!(matches!(result, Err(ConnectError::Core(CoreError::Rejected(_)))));
        assert_eq!(next_state(&mut rx).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut rx).await, ConnectionState::NotConnected);
        assert_eq!(controller.state(), ConnectionState::NotConnected);
    }

    #[tokio::test]
    async fn test_controller_connect_timeout_cancels() {
        let node = Arc::new(SimulatedNode::new());
        node.set_connect_outcome(ConnectOutcome::Hang);
        let (controller, _events) = controller(&node).await;

        let result = controller.request_connect(target()).await;

        assert!(matches!(result, Err(ConnectError::Core(CoreError::Timeout(_)))));
        assert_eq!(controller.state(), ConnectionState::NotConnected);
        assert_eq!(node.cancel_calls(), 1);
    }

    #[tokio::test]
    async fn test_controller_disconnect_failure() {
        let node = Arc::new(SimulatedNode::new());
        let (controller, events) = controller(&node).await;
        let mut rx = events.subscribe();

        controller.request_connect(target()).await.unwrap();
        next_state(&mut rx).await;
        next_state(&mut rx).await;

        node.fail_cancel(Some("node busy".to_string()));
        let result = controller.request_disconnect(true).await;

        assert!(matches!(result, Err(CancelError::Core(_))));
        assert_eq!(controller.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_controller_sync_status() {
        let node = Arc::new(SimulatedNode::new());
        node.set_status(CoreConnectionStatus::Connected);
        let (controller, _events) = controller(&node).await;

        let state = controller.sync_status().await.unwrap();

        assert_eq!(state, ConnectionState::Connected);
        assert!(controller.watch_state().borrow().is_connected());
    }
}
