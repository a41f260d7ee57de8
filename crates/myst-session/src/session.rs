//! Session Coordinator
//!
//! Sequences one app session against the node:
//!
//! 1. wait for the core binding (bounded by `ready_timeout`)
//! 2. load the identity; a failed registration can be retried without
//!    repeating step 1
//! 3. arm the balance, statistics and connection status subscriptions
//! 4. accept connect / disconnect requests
//!
//! # Usage
//!
//! ```rust,ignore
//! let binding = CoreBinding::new();
//! let session = SessionCoordinator::open(SessionConfig::default(), binding.clone())?;
//! let mut events = session.subscribe();
//!
//! // Elsewhere, once the node service is up:
//! binding.complete(node);
//!
//! session.start().await?;
//! session.connect(ConnectTarget::new("0xprovider", "wireguard")).await?;
//! ```

use crate::balance::{BalanceError, BalanceSnapshot, BalanceTracker};
use crate::config::{ConfigError, SessionConfig};
use crate::connection::{
    CancelError, ConnectError, ConnectionController, ConnectionState, ConnectionTimeouts,
};
use crate::events::{EventBus, SessionEvent, UserNotice};
use crate::identity::{Identity, IdentityError, IdentityLoader};
use crate::node::{with_timeout, ConnectTarget, CoreBinding, CoreError, CoreRef};
use crate::prefs::{
    BalanceNotices, Favourites, FilePreferences, MemoryPreferences, PreferenceStore, PrefsError,
};
use crate::statistics::ConnectionStatistic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Where the session is in its startup sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Not started
    Idle,
    /// Waiting for the node service to be bound
    AwaitingCore,
    /// Node service was not bound in time; `start` may be called again
    CoreUnavailable,
    LoadingIdentity,
    /// Registration failed; `retry_identity` is available
    RegistrationFailed,
    /// Identity query failed; `retry_identity` is available
    IdentityUnavailable,
    /// Subscriptions could not be armed; `retry_identity` is available
    ArmFailed,
    /// Subscriptions live, connection requests accepted
    Armed,
    ShutDown,
}

impl SessionPhase {
    pub fn can_start(&self) -> bool {
        matches!(self, SessionPhase::Idle | SessionPhase::CoreUnavailable)
    }

    pub fn can_retry_identity(&self) -> bool {
        matches!(
            self,
            SessionPhase::RegistrationFailed
                | SessionPhase::IdentityUnavailable
                | SessionPhase::ArmFailed
        )
    }
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Not allowed while session is {0:?}")]
    InvalidPhase(SessionPhase),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Balance error: {0}")]
    Balance(#[from] BalanceError),

    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Disconnect error: {0}")]
    Cancel(#[from] CancelError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Preferences error: {0}")]
    Prefs(#[from] PrefsError),
}

#[derive(Default)]
struct SessionInner {
    core: Option<CoreRef>,
    identity: Option<Identity>,
    balance: Option<Arc<BalanceTracker>>,
    connection: Option<Arc<ConnectionController>>,
    signal_pump: Option<JoinHandle<()>>,
    ip_watcher: Option<JoinHandle<()>>,
}

impl SessionInner {
    /// Drop subscriptions bound to the current identity
    fn disarm(&mut self) {
        if let Some(tracker) = self.balance.take() {
            tracker.stop();
        }
        if let Some(pump) = self.signal_pump.take() {
            pump.abort();
        }
        if let Some(watcher) = self.ip_watcher.take() {
            watcher.abort();
        }
        self.connection = None;
    }
}

/// Session coordinator
///
/// Owns the identity, the balance tracker and the connection controller.
/// Observers get read-only access through [`subscribe`](Self::subscribe)
/// and the `watch_*` receivers.
pub struct SessionCoordinator {
    config: SessionConfig,
    binding: CoreBinding,
    loader: IdentityLoader,
    events: EventBus,
    notices: BalanceNotices,
    favourites: Favourites,
    network_available: AtomicBool,
    public_ip: Arc<watch::Sender<Option<String>>>,
    phase: watch::Sender<SessionPhase>,
    inner: Mutex<SessionInner>,
}

impl SessionCoordinator {
    /// Create a coordinator with in-memory preference flags
    pub fn new(config: SessionConfig, binding: CoreBinding) -> Self {
        Self::with_preferences(config, binding, Arc::new(MemoryPreferences::new()))
    }

    /// Create a coordinator backed by the given preference store
    pub fn with_preferences(
        config: SessionConfig,
        binding: CoreBinding,
        store: Arc<dyn PreferenceStore>,
    ) -> Self {
        let (phase, _) = watch::channel(SessionPhase::Idle);
        let (public_ip, _) = watch::channel(None);
        Self {
            loader: IdentityLoader::new(config.query_timeout()),
            events: EventBus::new(config.event_capacity),
            notices: BalanceNotices::new(store.clone()),
            favourites: Favourites::new(store),
            network_available: AtomicBool::new(true),
            public_ip: Arc::new(public_ip),
            config,
            binding,
            phase,
            inner: Mutex::new(SessionInner::default()),
        }
    }

    /// Validate `config` and open the preference store it names
    pub fn open(config: SessionConfig, binding: CoreBinding) -> Result<Self, SessionError> {
        config.validate()?;
        let store: Arc<dyn PreferenceStore> = match &config.preferences_path {
            Some(path) => Arc::new(FilePreferences::open(path)?),
            None => Arc::new(MemoryPreferences::new()),
        };
        Ok(Self::with_preferences(config, binding, store))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn balance_notices(&self) -> &BalanceNotices {
        &self.notices
    }

    pub fn favourites(&self) -> &Favourites {
        &self.favourites
    }

    /// Record whether the device currently has network access
    pub fn set_network_available(&self, available: bool) {
        if self.network_available.swap(available, Ordering::AcqRel) != available {
            info!("Network {}", if available { "available" } else { "unavailable" });
        }
    }

    pub fn network_available(&self) -> bool {
        self.network_available.load(Ordering::Acquire)
    }

    /// User affordance for `event`, given the current network availability
    pub fn notice_for(&self, event: &SessionEvent) -> Option<UserNotice> {
        event.notice(self.network_available())
    }

    pub async fn identity(&self) -> Option<Identity> {
        self.inner.lock().await.identity.clone()
    }

    /// Run steps 1-4
    pub async fn start(&self) -> Result<Identity, SessionError> {
        self.transition(SessionPhase::can_start, SessionPhase::AwaitingCore)?;

        info!("Waiting for core service");
        let ready = tokio::select! {
            ready = self.binding.await_ready(self.config.ready_timeout()) => ready,
            _ = shut_down(self.phase.subscribe()) => {
                info!("Session shut down while waiting for core service");
                return Err(SessionError::InvalidPhase(SessionPhase::ShutDown));
            }
        };
        let core = match ready {
            Ok(core) => core,
            Err(e) => {
                error!("Core service unavailable: {}", e);
                self.advance(SessionPhase::AwaitingCore, SessionPhase::CoreUnavailable)?;
                return Err(e.into());
            }
        };
        self.advance(SessionPhase::AwaitingCore, SessionPhase::LoadingIdentity)?;

        self.inner.lock().await.core = Some(core.clone());
        self.events.emit(SessionEvent::CoreReady);

        self.load_and_arm(core).await
    }

    /// Re-run identity loading (and arming) on the already bound core
    pub async fn retry_identity(&self) -> Result<Identity, SessionError> {
        self.transition(
            SessionPhase::can_retry_identity,
            SessionPhase::LoadingIdentity,
        )?;

        let core = self.inner.lock().await.core.clone();
        match core {
            Some(core) => {
                info!("Retrying identity load");
                self.load_and_arm(core).await
            }
            None => {
                self.advance(
                    SessionPhase::LoadingIdentity,
                    SessionPhase::IdentityUnavailable,
                )?;
                Err(CoreError::Unavailable.into())
            }
        }
    }

    /// Expects `LoadingIdentity`. Phase changes happen under the `inner`
    /// lock, which `shutdown` also takes, so a shutdown is never overwritten.
    async fn load_and_arm(&self, core: CoreRef) -> Result<Identity, SessionError> {
        let loaded = self.loader.load(&core).await;

        let mut inner = self.inner.lock().await;
        let identity = match loaded {
            Ok(identity) => {
                self.expect_phase(SessionPhase::LoadingIdentity)?;
                adopt_identity(&mut inner, identity)
            }
            Err(IdentityError::RegistrationFailed(identity)) => {
                self.advance(
                    SessionPhase::LoadingIdentity,
                    SessionPhase::RegistrationFailed,
                )?;
                let identity = adopt_identity(&mut inner, identity);
                inner.disarm();
                self.events
                    .emit(SessionEvent::RegistrationFailed(identity.clone()));
                return Err(IdentityError::RegistrationFailed(identity).into());
            }
            Err(e) => {
                error!("Identity unavailable: {}", e);
                self.advance(
                    SessionPhase::LoadingIdentity,
                    SessionPhase::IdentityUnavailable,
                )?;
                return Err(e.into());
            }
        };
        self.events.emit(SessionEvent::IdentityLoaded(identity.clone()));

        if let Err(e) = self.arm(&mut inner, &core, &identity).await {
            error!("Arming subscriptions failed: {}", e);
            self.advance(SessionPhase::LoadingIdentity, SessionPhase::ArmFailed)?;
            return Err(e);
        }

        self.advance(SessionPhase::LoadingIdentity, SessionPhase::Armed)?;
        self.events.emit(SessionEvent::SubscriptionsArmed);
        info!("Session armed for {}", identity.address);
        Ok(identity)
    }

    async fn arm(
        &self,
        inner: &mut SessionInner,
        core: &CoreRef,
        identity: &Identity,
    ) -> Result<(), SessionError> {
        if inner.balance.is_none() {
            let tracker = Arc::new(BalanceTracker::new(
                identity.address.clone(),
                self.config.token_currency.clone(),
                self.config.query_timeout(),
            ));
            let events = self.events.clone();
            tracker
                .start(core, move |snapshot| {
                    events.emit(SessionEvent::BalanceChanged(snapshot));
                })
                .await?;
            inner.balance = Some(tracker);
        }

        if inner.connection.is_none() {
            let controller = Arc::new(ConnectionController::new(
                core.clone(),
                identity.address.clone(),
                self.timeouts(),
                self.events.clone(),
            ));

            // Statistics and status share one channel so they are applied in order
            let (tx, mut rx) = mpsc::channel(self.config.signal_capacity);
            core.subscribe_statistics(tx.clone()).await?;
            core.subscribe_connection_status(tx).await?;

            let pump = controller.clone();
            let handle = tokio::spawn(async move {
                while let Some(signal) = rx.recv().await {
                    pump.on_signal(signal).await;
                }
                debug!("Core signal channel closed");
            });

            inner.ip_watcher = Some(tokio::spawn(track_public_ip(
                core.clone(),
                controller.watch_state(),
                self.public_ip.clone(),
                self.events.clone(),
                self.config.query_timeout(),
            )));
            inner.connection = Some(controller);
            inner.signal_pump = Some(handle);
        }
        Ok(())
    }

    fn timeouts(&self) -> ConnectionTimeouts {
        ConnectionTimeouts {
            connect: self.config.connect_timeout(),
            cancel: self.config.cancel_timeout(),
            query: self.config.query_timeout(),
        }
    }

    fn transition(
        &self,
        allowed: impl Fn(&SessionPhase) -> bool,
        next: SessionPhase,
    ) -> Result<(), SessionError> {
        let mut rejected = None;
        self.phase.send_if_modified(|phase| {
            if allowed(&*phase) {
                *phase = next;
                true
            } else {
                rejected = Some(*phase);
                false
            }
        });
        match rejected {
            Some(phase) => Err(SessionError::InvalidPhase(phase)),
            None => Ok(()),
        }
    }

    fn advance(&self, from: SessionPhase, to: SessionPhase) -> Result<(), SessionError> {
        self.transition(|phase| *phase == from, to)
    }

    fn expect_phase(&self, expected: SessionPhase) -> Result<(), SessionError> {
        match self.phase() {
            phase if phase == expected => Ok(()),
            phase => Err(SessionError::InvalidPhase(phase)),
        }
    }

    async fn controller(&self) -> Result<Arc<ConnectionController>, SessionError> {
        let phase = self.phase();
        if phase != SessionPhase::Armed {
            return Err(SessionError::InvalidPhase(phase));
        }
        self.inner
            .lock()
            .await
            .connection
            .clone()
            .ok_or(SessionError::InvalidPhase(phase))
    }

    async fn core(&self) -> Result<CoreRef, SessionError> {
        Ok(self
            .inner
            .lock()
            .await
            .core
            .clone()
            .ok_or(CoreError::Unavailable)?)
    }

    /// Start a connection to `target`
    pub async fn connect(&self, target: ConnectTarget) -> Result<(), SessionError> {
        self.controller().await?.request_connect(target).await?;
        Ok(())
    }

    /// Tear down the current connection
    ///
    /// Pass `user_initiated = false` when the app itself drops the
    /// connection (e.g. network loss) so observers get `ConnectionLost`.
    pub async fn disconnect(&self, user_initiated: bool) -> Result<(), SessionError> {
        self.controller()
            .await?
            .request_disconnect(user_initiated)
            .await?;
        Ok(())
    }

    /// Adopt the node's connection status, e.g. when the app resumes
    pub async fn sync_connection_status(&self) -> Result<ConnectionState, SessionError> {
        Ok(self.controller().await?.sync_status().await?)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        match &self.inner.lock().await.connection {
            Some(controller) => controller.state(),
            None => ConnectionState::NotConnected,
        }
    }

    /// Read-only connection state; `None` until armed
    pub async fn watch_connection_state(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.inner
            .lock()
            .await
            .connection
            .as_ref()
            .map(|c| c.watch_state())
    }

    pub async fn statistics(&self) -> Option<ConnectionStatistic> {
        let controller = self.inner.lock().await.connection.clone();
        match controller {
            Some(controller) => controller.statistics().await,
            None => None,
        }
    }

    pub async fn cached_balance(&self) -> Option<BalanceSnapshot> {
        self.inner
            .lock()
            .await
            .balance
            .as_ref()
            .and_then(|t| t.cached())
    }

    /// Pull the balance now and publish it
    pub async fn refresh_balance(&self) -> Result<BalanceSnapshot, SessionError> {
        let (core, tracker) = {
            let inner = self.inner.lock().await;
            match (&inner.core, &inner.balance) {
                (Some(core), Some(tracker)) => (core.clone(), tracker.clone()),
                _ => return Err(SessionError::InvalidPhase(self.phase())),
            }
        };

        let snapshot = tracker.refresh_now(&core).await?;
        self.events
            .emit(SessionEvent::BalanceChanged(snapshot.clone()));
        Ok(snapshot)
    }

    /// Value of one token in the configured fiat currency
    pub async fn exchange_rate(&self) -> Result<f64, SessionError> {
        let core = self.core().await?;
        let rate = with_timeout(
            self.config.query_timeout(),
            core.exchange_rate(&self.config.fiat_currency),
        )
        .await?;
        Ok(rate)
    }

    /// Balance converted to wallet units
    pub async fn wallet_equivalent(&self, balance: f64) -> Result<f64, SessionError> {
        let core = self.core().await?;
        let amount =
            with_timeout(self.config.query_timeout(), core.wallet_equivalent(balance)).await?;
        Ok(amount)
    }

    /// Last known public IP
    pub fn public_ip(&self) -> Option<String> {
        self.public_ip.borrow().clone()
    }

    pub fn watch_public_ip(&self) -> watch::Receiver<Option<String>> {
        self.public_ip.subscribe()
    }

    /// Query the public IP now and publish it if it changed
    pub async fn refresh_public_ip(&self) -> Result<String, SessionError> {
        let core = self.core().await?;
        let ip = lookup_public_ip(
            &core,
            &self.public_ip,
            &self.events,
            self.config.query_timeout(),
        )
        .await?;
        Ok(ip)
    }

    /// Drop all subscriptions. The connection itself is left to the node.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        self.phase.send_replace(SessionPhase::ShutDown);
        inner.disarm();
        info!("Session shut down");
    }
}

async fn shut_down(mut phase: watch::Receiver<SessionPhase>) {
    let _ = phase.wait_for(|p| *p == SessionPhase::ShutDown).await;
}

async fn lookup_public_ip(
    core: &CoreRef,
    cell: &watch::Sender<Option<String>>,
    events: &EventBus,
    limit: Duration,
) -> Result<String, CoreError> {
    let ip = with_timeout(limit, core.public_ip()).await?;
    let changed = cell.send_if_modified(|current| {
        if current.as_deref() == Some(ip.as_str()) {
            return false;
        }
        *current = Some(ip.clone());
        true
    });
    if changed {
        debug!("Public IP is now {}", ip);
        events.emit(SessionEvent::IpChanged(ip.clone()));
    }
    Ok(ip)
}

/// Refresh the public IP once at arming, then whenever the connection
/// settles in Connected or NotConnected
async fn track_public_ip(
    core: CoreRef,
    mut state: watch::Receiver<ConnectionState>,
    cell: Arc<watch::Sender<Option<String>>>,
    events: EventBus,
    limit: Duration,
) {
    loop {
        if let Err(e) = lookup_public_ip(&core, &cell, &events, limit).await {
            warn!("Public IP lookup failed: {}", e);
        }
        loop {
            if state.changed().await.is_err() {
                return;
            }
            let current = *state.borrow_and_update();
            if matches!(
                current,
                ConnectionState::Connected | ConnectionState::NotConnected
            ) {
                break;
            }
        }
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        self.inner.get_mut().disarm();
    }
}

/// Store a freshly loaded identity
///
/// The same address only updates the registration status. A different
/// address replaces the identity and drops everything armed for the old one.
fn adopt_identity(inner: &mut SessionInner, loaded: Identity) -> Identity {
    if let Some(current) = inner.identity.as_mut() {
        if current.address == loaded.address {
            current.update_status(loaded.registration_status);
            return current.clone();
        }
        warn!(
            "Identity changed from {} to {}, re-arming",
            current.address, loaded.address
        );
        inner.disarm();
    }
    inner.identity = Some(loaded.clone());
    loaded
}
