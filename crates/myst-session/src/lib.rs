//! myst-session - Session, Identity and Connection Coordinator
//!
//! Sequences a VPN client session against an embedded node service:
//! waits for the node to be bound, resolves the consumer identity, arms
//! the balance and connection subscriptions, then drives connect and
//! disconnect requests through a single connection state machine.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     SessionCoordinator                        │
//! │                                                               │
//! │  ┌─────────────┐   ┌────────────────┐   ┌──────────────────┐  │
//! │  │ CoreBinding │──▶│ IdentityLoader │──▶│  BalanceTracker  │  │
//! │  │ (await 30s) │   │ (retryable)    │   │  (per identity)  │  │
//! │  └─────────────┘   └────────────────┘   └──────────────────┘  │
//! │                                                               │
//! │  ┌────────────────────────────┐      ┌─────────────────────┐  │
//! │  │   ConnectionController     │─────▶│      EventBus       │  │
//! │  │  (ConnectionStateMachine)  │      │    (broadcast)      │  │
//! │  └─────────────▲──────────────┘      └──────────┬──────────┘  │
//! └────────────────│────────────────────────────────│─────────────┘
//!                  │ status / statistics            ▼
//!          ┌───────┴────────┐                 UI observers
//!          │  Node service  │
//!          │  (CoreHandle)  │
//!          └────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - Identity is loaded only after the node is bound
//! - Balance pushes are applied only for the loaded identity
//! - Connected is reported once per connection cycle
//! - User disconnects are never reported as connection loss

mod balance;
mod config;
mod connection;
mod events;
mod identity;
mod node;
mod prefs;
mod session;
mod statistics;

pub mod sim;

pub use balance::{BalanceError, BalanceSnapshot, BalanceTracker};
pub use config::{ConfigError, SessionConfig};
pub use connection::{
    CancelError, ConnectError, ConnectionController, ConnectionState, ConnectionStateMachine,
    ConnectionTimeouts,
};
pub use events::{EventBus, SessionEvent, UserNotice};
pub use identity::{Identity, IdentityError, IdentityLoader, RegistrationStatus};
pub use node::{
    BalanceUpdate, ConnectTarget, CoreBinding, CoreConnectionStatus, CoreError, CoreHandle,
    CoreRef, CoreSignal, NodeIdentity,
};
pub use prefs::{
    BalanceNotices, Favourites, FilePreferences, MemoryPreferences, NoticeKey, PreferenceStore,
    PrefsError,
};
pub use session::{SessionCoordinator, SessionError, SessionPhase};
pub use statistics::{display_money, format_duration, ConnectionStatistic, DataSize};
