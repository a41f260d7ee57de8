//! Identity Loader
//!
//! Resolves the consumer identity and its registration status from the
//! node. The loader only queries; the coordinator owns the result.

use crate::node::{with_timeout, CoreError, CoreRef, NodeIdentity};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Registration lifecycle of an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Unregistered,
    InProgress,
    Registered,
    Failed,
}

impl RegistrationStatus {
    /// Parse the status string reported by the node
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "unregistered" => Ok(Self::Unregistered),
            "inprogress" | "in_progress" => Ok(Self::InProgress),
            "registered" => Ok(Self::Registered),
            "registrationerror" | "failed" => Ok(Self::Failed),
            _ => Err(IdentityError::QueryFailed(format!(
                "unknown registration status '{}'",
                raw
            ))),
        }
    }

    /// Check if the identity can pay for sessions
    pub fn is_registered(&self) -> bool {
        matches!(self, Self::Registered)
    }

    /// Check if a step of the lifecycle is allowed
    pub fn can_transition_to(&self, next: RegistrationStatus) -> bool {
        use self::RegistrationStatus::*;
        matches!(
            (self, next),
            (Unregistered, InProgress)
                | (InProgress, Registered)
                | (InProgress, Failed)
                | (Failed, InProgress)
        ) || *self == next
    }
}

/// Consumer identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub address: String,
    pub channel_address: String,
    pub registration_status: RegistrationStatus,
}

impl Identity {
    fn from_node(node: NodeIdentity) -> Result<Self, IdentityError> {
        let registration_status = RegistrationStatus::parse(&node.registration_status)?;
        Ok(Self {
            address: node.address,
            channel_address: node.channel_address,
            registration_status,
        })
    }

    /// Apply a newer status for the same identity
    ///
    /// The node is authoritative, so a status that skips a lifecycle step
    /// is still applied.
    pub fn update_status(&mut self, next: RegistrationStatus) {
        if !self.registration_status.can_transition_to(next) {
            debug!(
                "Identity {} status jumped {:?} -> {:?}",
                self.address, self.registration_status, next
            );
        }
        self.registration_status = next;
    }
}

/// Identity errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IdentityError {
    #[error("Identity query failed: {0}")]
    QueryFailed(String),

    #[error("Identity {} registration failed", .0.address)]
    RegistrationFailed(Identity),
}

impl From<CoreError> for IdentityError {
    fn from(e: CoreError) -> Self {
        IdentityError::QueryFailed(e.to_string())
    }
}

/// Identity loader
#[derive(Debug, Clone)]
pub struct IdentityLoader {
    query_timeout: Duration,
}

impl IdentityLoader {
    pub fn new(query_timeout: Duration) -> Self {
        Self { query_timeout }
    }

    /// Query the identity and its registration status
    ///
    /// Repeated calls re-query the node and may observe a newer status.
    pub async fn load(&self, core: &CoreRef) -> Result<Identity, IdentityError> {
        let node = with_timeout(self.query_timeout, core.identity()).await?;
        let identity = Identity::from_node(node)?;

        if identity.registration_status == RegistrationStatus::Failed {
            warn!("Identity {} registration failed", identity.address);
            return Err(IdentityError::RegistrationFailed(identity));
        }

        info!(
            "Loaded identity {} ({:?})",
            identity.address, identity.registration_status
        );
        Ok(identity)
    }
}
