//! Error taxonomy shared by the pipelines.
//!
//! Errors are classified by what the caller should do with them:
//! - Rejected: the input can never succeed (`Unrouted`, `Validation`)
//! - Transient: a provider or the store failed before any side effect
//! - NotFound: the referenced thing does not exist locally
//! - Forbidden: it exists but belongs to another user

use thiserror::Error;

use crate::billing::BillingError;
use crate::board::BoardError;
use crate::relay::RelayError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// No destination list is configured for the recipient address.
    #[error("no list registered for address {0}")]
    Unrouted(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The caller does not control the thing it tried to change.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("board provider error: {0}")]
    Board(#[from] BoardError),

    #[error("mail relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("billing provider error: {0}")]
    Billing(#[from] BillingError),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for BridgeError {
    /// Lookup and ownership failures keep their meaning; the rest is a
    /// storage fault.
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => BridgeError::NotFound(what),
            StoreError::Forbidden { address } => BridgeError::Forbidden(address),
            StoreError::Invalid(what) => BridgeError::Validation(what),
            other => BridgeError::Store(other),
        }
    }
}

impl BridgeError {
    /// Returns true if retrying the same request might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::Board(_) | BridgeError::Relay(_) | BridgeError::Billing(_)
        )
    }

    /// Returns true if the request itself is at fault.
    pub fn is_rejection(&self) -> bool {
        matches!(self, BridgeError::Unrouted(_) | BridgeError::Validation(_))
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
