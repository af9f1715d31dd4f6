use thiserror::Error;

use crate::db::models::SubscriptionState;
use crate::db::StoreError;
use crate::graph::GraphError;

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("validation handshake for {resource} did not complete: {source}")]
    HandshakeTimeout {
        resource: String,
        #[source]
        source: GraphError,
    },

    #[error("subscription create for {resource} failed: {source}")]
    Create {
        resource: String,
        #[source]
        source: GraphError,
    },

    #[error("renewal of {id} failed (attempt {attempts}), will retry: {reason}")]
    RenewalTransient {
        id: String,
        attempts: u32,
        reason: String,
    },

    #[error("renewal of {id} failed permanently: {reason}")]
    RenewalPermanent { id: String, reason: String },

    #[error("renewal of {id} gave up after {attempts} attempts: {reason}")]
    RenewalExhausted {
        id: String,
        attempts: u32,
        reason: String,
    },

    #[error("subscription {id} already covers {resource}")]
    AlreadyActive { id: String, resource: String },

    #[error("a subscription for {resource} is already being created")]
    CreateInFlight { resource: String },

    #[error("subscription {0} is already being renewed")]
    RenewalInFlight(String),

    #[error("subscription {0} not found")]
    NotFound(String),

    #[error("subscription {id} cannot be renewed in state {state}")]
    NotRenewable { id: String, state: SubscriptionState },

    #[error("subscription {0} expired before it could be renewed")]
    Expired(String),

    #[error("invalid subscription request: {0}")]
    InvalidRequest(String),

    #[error("no notification url configured and none could be derived from the request")]
    MissingNotificationUrl,

    #[error("failed to generate client secret")]
    SecretGeneration,

    #[error("subscription task for {resource} did not finish: {reason}")]
    Interrupted { resource: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SubscriptionError {
    /// Outcomes that mean coverage for a resource is lost until someone acts.
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            Self::RenewalPermanent { .. } | Self::RenewalExhausted { .. } | Self::Expired(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("unknown subscription {0}")]
    UnknownSubscription(String),

    #[error("subscription {id} is {state}")]
    InactiveSubscription {
        id: String,
        state: SubscriptionState,
    },

    #[error("clientState mismatch for subscription {0}")]
    ClientStateMismatch(String),

    #[error("malformed notification: {0}")]
    Malformed(String),

    #[error("subscription lookup failed: {0}")]
    Store(String),
}
