//! Notifications emitted by the triad store.
//!
//! Delivered over a `tokio::sync::broadcast` channel. Every event that
//! reports a mutation is sent only after the mutation is durable.

use serde::{Deserialize, Serialize};

use crate::matrix::triad::Triad;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum MatrixEvent {
    /// Persisted state finished loading; the store accepts operations.
    Initialized,
    /// A triad was created locally.
    TriadCreated(Triad),
    /// A local validation attempt updated a triad.
    TriadValidated(Triad),
    /// A triad received from a peer was stored.
    TriadImported(Triad),
    /// A peer's validation result was applied to a local triad.
    ValidationImported(Triad),
    /// Initialization failed. The store stays unusable.
    Error(String),
}

impl MatrixEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::TriadCreated(_) => "triadCreated",
            Self::TriadValidated(_) => "triadValidated",
            Self::TriadImported(_) => "triadImported",
            Self::ValidationImported(_) => "validationImported",
            Self::Error(_) => "error",
        }
    }
}
