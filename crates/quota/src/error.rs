//! Quota error types

use clipvault_shared::Feature;
use thiserror::Error;

/// Errors produced by the quota subsystem
///
/// Business outcomes (a denied charge) and infrastructure faults (a
/// database timeout) are distinct variants: a denial must never be
/// retried into success, and a storage fault must never read as a
/// denial.
#[derive(Error, Debug)]
pub enum QuotaError {
    #[error("{feature} quota exceeded: {current_usage} of {limit} used this period")]
    QuotaExceeded {
        feature: Feature,
        current_usage: i64,
        limit: i64,
    },

    #[error("clip too large: {words} words exceeds the {limit}-word limit")]
    ClipTooLarge { words: i64, limit: i64 },

    #[error("Database error: {0}")]
    Database(String),

    #[error("No subscription found for billing customer: {0}")]
    UnknownSubscriptionReference(String),

    #[error("Invalid subscription state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Invalid subscription tier value: {0}")]
    InvalidTier(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Unsupported billing event payload: {0}")]
    UnsupportedEvent(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for QuotaError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

pub type QuotaResult<T> = Result<T, QuotaError>;
