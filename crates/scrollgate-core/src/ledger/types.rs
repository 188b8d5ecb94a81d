//! ============================================================================
//! Ledger Types - Reservation tokens, configuration and errors
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::types::UserId;

/// Default reservation hold before auto-release (2 minutes)
pub const DEFAULT_RESERVATION_TIMEOUT_SECS: u64 = 120;

/// Committed token ids remembered per user for idempotent commits
pub const MAX_SETTLED_TOKENS: usize = 256;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// How long a reservation holds funds before it is released automatically
    pub reservation_timeout: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            reservation_timeout: Duration::from_secs(DEFAULT_RESERVATION_TIMEOUT_SECS),
        }
    }
}

/// Handle to a credit hold. Returned by `reserve`, consumed by `commit`/`release`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationToken {
    id: Uuid,
    user_id: UserId,
    amount: u64,
}

impl ReservationToken {
    pub(crate) fn new(user_id: UserId, amount: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            amount,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }
}

/// Credit ledger failures. Returned as values, never panics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Insufficient credits for {user_id}: requested {requested}, available {available}")]
    InsufficientCredits {
        user_id: UserId,
        requested: u64,
        available: u64,
    },

    #[error("Reservation not found or expired: {0}")]
    TokenNotFound(Uuid),

    #[error("Reservation already committed: {0}")]
    AlreadyCommitted(Uuid),

    #[error("Balance store error: {0}")]
    Store(String),
}

/// Point-in-time view of one user's account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    /// Persisted balance
    pub balance: u64,
    /// Sum of outstanding holds
    pub held: u64,
    /// `balance - held`
    pub available: u64,
    pub outstanding_reservations: usize,
}
