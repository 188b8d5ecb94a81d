//! ============================================================================
//! Database Types - Serializable records for redb storage
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::UserEntitlement;

/// Entitlement record stored in the local database.
/// Holds the raw subscription state; expiry is applied when it is loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementRecord {
    pub entitlement: UserEntitlement,
    /// Unix seconds of the last write
    pub updated_at: i64,
}

impl EntitlementRecord {
    pub fn new(entitlement: UserEntitlement) -> Self {
        Self {
            entitlement,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Database statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbStats {
    pub total_users: usize,
    /// Users per tier id
    pub tier_counts: HashMap<String, usize>,
    pub pass_holders: usize,
    /// Subscriptions that are active right now
    pub active_subscriptions: usize,
    pub total_credits: u64,
    pub total_preferences: usize,
}
