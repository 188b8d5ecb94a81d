//! ============================================================================
//! Store Module - External collaborator interfaces
//! ============================================================================
//! The core never performs I/O itself. Entitlement records, credit balances
//! and per-user preference flags are reached through these traits:
//!
//! - `UserProfileStore`: entitlement loads + pushed subscription changes
//! - `BalanceStore`: the persistence behind the credit ledger
//! - `PreferenceStore`: per-user key/value flags (dismissed prompts, opened scrolls)
//!
//! `MemoryProfileStore` / `MemoryPreferenceStore` back tests and embedding
//! hosts; `GateDb` (redb) is the on-disk implementation.
//! ============================================================================

mod memory;

pub use memory::{MemoryPreferenceStore, MemoryProfileStore};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::access::TierId;
use crate::types::{Subscription, UserEntitlement, UserId};

/// Invoked with the updated entitlement after an external subscription event
pub type ProfileChangeCallback = Arc<dyn Fn(&UserEntitlement) + Send + Sync>;

/// Returned by `subscribe_to_changes`; pass it back to `unsubscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

#[async_trait]
pub trait UserProfileStore: Send + Sync {
    /// Load a user's entitlement. Users without a record are free-tier with no credits.
    async fn load_entitlement(&self, user_id: &UserId) -> Result<UserEntitlement>;

    /// Register a callback for externally pushed tier/pass/subscription changes
    async fn subscribe_to_changes(
        &self,
        user_id: &UserId,
        callback: ProfileChangeCallback,
    ) -> SubscriptionId;

    /// Drop a callback. Unknown ids are ignored.
    async fn unsubscribe(&self, user_id: &UserId, subscription: SubscriptionId);
}

#[async_trait]
pub trait BalanceStore: Send + Sync {
    async fn load_balance(&self, user_id: &UserId) -> Result<u64>;

    async fn store_balance(&self, user_id: &UserId, balance: u64) -> Result<()>;
}

#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn get(&self, user_id: &UserId, key: &str) -> Result<Option<String>>;

    async fn set(&self, user_id: &UserId, key: &str, value: &str) -> Result<()>;

    /// Returns whether the key existed
    async fn remove(&self, user_id: &UserId, key: &str) -> Result<bool>;
}

/// Preference key marking a scroll as opened after a committed purchase
pub fn opened_key(content_id: &crate::types::ContentId) -> String {
    format!("scroll.opened.{}", content_id)
}

/// Preference key marking an upgrade prompt as dismissed
pub fn prompt_dismissed_key(content_id: &crate::types::ContentId) -> String {
    format!("scroll.prompt_dismissed.{}", content_id)
}

/// External subscription event (billing webhook). Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    #[serde(default)]
    pub tier: Option<TierId>,
    #[serde(default)]
    pub pass_owned: Option<bool>,
    #[serde(default)]
    pub subscription: Option<Subscription>,
}

impl SubscriptionUpdate {
    pub fn is_empty(&self) -> bool {
        self.tier.is_none() && self.pass_owned.is_none() && self.subscription.is_none()
    }

    /// Apply to an entitlement. Credits are never touched.
    pub fn apply(&self, entitlement: &mut UserEntitlement) {
        if let Some(tier) = &self.tier {
            entitlement.tier = tier.clone();
        }
        if let Some(pass) = self.pass_owned {
            entitlement.pass_owned = pass;
        }
        if let Some(subscription) = &self.subscription {
            entitlement.subscription = subscription.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubscriptionStatus;

    #[test]
    fn test_update_leaves_credits_alone() {
        let mut user = UserEntitlement::free("u1").with_credits(40);
        let update = SubscriptionUpdate {
            tier: Some(TierId::new("pro")),
            pass_owned: None,
            subscription: Some(Subscription::active_until(100)),
        };
        update.apply(&mut user);

        assert_eq!(user.tier, TierId::new("pro"));
        assert_eq!(user.credit_balance, 40);
        assert!(!user.pass_owned);
        assert_eq!(user.subscription.status, SubscriptionStatus::Active);
    }

    #[test]
    fn test_empty_update() {
        assert!(SubscriptionUpdate::default().is_empty());
        let parsed: SubscriptionUpdate = serde_json::from_str(r#"{"pass_owned": true}"#).unwrap();
        assert!(!parsed.is_empty());
        assert_eq!(parsed.pass_owned, Some(true));
    }
}
