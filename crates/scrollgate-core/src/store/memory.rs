//! In-memory collaborators.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    BalanceStore, PreferenceStore, ProfileChangeCallback, SubscriptionId, SubscriptionUpdate,
    UserProfileStore,
};
use crate::types::{UserEntitlement, UserId};

/// Entitlement records held in memory. Also serves as the ledger's balance store.
#[derive(Default)]
pub struct MemoryProfileStore {
    records: RwLock<HashMap<UserId, UserEntitlement>>,
    subscribers: RwLock<HashMap<UserId, Vec<(SubscriptionId, ProfileChangeCallback)>>>,
    next_subscription: AtomicU64,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with records
    pub fn with_users(users: impl IntoIterator<Item = UserEntitlement>) -> Self {
        Self {
            records: RwLock::new(users.into_iter().map(|u| (u.user_id.clone(), u)).collect()),
            ..Self::default()
        }
    }

    /// Registered change callbacks across all users
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.values().map(Vec::len).sum()
    }

    pub async fn insert(&self, entitlement: UserEntitlement) {
        self.records
            .write()
            .await
            .insert(entitlement.user_id.clone(), entitlement);
    }

    /// Apply an external subscription event and notify subscribers
    pub async fn apply_subscription_update(
        &self,
        user_id: &UserId,
        update: &SubscriptionUpdate,
    ) -> UserEntitlement {
        let updated = {
            let mut records = self.records.write().await;
            let record = records
                .entry(user_id.clone())
                .or_insert_with(|| UserEntitlement::free(user_id.clone()));
            update.apply(record);
            record.clone()
        };
        info!("Applied subscription update for {}", user_id);

        let callbacks: Vec<ProfileChangeCallback> = self
            .subscribers
            .read()
            .await
            .get(user_id)
            .map(|subs| subs.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback(&updated);
        }
        updated
    }
}

#[async_trait]
impl UserProfileStore for MemoryProfileStore {
    async fn load_entitlement(&self, user_id: &UserId) -> Result<UserEntitlement> {
        let now = chrono::Utc::now().timestamp();
        match self.records.read().await.get(user_id) {
            Some(record) => Ok(record.clone().normalized(now)),
            None => {
                debug!("No entitlement record for {}, treating as free tier", user_id);
                Ok(UserEntitlement::free(user_id.clone()))
            }
        }
    }

    async fn subscribe_to_changes(
        &self,
        user_id: &UserId,
        callback: ProfileChangeCallback,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .await
            .entry(user_id.clone())
            .or_default()
            .push((id, callback));
        id
    }

    async fn unsubscribe(&self, user_id: &UserId, subscription: SubscriptionId) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(subs) = subscribers.get_mut(user_id) {
            subs.retain(|(id, _)| *id != subscription);
            if subs.is_empty() {
                subscribers.remove(user_id);
            }
        }
    }
}

#[async_trait]
impl BalanceStore for MemoryProfileStore {
    async fn load_balance(&self, user_id: &UserId) -> Result<u64> {
        Ok(self
            .records
            .read()
            .await
            .get(user_id)
            .map(|r| r.credit_balance)
            .unwrap_or(0))
    }

    async fn store_balance(&self, user_id: &UserId, balance: u64) -> Result<()> {
        self.records
            .write()
            .await
            .entry(user_id.clone())
            .or_insert_with(|| UserEntitlement::free(user_id.clone()))
            .credit_balance = balance;
        Ok(())
    }
}

/// Per-user key/value flags held in memory
#[derive(Default)]
pub struct MemoryPreferenceStore {
    values: RwLock<HashMap<(UserId, String), String>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreferenceStore for MemoryPreferenceStore {
    async fn get(&self, user_id: &UserId, key: &str) -> Result<Option<String>> {
        Ok(self
            .values
            .read()
            .await
            .get(&(user_id.clone(), key.to_string()))
            .cloned())
    }

    async fn set(&self, user_id: &UserId, key: &str, value: &str) -> Result<()> {
        self.values
            .write()
            .await
            .insert((user_id.clone(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn remove(&self, user_id: &UserId, key: &str) -> Result<bool> {
        Ok(self
            .values
            .write()
            .await
            .remove(&(user_id.clone(), key.to_string()))
            .is_some())
    }
}
