// ============================================================================
// GateDb — Embedded Database (redb)
// ============================================================================
// Persistent local storage for entitlement records and per-user preferences.
// Default path: ~/.scrollgate/scrollgate.redb (override via SCROLLGATE_DB_PATH)
// ============================================================================

pub mod types;

pub use types::{DbStats, EntitlementRecord};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::{debug, info, warn};

use crate::store::{
    BalanceStore, PreferenceStore, ProfileChangeCallback, SubscriptionId, SubscriptionUpdate,
    UserProfileStore,
};
use crate::types::{SubscriptionStatus, UserEntitlement, UserId};

/// Environment variable overriding the database location
pub const DB_PATH_ENV_VAR: &str = "SCROLLGATE_DB_PATH";

// Table definitions
const ENTITLEMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("entitlements");
const PREFERENCES: TableDefinition<&str, &[u8]> = TableDefinition::new("preferences");

fn preference_key(user_id: &UserId, key: &str) -> String {
    format!("{}\0{}", user_id, key)
}

/// Embedded database backing the gate's persistence collaborators
pub struct GateDb {
    db: Database,
    path: PathBuf,
    subscribers: RwLock<HashMap<UserId, Vec<(SubscriptionId, ProfileChangeCallback)>>>,
    next_subscription: AtomicU64,
}

impl GateDb {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses SCROLLGATE_DB_PATH or ~/.scrollgate/scrollgate.redb
    pub fn open(path: Option<&str>) -> Result<Self> {
        let db_path = if let Some(p) = path {
            PathBuf::from(p)
        } else if let Ok(env_path) = std::env::var(DB_PATH_ENV_VAR) {
            PathBuf::from(env_path)
        } else {
            let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
            let gate_dir = home.join(".scrollgate");
            std::fs::create_dir_all(&gate_dir)
                .map_err(|e| anyhow!("Failed to create .scrollgate directory: {}", e))?;
            gate_dir.join("scrollgate.redb")
        };

        info!("Opening database at: {}", db_path.display());

        let db = Database::create(&db_path)
            .map_err(|e| anyhow!("Failed to open database: {}", e))?;

        // Ensure tables exist by doing a write transaction
        let write_txn = db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let _ = write_txn
                .open_table(ENTITLEMENTS)
                .map_err(|e| anyhow!("Failed to create entitlements table: {}", e))?;
            let _ = write_txn
                .open_table(PREFERENCES)
                .map_err(|e| anyhow!("Failed to create preferences table: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit init: {}", e))?;

        info!("Database ready");

        Ok(Self {
            db,
            path: db_path,
            subscribers: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        })
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ========================================================================
    // Entitlement Operations
    // ========================================================================

    pub fn store_entitlement(&self, entitlement: &UserEntitlement) -> Result<()> {
        let record = EntitlementRecord::new(entitlement.clone());
        let value = bincode::serialize(&record)
            .map_err(|e| anyhow!("Failed to serialize entitlement: {}", e))?;

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn.open_table(ENTITLEMENTS)
                .map_err(|e| anyhow!("Failed to open entitlements table: {}", e))?;
            table.insert(entitlement.user_id.as_str(), value.as_slice())
                .map_err(|e| anyhow!("Failed to insert entitlement: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Stored entitlement: {}", entitlement.user_id);
        Ok(())
    }

    /// Raw stored record, without expiry applied
    pub fn get_entitlement(&self, user_id: &UserId) -> Result<Option<EntitlementRecord>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(ENTITLEMENTS)
            .map_err(|e| anyhow!("Failed to open entitlements table: {}", e))?;

        match table.get(user_id.as_str()).map_err(|e| anyhow!("Failed to get entitlement: {}", e))? {
            Some(value) => {
                let record: EntitlementRecord = bincode::deserialize(value.value())
                    .map_err(|e| anyhow!("Failed to deserialize entitlement: {}", e))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn list_entitlements(&self) -> Result<Vec<EntitlementRecord>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(ENTITLEMENTS)
            .map_err(|e| anyhow!("Failed to open entitlements table: {}", e))?;

        let mut results = Vec::new();
        let iter = table.range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate entitlements: {}", e))?;
        for entry in iter {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            let record: EntitlementRecord = bincode::deserialize(value.value())
                .map_err(|e| anyhow!("Failed to deserialize entitlement: {}", e))?;
            results.push(record);
        }
        Ok(results)
    }

    pub fn delete_entitlement(&self, user_id: &UserId) -> Result<bool> {
        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let removed;
        {
            let mut table = write_txn.open_table(ENTITLEMENTS)
                .map_err(|e| anyhow!("Failed to open entitlements table: {}", e))?;
            removed = table.remove(user_id.as_str())
                .map_err(|e| anyhow!("Failed to remove entitlement: {}", e))?
                .is_some();
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit delete: {}", e))?;

        if removed {
            debug!("Deleted entitlement: {}", user_id);
        }
        Ok(removed)
    }

    /// Read-modify-write a record in one transaction. A missing user starts as free tier.
    fn update_entitlement<F>(&self, user_id: &UserId, mutate: F) -> Result<UserEntitlement>
    where
        F: FnOnce(&mut UserEntitlement),
    {
        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let updated;
        {
            let mut table = write_txn.open_table(ENTITLEMENTS)
                .map_err(|e| anyhow!("Failed to open entitlements table: {}", e))?;
            let existing = table
                .get(user_id.as_str())
                .map_err(|e| anyhow!("Failed to get entitlement: {}", e))?
                .map(|v| v.value().to_vec());

            let mut entitlement = match existing {
                Some(bytes) => {
                    bincode::deserialize::<EntitlementRecord>(&bytes)
                        .map_err(|e| anyhow!("Failed to deserialize entitlement: {}", e))?
                        .entitlement
                }
                None => UserEntitlement::free(user_id.clone()),
            };
            mutate(&mut entitlement);

            let value = bincode::serialize(&EntitlementRecord::new(entitlement.clone()))
                .map_err(|e| anyhow!("Failed to serialize entitlement: {}", e))?;
            table.insert(user_id.as_str(), value.as_slice())
                .map_err(|e| anyhow!("Failed to insert entitlement: {}", e))?;
            updated = entitlement;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;
        Ok(updated)
    }

    /// Persist an external subscription event and notify change subscribers
    pub fn apply_subscription_update(
        &self,
        user_id: &UserId,
        update: &SubscriptionUpdate,
    ) -> Result<UserEntitlement> {
        let updated = self.update_entitlement(user_id, |e| update.apply(e))?;
        info!("Applied subscription update for {}", user_id);

        let normalized = updated.clone().normalized(chrono::Utc::now().timestamp());
        let callbacks: Vec<ProfileChangeCallback> = self
            .subscribers
            .read()
            .map_err(|_| anyhow!("Subscriber registry poisoned"))?
            .get(user_id)
            .map(|subs| subs.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback(&normalized);
        }
        Ok(updated)
    }

    // ========================================================================
    // Preference Operations
    // ========================================================================

    pub fn get_preference(&self, user_id: &UserId, key: &str) -> Result<Option<String>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(PREFERENCES)
            .map_err(|e| anyhow!("Failed to open preferences table: {}", e))?;

        let full_key = preference_key(user_id, key);
        match table.get(full_key.as_str()).map_err(|e| anyhow!("Failed to get preference: {}", e))? {
            Some(value) => {
                let text = String::from_utf8(value.value().to_vec())
                    .map_err(|e| anyhow!("Preference {} is not UTF-8: {}", key, e))?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }

    pub fn set_preference(&self, user_id: &UserId, key: &str, value: &str) -> Result<()> {
        let full_key = preference_key(user_id, key);
        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn.open_table(PREFERENCES)
                .map_err(|e| anyhow!("Failed to open preferences table: {}", e))?;
            table.insert(full_key.as_str(), value.as_bytes())
                .map_err(|e| anyhow!("Failed to insert preference: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Stored preference {} for {}", key, user_id);
        Ok(())
    }

    pub fn delete_preference(&self, user_id: &UserId, key: &str) -> Result<bool> {
        let full_key = preference_key(user_id, key);
        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let removed;
        {
            let mut table = write_txn.open_table(PREFERENCES)
                .map_err(|e| anyhow!("Failed to open preferences table: {}", e))?;
            removed = table.remove(full_key.as_str())
                .map_err(|e| anyhow!("Failed to remove preference: {}", e))?
                .is_some();
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit delete: {}", e))?;
        Ok(removed)
    }

    /// All preferences of one user as (key, value) pairs
    pub fn list_preferences(&self, user_id: &UserId) -> Result<Vec<(String, String)>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(PREFERENCES)
            .map_err(|e| anyhow!("Failed to open preferences table: {}", e))?;

        let start = format!("{}\0", user_id);
        let end = format!("{}\u{1}", user_id);
        let mut results = Vec::new();
        let iter = table.range::<&str>(start.as_str()..end.as_str())
            .map_err(|e| anyhow!("Failed to iterate preferences: {}", e))?;
        for entry in iter {
            let (key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            let name = key.value()[start.len()..].to_string();
            let text = String::from_utf8_lossy(value.value()).into_owned();
            results.push((name, text));
        }
        Ok(results)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> Result<DbStats> {
        let records = self.list_entitlements()?;
        let now = chrono::Utc::now().timestamp();

        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(PREFERENCES)
            .map_err(|e| anyhow!("Failed to open preferences table: {}", e))?;
        let preference_count = table.range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate preferences: {}", e))?
            .count();

        let mut tier_counts = HashMap::new();
        let mut pass_holders = 0;
        let mut active_subscriptions = 0;
        let mut total_credits: u64 = 0;
        for record in &records {
            let e = &record.entitlement;
            *tier_counts.entry(e.tier.to_string()).or_insert(0usize) += 1;
            if e.pass_owned {
                pass_holders += 1;
            }
            if e.subscription.effective_status(now) == SubscriptionStatus::Active {
                active_subscriptions += 1;
            }
            total_credits = total_credits.saturating_add(e.credit_balance);
        }

        Ok(DbStats {
            total_users: records.len(),
            tier_counts,
            pass_holders,
            active_subscriptions,
            total_credits,
            total_preferences: preference_count,
        })
    }
}

#[async_trait]
impl UserProfileStore for GateDb {
    async fn load_entitlement(&self, user_id: &UserId) -> Result<UserEntitlement> {
        let now = chrono::Utc::now().timestamp();
        match self.get_entitlement(user_id)? {
            Some(record) => Ok(record.entitlement.normalized(now)),
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
        match self.subscribers.write() {
            Ok(mut subscribers) => subscribers
                .entry(user_id.clone())
                .or_default()
                .push((id, callback)),
            Err(_) => warn!("Subscriber registry poisoned, dropping subscription for {}", user_id),
        }
        id
    }

    async fn unsubscribe(&self, user_id: &UserId, subscription: SubscriptionId) {
        match self.subscribers.write() {
            Ok(mut subscribers) => {
                if let Some(subs) = subscribers.get_mut(user_id) {
                    subs.retain(|(id, _)| *id != subscription);
                    if subs.is_empty() {
                        subscribers.remove(user_id);
                    }
                }
            }
            Err(_) => warn!("Subscriber registry poisoned, keeping subscription for {}", user_id),
        }
    }
}

#[async_trait]
impl BalanceStore for GateDb {
    async fn load_balance(&self, user_id: &UserId) -> Result<u64> {
        Ok(self
            .get_entitlement(user_id)?
            .map(|r| r.entitlement.credit_balance)
            .unwrap_or(0))
    }

    async fn store_balance(&self, user_id: &UserId, balance: u64) -> Result<()> {
        self.update_entitlement(user_id, |e| e.credit_balance = balance)?;
        Ok(())
    }
}

#[async_trait]
impl PreferenceStore for GateDb {
    async fn get(&self, user_id: &UserId, key: &str) -> Result<Option<String>> {
        self.get_preference(user_id, key)
    }

    async fn set(&self, user_id: &UserId, key: &str, value: &str) -> Result<()> {
        self.set_preference(user_id, key, value)
    }

    async fn remove(&self, user_id: &UserId, key: &str) -> Result<bool> {
        self.delete_preference(user_id, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::TierId;
    use crate::types::Subscription;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open_temp() -> (GateDb, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.redb");
        let db = GateDb::open(Some(path.to_str().unwrap())).unwrap();
        (db, dir)
    }

    #[test]
    fn test_entitlement_crud() {
        let (db, _dir) = open_temp();
        let user = UserEntitlement::free("u1").with_tier("pro").with_credits(25);

        db.store_entitlement(&user).unwrap();
        let record = db.get_entitlement(&UserId::new("u1")).unwrap().unwrap();
        assert_eq!(record.entitlement, user);

        assert_eq!(db.list_entitlements().unwrap().len(), 1);
        assert!(db.delete_entitlement(&UserId::new("u1")).unwrap());
        assert!(!db.delete_entitlement(&UserId::new("u1")).unwrap());
        assert!(db.get_entitlement(&UserId::new("u1")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_applies_expiry_and_defaults() {
        let (db, _dir) = open_temp();
        db.store_entitlement(
            &UserEntitlement::free("lapsed").with_subscription(Subscription::active_until(1)),
        )
        .unwrap();

        let lapsed = db.load_entitlement(&UserId::new("lapsed")).await.unwrap();
        assert_eq!(lapsed.subscription.status, SubscriptionStatus::Expired);

        // The stored record keeps the provider's status
        let raw = db.get_entitlement(&UserId::new("lapsed")).unwrap().unwrap();
        assert_eq!(raw.entitlement.subscription.status, SubscriptionStatus::Active);

        let ghost = db.load_entitlement(&UserId::new("ghost")).await.unwrap();
        assert_eq!(ghost, UserEntitlement::free("ghost"));
    }

    #[tokio::test]
    async fn test_balance_write_keeps_tier() {
        let (db, _dir) = open_temp();
        let user_id = UserId::new("u1");
        db.store_entitlement(&UserEntitlement::free("u1").with_tier("legacy").with_credits(50))
            .unwrap();

        db.store_balance(&user_id, 20).await.unwrap();
        let loaded = db.load_entitlement(&user_id).await.unwrap();
        assert_eq!(loaded.credit_balance, 20);
        assert_eq!(loaded.tier, TierId::new("legacy"));
        assert_eq!(db.load_balance(&UserId::new("nobody")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_subscription_update_notifies() {
        let (db, _dir) = open_temp();
        let user_id = UserId::new("u1");
        db.store_entitlement(&UserEntitlement::free("u1").with_credits(7)).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        db.subscribe_to_changes(
            &user_id,
            Arc::new(move |e: &UserEntitlement| {
                assert_eq!(e.tier, TierId::new("pro"));
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await;

        let update = SubscriptionUpdate {
            tier: Some(TierId::new("pro")),
            ..Default::default()
        };
        let updated = db.apply_subscription_update(&user_id, &update).unwrap();
        assert_eq!(updated.credit_balance, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribed_callback_is_not_called() {
        let (db, _dir) = open_temp();
        let user_id = UserId::new("u1");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let id = db
            .subscribe_to_changes(
                &user_id,
                Arc::new(move |_: &UserEntitlement| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;

        db.unsubscribe(&user_id, id).await;
        let update = SubscriptionUpdate {
            pass_owned: Some(true),
            ..Default::default()
        };
        db.apply_subscription_update(&user_id, &update).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_preferences_scoped_per_user() {
        let (db, _dir) = open_temp();
        let a = UserId::new("a");
        let ab = UserId::new("ab");

        db.set(&a, "scroll.opened.intro", "true").await.unwrap();
        db.set(&ab, "scroll.opened.other", "true").await.unwrap();

        assert_eq!(db.get(&a, "scroll.opened.intro").await.unwrap().as_deref(), Some("true"));
        assert_eq!(db.get(&ab, "scroll.opened.intro").await.unwrap(), None);
        assert_eq!(
            db.list_preferences(&a).unwrap(),
            vec![("scroll.opened.intro".to_string(), "true".to_string())]
        );
        assert!(db.remove(&a, "scroll.opened.intro").await.unwrap());
        assert!(!db.remove(&a, "scroll.opened.intro").await.unwrap());
    }

    #[test]
    fn test_stats() {
        let (db, _dir) = open_temp();
        db.store_entitlement(&UserEntitlement::free("a").with_credits(10)).unwrap();
        db.store_entitlement(&UserEntitlement::free("b").with_tier("pro").with_pass(true).with_credits(5))
            .unwrap();
        db.set_preference(&UserId::new("a"), "k", "v").unwrap();

        let stats = db.stats().unwrap();
        assert_eq!(stats.total_users, 2);
        assert_eq!(stats.tier_counts.get("free"), Some(&1));
        assert_eq!(stats.tier_counts.get("pro"), Some(&1));
        assert_eq!(stats.pass_holders, 1);
        assert_eq!(stats.total_credits, 15);
        assert_eq!(stats.total_preferences, 1);
    }

    #[test]
    fn test_reopen_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("persist.redb");
        {
            let db = GateDb::open(Some(path.to_str().unwrap())).unwrap();
            db.store_entitlement(&UserEntitlement::free("u1").with_credits(3)).unwrap();
        }
        let db = GateDb::open(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(
            db.get_entitlement(&UserId::new("u1")).unwrap().unwrap().entitlement.credit_balance,
            3
        );
    }
}
