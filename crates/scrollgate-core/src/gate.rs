//! ============================================================================
//! Scroll Gate - Cached entitlement lookups and the exposed gate interface
//! ============================================================================
//! Entitlements are cached for one interaction window so repeated decisions do
//! not hit the profile store. The cached credit balance is never trusted: the
//! ledger's available balance is overlaid on every evaluation. An external
//! subscription event for a user drops their cached entry.
//!
//! Each cached user holds one change subscription on the profile store. Once
//! more users are watched than the cache can hold, users no longer cached are
//! unsubscribed.
//! ============================================================================

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::access::{ContentCatalog, EntitlementEvaluator, TierPolicyTable};
use crate::config::ValidatedConfig;
use crate::db::GateDb;
use crate::ledger::CreditLedger;
use crate::store::{
    BalanceStore, PreferenceStore, ProfileChangeCallback, SubscriptionId, UserProfileStore,
};
use crate::types::{AccessDecision, ContentId, GateError, SessionId, UserEntitlement, UserId};
use crate::unlock::{
    AccessEvent, AccessEventSink, CancelOutcome, SessionOutcome, UnlockOrchestrator,
    UnlockSession, UnlockState,
};

/// Cached entitlement
#[derive(Debug, Clone)]
struct CachedEntitlement {
    entitlement: UserEntitlement,
    cached_at: Instant,
}

type EntitlementCache = Arc<RwLock<HashMap<UserId, CachedEntitlement>>>;

fn write_cache(cache: &EntitlementCache) -> std::sync::RwLockWriteGuard<'_, HashMap<UserId, CachedEntitlement>> {
    cache.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_cache(cache: &EntitlementCache) -> std::sync::RwLockReadGuard<'_, HashMap<UserId, CachedEntitlement>> {
    cache.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Content gate: access decisions plus the unlock flow
pub struct ScrollGate {
    evaluator: EntitlementEvaluator,
    catalog: Arc<ContentCatalog>,
    ledger: CreditLedger,
    orchestrator: UnlockOrchestrator,
    profiles: Arc<dyn UserProfileStore>,
    cache: EntitlementCache,
    watched: Mutex<HashMap<UserId, SubscriptionId>>,
    cache_ttl: Duration,
    max_cache_size: usize,
}

impl ScrollGate {
    pub fn new(
        config: ValidatedConfig,
        profiles: Arc<dyn UserProfileStore>,
        balances: Arc<dyn BalanceStore>,
        preferences: Arc<dyn PreferenceStore>,
        sink: Arc<dyn AccessEventSink>,
    ) -> Self {
        let ValidatedConfig {
            tiers,
            catalog,
            ledger,
            orchestrator,
            entitlement_ttl,
            entitlement_cache_size,
        } = config;

        let evaluator = EntitlementEvaluator::new(Arc::new(tiers));
        let catalog = Arc::new(catalog);
        let ledger = CreditLedger::with_config(balances, ledger);
        let orchestrator = UnlockOrchestrator::new(
            evaluator.clone(),
            catalog.clone(),
            ledger.clone(),
            profiles.clone(),
            preferences,
            sink,
            orchestrator,
        );

        info!(
            "Scroll gate ready: {} tiers, {} scrolls",
            evaluator.tiers().len(),
            catalog.len()
        );

        Self {
            evaluator,
            catalog,
            ledger,
            orchestrator,
            profiles,
            cache: Arc::new(RwLock::new(HashMap::new())),
            watched: Mutex::new(HashMap::new()),
            cache_ttl: entitlement_ttl,
            max_cache_size: entitlement_cache_size.max(1),
        }
    }

    /// Gate backed by the embedded database for every store
    pub fn with_db(config: ValidatedConfig, db: Arc<GateDb>, sink: Arc<dyn AccessEventSink>) -> Self {
        Self::new(config, db.clone(), db.clone(), db, sink)
    }

    pub fn tiers(&self) -> &TierPolicyTable {
        self.evaluator.tiers()
    }

    pub fn catalog(&self) -> &ContentCatalog {
        &self.catalog
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub fn orchestrator(&self) -> &UnlockOrchestrator {
        &self.orchestrator
    }

    // ========================================================================
    // Entitlements
    // ========================================================================

    /// Entitlement for the current interaction window, using the cache when possible
    pub async fn entitlement(&self, user_id: &UserId) -> Result<UserEntitlement, GateError> {
        {
            let cache = read_cache(&self.cache);
            if let Some(cached) = cache.get(user_id) {
                let age = cached.cached_at.elapsed();
                if age < self.cache_ttl {
                    debug!("Cache hit for {} (age: {}s)", user_id, age.as_secs());
                    return Ok(cached.entitlement.clone());
                }
            }
        }

        debug!("Cache miss for {}, loading entitlement", user_id);
        self.watch(user_id).await;
        let entitlement = self
            .profiles
            .load_entitlement(user_id)
            .await
            .map_err(|e| GateError::Profile {
                user_id: user_id.clone(),
                detail: e.to_string(),
            })?;

        {
            let mut cache = write_cache(&self.cache);
            // Evict oldest entry if cache is at capacity
            if cache.len() >= self.max_cache_size && !cache.contains_key(user_id) {
                if let Some(oldest_key) = cache
                    .iter()
                    .min_by_key(|(_, v)| v.cached_at)
                    .map(|(k, _)| k.clone())
                {
                    cache.remove(&oldest_key);
                }
            }
            cache.insert(
                user_id.clone(),
                CachedEntitlement {
                    entitlement: entitlement.clone(),
                    cached_at: Instant::now(),
                },
            );
        }
        self.prune_watches().await;

        Ok(entitlement)
    }

    fn watched(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, SubscriptionId>> {
        self.watched.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe to profile changes the first time a user is loaded
    async fn watch(&self, user_id: &UserId) {
        if self.watched().contains_key(user_id) {
            return;
        }

        let cache = self.cache.clone();
        let callback: ProfileChangeCallback = Arc::new(move |changed: &UserEntitlement| {
            if write_cache(&cache).remove(&changed.user_id).is_some() {
                info!("Invalidated cached entitlement for {}", changed.user_id);
            }
        });
        let subscription = self.profiles.subscribe_to_changes(user_id, callback).await;

        // A concurrent first load may have subscribed in the meantime
        let duplicate = {
            let mut watched = self.watched();
            if watched.contains_key(user_id) {
                true
            } else {
                watched.insert(user_id.clone(), subscription);
                false
            }
        };
        if duplicate {
            self.profiles.unsubscribe(user_id, subscription).await;
        }
    }

    /// Unsubscribe users that are no longer cached once the watch list
    /// outgrows the cache
    async fn prune_watches(&self) {
        let stale: Vec<(UserId, SubscriptionId)> = {
            let mut watched = self.watched();
            if watched.len() <= self.max_cache_size {
                return;
            }
            let cache = read_cache(&self.cache);
            let stale_users: Vec<UserId> = watched
                .keys()
                .filter(|user| !cache.contains_key(*user))
                .cloned()
                .collect();
            stale_users
                .into_iter()
                .filter_map(|user| watched.remove(&user).map(|id| (user, id)))
                .collect()
        };

        for (user_id, subscription) in &stale {
            self.profiles.unsubscribe(user_id, *subscription).await;
        }
        if !stale.is_empty() {
            debug!("Stopped watching {} uncached users", stale.len());
        }
    }

    /// Users with a live change subscription
    pub fn watched_users(&self) -> usize {
        self.watched().len()
    }

    /// Drop a user's cached entitlement
    pub fn invalidate(&self, user_id: &UserId) {
        if write_cache(&self.cache).remove(user_id).is_some() {
            info!("Invalidated cached entitlement for {}", user_id);
        }
    }

    pub fn clear_cache(&self) {
        let mut cache = write_cache(&self.cache);
        let count = cache.len();
        cache.clear();
        info!("Cleared {} cached entitlements", count);
    }

    /// (total, still valid) cached entries
    pub fn cache_stats(&self) -> (usize, usize) {
        let cache = read_cache(&self.cache);
        let total = cache.len();
        let valid = cache
            .values()
            .filter(|c| c.cached_at.elapsed() < self.cache_ttl)
            .count();
        (total, valid)
    }

    // ========================================================================
    // Exposed Interface
    // ========================================================================

    /// Decide whether `user_id` may open `content_id` right now
    pub async fn evaluate_access(
        &self,
        user_id: &UserId,
        content_id: &ContentId,
    ) -> Result<AccessDecision, GateError> {
        let requirement = self
            .catalog
            .get(content_id)
            .ok_or_else(|| GateError::ContentNotFound(content_id.clone()))?;

        let entitlement = self.entitlement(user_id).await?;
        let available = self.ledger.balance(user_id).await.map_err(|e| {
            warn!("Balance unavailable for {}: {}", user_id, e);
            GateError::Profile {
                user_id: user_id.clone(),
                detail: e.to_string(),
            }
        })?;

        Ok(self
            .evaluator
            .evaluate(&entitlement.with_credits(available), requirement))
    }

    pub async fn start_unlock(
        &self,
        user_id: &UserId,
        content_id: &ContentId,
    ) -> Result<SessionId, GateError> {
        Ok(self.orchestrator.start_unlock(user_id, content_id).await?)
    }

    pub async fn confirm_unlock(&self, session_id: SessionId) -> Result<UnlockState, GateError> {
        let user_id = self.orchestrator.session(session_id).await.map(|s| s.user_id);
        let state = self.orchestrator.confirm_unlock(session_id).await?;
        if let (UnlockState::Unlocking, Some(user_id)) = (state, user_id) {
            self.invalidate(&user_id);
        }
        Ok(state)
    }

    pub async fn cancel_unlock(&self, session_id: SessionId) -> Result<CancelOutcome, GateError> {
        Ok(self.orchestrator.cancel_unlock(session_id).await?)
    }

    pub async fn abandon_unlock(&self, session_id: SessionId) -> Result<(), GateError> {
        Ok(self.orchestrator.abandon_unlock(session_id).await?)
    }

    pub async fn on_session_state_change<F>(
        &self,
        session_id: SessionId,
        handler: F,
    ) -> Result<(), GateError>
    where
        F: Fn(&AccessEvent) + Send + Sync + 'static,
    {
        Ok(self
            .orchestrator
            .on_session_state_change(session_id, handler)
            .await?)
    }

    pub async fn on_complete<F>(&self, session_id: SessionId, handler: F) -> Result<(), GateError>
    where
        F: FnOnce(SessionOutcome) + Send + 'static,
    {
        Ok(self.orchestrator.on_complete(session_id, handler).await?)
    }

    pub async fn session(&self, session_id: SessionId) -> Option<UnlockSession> {
        self.orchestrator.session(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GateConfig;
    use crate::store::{MemoryPreferenceStore, MemoryProfileStore, SubscriptionUpdate};
    use crate::types::{ReasonCode, RequiredAction};
    use crate::unlock::TracingEventSink;

    const CONFIG: &str = r#"{
        "content": [
            {"content_id": "deep-dive", "required_tier": "pro", "credit_cost": 30, "purchasable": true},
            {"content_id": "archive", "required_tier": "legacy"}
        ],
        "entitlement_cache": {"ttl_secs": 300, "max_entries": 2}
    }"#;

    fn gate_with(users: Vec<UserEntitlement>) -> (ScrollGate, Arc<MemoryProfileStore>) {
        let config = GateConfig::from_json(CONFIG).unwrap().build().unwrap();
        let store = Arc::new(MemoryProfileStore::with_users(users));
        let gate = ScrollGate::new(
            config,
            store.clone(),
            store.clone(),
            Arc::new(MemoryPreferenceStore::new()),
            Arc::new(TracingEventSink),
        );
        (gate, store)
    }

    #[tokio::test]
    async fn test_unknown_content_is_an_error() {
        let (gate, _) = gate_with(vec![]);
        let err = gate
            .evaluate_access(&UserId::new("u1"), &ContentId::new("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::ContentNotFound(_)));
    }

    #[tokio::test]
    async fn test_evaluation_uses_available_balance() {
        let (gate, _) = gate_with(vec![UserEntitlement::free("u1").with_credits(50)]);
        let user = UserId::new("u1");
        let content = ContentId::new("deep-dive");

        let decision = gate.evaluate_access(&user, &content).await.unwrap();
        assert_eq!(decision.reason_code(), ReasonCode::Purchased);

        let _hold = gate.ledger().reserve(&user, 30).await.unwrap();
        let decision = gate.evaluate_access(&user, &content).await.unwrap();
        assert!(!decision.granted());
        assert_eq!(decision.required_action(), RequiredAction::PurchaseCredits);
    }

    #[tokio::test]
    async fn test_subscription_event_invalidates_cache() {
        let (gate, store) = gate_with(vec![UserEntitlement::free("u1")]);
        let user = UserId::new("u1");
        let archive = ContentId::new("archive");

        assert!(!gate.evaluate_access(&user, &archive).await.unwrap().granted());
        assert_eq!(gate.cache_stats(), (1, 1));

        let update = SubscriptionUpdate {
            pass_owned: Some(true),
            ..Default::default()
        };
        store.apply_subscription_update(&user, &update).await;
        assert_eq!(gate.cache_stats(), (0, 0));

        let decision = gate.evaluate_access(&user, &archive).await.unwrap();
        assert_eq!(decision.reason_code(), ReasonCode::PassOwned);
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let (gate, _) = gate_with(vec![]);
        for id in ["a", "b", "c"] {
            gate.entitlement(&UserId::new(id)).await.unwrap();
        }
        assert_eq!(gate.cache_stats().0, 2);

        gate.invalidate(&UserId::new("c"));
        assert_eq!(gate.cache_stats().0, 1);
        gate.clear_cache();
        assert_eq!(gate.cache_stats(), (0, 0));
    }

    #[tokio::test]
    async fn test_evicted_users_are_unsubscribed() {
        let (gate, store) = gate_with(vec![]);
        for id in ["a", "b", "c", "d"] {
            gate.entitlement(&UserId::new(id)).await.unwrap();
        }

        assert_eq!(gate.watched_users(), 2);
        assert_eq!(store.subscriber_count().await, 2);

        // A re-loaded user is watched again and still sees webhook updates
        let a = UserId::new("a");
        gate.entitlement(&a).await.unwrap();
        assert_eq!(store.subscriber_count().await, 2);
        let update = SubscriptionUpdate {
            tier: Some("legacy".into()),
            ..Default::default()
        };
        store.apply_subscription_update(&a, &update).await;
        assert_eq!(gate.entitlement(&a).await.unwrap().tier.as_str(), "legacy");
    }

    #[tokio::test]
    async fn test_cache_hides_store_changes_until_invalidated() {
        let (gate, store) = gate_with(vec![UserEntitlement::free("u1")]);
        let user = UserId::new("u1");

        gate.entitlement(&user).await.unwrap();
        store.insert(UserEntitlement::free("u1").with_tier("legacy")).await;
        assert_eq!(gate.entitlement(&user).await.unwrap().tier.as_str(), "free");

        gate.invalidate(&user);
        assert_eq!(gate.entitlement(&user).await.unwrap().tier.as_str(), "legacy");
    }
}
