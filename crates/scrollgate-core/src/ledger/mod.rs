//! ============================================================================
//! Credit Ledger - Per-user credit balances with reserve / commit / release
//! ============================================================================
//! A reservation places an exclusive hold on part of a user's balance. The
//! hold ends in exactly one of three ways:
//! - `commit`: the debit is written through the `BalanceStore`
//! - `release`: the hold is dropped and the funds are available again
//! - expiry: after `reservation_timeout` the hold is dropped automatically
//!
//! Every operation on a user runs inside that user's mutex, so concurrent
//! reserves never lose updates. The outer account map is only locked long
//! enough to find or create the per-user handle; different users never wait
//! on each other.
//!
//! Expiry is enforced lazily on every touch of an account, and proactively by
//! the task returned from [`CreditLedger::spawn_expiry_sweeper`]. The sweeper
//! also evicts accounts that have no holds and have not been touched for a
//! full reservation window.
//!
//! `commit` re-reads the persisted balance inside the user's critical section
//! before writing the debit, so credits added to the store by another writer
//! are never overwritten.
//! ============================================================================

mod types;

pub use types::{
    AccountSnapshot, LedgerConfig, LedgerError, ReservationToken, DEFAULT_RESERVATION_TIMEOUT_SECS,
    MAX_SETTLED_TOKENS,
};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::BalanceStore;
use crate::types::UserId;

struct Hold {
    amount: u64,
    expires_at: Instant,
}

#[derive(Default)]
struct Account {
    loaded: bool,
    /// Set when the account is dropped from the map; holders must re-fetch
    retired: bool,
    last_used: Option<Instant>,
    balance: u64,
    holds: HashMap<Uuid, Hold>,
    settled: VecDeque<Uuid>,
    settled_index: HashSet<Uuid>,
}

impl Account {
    fn held(&self) -> u64 {
        self.holds.values().map(|h| h.amount).sum()
    }

    fn available(&self) -> u64 {
        self.balance.saturating_sub(self.held())
    }

    fn is_committed(&self, id: &Uuid) -> bool {
        self.settled_index.contains(id)
    }

    fn remember_committed(&mut self, id: Uuid) {
        if self.settled.len() >= MAX_SETTLED_TOKENS {
            if let Some(oldest) = self.settled.pop_front() {
                self.settled_index.remove(&oldest);
            }
        }
        self.settled.push_back(id);
        self.settled_index.insert(id);
    }

    fn release_expired(&mut self, user_id: &UserId, now: Instant) -> usize {
        let expired: Vec<Uuid> = self
            .holds
            .iter()
            .filter(|(_, hold)| hold.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(hold) = self.holds.remove(id) {
                warn!(
                    "Reservation {} for {} expired, released {} credits",
                    id, user_id, hold.amount
                );
            }
        }
        expired.len()
    }

    fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            balance: self.balance,
            held: self.held(),
            available: self.available(),
            outstanding_reservations: self.holds.len(),
        }
    }
}

type AccountHandle = Arc<Mutex<Account>>;

struct LedgerInner {
    store: Arc<dyn BalanceStore>,
    accounts: RwLock<HashMap<UserId, AccountHandle>>,
    config: LedgerConfig,
    reservations_issued: AtomicU64,
}

impl LedgerInner {
    async fn sweep_expired(&self) -> usize {
        let handles: Vec<(UserId, AccountHandle)> = self
            .accounts
            .read()
            .await
            .iter()
            .map(|(user, handle)| (user.clone(), handle.clone()))
            .collect();

        let now = Instant::now();
        let mut released = 0;
        for (user_id, handle) in handles {
            released += handle.lock().await.release_expired(&user_id, now);
        }
        released
    }

    /// Drop accounts with no holds that have been idle for `idle_for`
    async fn evict_idle(&self, idle_for: Duration) -> usize {
        let now = Instant::now();
        let mut accounts = self.accounts.write().await;
        let before = accounts.len();
        accounts.retain(|user_id, handle| match handle.try_lock() {
            Ok(mut account) => {
                account.release_expired(user_id, now);
                let idle = account
                    .last_used
                    .map_or(true, |used| now.duration_since(used) >= idle_for);
                if account.holds.is_empty() && idle {
                    account.retired = true;
                    false
                } else {
                    true
                }
            }
            Err(_) => true,
        });
        let evicted = before - accounts.len();
        if evicted > 0 {
            debug!("Evicted {} idle accounts", evicted);
        }
        evicted
    }
}

/// Credit ledger over an external balance store
#[derive(Clone)]
pub struct CreditLedger {
    inner: Arc<LedgerInner>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn BalanceStore>) -> Self {
        Self::with_config(store, LedgerConfig::default())
    }

    pub fn with_config(store: Arc<dyn BalanceStore>, config: LedgerConfig) -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                store,
                accounts: RwLock::new(HashMap::new()),
                config,
                reservations_issued: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.inner.config
    }

    async fn account_handle(&self, user_id: &UserId) -> AccountHandle {
        if let Some(handle) = self.inner.accounts.read().await.get(user_id) {
            return handle.clone();
        }
        self.inner
            .accounts
            .write()
            .await
            .entry(user_id.clone())
            .or_default()
            .clone()
    }

    /// Enter the user's critical section, loading the account on first touch
    async fn lock_account(&self, user_id: &UserId) -> Result<OwnedMutexGuard<Account>, LedgerError> {
        loop {
            let handle = self.account_handle(user_id).await;
            let mut account = handle.lock_owned().await;
            if account.retired {
                continue;
            }

            if !account.loaded {
                account.balance = self
                    .inner
                    .store
                    .load_balance(user_id)
                    .await
                    .map_err(|e| LedgerError::Store(e.to_string()))?;
                account.loaded = true;
                debug!("Loaded balance {} for {}", account.balance, user_id);
            }

            let now = Instant::now();
            account.last_used = Some(now);
            account.release_expired(user_id, now);
            return Ok(account);
        }
    }

    /// Hold `amount` credits. Fails without mutation if the available balance is short.
    pub async fn reserve(
        &self,
        user_id: &UserId,
        amount: u64,
    ) -> Result<ReservationToken, LedgerError> {
        let mut account = self.lock_account(user_id).await?;

        let available = account.available();
        if amount > available {
            debug!(
                "Reserve of {} denied for {}: {} available",
                amount, user_id, available
            );
            return Err(LedgerError::InsufficientCredits {
                user_id: user_id.clone(),
                requested: amount,
                available,
            });
        }

        let token = ReservationToken::new(user_id.clone(), amount);
        account.holds.insert(
            token.id(),
            Hold {
                amount,
                expires_at: Instant::now() + self.inner.config.reservation_timeout,
            },
        );
        self.inner.reservations_issued.fetch_add(1, Ordering::Relaxed);

        debug!("Reserved {} credits for {} ({})", amount, user_id, token.id());
        Ok(token)
    }

    /// Finalize the debit. Committing an already committed token is a no-op.
    ///
    /// The persisted balance is re-read first. If it has dropped below the
    /// hold, the commit fails with `InsufficientCredits` and the hold is kept
    /// for the caller to release.
    pub async fn commit(&self, token: &ReservationToken) -> Result<(), LedgerError> {
        let user_id = token.user_id();
        let mut account = self.lock_account(user_id).await?;

        if account.is_committed(&token.id()) {
            debug!("Reservation {} already committed, ignoring", token.id());
            return Ok(());
        }

        let amount = match account.holds.get(&token.id()) {
            Some(hold) => hold.amount,
            None => return Err(LedgerError::TokenNotFound(token.id())),
        };

        let persisted = self
            .inner
            .store
            .load_balance(user_id)
            .await
            .map_err(|e| LedgerError::Store(e.to_string()))?;
        if persisted != account.balance {
            debug!(
                "Balance for {} changed outside the ledger: {} -> {}",
                user_id, account.balance, persisted
            );
            account.balance = persisted;
        }
        if persisted < amount {
            warn!(
                "Balance for {} fell to {} under a hold of {}",
                user_id, persisted, amount
            );
            return Err(LedgerError::InsufficientCredits {
                user_id: user_id.clone(),
                requested: amount,
                available: persisted,
            });
        }

        let new_balance = persisted - amount;
        self.inner
            .store
            .store_balance(user_id, new_balance)
            .await
            .map_err(|e| {
                warn!("Failed to persist debit for {}: {}", user_id, e);
                LedgerError::Store(e.to_string())
            })?;

        account.balance = new_balance;
        account.holds.remove(&token.id());
        account.remember_committed(token.id());

        info!(
            "Committed {} credits for {} (balance now {})",
            amount, user_id, new_balance
        );
        Ok(())
    }

    /// Drop the hold and make the funds available again
    pub async fn release(&self, token: &ReservationToken) -> Result<(), LedgerError> {
        let mut account = self.lock_account(token.user_id()).await?;

        if account.is_committed(&token.id()) {
            return Err(LedgerError::AlreadyCommitted(token.id()));
        }

        match account.holds.remove(&token.id()) {
            Some(hold) => {
                debug!(
                    "Released {} credits for {} ({})",
                    hold.amount,
                    token.user_id(),
                    token.id()
                );
                Ok(())
            }
            None => Err(LedgerError::TokenNotFound(token.id())),
        }
    }

    /// Available balance: persisted balance minus outstanding holds
    pub async fn balance(&self, user_id: &UserId) -> Result<u64, LedgerError> {
        Ok(self.lock_account(user_id).await?.available())
    }

    pub async fn snapshot(&self, user_id: &UserId) -> Result<AccountSnapshot, LedgerError> {
        Ok(self.lock_account(user_id).await?.snapshot())
    }

    /// Total reservations handed out since construction
    pub fn reservations_issued(&self) -> u64 {
        self.inner.reservations_issued.load(Ordering::Relaxed)
    }

    /// Release every expired hold across all accounts
    pub async fn release_expired(&self) -> usize {
        self.inner.sweep_expired().await
    }

    /// Drop a cached account with no outstanding holds so the next touch
    /// reloads it from the store. Returns whether it was dropped.
    pub async fn forget(&self, user_id: &UserId) -> bool {
        let mut accounts = self.inner.accounts.write().await;
        let idle = match accounts.get(user_id) {
            Some(handle) => match handle.try_lock() {
                Ok(mut account) if account.holds.is_empty() => {
                    account.retired = true;
                    true
                }
                _ => false,
            },
            None => return false,
        };
        if idle {
            accounts.remove(user_id);
            debug!("Dropped cached account for {}", user_id);
        }
        idle
    }

    /// Drop every account with no holds that has been untouched for a full
    /// reservation window. Returns how many were dropped.
    pub async fn evict_idle(&self) -> usize {
        self.inner
            .evict_idle(self.inner.config.reservation_timeout)
            .await
    }

    /// Accounts currently held in memory
    pub async fn cached_accounts(&self) -> usize {
        self.inner.accounts.read().await.len()
    }

    /// Periodically release expired holds and evict idle accounts.
    /// Stops once the ledger is dropped.
    pub fn spawn_expiry_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<LedgerInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let released = inner.sweep_expired().await;
                if released > 0 {
                    info!(released = released, "Released expired credit reservations");
                }
                inner.evict_idle(inner.config.reservation_timeout).await;
            }
        })
    }
}
