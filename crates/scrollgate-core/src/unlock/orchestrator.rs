//! ============================================================================
//! Unlock Orchestrator - Per (user, content) unlock state machine
//! ============================================================================
//! Drives a session through
//! `idle -> locked_shake -> upgrade_prompt -> reserving -> debiting ->
//! unlocking -> opened -> complete`, with `failed` reachable from any live
//! state. The session table lock is never held across a ledger, profile or
//! preference await; every step that awaits re-checks the session afterwards.
//!
//! Timers are spawned tasks whose abort handles live on the session. Every
//! transition aborts them, and each timer re-checks that its session is still
//! in the state it was armed for before acting.
//!
//! Everything after `upgrade_prompt -> reserving` runs in its own spawned task,
//! so dropping a `confirm_unlock` future never strands a session. A settle
//! watchdog is armed in `reserving` and `debiting`; if the task stalls on a
//! store, the watchdog aborts it, releases any stored hold and fails the
//! session with `reservation_timeout`.
//! ============================================================================

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::events::{AccessEvent, AccessEventSink};
use super::session::{FailureReason, OrchestratorConfig, SessionOutcome, UnlockSession, UnlockState};
use super::UnlockError;
use crate::access::{ContentCatalog, EntitlementEvaluator};
use crate::ledger::{CreditLedger, LedgerError, ReservationToken};
use crate::store::{opened_key, prompt_dismissed_key, PreferenceStore, UserProfileStore};
use crate::types::{ContentId, ReasonCode, RequiredAction, SessionId, UserId};

type StateHandler = Arc<dyn Fn(&AccessEvent) + Send + Sync>;
type CompletionHandler = Box<dyn FnOnce(SessionOutcome) + Send>;

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The prompt was dismissed and the session returned to idle
    Cancelled,
    /// A reservation is in flight; it will be released once it settles
    Deferred,
    /// The debit has started, the unlock will run to completion
    TooLate,
}

#[derive(Debug, Clone, Copy)]
enum TimerAction {
    ShakeElapsed,
    PromptExpired,
    SettleExpired,
    RevealElapsed,
}

struct SessionEntry {
    session: UnlockSession,
    cancel_requested: bool,
    timers: Vec<AbortHandle>,
    /// Reserve/commit task started by confirm
    settle_task: Option<AbortHandle>,
    handlers: Vec<StateHandler>,
    on_complete: Option<CompletionHandler>,
}

impl SessionEntry {
    fn new(session: UnlockSession) -> Self {
        Self {
            session,
            cancel_requested: false,
            timers: Vec::new(),
            settle_task: None,
            handlers: Vec::new(),
            on_complete: None,
        }
    }
}

#[derive(Default)]
struct SessionTable {
    by_key: HashMap<(UserId, ContentId), SessionId>,
    entries: HashMap<SessionId, SessionEntry>,
}

struct OrchestratorInner {
    evaluator: EntitlementEvaluator,
    catalog: Arc<ContentCatalog>,
    ledger: CreditLedger,
    profiles: Arc<dyn UserProfileStore>,
    preferences: Arc<dyn PreferenceStore>,
    sink: Arc<dyn AccessEventSink>,
    config: OrchestratorConfig,
    sessions: Mutex<SessionTable>,
}

impl OrchestratorInner {
    /// Move a session along one edge. Emits the event, runs handlers and, on
    /// `idle`/`complete`/`failed`, destroys the session and fires completion.
    fn transition(
        &self,
        table: &mut SessionTable,
        session_id: SessionId,
        to: UnlockState,
        reason: Option<FailureReason>,
    ) -> Result<(), UnlockError> {
        let entry = table
            .entries
            .get_mut(&session_id)
            .ok_or(UnlockError::SessionNotFound(session_id))?;

        let from = entry.session.state;
        if !from.can_transition_to(to) {
            warn!(
                session_id = %session_id,
                "Rejected transition {} -> {}", from, to
            );
            return Err(UnlockError::InvalidState {
                session_id,
                state: from,
                operation: "transition",
            });
        }

        for timer in entry.timers.drain(..) {
            timer.abort();
        }
        entry.session.state = to;

        let event = AccessEvent {
            session_id,
            user_id: entry.session.user_id.clone(),
            content_id: entry.session.content_id.clone(),
            from_state: from,
            to_state: to,
            timestamp: chrono::Utc::now().timestamp_millis(),
            reason,
        };
        self.sink.record(&event);
        for handler in &entry.handlers {
            handler(&event);
        }

        let outcome = match to {
            UnlockState::Idle => SessionOutcome::Cancelled,
            UnlockState::Complete => SessionOutcome::Completed,
            UnlockState::Failed => {
                SessionOutcome::Failed(reason.unwrap_or(FailureReason::Abandoned))
            }
            _ => return Ok(()),
        };

        if let Some(entry) = table.entries.remove(&session_id) {
            table.by_key.remove(&(
                entry.session.user_id.clone(),
                entry.session.content_id.clone(),
            ));
            debug!(session_id = %session_id, "Session destroyed ({:?})", outcome);
            if let Some(done) = entry.on_complete {
                done(outcome);
            }
        }
        Ok(())
    }

    /// Fail a session if it still exists. A session that vanished during an
    /// await was abandoned, which also ends in `failed`.
    fn fail_if_live(
        &self,
        table: &mut SessionTable,
        session_id: SessionId,
        reason: FailureReason,
    ) -> UnlockState {
        if table.entries.contains_key(&session_id) {
            if let Err(e) = self.transition(table, session_id, UnlockState::Failed, Some(reason)) {
                warn!(session_id = %session_id, "Could not fail session: {}", e);
            }
        }
        UnlockState::Failed
    }

    fn arm_timer(
        self: &Arc<Self>,
        table: &mut SessionTable,
        session_id: SessionId,
        delay: Duration,
        armed_in: UnlockState,
        action: TimerAction,
    ) {
        let Some(entry) = table.entries.get_mut(&session_id) else {
            return;
        };
        let weak: Weak<OrchestratorInner> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire_timer(session_id, armed_in, action).await;
            }
        });
        entry.timers.push(handle.abort_handle());
    }

    async fn fire_timer(self: &Arc<Self>, session_id: SessionId, armed_in: UnlockState, action: TimerAction) {
        let mut table = self.sessions.lock().await;
        match table.entries.get(&session_id) {
            Some(entry) if entry.session.state == armed_in => {}
            _ => {
                debug!(session_id = %session_id, "Stale {:?} timer ignored", action);
                return;
            }
        }

        if let TimerAction::SettleExpired = action {
            let reservation = match table.entries.get_mut(&session_id) {
                Some(entry) => {
                    if let Some(task) = entry.settle_task.take() {
                        task.abort();
                    }
                    entry.session.reservation.take()
                }
                None => None,
            };
            warn!(session_id = %session_id, "Unlock stalled in {}, giving up", armed_in);
            self.fail_if_live(&mut table, session_id, FailureReason::ReservationTimeout);
            drop(table);
            if let Some(token) = reservation {
                self.release_quietly(&token).await;
            }
            return;
        }

        let result = match action {
            TimerAction::ShakeElapsed => self
                .transition(&mut table, session_id, UnlockState::UpgradePrompt, None)
                .map(|()| {
                    self.arm_timer(
                        &mut table,
                        session_id,
                        self.config.prompt_timeout,
                        UnlockState::UpgradePrompt,
                        TimerAction::PromptExpired,
                    )
                }),
            TimerAction::PromptExpired => {
                info!(session_id = %session_id, "Upgrade prompt timed out");
                self.transition(&mut table, session_id, UnlockState::Idle, None)
            }
            TimerAction::RevealElapsed => self
                .transition(&mut table, session_id, UnlockState::Opened, None)
                .and_then(|()| self.transition(&mut table, session_id, UnlockState::Complete, None)),
            TimerAction::SettleExpired => Ok(()),
        };

        if let Err(e) = result {
            warn!(session_id = %session_id, "Timer {:?} failed: {}", action, e);
        }
    }

    /// Load, evaluate and reserve. Runs outside the session lock.
    async fn reserve_for(
        &self,
        user_id: &UserId,
        content_id: &ContentId,
    ) -> Result<ReservationToken, FailureReason> {
        let requirement = self
            .catalog
            .get(content_id)
            .ok_or(FailureReason::ContentNotFound)?;

        let profile = self.profiles.load_entitlement(user_id).await.map_err(|e| {
            warn!("Failed to load entitlement for {}: {}", user_id, e);
            FailureReason::ProfileUnavailable
        })?;
        let available = self.ledger.balance(user_id).await.map_err(|e| {
            warn!("Failed to read balance for {}: {}", user_id, e);
            FailureReason::LedgerError
        })?;

        let decision = self
            .evaluator
            .evaluate(&profile.with_credits(available), requirement);
        if !decision.granted() {
            return Err(match decision.reason_code() {
                ReasonCode::InsufficientCredits => FailureReason::InsufficientCredits,
                ReasonCode::InsufficientTier
                    if decision.required_action() == RequiredAction::BuyPass =>
                {
                    FailureReason::PassRequired
                }
                ReasonCode::InsufficientTier => FailureReason::InsufficientTier,
                _ => FailureReason::UnknownTier,
            });
        }

        // Pass and tier grants go through the flow without spending credits
        let cost = match decision.reason_code() {
            ReasonCode::Purchased => requirement.credit_cost,
            _ => 0,
        };
        self.ledger.reserve(user_id, cost).await.map_err(|e| match e {
            LedgerError::InsufficientCredits { .. } => FailureReason::InsufficientCredits,
            other => {
                warn!("Reserve failed for {}: {}", user_id, other);
                FailureReason::LedgerError
            }
        })
    }

    /// Reserve, commit and start the reveal for a confirmed session
    async fn settle(
        self: Arc<Self>,
        session_id: SessionId,
        user_id: UserId,
        content_id: ContentId,
    ) -> Result<UnlockState, UnlockError> {
        let token = match self.reserve_for(&user_id, &content_id).await {
            Ok(token) => token,
            Err(reason) => {
                info!("Unlock {} failed while reserving: {:?}", session_id, reason);
                let mut table = self.sessions.lock().await;
                return Ok(self.fail_if_live(&mut table, session_id, reason));
            }
        };

        let mut table = self.sessions.lock().await;
        let cancel_requested = match table.entries.get_mut(&session_id) {
            Some(entry) if entry.session.state == UnlockState::Reserving => {
                if !entry.cancel_requested {
                    entry.session.reservation = Some(token.clone());
                }
                entry.cancel_requested
            }
            _ => {
                drop(table);
                debug!("Session {} ended while reserving", session_id);
                self.release_quietly(&token).await;
                return Ok(UnlockState::Failed);
            }
        };

        if cancel_requested {
            drop(table);
            self.release_quietly(&token).await;
            let mut table = self.sessions.lock().await;
            info!("Applied deferred cancel to session {}", session_id);
            return Ok(self.fail_if_live(&mut table, session_id, FailureReason::Cancelled));
        }

        self.transition(&mut table, session_id, UnlockState::Debiting, None)?;
        self.arm_timer(
            &mut table,
            session_id,
            self.config.settle_timeout,
            UnlockState::Debiting,
            TimerAction::SettleExpired,
        );
        drop(table);

        match self.ledger.commit(&token).await {
            Ok(()) => {
                self.set_flag(&user_id, &opened_key(&content_id)).await;

                let mut table = self.sessions.lock().await;
                if !table.entries.contains_key(&session_id) {
                    // Abandoned during the commit; the debit stands
                    return Ok(UnlockState::Failed);
                }
                self.transition(&mut table, session_id, UnlockState::Unlocking, None)?;
                self.arm_timer(
                    &mut table,
                    session_id,
                    self.config.reveal_dwell,
                    UnlockState::Unlocking,
                    TimerAction::RevealElapsed,
                );
                Ok(UnlockState::Unlocking)
            }
            Err(e) => {
                let reason = match e {
                    LedgerError::TokenNotFound(_) => FailureReason::ReservationTimeout,
                    LedgerError::InsufficientCredits { .. } => FailureReason::InsufficientCredits,
                    _ => FailureReason::LedgerError,
                };
                warn!("Commit failed for session {}: {}", session_id, e);
                self.release_quietly(&token).await;

                let mut table = self.sessions.lock().await;
                Ok(self.fail_if_live(&mut table, session_id, reason))
            }
        }
    }

    async fn release_quietly(&self, token: &ReservationToken) {
        match self.ledger.release(token).await {
            Ok(()) => debug!("Released reservation {}", token.id()),
            Err(LedgerError::AlreadyCommitted(id)) => {
                debug!("Reservation {} already committed, debit stands", id)
            }
            Err(e) => warn!("Failed to release reservation {}: {}", token.id(), e),
        }
    }

    async fn set_flag(&self, user_id: &UserId, key: &str) {
        if let Err(e) = self.preferences.set(user_id, key, "true").await {
            warn!("Failed to store preference {} for {}: {}", key, user_id, e);
        }
    }
}

/// Session store and state machine for scroll unlocks
#[derive(Clone)]
pub struct UnlockOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl UnlockOrchestrator {
    pub fn new(
        evaluator: EntitlementEvaluator,
        catalog: Arc<ContentCatalog>,
        ledger: CreditLedger,
        profiles: Arc<dyn UserProfileStore>,
        preferences: Arc<dyn PreferenceStore>,
        sink: Arc<dyn AccessEventSink>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                evaluator,
                catalog,
                ledger,
                profiles,
                preferences,
                sink,
                config,
                sessions: Mutex::new(SessionTable::default()),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Begin an unlock after a click on locked content. A live session for the
    /// same (user, content) is returned instead of starting a second one.
    pub async fn start_unlock(
        &self,
        user_id: &UserId,
        content_id: &ContentId,
    ) -> Result<SessionId, UnlockError> {
        if self.inner.catalog.get(content_id).is_none() {
            return Err(UnlockError::ContentNotFound(content_id.clone()));
        }

        let mut table = self.inner.sessions.lock().await;
        let key = (user_id.clone(), content_id.clone());
        if let Some(existing) = table.by_key.get(&key) {
            debug!("Reusing unlock session {} for {}/{}", existing, user_id, content_id);
            return Ok(*existing);
        }

        let session_id = SessionId::new();
        table.entries.insert(
            session_id,
            SessionEntry::new(UnlockSession {
                session_id,
                user_id: user_id.clone(),
                content_id: content_id.clone(),
                state: UnlockState::Idle,
                reservation: None,
                started_at: chrono::Utc::now().timestamp_millis(),
            }),
        );
        table.by_key.insert(key, session_id);

        self.inner
            .transition(&mut table, session_id, UnlockState::LockedShake, None)?;
        self.inner.arm_timer(
            &mut table,
            session_id,
            self.inner.config.shake_duration,
            UnlockState::LockedShake,
            TimerAction::ShakeElapsed,
        );

        info!("Started unlock session {} for {}/{}", session_id, user_id, content_id);
        Ok(session_id)
    }

    /// Confirm the upgrade prompt: reserve, debit and start the reveal.
    /// Returns the state the session settled in (`unlocking` or `failed`).
    ///
    /// The work runs in a spawned task; dropping the returned future does not
    /// stop the unlock.
    pub async fn confirm_unlock(&self, session_id: SessionId) -> Result<UnlockState, UnlockError> {
        let inner = &self.inner;

        let task = {
            let mut table = inner.sessions.lock().await;
            let entry = table
                .entries
                .get(&session_id)
                .ok_or(UnlockError::SessionNotFound(session_id))?;
            if entry.session.state != UnlockState::UpgradePrompt {
                return Err(UnlockError::InvalidState {
                    session_id,
                    state: entry.session.state,
                    operation: "confirm",
                });
            }
            let user_id = entry.session.user_id.clone();
            let content_id = entry.session.content_id.clone();
            inner.transition(&mut table, session_id, UnlockState::Reserving, None)?;
            inner.arm_timer(
                &mut table,
                session_id,
                inner.config.settle_timeout,
                UnlockState::Reserving,
                TimerAction::SettleExpired,
            );

            let task = tokio::spawn(inner.clone().settle(session_id, user_id, content_id));
            if let Some(entry) = table.entries.get_mut(&session_id) {
                entry.settle_task = Some(task.abort_handle());
            }
            task
        };

        match task.await {
            Ok(result) => result,
            Err(e) => {
                debug!(session_id = %session_id, "Settle task stopped: {}", e);
                Ok(UnlockState::Failed)
            }
        }
    }

    /// Cancel from the upgrade prompt. In `reserving` the cancel is deferred
    /// until the reservation settles; from `debiting` on it is too late.
    pub async fn cancel_unlock(&self, session_id: SessionId) -> Result<CancelOutcome, UnlockError> {
        let inner = &self.inner;
        let mut table = inner.sessions.lock().await;
        let entry = table
            .entries
            .get_mut(&session_id)
            .ok_or(UnlockError::SessionNotFound(session_id))?;

        match entry.session.state {
            UnlockState::UpgradePrompt => {
                let user_id = entry.session.user_id.clone();
                let content_id = entry.session.content_id.clone();
                inner.transition(&mut table, session_id, UnlockState::Idle, None)?;
                drop(table);

                inner.set_flag(&user_id, &prompt_dismissed_key(&content_id)).await;
                info!("Unlock session {} cancelled at prompt", session_id);
                Ok(CancelOutcome::Cancelled)
            }
            UnlockState::Reserving => {
                entry.cancel_requested = true;
                debug!("Cancel deferred for session {}", session_id);
                Ok(CancelOutcome::Deferred)
            }
            UnlockState::Debiting | UnlockState::Unlocking | UnlockState::Opened => {
                Ok(CancelOutcome::TooLate)
            }
            state => Err(UnlockError::InvalidState {
                session_id,
                state,
                operation: "cancel",
            }),
        }
    }

    /// Destroy a session early (navigation away). Timers stop and an
    /// uncommitted reservation is released; a committed debit stands.
    pub async fn abandon_unlock(&self, session_id: SessionId) -> Result<(), UnlockError> {
        let inner = &self.inner;
        let reservation = {
            let mut table = inner.sessions.lock().await;
            let entry = table
                .entries
                .get(&session_id)
                .ok_or(UnlockError::SessionNotFound(session_id))?;
            let reservation = entry.session.reservation.clone();
            inner.transition(
                &mut table,
                session_id,
                UnlockState::Failed,
                Some(FailureReason::Abandoned),
            )?;
            reservation
        };

        if let Some(token) = reservation {
            inner.release_quietly(&token).await;
        }
        info!("Unlock session {} abandoned", session_id);
        Ok(())
    }

    /// Subscribe to every later transition of a session
    pub async fn on_session_state_change<F>(
        &self,
        session_id: SessionId,
        handler: F,
    ) -> Result<(), UnlockError>
    where
        F: Fn(&AccessEvent) + Send + Sync + 'static,
    {
        let mut table = self.inner.sessions.lock().await;
        let entry = table
            .entries
            .get_mut(&session_id)
            .ok_or(UnlockError::SessionNotFound(session_id))?;
        entry.handlers.push(Arc::new(handler));
        Ok(())
    }

    /// Register the completion handler. Fires once, when the session is destroyed.
    pub async fn on_complete<F>(&self, session_id: SessionId, handler: F) -> Result<(), UnlockError>
    where
        F: FnOnce(SessionOutcome) + Send + 'static,
    {
        let mut table = self.inner.sessions.lock().await;
        let entry = table
            .entries
            .get_mut(&session_id)
            .ok_or(UnlockError::SessionNotFound(session_id))?;
        entry.on_complete = Some(Box::new(handler));
        Ok(())
    }

    pub async fn session(&self, session_id: SessionId) -> Option<UnlockSession> {
        self.inner
            .sessions
            .lock()
            .await
            .entries
            .get(&session_id)
            .map(|e| e.session.clone())
    }

    /// Live session for a (user, content) pair
    pub async fn session_for(&self, user_id: &UserId, content_id: &ContentId) -> Option<SessionId> {
        self.inner
            .sessions
            .lock()
            .await
            .by_key
            .get(&(user_id.clone(), content_id.clone()))
            .copied()
    }

    pub async fn active_sessions(&self) -> usize {
        self.inner.sessions.lock().await.entries.len()
    }
}
