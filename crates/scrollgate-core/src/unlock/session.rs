//! ============================================================================
//! Unlock Session - States, transitions and failure reasons
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::ledger::ReservationToken;
use crate::types::{ContentId, RequiredAction, SessionId, UserId};

/// Shake animation before the upgrade prompt appears
pub const DEFAULT_SHAKE_MS: u64 = 450;

/// Minimum time the reveal stays on screen before the scroll opens
pub const DEFAULT_REVEAL_DWELL_MS: u64 = 1200;

/// Unanswered prompts are dismissed after this long
pub const DEFAULT_PROMPT_TIMEOUT_SECS: u64 = 120;

/// Longest a session may sit in `reserving` or `debiting`
pub const DEFAULT_SETTLE_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub shake_duration: Duration,
    pub reveal_dwell: Duration,
    pub prompt_timeout: Duration,
    /// Watchdog on `reserving` and `debiting`; on expiry the session fails
    /// with `reservation_timeout` and any stored hold is released
    pub settle_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            shake_duration: Duration::from_millis(DEFAULT_SHAKE_MS),
            reveal_dwell: Duration::from_millis(DEFAULT_REVEAL_DWELL_MS),
            prompt_timeout: Duration::from_secs(DEFAULT_PROMPT_TIMEOUT_SECS),
            settle_timeout: Duration::from_secs(DEFAULT_SETTLE_TIMEOUT_SECS),
        }
    }
}

/// Unlock session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockState {
    Idle,
    LockedShake,
    UpgradePrompt,
    Reserving,
    Debiting,
    Unlocking,
    Opened,
    Complete,
    Failed,
}

impl UnlockState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnlockState::Complete | UnlockState::Failed)
    }

    /// Whether `self -> next` is a legal edge. Any live state may fail.
    pub fn can_transition_to(&self, next: UnlockState) -> bool {
        use UnlockState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (*self, next),
            (Idle, LockedShake)
                | (LockedShake, UpgradePrompt)
                | (UpgradePrompt, Idle)
                | (UpgradePrompt, Reserving)
                | (Reserving, Debiting)
                | (Debiting, Unlocking)
                | (Unlocking, Opened)
                | (Opened, Complete)
                | (_, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnlockState::Idle => "idle",
            UnlockState::LockedShake => "locked_shake",
            UnlockState::UpgradePrompt => "upgrade_prompt",
            UnlockState::Reserving => "reserving",
            UnlockState::Debiting => "debiting",
            UnlockState::Unlocking => "unlocking",
            UnlockState::Opened => "opened",
            UnlockState::Complete => "complete",
            UnlockState::Failed => "failed",
        }
    }
}

impl fmt::Display for UnlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended in `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InsufficientCredits,
    InsufficientTier,
    /// The scroll needs a pass-only tier that no upgrade reaches
    PassRequired,
    UnknownTier,
    ContentNotFound,
    ReservationTimeout,
    LedgerError,
    ProfileUnavailable,
    Cancelled,
    Abandoned,
}

impl FailureReason {
    /// Path the presentation layer should offer
    pub fn required_action(&self) -> RequiredAction {
        match self {
            FailureReason::InsufficientCredits => RequiredAction::PurchaseCredits,
            FailureReason::InsufficientTier => RequiredAction::UpgradeTier,
            FailureReason::PassRequired => RequiredAction::BuyPass,
            _ => RequiredAction::None,
        }
    }

    /// Whether the user should simply be offered a retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureReason::ReservationTimeout
                | FailureReason::LedgerError
                | FailureReason::ProfileUnavailable
        )
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            FailureReason::InsufficientCredits => "Not enough credits to unlock this scroll.",
            FailureReason::InsufficientTier => "Your plan does not include this scroll.",
            FailureReason::PassRequired => "This scroll is only available with a pass.",
            FailureReason::UnknownTier => "We could not verify your plan. Please contact support.",
            FailureReason::ContentNotFound => "This scroll is no longer available.",
            FailureReason::ReservationTimeout
            | FailureReason::LedgerError
            | FailureReason::ProfileUnavailable => "Something went wrong. Please try again.",
            FailureReason::Cancelled => "Unlock cancelled. No credits were spent.",
            FailureReason::Abandoned => "Unlock interrupted.",
        }
    }
}

/// How a session ended. Passed once to the completion handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum SessionOutcome {
    Completed,
    Cancelled,
    Failed(FailureReason),
}

/// Snapshot of an unlock session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockSession {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub content_id: ContentId,
    pub state: UnlockState,
    pub reservation: Option<ReservationToken>,
    /// Unix millis
    pub started_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_edges() {
        use UnlockState::*;
        let path = [
            Idle,
            LockedShake,
            UpgradePrompt,
            Reserving,
            Debiting,
            Unlocking,
            Opened,
            Complete,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_illegal_edges() {
        use UnlockState::*;
        assert!(!Idle.can_transition_to(UpgradePrompt));
        assert!(!LockedShake.can_transition_to(Idle));
        assert!(!Reserving.can_transition_to(Idle));
        assert!(!Debiting.can_transition_to(Opened));
        assert!(!Complete.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Idle));
    }

    #[test]
    fn test_every_live_state_can_fail() {
        use UnlockState::*;
        for state in [Idle, LockedShake, UpgradePrompt, Reserving, Debiting, Unlocking, Opened] {
            assert!(state.can_transition_to(Failed));
        }
    }

    #[test]
    fn test_failure_reason_paths() {
        assert_eq!(
            FailureReason::InsufficientCredits.required_action(),
            RequiredAction::PurchaseCredits
        );
        assert_eq!(
            FailureReason::InsufficientTier.required_action(),
            RequiredAction::UpgradeTier
        );
        assert_eq!(
            FailureReason::PassRequired.required_action(),
            RequiredAction::BuyPass
        );
        assert!(FailureReason::ReservationTimeout.is_retryable());
        assert!(!FailureReason::Cancelled.is_retryable());
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(SessionOutcome::Failed(FailureReason::ReservationTimeout)).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["reason"], "reservation_timeout");
    }
}
