//! ============================================================================
//! Unlock Module - Session state machine for opening gated scrolls
//! ============================================================================
//! A click on locked content starts a session:
//!
//! ```text
//! idle -> locked_shake -> upgrade_prompt -> reserving -> debiting
//!      -> unlocking -> opened -> complete
//!                upgrade_prompt -> idle        (cancel, prompt timeout)
//!                    any live state -> failed
//! ```
//!
//! Credits are committed before the scroll opens. Every transition is written
//! to an [`AccessEventSink`] and to the session's own handlers.
//! ============================================================================

mod events;
mod orchestrator;
mod session;

pub use events::{
    AccessEvent, AccessEventSink, ChannelEventSink, FanoutEventSink, RecordingEventSink,
    TracingEventSink, DEFAULT_EVENT_CHANNEL_CAPACITY,
};
pub use orchestrator::{CancelOutcome, UnlockOrchestrator};
pub use session::{
    FailureReason, OrchestratorConfig, SessionOutcome, UnlockSession, UnlockState,
    DEFAULT_PROMPT_TIMEOUT_SECS, DEFAULT_REVEAL_DWELL_MS, DEFAULT_SETTLE_TIMEOUT_SECS,
    DEFAULT_SHAKE_MS,
};

use crate::types::{ContentId, SessionId};

/// Unlock API misuse. Business failures end the session in `failed` instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnlockError {
    #[error("Unlock session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Cannot {operation} session {session_id} in state {state}")]
    InvalidState {
        session_id: SessionId,
        state: UnlockState,
        operation: &'static str,
    },

    #[error("Content not found: {0}")]
    ContentNotFound(ContentId),
}
