//! ============================================================================
//! SCROLLGATE-CORE: Content gating and unlock orchestration
//! ============================================================================
//! This crate holds every stateful piece of the scroll gate:
//! - Tier policy table and the pure entitlement evaluator
//! - Credit ledger with reserve / commit / release and expiring holds
//! - Unlock orchestrator driving the per (user, content) session state machine
//! - Embedded redb store implementing the persistence collaborators
//! ============================================================================

pub mod access;
pub mod config;
pub mod db;
pub mod gate;
pub mod ledger;
pub mod store;
pub mod types;
pub mod unlock;

// Re-export main types for convenience
pub use types::*;
pub use access::{ContentCatalog, EntitlementEvaluator, TierDefinition, TierId, TierPolicyTable};
pub use config::{ConfigError, GateConfig, ValidatedConfig};
pub use db::GateDb;
pub use gate::ScrollGate;
pub use ledger::{CreditLedger, LedgerConfig, LedgerError, ReservationToken};
pub use store::{
    BalanceStore, MemoryPreferenceStore, MemoryProfileStore, PreferenceStore, SubscriptionId,
    SubscriptionUpdate, UserProfileStore,
};
pub use unlock::{
    AccessEvent, AccessEventSink, CancelOutcome, FailureReason, SessionOutcome, UnlockError,
    UnlockOrchestrator, UnlockSession, UnlockState,
};
