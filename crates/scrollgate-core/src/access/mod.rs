//! ============================================================================
//! Access Module - Tier ranking, content requirements and access decisions
//! ============================================================================
//! Decides whether a user may open a scroll based on pass ownership,
//! subscription status, tier rank and credit balance.
//!
//! ## Default Tiers
//! - **free** (0) - public scrolls
//! - **starter** (1) - starter scrolls, bookmarks
//! - **pro** (2) - pro scrolls, downloads
//! - **legacy** (3) - legacy archive
//! - **creator_pass** (4) - reachable only through a pass
//!
//! ## Usage
//! ```rust,ignore
//! use scrollgate_core::access::{EntitlementEvaluator, TierPolicyTable};
//!
//! let evaluator = EntitlementEvaluator::new(Arc::new(TierPolicyTable::standard()));
//! let decision = evaluator.evaluate(&user, &requirement);
//! ```
//! ============================================================================

mod catalog;
mod evaluator;
mod tiers;
mod types;

pub use catalog::ContentCatalog;
pub use evaluator::EntitlementEvaluator;
pub use tiers::TierPolicyTable;
pub use types::{
    standard_tiers, TierDefinition, TierId, TIER_CREATOR_PASS, TIER_FREE, TIER_LEGACY, TIER_PRO,
    TIER_STARTER,
};
