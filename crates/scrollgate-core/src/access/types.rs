//! ============================================================================
//! Access Types - Tier identifiers and tier definitions
//! ============================================================================
//! Tiers are configuration-driven. A tier is referenced by its string id and
//! only acquires a rank once it is registered in a `TierPolicyTable`, so a
//! profile carrying an unrecognized tier stays representable and can be
//! denied instead of failing to parse.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Built-in tier ids
pub const TIER_FREE: &str = "free";
pub const TIER_STARTER: &str = "starter";
pub const TIER_PRO: &str = "pro";
pub const TIER_LEGACY: &str = "legacy";
pub const TIER_CREATOR_PASS: &str = "creator_pass";

/// Identifier of a subscription tier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierId(pub String);

impl TierId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TierId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A ranked tier as declared in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierDefinition {
    pub id: TierId,
    pub rank: u32,
    /// Capabilities introduced at this tier (lower-tier capabilities are inherited)
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Reachable only by buying a pass, never by a subscription upgrade
    #[serde(default)]
    pub pass_only: bool,
}

impl TierDefinition {
    pub fn new(id: &str, rank: u32, capabilities: &[&str]) -> Self {
        Self {
            id: TierId::new(id),
            rank,
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            pass_only: false,
        }
    }

    pub fn pass_only(mut self) -> Self {
        self.pass_only = true;
        self
    }
}

/// The tier ladder shipped by default: free < starter < pro < legacy < creator_pass
pub fn standard_tiers() -> Vec<TierDefinition> {
    vec![
        TierDefinition::new(TIER_FREE, 0, &["read_free_scrolls"]),
        TierDefinition::new(TIER_STARTER, 1, &["read_starter_scrolls", "bookmarks"]),
        TierDefinition::new(TIER_PRO, 2, &["read_pro_scrolls", "downloads"]),
        TierDefinition::new(TIER_LEGACY, 3, &["read_legacy_scrolls", "archive"]),
        TierDefinition::new(TIER_CREATOR_PASS, 4, &["creator_tools"]).pass_only(),
    ]
}
