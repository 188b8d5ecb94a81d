//! ============================================================================
//! Core Types for Scrollgate
//! ============================================================================
//! Identifiers, entitlement records, content requirements and access
//! decisions. Enum variants serialize in snake_case so the presentation layer
//! receives the same names it renders (`pass_owned`, `upgrade_tier`, ...).
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::access::TierId;

/// Identifier of an end user
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a gated content unit (a "scroll")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(pub String);

impl ContentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of an ephemeral unlock session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// Entitlements
// ============================================================================

/// Subscription lifecycle status as reported by the billing provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    Expired,
    #[default]
    None,
}

impl SubscriptionStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(Self::Active),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::None => "none",
        }
    }
}

/// Subscription state attached to a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Subscription {
    pub status: SubscriptionStatus,
    /// Unix seconds; `None` means open-ended
    #[serde(default)]
    pub expiry: Option<i64>,
}

impl Subscription {
    pub fn active_until(expiry: i64) -> Self {
        Self {
            status: SubscriptionStatus::Active,
            expiry: Some(expiry),
        }
    }

    /// Status as of `now`. An active subscription past its expiry reads as expired.
    pub fn effective_status(&self, now: i64) -> SubscriptionStatus {
        match (self.status, self.expiry) {
            (SubscriptionStatus::Active, Some(expiry)) if expiry <= now => {
                SubscriptionStatus::Expired
            }
            (status, _) => status,
        }
    }
}

/// Everything the evaluator needs to know about a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntitlement {
    pub user_id: UserId,
    pub tier: TierId,
    pub credit_balance: u64,
    pub pass_owned: bool,
    #[serde(default)]
    pub subscription: Subscription,
}

impl UserEntitlement {
    /// A free-tier user with no credits, pass or subscription
    pub fn free(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            tier: TierId::new("free"),
            credit_balance: 0,
            pass_owned: false,
            subscription: Subscription::default(),
        }
    }

    pub fn with_tier(mut self, tier: impl Into<TierId>) -> Self {
        self.tier = tier.into();
        self
    }

    pub fn with_credits(mut self, credits: u64) -> Self {
        self.credit_balance = credits;
        self
    }

    pub fn with_pass(mut self, owned: bool) -> Self {
        self.pass_owned = owned;
        self
    }

    pub fn with_subscription(mut self, subscription: Subscription) -> Self {
        self.subscription = subscription;
        self
    }

    /// Apply the expiry of the subscription as of `now`
    pub fn normalized(mut self, now: i64) -> Self {
        self.subscription.status = self.subscription.effective_status(now);
        self
    }
}

// ============================================================================
// Content
// ============================================================================

/// Gate placed in front of a content unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRequirement {
    pub content_id: ContentId,
    /// `None` means any tier may open it
    pub required_tier: Option<TierId>,
    pub credit_cost: u64,
    pub purchasable: bool,
}

// ============================================================================
// Decisions
// ============================================================================

/// Why access was granted or denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    PassOwned,
    TierSufficient,
    Purchased,
    InsufficientCredits,
    InsufficientTier,
    Unknown,
}

impl ReasonCode {
    pub fn is_grant(self) -> bool {
        matches!(self, Self::PassOwned | Self::TierSufficient | Self::Purchased)
    }
}

/// What the user has to do to get access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequiredAction {
    #[default]
    None,
    UpgradeTier,
    PurchaseCredits,
    BuyPass,
}

/// Result of evaluating a user against a content requirement.
/// Built only through [`AccessDecision::grant`] and [`AccessDecision::deny`],
/// so a granted decision always carries `RequiredAction::None`.
/// Deserialization goes through the same check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDecision")]
pub struct AccessDecision {
    granted: bool,
    reason_code: ReasonCode,
    required_action: RequiredAction,
}

impl AccessDecision {
    pub fn grant(reason_code: ReasonCode) -> Self {
        Self {
            granted: true,
            reason_code,
            required_action: RequiredAction::None,
        }
    }

    pub fn deny(reason_code: ReasonCode, required_action: RequiredAction) -> Self {
        Self {
            granted: false,
            reason_code,
            required_action,
        }
    }

    pub fn granted(&self) -> bool {
        self.granted
    }

    pub fn reason_code(&self) -> ReasonCode {
        self.reason_code
    }

    pub fn required_action(&self) -> RequiredAction {
        self.required_action
    }
}

#[derive(Deserialize)]
struct RawDecision {
    granted: bool,
    reason_code: ReasonCode,
    #[serde(default)]
    required_action: RequiredAction,
}

/// Rejected decision payload
#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error("granted decision cannot require {0:?}")]
    GrantWithAction(RequiredAction),

    #[error("reason {reason:?} does not match granted={granted}")]
    ReasonMismatch { granted: bool, reason: ReasonCode },
}

impl TryFrom<RawDecision> for AccessDecision {
    type Error = DecisionError;

    fn try_from(raw: RawDecision) -> Result<Self, Self::Error> {
        if raw.granted != raw.reason_code.is_grant() {
            return Err(DecisionError::ReasonMismatch {
                granted: raw.granted,
                reason: raw.reason_code,
            });
        }
        if raw.granted {
            if raw.required_action != RequiredAction::None {
                return Err(DecisionError::GrantWithAction(raw.required_action));
            }
            return Ok(Self::grant(raw.reason_code));
        }
        Ok(Self::deny(raw.reason_code, raw.required_action))
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by the exposed gate interface.
/// Business denials are never errors; they are [`AccessDecision`] values.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("Content not found: {0}")]
    ContentNotFound(ContentId),

    #[error("Profile unavailable for {user_id}: {detail}")]
    Profile { user_id: UserId, detail: String },

    #[error(transparent)]
    Unlock(#[from] crate::unlock::UnlockError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_status_expiry() {
        let sub = Subscription::active_until(1_000);
        assert_eq!(sub.effective_status(999), SubscriptionStatus::Active);
        assert_eq!(sub.effective_status(1_000), SubscriptionStatus::Expired);

        let open_ended = Subscription {
            status: SubscriptionStatus::Active,
            expiry: None,
        };
        assert_eq!(open_ended.effective_status(i64::MAX), SubscriptionStatus::Active);

        let cancelled = Subscription {
            status: SubscriptionStatus::Cancelled,
            expiry: Some(0),
        };
        assert_eq!(cancelled.effective_status(10), SubscriptionStatus::Cancelled);
    }

    #[test]
    fn test_decision_wire_names() {
        let decision = AccessDecision::deny(ReasonCode::InsufficientTier, RequiredAction::UpgradeTier);
        let json = serde_json::to_value(decision).unwrap();
        assert_eq!(json["granted"], false);
        assert_eq!(json["reason_code"], "insufficient_tier");
        assert_eq!(json["required_action"], "upgrade_tier");
    }

    #[test]
    fn test_grant_has_no_required_action() {
        for reason in [ReasonCode::PassOwned, ReasonCode::TierSufficient, ReasonCode::Purchased] {
            let decision = AccessDecision::grant(reason);
            assert!(decision.granted());
            assert_eq!(decision.required_action(), RequiredAction::None);
        }
    }

    #[test]
    fn test_decision_decode_checks_consistency() {
        let decoded: AccessDecision = serde_json::from_str(
            r#"{"granted": false, "reason_code": "insufficient_credits", "required_action": "purchase_credits"}"#,
        )
        .unwrap();
        assert_eq!(
            decoded,
            AccessDecision::deny(ReasonCode::InsufficientCredits, RequiredAction::PurchaseCredits)
        );

        let decoded: AccessDecision =
            serde_json::from_str(r#"{"granted": true, "reason_code": "pass_owned"}"#).unwrap();
        assert_eq!(decoded, AccessDecision::grant(ReasonCode::PassOwned));

        let grant_with_action = r#"{"granted": true, "reason_code": "purchased", "required_action": "upgrade_tier"}"#;
        assert!(serde_json::from_str::<AccessDecision>(grant_with_action).is_err());

        let grant_with_denial = r#"{"granted": true, "reason_code": "insufficient_tier", "required_action": "none"}"#;
        assert!(serde_json::from_str::<AccessDecision>(grant_with_denial).is_err());

        let denial_with_grant = r#"{"granted": false, "reason_code": "tier_sufficient", "required_action": "none"}"#;
        assert!(serde_json::from_str::<AccessDecision>(denial_with_grant).is_err());
    }

    #[test]
    fn test_subscription_status_parse() {
        assert_eq!(SubscriptionStatus::parse("ACTIVE"), Some(SubscriptionStatus::Active));
        assert_eq!(SubscriptionStatus::parse("canceled"), Some(SubscriptionStatus::Cancelled));
        assert_eq!(SubscriptionStatus::parse("paused"), None);
    }
}
