//! ============================================================================
//! Entitlement Evaluator - Pure access decisions
//! ============================================================================
//! Decision order, first match wins:
//! 1. Pass owned or active subscription      -> granted (pass_owned)
//! 2. No tier required, or tier rank suffices -> granted (tier_sufficient)
//! 3. Purchasable and balance covers the cost -> granted (purchased)
//! 4. Purchasable but balance too low         -> denied  (purchase_credits)
//! 5. Otherwise                               -> denied  (upgrade_tier / buy_pass)
//!
//! An unranked tier at step 2 fails closed with `unknown`. Evaluation never
//! touches the balance; a `purchased` grant still has to be reserved and
//! committed through the ledger.
//! ============================================================================

use std::sync::Arc;
use tracing::debug;

use super::tiers::TierPolicyTable;
use crate::types::{
    AccessDecision, ContentRequirement, ReasonCode, RequiredAction, SubscriptionStatus,
    UserEntitlement,
};

/// Stateless decision function over a shared tier table
#[derive(Debug, Clone)]
pub struct EntitlementEvaluator {
    tiers: Arc<TierPolicyTable>,
}

impl EntitlementEvaluator {
    pub fn new(tiers: Arc<TierPolicyTable>) -> Self {
        Self { tiers }
    }

    pub fn tiers(&self) -> &TierPolicyTable {
        &self.tiers
    }

    /// Evaluate `user` against `req`
    pub fn evaluate(&self, user: &UserEntitlement, req: &ContentRequirement) -> AccessDecision {
        let decision = self.decide(user, req);
        debug!(
            "Access for {} on {}: {:?} ({:?})",
            user.user_id,
            req.content_id,
            decision.reason_code(),
            decision.required_action()
        );
        decision
    }

    fn decide(&self, user: &UserEntitlement, req: &ContentRequirement) -> AccessDecision {
        if user.pass_owned || user.subscription.status == SubscriptionStatus::Active {
            return AccessDecision::grant(ReasonCode::PassOwned);
        }

        let required = match &req.required_tier {
            None => return AccessDecision::grant(ReasonCode::TierSufficient),
            Some(required) => required,
        };

        let (user_rank, required_rank) =
            match (self.tiers.rank(&user.tier), self.tiers.rank(required)) {
                (Some(u), Some(r)) => (u, r),
                _ => return AccessDecision::deny(ReasonCode::Unknown, RequiredAction::None),
            };

        if user_rank >= required_rank {
            return AccessDecision::grant(ReasonCode::TierSufficient);
        }

        if req.purchasable {
            if user.credit_balance >= req.credit_cost {
                return AccessDecision::grant(ReasonCode::Purchased);
            }
            return AccessDecision::deny(
                ReasonCode::InsufficientCredits,
                RequiredAction::PurchaseCredits,
            );
        }

        let action = if self.tiers.is_pass_only(required) {
            RequiredAction::BuyPass
        } else {
            RequiredAction::UpgradeTier
        };
        AccessDecision::deny(ReasonCode::InsufficientTier, action)
    }
}

impl Default for EntitlementEvaluator {
    fn default() -> Self {
        Self::new(Arc::new(TierPolicyTable::standard()))
    }
}
