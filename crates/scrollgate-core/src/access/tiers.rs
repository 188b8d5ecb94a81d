//! ============================================================================
//! Tier Policy Table - Ranked tier lookup and capability resolution
//! ============================================================================
//! Validated once at load; afterwards every lookup is infallible or returns
//! `None` for a tier that was never registered.
//! ============================================================================

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use super::types::{standard_tiers, TierDefinition, TierId};
use crate::config::ConfigError;

/// Static ranked tier definitions
#[derive(Debug, Clone)]
pub struct TierPolicyTable {
    /// Sorted by rank ascending
    tiers: Vec<TierDefinition>,
    index: HashMap<TierId, usize>,
}

impl TierPolicyTable {
    /// Build a table, rejecting blank ids, duplicate ids and duplicate ranks
    pub fn new(mut tiers: Vec<TierDefinition>) -> Result<Self, ConfigError> {
        if tiers.is_empty() {
            return Err(ConfigError::EmptyTierTable);
        }

        tiers.sort_by_key(|t| t.rank);

        let mut index = HashMap::with_capacity(tiers.len());
        for (pos, tier) in tiers.iter().enumerate() {
            if tier.id.as_str().trim().is_empty() {
                return Err(ConfigError::BlankTierId { rank: tier.rank });
            }
            if pos > 0 && tiers[pos - 1].rank == tier.rank {
                return Err(ConfigError::DuplicateRank {
                    rank: tier.rank,
                    first: tiers[pos - 1].id.clone(),
                    second: tier.id.clone(),
                });
            }
            if index.insert(tier.id.clone(), pos).is_some() {
                return Err(ConfigError::DuplicateTier(tier.id.clone()));
            }
        }

        Ok(Self { tiers, index })
    }

    /// free < starter < pro < legacy < creator_pass
    pub fn standard() -> Self {
        Self {
            index: standard_tiers()
                .iter()
                .enumerate()
                .map(|(pos, t)| (t.id.clone(), pos))
                .collect(),
            tiers: standard_tiers(),
        }
    }

    /// Rank of a tier, `None` if the tier is not registered
    pub fn rank(&self, tier: &TierId) -> Option<u32> {
        self.definition(tier).map(|t| t.rank)
    }

    pub fn contains(&self, tier: &TierId) -> bool {
        self.index.contains_key(tier)
    }

    pub fn definition(&self, tier: &TierId) -> Option<&TierDefinition> {
        self.index.get(tier).map(|&pos| &self.tiers[pos])
    }

    /// Compare two tiers by rank; `None` if either is unknown
    pub fn compare(&self, a: &TierId, b: &TierId) -> Option<Ordering> {
        Some(self.rank(a)?.cmp(&self.rank(b)?))
    }

    /// All capabilities available at `tier`, including those of every lower tier
    pub fn capabilities_of(&self, tier: &TierId) -> Option<BTreeSet<String>> {
        let pos = *self.index.get(tier)?;
        Some(
            self.tiers[..=pos]
                .iter()
                .flat_map(|t| t.capabilities.iter().cloned())
                .collect(),
        )
    }

    pub fn can_use(&self, tier: &TierId, capability: &str) -> bool {
        self.capabilities_of(tier)
            .map(|caps| caps.contains(capability))
            .unwrap_or(false)
    }

    pub fn is_pass_only(&self, tier: &TierId) -> bool {
        self.definition(tier).map(|t| t.pass_only).unwrap_or(false)
    }

    /// Tiers in ascending rank order
    pub fn tiers(&self) -> impl Iterator<Item = &TierDefinition> {
        self.tiers.iter()
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

impl Default for TierPolicyTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::types::{TIER_FREE, TIER_LEGACY, TIER_PRO, TIER_STARTER};

    fn tier(id: &str) -> TierId {
        TierId::new(id)
    }

    #[test]
    fn test_standard_ordering() {
        let table = TierPolicyTable::standard();
        assert!(table.rank(&tier(TIER_FREE)) < table.rank(&tier(TIER_STARTER)));
        assert!(table.rank(&tier(TIER_STARTER)) < table.rank(&tier(TIER_PRO)));
        assert!(table.rank(&tier(TIER_PRO)) < table.rank(&tier(TIER_LEGACY)));
        assert_eq!(
            table.compare(&tier(TIER_LEGACY), &tier(TIER_PRO)),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn test_unknown_tier_has_no_rank() {
        let table = TierPolicyTable::standard();
        assert_eq!(table.rank(&tier("platinum")), None);
        assert_eq!(table.compare(&tier("platinum"), &tier(TIER_FREE)), None);
        assert!(table.capabilities_of(&tier("platinum")).is_none());
    }

    #[test]
    fn test_capabilities_are_cumulative() {
        let table = TierPolicyTable::standard();
        let pro = table.capabilities_of(&tier(TIER_PRO)).unwrap();
        assert!(pro.contains("read_free_scrolls"));
        assert!(pro.contains("bookmarks"));
        assert!(pro.contains("downloads"));
        assert!(!pro.contains("archive"));

        assert!(table.can_use(&tier(TIER_LEGACY), "downloads"));
        assert!(!table.can_use(&tier(TIER_FREE), "downloads"));
    }

    #[test]
    fn test_duplicate_rank_rejected() {
        let result = TierPolicyTable::new(vec![
            TierDefinition::new("free", 0, &[]),
            TierDefinition::new("pro", 1, &[]),
            TierDefinition::new("legacy", 1, &[]),
        ]);
        assert!(matches!(result, Err(ConfigError::DuplicateRank { rank: 1, .. })));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let result = TierPolicyTable::new(vec![
            TierDefinition::new("free", 0, &[]),
            TierDefinition::new("free", 1, &[]),
        ]);
        assert!(matches!(result, Err(ConfigError::DuplicateTier(_))));
    }

    #[test]
    fn test_empty_and_blank_rejected() {
        assert!(matches!(
            TierPolicyTable::new(vec![]),
            Err(ConfigError::EmptyTierTable)
        ));
        assert!(matches!(
            TierPolicyTable::new(vec![TierDefinition::new("  ", 0, &[])]),
            Err(ConfigError::BlankTierId { rank: 0 })
        ));
    }

    #[test]
    fn test_unsorted_input_is_ordered() {
        let table = TierPolicyTable::new(vec![
            TierDefinition::new("gold", 20, &[]),
            TierDefinition::new("bronze", 0, &[]),
            TierDefinition::new("silver", 10, &[]),
        ])
        .unwrap();
        let order: Vec<&str> = table.tiers().map(|t| t.id.as_str()).collect();
        assert_eq!(order, vec!["bronze", "silver", "gold"]);
        assert_eq!(table.rank(&tier("silver")), Some(10));
    }
}
