//! ============================================================================
//! Content Catalog - Validated content requirements keyed by content id
//! ============================================================================

use std::collections::HashMap;

use super::tiers::TierPolicyTable;
use crate::config::ConfigError;
use crate::types::{ContentId, ContentRequirement};

#[derive(Debug, Clone, Default)]
pub struct ContentCatalog {
    entries: HashMap<ContentId, ContentRequirement>,
}

impl ContentCatalog {
    /// Build a catalog whose every required tier exists in `tiers`
    pub fn new(
        requirements: Vec<ContentRequirement>,
        tiers: &TierPolicyTable,
    ) -> Result<Self, ConfigError> {
        let mut entries = HashMap::with_capacity(requirements.len());
        for req in requirements {
            if let Some(tier) = &req.required_tier {
                if !tiers.contains(tier) {
                    return Err(ConfigError::MissingTier {
                        content_id: req.content_id.clone(),
                        tier: tier.clone(),
                    });
                }
            }
            if entries.contains_key(&req.content_id) {
                return Err(ConfigError::DuplicateContent(req.content_id.clone()));
            }
            entries.insert(req.content_id.clone(), req);
        }
        Ok(Self { entries })
    }

    pub fn get(&self, content_id: &ContentId) -> Option<&ContentRequirement> {
        self.entries.get(content_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContentRequirement> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::TierId;

    fn req(id: &str, tier: Option<&str>) -> ContentRequirement {
        ContentRequirement {
            content_id: ContentId::new(id),
            required_tier: tier.map(TierId::new),
            credit_cost: 5,
            purchasable: true,
        }
    }

    #[test]
    fn test_lookup() {
        let catalog =
            ContentCatalog::new(vec![req("a", Some("pro")), req("b", None)], &TierPolicyTable::standard())
                .unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(
            catalog.get(&ContentId::new("a")).unwrap().required_tier,
            Some(TierId::new("pro"))
        );
        assert!(catalog.get(&ContentId::new("zzz")).is_none());
    }

    #[test]
    fn test_missing_tier_rejected() {
        let result = ContentCatalog::new(vec![req("a", Some("mythic"))], &TierPolicyTable::standard());
        assert!(matches!(result, Err(ConfigError::MissingTier { .. })));
    }

    #[test]
    fn test_duplicate_content_rejected() {
        let result =
            ContentCatalog::new(vec![req("a", None), req("a", None)], &TierPolicyTable::standard());
        assert!(matches!(result, Err(ConfigError::DuplicateContent(_))));
    }
}
