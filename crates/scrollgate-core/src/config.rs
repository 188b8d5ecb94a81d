//! ============================================================================
//! Gate Configuration - Tier table, content catalog and timing settings
//! ============================================================================
//! Loaded from JSON. Every section has a default, so `{}` is a valid document
//! (standard tiers, empty catalog). Validation happens once in
//! [`GateConfig::build`]; a malformed tier table or catalog is the only fatal
//! error class in the core.
//!
//! Path resolution for [`GateConfig::from_env`]: `SCROLLGATE_CONFIG`, else the
//! built-in defaults.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::access::{standard_tiers, ContentCatalog, TierDefinition, TierId, TierPolicyTable};
use crate::ledger::LedgerConfig;
use crate::types::{ContentId, ContentRequirement};
use crate::unlock::OrchestratorConfig;

/// Environment variable naming the configuration file
pub const CONFIG_ENV_VAR: &str = "SCROLLGATE_CONFIG";

/// Default entitlement cache lifetime (one interaction window)
pub const DEFAULT_ENTITLEMENT_TTL_SECS: u64 = 300;

/// Default cap on cached entitlements
pub const DEFAULT_ENTITLEMENT_CACHE_SIZE: usize = 1000;

/// Configuration errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Tier table is empty")]
    EmptyTierTable,

    #[error("Tier with rank {rank} has a blank id")]
    BlankTierId { rank: u32 },

    #[error("Tier '{0}' is declared more than once")]
    DuplicateTier(TierId),

    #[error("Tiers '{first}' and '{second}' share rank {rank}")]
    DuplicateRank {
        rank: u32,
        first: TierId,
        second: TierId,
    },

    #[error("Content '{content_id}' requires unknown tier '{tier}'")]
    MissingTier { content_id: ContentId, tier: TierId },

    #[error("Content '{content_id}' has negative credit cost {cost}")]
    NegativeCost { content_id: ContentId, cost: i64 },

    #[error("Content '{0}' is declared more than once")]
    DuplicateContent(ContentId),

    #[error("Invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Content entry as written in configuration. Costs are signed here so a
/// negative value is reported instead of failing deserialization opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentEntry {
    pub content_id: String,
    #[serde(default)]
    pub required_tier: Option<String>,
    #[serde(default)]
    pub credit_cost: i64,
    #[serde(default)]
    pub purchasable: bool,
}

impl ContentEntry {
    fn into_requirement(self) -> Result<ContentRequirement, ConfigError> {
        let content_id = ContentId::new(self.content_id);
        let credit_cost = u64::try_from(self.credit_cost).map_err(|_| ConfigError::NegativeCost {
            content_id: content_id.clone(),
            cost: self.credit_cost,
        })?;
        Ok(ContentRequirement {
            content_id,
            required_tier: self.required_tier.map(TierId::new),
            credit_cost,
            purchasable: self.purchasable,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    pub reservation_timeout_secs: u64,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            reservation_timeout_secs: LedgerConfig::default().reservation_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub shake_ms: u64,
    pub reveal_dwell_ms: u64,
    pub prompt_timeout_secs: u64,
    pub settle_timeout_secs: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            shake_ms: defaults.shake_duration.as_millis() as u64,
            reveal_dwell_ms: defaults.reveal_dwell.as_millis() as u64,
            prompt_timeout_secs: defaults.prompt_timeout.as_secs(),
            settle_timeout_secs: defaults.settle_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_ENTITLEMENT_TTL_SECS,
            max_entries: DEFAULT_ENTITLEMENT_CACHE_SIZE,
        }
    }
}

/// Complete gate configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default = "standard_tiers")]
    pub tiers: Vec<TierDefinition>,
    #[serde(default)]
    pub content: Vec<ContentEntry>,
    #[serde(default)]
    pub ledger: LedgerSettings,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub entitlement_cache: CacheSettings,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            tiers: standard_tiers(),
            content: Vec::new(),
            ledger: LedgerSettings::default(),
            orchestrator: OrchestratorSettings::default(),
            entitlement_cache: CacheSettings::default(),
        }
    }
}

/// Configuration after validation
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub tiers: TierPolicyTable,
    pub catalog: ContentCatalog,
    pub ledger: LedgerConfig,
    pub orchestrator: OrchestratorConfig,
    pub entitlement_ttl: Duration,
    pub entitlement_cache_size: usize,
}

impl GateConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded gate configuration from {}", path.display());
        Self::from_json(&raw)
    }

    /// Load from `SCROLLGATE_CONFIG` if set, otherwise use defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) => Self::load(Path::new(&path)),
            Err(_) => {
                info!("{} not set, using default gate configuration", CONFIG_ENV_VAR);
                Ok(Self::default())
            }
        }
    }

    /// Validate into the runtime tier table, catalog and component configs
    pub fn build(&self) -> Result<ValidatedConfig, ConfigError> {
        let tiers = TierPolicyTable::new(self.tiers.clone())?;
        let requirements = self
            .content
            .iter()
            .cloned()
            .map(ContentEntry::into_requirement)
            .collect::<Result<Vec<_>, _>>()?;
        let catalog = ContentCatalog::new(requirements, &tiers)?;

        Ok(ValidatedConfig {
            tiers,
            catalog,
            ledger: LedgerConfig {
                reservation_timeout: Duration::from_secs(self.ledger.reservation_timeout_secs),
            },
            orchestrator: OrchestratorConfig {
                shake_duration: Duration::from_millis(self.orchestrator.shake_ms),
                reveal_dwell: Duration::from_millis(self.orchestrator.reveal_dwell_ms),
                prompt_timeout: Duration::from_secs(self.orchestrator.prompt_timeout_secs),
                settle_timeout: Duration::from_secs(self.orchestrator.settle_timeout_secs),
            },
            entitlement_ttl: Duration::from_secs(self.entitlement_cache.ttl_secs),
            entitlement_cache_size: self.entitlement_cache.max_entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = GateConfig::from_json("{}").unwrap();
        let validated = config.build().unwrap();
        assert_eq!(validated.tiers.len(), 5);
        assert!(validated.catalog.is_empty());
        assert_eq!(validated.ledger.reservation_timeout, Duration::from_secs(120));
        assert_eq!(validated.entitlement_ttl, Duration::from_secs(DEFAULT_ENTITLEMENT_TTL_SECS));
    }

    #[test]
    fn test_full_document() {
        let json = r#"{
            "tiers": [
                {"id": "free", "rank": 0},
                {"id": "pro", "rank": 5, "capabilities": ["downloads"]}
            ],
            "content": [
                {"content_id": "intro", "credit_cost": 0},
                {"content_id": "deep-dive", "required_tier": "pro", "credit_cost": 30, "purchasable": true}
            ],
            "ledger": {"reservation_timeout_secs": 60},
            "orchestrator": {"shake_ms": 100, "reveal_dwell_ms": 200, "prompt_timeout_secs": 30, "settle_timeout_secs": 45}
        }"#;
        let validated = GateConfig::from_json(json).unwrap().build().unwrap();

        assert_eq!(validated.tiers.rank(&TierId::new("pro")), Some(5));
        let deep = validated.catalog.get(&ContentId::new("deep-dive")).unwrap();
        assert_eq!(deep.credit_cost, 30);
        assert!(deep.purchasable);
        assert_eq!(validated.ledger.reservation_timeout, Duration::from_secs(60));
        assert_eq!(validated.orchestrator.shake_duration, Duration::from_millis(100));
        assert_eq!(validated.orchestrator.reveal_dwell, Duration::from_millis(200));
        assert_eq!(validated.orchestrator.prompt_timeout, Duration::from_secs(30));
        assert_eq!(validated.orchestrator.settle_timeout, Duration::from_secs(45));
    }

    #[test]
    fn test_negative_cost_rejected_at_load() {
        let json = r#"{"content": [{"content_id": "bad", "credit_cost": -5, "purchasable": true}]}"#;
        let err = GateConfig::from_json(json).unwrap().build().unwrap_err();
        match err {
            ConfigError::NegativeCost { content_id, cost } => {
                assert_eq!(content_id, ContentId::new("bad"));
                assert_eq!(cost, -5);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_rank_rejected_at_load() {
        let json = r#"{"tiers": [{"id": "a", "rank": 1}, {"id": "b", "rank": 1}]}"#;
        let err = GateConfig::from_json(json).unwrap().build().unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateRank { .. }));
    }

    #[test]
    fn test_missing_tier_rejected_at_load() {
        let json = r#"{"content": [{"content_id": "x", "required_tier": "mythic"}]}"#;
        let err = GateConfig::from_json(json).unwrap().build().unwrap_err();
        assert!(matches!(err, ConfigError::MissingTier { .. }));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            GateConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = GateConfig::load(Path::new("/nonexistent/scrollgate.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
