//! Configuration, read from `mender.toml` in the project root.
//!
//! Every section and field has a default, so a missing or empty file yields
//! a working configuration. `validate()` returns warnings rather than
//! failing: a misconfigured orchestrator should still run and report.
//!
//! # Configuration File Format
//!
//! ```toml
//! [escalation]
//! tier_boundaries = [
//!     { last_attempt = 4, tier = "tier-1" },
//!     { last_attempt = 6, tier = "tier-2" },
//! ]
//! human_threshold = 7
//! min_confidence = 0.5
//!
//! [investigation]
//! max_turns = 8
//! token_budget = 200000
//! max_fetch_bytes = 262144
//!
//! [coordination]
//! enabled = true
//! probe_attempts = 3
//! probe_delay_ms = 2000
//! reconcile_delay_ms = 5000
//! lock_ttl_secs = 3600
//!
//! [git]
//! base_branch = "main"
//!
//! [models]
//! tier-1 = "claude-3-5-haiku-latest"
//! tier-2 = "claude-sonnet-4-5"
//! tier-3 = "claude-opus-4-1"
//! ```

use crate::coordination::CoordinationConfig;
use crate::escalation::{EscalationPolicy, ReasoningTier, TierBoundary};
use crate::investigation::SessionLimits;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const CONFIG_FILE: &str = "mender.toml";

fn default_human_threshold() -> u32 {
    7
}

fn default_min_confidence() -> f64 {
    0.5
}

fn default_tier_boundaries() -> Vec<TierBoundary> {
    vec![
        TierBoundary {
            last_attempt: 4,
            tier: ReasoningTier::Tier1,
        },
        TierBoundary {
            last_attempt: 6,
            tier: ReasoningTier::Tier2,
        },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationSection {
    #[serde(default = "default_tier_boundaries")]
    pub tier_boundaries: Vec<TierBoundary>,
    #[serde(default = "default_human_threshold")]
    pub human_threshold: u32,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

impl Default for EscalationSection {
    fn default() -> Self {
        Self {
            tier_boundaries: default_tier_boundaries(),
            human_threshold: default_human_threshold(),
            min_confidence: default_min_confidence(),
        }
    }
}

fn default_max_turns() -> u32 {
    8
}

fn default_token_budget() -> u64 {
    200_000
}

fn default_max_fetch_bytes() -> u64 {
    256 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestigationSection {
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_token_budget")]
    pub token_budget: u64,
    /// Largest repository file the artifact fetcher will return.
    #[serde(default = "default_max_fetch_bytes")]
    pub max_fetch_bytes: u64,
}

impl Default for InvestigationSection {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            token_budget: default_token_budget(),
            max_fetch_bytes: default_max_fetch_bytes(),
        }
    }
}

fn default_coordination_enabled() -> bool {
    true
}

fn default_probe_attempts() -> u32 {
    3
}

fn default_probe_delay_ms() -> u64 {
    2_000
}

fn default_reconcile_delay_ms() -> u64 {
    5_000
}

fn default_lock_ttl_secs() -> i64 {
    3_600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationSection {
    #[serde(default = "default_coordination_enabled")]
    pub enabled: bool,
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,
    #[serde(default = "default_probe_delay_ms")]
    pub probe_delay_ms: u64,
    #[serde(default = "default_reconcile_delay_ms")]
    pub reconcile_delay_ms: u64,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: i64,
}

impl Default for CoordinationSection {
    fn default() -> Self {
        Self {
            enabled: default_coordination_enabled(),
            probe_attempts: default_probe_attempts(),
            probe_delay_ms: default_probe_delay_ms(),
            reconcile_delay_ms: default_reconcile_delay_ms(),
            lock_ttl_secs: default_lock_ttl_secs(),
        }
    }
}

fn default_base_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitSection {
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
}

impl Default for GitSection {
    fn default() -> Self {
        Self {
            base_branch: default_base_branch(),
        }
    }
}

fn default_models() -> HashMap<ReasoningTier, String> {
    HashMap::from([
        (ReasoningTier::Tier1, "claude-3-5-haiku-latest".to_string()),
        (ReasoningTier::Tier2, "claude-sonnet-4-5".to_string()),
        (ReasoningTier::Tier3, "claude-opus-4-1".to_string()),
    ])
}

/// Root of `mender.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MenderToml {
    #[serde(default)]
    pub escalation: EscalationSection,
    #[serde(default)]
    pub investigation: InvestigationSection,
    #[serde(default)]
    pub coordination: CoordinationSection,
    #[serde(default)]
    pub git: GitSection,
    /// Model identifier per tier. Missing tiers fall back to the defaults.
    #[serde(default)]
    pub models: HashMap<ReasoningTier, String>,
}

impl MenderToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse mender.toml")
    }

    /// Load from `<project_dir>/mender.toml`, or defaults if absent.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn escalation_policy(&self) -> Result<EscalationPolicy> {
        EscalationPolicy::new(
            self.escalation.tier_boundaries.clone(),
            self.escalation.human_threshold,
            self.escalation.min_confidence,
        )
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_turns: self.investigation.max_turns,
            token_budget: self.investigation.token_budget,
            min_confidence: self.escalation.min_confidence,
        }
    }

    pub fn coordination_config(&self) -> CoordinationConfig {
        CoordinationConfig {
            enabled: self.coordination.enabled,
            probe_attempts: self.coordination.probe_attempts,
            probe_delay_ms: self.coordination.probe_delay_ms,
            reconcile_delay_ms: self.coordination.reconcile_delay_ms,
            lock_ttl_secs: self.coordination.lock_ttl_secs,
        }
    }

    /// Model map with defaults filled in for unconfigured tiers.
    pub fn models(&self) -> HashMap<ReasoningTier, String> {
        let mut models = default_models();
        for (tier, model) in &self.models {
            models.insert(*tier, model.clone());
        }
        models
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Err(e) = self.escalation_policy() {
            warnings.push(format!("Invalid escalation ladder: {e}"));
        }
        if !(0.0..=1.0).contains(&self.escalation.min_confidence) {
            warnings.push(format!(
                "min_confidence {} is outside [0, 1]",
                self.escalation.min_confidence
            ));
        }
        if self.investigation.max_turns == 0 {
            warnings.push("max_turns of 0 means no investigation can ever run".to_string());
        }
        if self.coordination.enabled && self.coordination.probe_attempts == 0 {
            warnings.push(
                "coordination is enabled but probe_attempts is 0; existing locks will never be seen"
                    .to_string(),
            );
        }
        if self.coordination.lock_ttl_secs <= 0 {
            warnings.push("lock_ttl_secs must be positive for expiry to work".to_string());
        }

        warnings
    }
}
