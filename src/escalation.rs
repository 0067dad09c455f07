//! Escalation policy: which reasoning tier handles a given attempt, and
//! when the session stops retrying and hands the failure to a human.
//!
//! The policy is a pure, total function of the attempt number. Every
//! positive attempt number maps to exactly one tier; attempt numbers at or
//! past the human-escalation threshold stop automated retries entirely.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered capability level of the reasoning backend.
///
/// Lower tiers are cheaper and faster; higher tiers are more capable and
/// more expensive. Ordering is significant: the tier for attempt N+1 is
/// never lower than the tier for attempt N.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ReasoningTier {
    #[serde(rename = "tier-1")]
    Tier1,
    #[serde(rename = "tier-2")]
    Tier2,
    #[serde(rename = "tier-3")]
    Tier3,
}

impl fmt::Display for ReasoningTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReasoningTier::Tier1 => write!(f, "tier-1"),
            ReasoningTier::Tier2 => write!(f, "tier-2"),
            ReasoningTier::Tier3 => write!(f, "tier-3"),
        }
    }
}

impl std::str::FromStr for ReasoningTier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tier-1" | "tier1" => Ok(ReasoningTier::Tier1),
            "tier-2" | "tier2" => Ok(ReasoningTier::Tier2),
            "tier-3" | "tier3" => Ok(ReasoningTier::Tier3),
            _ => anyhow::bail!("Invalid reasoning tier '{}'. Valid values: tier-1, tier-2, tier-3", s),
        }
    }
}

/// One rung of the tier ladder: attempts up to and including `last_attempt`
/// run at `tier`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBoundary {
    pub last_attempt: u32,
    pub tier: ReasoningTier,
}

/// Maps attempt numbers to reasoning tiers and decides when to stop
/// retrying and escalate to a human.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationPolicy {
    /// Ordered ladder of tier boundaries. Attempts past the last boundary
    /// clamp to the last boundary's tier.
    boundaries: Vec<TierBoundary>,
    /// Once this many attempts have completed without a green build, the
    /// next failure escalates to a human instead of running another
    /// automated attempt.
    human_threshold: u32,
    /// Proposals with final confidence below this floor count as failed
    /// attempts even when the investigation reported a fix.
    min_confidence: f64,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            boundaries: vec![
                TierBoundary { last_attempt: 4, tier: ReasoningTier::Tier1 },
                TierBoundary { last_attempt: 6, tier: ReasoningTier::Tier2 },
            ],
            human_threshold: 7,
            min_confidence: 0.5,
        }
    }
}

impl EscalationPolicy {
    /// Build a policy from explicit boundaries. Boundaries are sorted and
    /// checked for monotone tiers; a non-monotone ladder is rejected so the
    /// tier-never-decreases invariant holds by construction.
    pub fn new(
        mut boundaries: Vec<TierBoundary>,
        human_threshold: u32,
        min_confidence: f64,
    ) -> anyhow::Result<Self> {
        if boundaries.is_empty() {
            anyhow::bail!("Escalation policy requires at least one tier boundary");
        }
        if human_threshold < 1 {
            anyhow::bail!("Human escalation threshold must be at least 1");
        }
        boundaries.sort_by_key(|b| b.last_attempt);
        for pair in boundaries.windows(2) {
            if pair[1].tier < pair[0].tier {
                anyhow::bail!(
                    "Tier ladder is not monotone: attempts <= {} map to {} but attempts <= {} map to {}",
                    pair[0].last_attempt,
                    pair[0].tier,
                    pair[1].last_attempt,
                    pair[1].tier
                );
            }
        }
        Ok(Self { boundaries, human_threshold, min_confidence })
    }

    /// The tier that handles the given attempt. Total: attempts past the
    /// last configured boundary clamp to the top of the ladder.
    pub fn tier_for(&self, attempt: u32) -> ReasoningTier {
        for boundary in &self.boundaries {
            if attempt <= boundary.last_attempt {
                return boundary.tier;
            }
        }
        // Past the ladder: the constructor guarantees at least one rung.
        self.boundaries.last().map(|b| b.tier).unwrap_or(ReasoningTier::Tier1)
    }

    /// Whether `completed_attempts` has reached the human threshold. The
    /// caller passes the number of attempts already recorded on the branch.
    pub fn should_escalate_to_human(&self, completed_attempts: u32) -> bool {
        completed_attempts >= self.human_threshold
    }

    pub fn human_threshold(&self) -> u32 {
        self.human_threshold
    }

    /// Whether a proposal's confidence clears the configured floor. A
    /// proposal below the floor is treated as a failed attempt that retries
    /// at the tier for the next attempt number.
    pub fn meets_confidence(&self, confidence: f64) -> bool {
        confidence >= self.min_confidence
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }
}
