//! Structured result of one orchestrator invocation.

use crate::escalation::ReasoningTier;
use serde::{Deserialize, Serialize};

/// What the orchestrator did with the observed build outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionTaken {
    /// Healthy build on a regular branch.
    NoOp,
    /// Another worker already holds the investigation lock.
    CoordinationSkip,
    /// A human committed to the fix branch; automated retries stop.
    HumanTakeover,
    /// An investigation ran and its record was committed.
    Attempted,
    /// The attempt limit was reached; a tracking issue hands off to a human.
    Escalated,
    /// The fix branch built green; a change request proposes the merge.
    MergeProposed,
    /// The attempt aborted on an unexpected error. Nothing advanced.
    Aborted,
}

/// Terminal state of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Applied,
    Rejected,
    InvestigationExhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub action: ActionTaken,
    pub fix_id: Option<String>,
    pub attempt_number: Option<u32>,
    pub tier: Option<ReasoningTier>,
    pub confidence: Option<f64>,
    pub outcome: Option<AttemptOutcome>,
    /// Pull request URL for merge proposals.
    pub change_url: Option<String>,
    /// Tracking issue URL for escalations.
    pub issue_url: Option<String>,
    pub error: Option<String>,
}

impl RunReport {
    pub fn bare(action: ActionTaken) -> Self {
        Self {
            action,
            fix_id: None,
            attempt_number: None,
            tier: None,
            confidence: None,
            outcome: None,
            change_url: None,
            issue_url: None,
            error: None,
        }
    }

    pub fn aborted(fix_id: Option<String>, error: impl std::fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            fix_id,
            ..Self::bare(ActionTaken::Aborted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_kebab_action() {
        let report = RunReport {
            attempt_number: Some(3),
            tier: Some(ReasoningTier::Tier2),
            confidence: Some(0.8),
            outcome: Some(AttemptOutcome::Applied),
            ..RunReport::bare(ActionTaken::Attempted)
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["action"], "attempted");
        assert_eq!(json["tier"], "tier-2");
        assert_eq!(json["outcome"], "applied");
        assert_eq!(json["attempt_number"], 3);
    }

    #[test]
    fn aborted_carries_the_error() {
        let report = RunReport::aborted(Some("f1".into()), "write failed");
        assert_eq!(report.action, ActionTaken::Aborted);
        assert_eq!(report.error.as_deref(), Some("write failed"));
        assert_eq!(report.fix_id.as_deref(), Some("f1"));
    }
}
