//! The commit log as the attempt database.
//!
//! No external storage exists for remediation state. Every attempt is
//! recorded in its commit message on the fix branch, and prior attempts are
//! reconstructed by parsing those messages back. Parsing is tolerant:
//! unrecognized commits are skipped, malformed fields fall back to defaults,
//! and a branch whose history cannot be read at all counts as attempt 1.

use crate::escalation::ReasoningTier;
use crate::git::CommitInfo;
use crate::reasoning::FixProposal;
use regex::Regex;
use std::sync::LazyLock;
use tracing::warn;

/// Author name used for every commit the agent makes. Anything else on a fix
/// branch means a human has taken over.
pub const AGENT_AUTHOR: &str = "mender";

static SUBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^mender: attempt (\d+): (.+)$").unwrap());

/// One prior attempt, reconstructed from a commit message.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub number: u32,
    pub tier: ReasoningTier,
    pub confidence: f64,
    pub description: String,
    pub root_cause: Option<String>,
    pub reasoning: Option<String>,
    pub author: String,
}

/// Render the durable commit message for one applied attempt.
pub fn format_commit_message(
    attempt: u32,
    tier: ReasoningTier,
    proposal: &FixProposal,
    fix_id: &str,
) -> String {
    format!(
        "mender: attempt {}: {}\n\nTier: {}\nConfidence: {:.2}\nRoot cause: {}\nReasoning: {}\nFix-Id: {}\n",
        attempt,
        proposal.description,
        tier,
        proposal.confidence,
        proposal.root_cause,
        proposal.reasoning.replace('\n', " "),
        fix_id
    )
}

/// Parse one commit message into an attempt record. Returns `None` for
/// commits that are not agent attempts (human commits, merge commits).
pub fn parse_attempt(message: &str, author: &str) -> Option<AttemptRecord> {
    let subject = message.lines().next()?;
    let caps = SUBJECT_RE.captures(subject)?;
    let number: u32 = caps[1].parse().ok()?;
    let description = caps[2].to_string();

    let mut tier = ReasoningTier::Tier1;
    let mut confidence = 0.0;
    let mut root_cause = None;
    let mut reasoning = None;
    for line in message.lines().skip(1) {
        if let Some(value) = line.strip_prefix("Tier: ") {
            tier = value.trim().parse().unwrap_or(ReasoningTier::Tier1);
        } else if let Some(value) = line.strip_prefix("Confidence: ") {
            confidence = value.trim().parse().unwrap_or(0.0);
        } else if let Some(value) = line.strip_prefix("Root cause: ") {
            root_cause = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Reasoning: ") {
            reasoning = Some(value.trim().to_string());
        }
    }

    Some(AttemptRecord {
        number,
        tier,
        confidence,
        description,
        root_cause,
        reasoning,
        author: author.to_string(),
    })
}

/// All agent attempts found on the branch, oldest first by attempt number.
pub fn collect_attempts(commits: &[CommitInfo]) -> Vec<AttemptRecord> {
    let mut attempts: Vec<AttemptRecord> = commits
        .iter()
        .filter_map(|c| parse_attempt(&c.message, &c.author))
        .collect();
    attempts.sort_by_key(|a| a.number);
    attempts
}

/// Highest attempt number recorded on the branch, 0 if none. A fix branch
/// with commits but no recognizable attempt record is ambiguous; report 0 so
/// the caller starts over at attempt 1 rather than guessing higher.
pub fn recover_attempt_number(commits: &[CommitInfo]) -> u32 {
    let attempts = collect_attempts(commits);
    match attempts.last() {
        Some(last) => last.number,
        None => {
            if !commits.is_empty() {
                warn!(
                    commits = commits.len(),
                    "fix branch has commits but no parseable attempt record, restarting at attempt 1"
                );
            }
            0
        }
    }
}

/// A commit by someone other than the agent, made after the agent started
/// working the branch. Commits arrive newest first; anything older than the
/// earliest attempt record is base-branch history and does not count.
pub fn human_takeover(commits: &[CommitInfo]) -> Option<&CommitInfo> {
    let oldest_attempt = commits
        .iter()
        .rposition(|c| parse_attempt(&c.message, &c.author).is_some())?;
    commits[..oldest_attempt]
        .iter()
        .find(|c| c.author != AGENT_AUTHOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasoning::FixProposal;

    fn commit(author: &str, message: &str) -> CommitInfo {
        CommitInfo {
            id: "0123456789abcdef".into(),
            author: author.into(),
            message: message.into(),
        }
    }

    fn proposal() -> FixProposal {
        FixProposal {
            description: "pin libfoo to 2.4".into(),
            root_cause: "upstream released a breaking 2.5".into(),
            reasoning: "log shows symbol\nmissing since 2.5".into(),
            confidence: 0.85,
            changes: Vec::new(),
        }
    }

    #[test]
    fn message_round_trips_through_parse() {
        let message = format_commit_message(3, ReasoningTier::Tier2, &proposal(), "F1");
        let record = parse_attempt(&message, AGENT_AUTHOR).unwrap();
        assert_eq!(record.number, 3);
        assert_eq!(record.tier, ReasoningTier::Tier2);
        assert!((record.confidence - 0.85).abs() < 1e-9);
        assert_eq!(record.description, "pin libfoo to 2.4");
        assert_eq!(
            record.root_cause.as_deref(),
            Some("upstream released a breaking 2.5")
        );
        // Newlines in reasoning are flattened for the body line.
        assert_eq!(
            record.reasoning.as_deref(),
            Some("log shows symbol missing since 2.5")
        );
    }

    #[test]
    fn message_embeds_fix_id() {
        let message = format_commit_message(1, ReasoningTier::Tier1, &proposal(), "abc123");
        assert!(message.contains("Fix-Id: abc123"));
    }

    #[test]
    fn non_agent_messages_are_skipped() {
        assert!(parse_attempt("Merge branch 'main'", "alice").is_none());
        assert!(parse_attempt("fix the build", AGENT_AUTHOR).is_none());
        assert!(parse_attempt("mender: attempt x: bad number", AGENT_AUTHOR).is_none());
    }

    #[test]
    fn missing_body_fields_fall_back_to_defaults() {
        let record = parse_attempt("mender: attempt 2: partial record", AGENT_AUTHOR).unwrap();
        assert_eq!(record.number, 2);
        assert_eq!(record.tier, ReasoningTier::Tier1);
        assert_eq!(record.confidence, 0.0);
        assert!(record.root_cause.is_none());
    }

    #[test]
    fn malformed_body_fields_do_not_fail_the_parse() {
        let message = "mender: attempt 2: odd fields\n\nTier: tier-99\nConfidence: lots\n";
        let record = parse_attempt(message, AGENT_AUTHOR).unwrap();
        assert_eq!(record.tier, ReasoningTier::Tier1);
        assert_eq!(record.confidence, 0.0);
    }

    #[test]
    fn collect_orders_by_attempt_number() {
        let commits = vec![
            commit(AGENT_AUTHOR, "mender: attempt 2: second try"),
            commit("alice", "tweak readme"),
            commit(AGENT_AUTHOR, "mender: attempt 1: first try"),
        ];
        let attempts = collect_attempts(&commits);
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].number, 1);
        assert_eq!(attempts[1].number, 2);
    }

    #[test]
    fn recover_uses_highest_attempt() {
        let commits = vec![
            commit(AGENT_AUTHOR, "mender: attempt 1: first"),
            commit(AGENT_AUTHOR, "mender: attempt 3: third"),
        ];
        assert_eq!(recover_attempt_number(&commits), 3);
    }

    #[test]
    fn recover_defaults_when_history_is_unreadable() {
        assert_eq!(recover_attempt_number(&[]), 0);
        let commits = vec![commit(AGENT_AUTHOR, "not an attempt record")];
        assert_eq!(recover_attempt_number(&commits), 0);
    }

    #[test]
    fn detects_human_takeover() {
        let agent_only = vec![commit(AGENT_AUTHOR, "mender: attempt 1: x")];
        assert!(human_takeover(&agent_only).is_none());

        // Newest first: alice committed after the attempt.
        let with_human = vec![
            commit("alice", "hand-fixed the linker flags"),
            commit(AGENT_AUTHOR, "mender: attempt 1: x"),
        ];
        assert_eq!(human_takeover(&with_human).unwrap().author, "alice");
    }

    #[test]
    fn base_history_below_the_first_attempt_is_not_a_takeover() {
        let commits = vec![
            commit(AGENT_AUTHOR, "mender: attempt 1: x"),
            commit("alice", "base branch work before the failure"),
        ];
        assert!(human_takeover(&commits).is_none());
    }
}
