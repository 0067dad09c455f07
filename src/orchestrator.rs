//! The remediation state machine.
//!
//! One invocation observes one build outcome and reacts: start a fix branch,
//! retry on it at an escalated tier, hand off to a human, propose the merge,
//! or do nothing. All durable state lives in the fix branch's commit
//! messages and in hub issues; the orchestrator itself is stateless between
//! invocations.

use crate::context::ArtifactFetcher;
use crate::coordination::{ClaimOutcome, CoordinationConfig, Coordinator, IssueLockStore, LockRecord};
use crate::escalation::EscalationPolicy;
use crate::evidence::FailureEvidence;
use crate::git::{Vcs, branch_for_fix, fix_id_from_branch};
use crate::history::{self, AttemptRecord};
use crate::hub::ReviewHub;
use crate::investigation::{
    InvestigationOutcome, InvestigationSession, SessionLimits,
};
use crate::reasoning::{FixProposal, ReasoningBackend};
use crate::report::{ActionTaken, AttemptOutcome, RunReport};
use tracing::{error, info, warn};

/// Commits scanned when reconstructing attempt history.
const HISTORY_SCAN_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Success,
    Failure,
}

/// One observed build outcome, the orchestrator's entire input.
#[derive(Debug)]
pub struct Invocation {
    pub branch: String,
    pub status: BuildStatus,
    pub evidence: Option<FailureEvidence>,
    pub worker: String,
}

pub struct Orchestrator<'a> {
    vcs: &'a dyn Vcs,
    hub: &'a dyn ReviewHub,
    backend: &'a dyn ReasoningBackend,
    fetcher: &'a dyn ArtifactFetcher,
    policy: EscalationPolicy,
    limits: SessionLimits,
    coordination: CoordinationConfig,
    /// Merge proposals target this branch.
    base_branch: String,
}

impl<'a> Orchestrator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vcs: &'a dyn Vcs,
        hub: &'a dyn ReviewHub,
        backend: &'a dyn ReasoningBackend,
        fetcher: &'a dyn ArtifactFetcher,
        policy: EscalationPolicy,
        limits: SessionLimits,
        coordination: CoordinationConfig,
        base_branch: String,
    ) -> Self {
        Self {
            vcs,
            hub,
            backend,
            fetcher,
            policy,
            limits,
            coordination,
            base_branch,
        }
    }

    /// React to one build outcome. Never panics and never returns `Err`;
    /// every failure path is folded into the report.
    pub async fn run(&self, invocation: &Invocation) -> RunReport {
        let fix_id = fix_id_from_branch(&invocation.branch).map(String::from);
        match (fix_id, invocation.status) {
            (None, BuildStatus::Success) => {
                info!(branch = %invocation.branch, "build healthy, nothing to do");
                RunReport::bare(ActionTaken::NoOp)
            }
            (None, BuildStatus::Failure) => self.start_remediation(invocation).await,
            (Some(fix_id), BuildStatus::Failure) => self.continue_remediation(invocation, fix_id).await,
            (Some(fix_id), BuildStatus::Success) => self.propose_merge(fix_id, &invocation.branch).await,
        }
    }

    /// Case: regular branch failed. Claim the failure, branch, run attempt 1.
    async fn start_remediation(&self, invocation: &Invocation) -> RunReport {
        let evidence = invocation
            .evidence
            .clone()
            .unwrap_or_else(FailureEvidence::unavailable);
        let fix_id = self.derive_fix_id(&evidence);
        info!(fix_id = %fix_id, kind = %evidence.kind, "build failure on a regular branch");

        let store = IssueLockStore::new(self.hub);
        let coordinator = Coordinator::new(&store, self.coordination.clone());
        let lock = match coordinator.claim(&fix_id, &invocation.worker).await {
            ClaimOutcome::Owner { lock } => lock,
            ClaimOutcome::Skip { holder } => {
                info!(holder = ?holder.as_ref().map(|h| h.lock_id),
                      "another worker is already investigating");
                return RunReport {
                    fix_id: Some(fix_id),
                    ..RunReport::bare(ActionTaken::CoordinationSkip)
                };
            }
        };

        let branch = branch_for_fix(&fix_id);
        if let Err(e) = self.vcs.create_branch(&branch) {
            error!(error = %e, branch = %branch, "failed to create fix branch");
            self.release_lock(&coordinator, lock.as_ref()).await;
            return RunReport::aborted(Some(fix_id), e);
        }

        let report = self
            .run_attempt(&fix_id, &branch, 1, &evidence, &[])
            .await;
        if report.action == ActionTaken::Aborted {
            // Let another worker retry rather than sitting on the lock
            // until it expires.
            self.release_lock(&coordinator, lock.as_ref()).await;
        }
        report
    }

    /// Case: fix branch failed again. Retry at an escalated tier, or hand
    /// off to a human once attempts pile up.
    async fn continue_remediation(&self, invocation: &Invocation, fix_id: String) -> RunReport {
        let commits = match self.vcs.list_commits(&invocation.branch, HISTORY_SCAN_LIMIT) {
            Ok(commits) => commits,
            Err(e) => {
                warn!(error = %e, "cannot read fix branch history, restarting at attempt 1");
                Vec::new()
            }
        };

        if let Some(commit) = history::human_takeover(&commits) {
            info!(author = %commit.author, "human commit on fix branch, stopping automation");
            return RunReport {
                fix_id: Some(fix_id),
                ..RunReport::bare(ActionTaken::HumanTakeover)
            };
        }

        let prior = history::collect_attempts(&commits);
        let recorded = history::recover_attempt_number(&commits);
        let next = recorded + 1;

        // Escalation keys on completed attempts: a threshold of 7 lets
        // attempt 7 run and hands off on the failure after it.
        if self.policy.should_escalate_to_human(recorded) {
            return self.escalate(&fix_id, &invocation.branch, &prior).await;
        }

        let evidence = invocation
            .evidence
            .clone()
            .unwrap_or_else(FailureEvidence::unavailable);
        self.run_attempt(&fix_id, &invocation.branch, next, &evidence, &prior)
            .await
    }

    /// One full investigation: negotiate, apply (or record the refusal),
    /// commit, push.
    async fn run_attempt(
        &self,
        fix_id: &str,
        branch: &str,
        attempt: u32,
        evidence: &FailureEvidence,
        prior: &[AttemptRecord],
    ) -> RunReport {
        let tier = self.policy.tier_for(attempt);
        info!(fix_id, attempt, tier = %tier, "running investigation");

        let session = InvestigationSession::new(self.backend, self.fetcher, self.limits);
        let investigation = match session.run(evidence, tier, prior).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, attempt, "investigation failed");
                return RunReport::aborted(Some(fix_id.to_string()), e);
            }
        };

        let (proposal, outcome) = match investigation.outcome {
            InvestigationOutcome::Proposal { proposal, .. } => {
                if self.policy.meets_confidence(proposal.confidence) {
                    (proposal, AttemptOutcome::Applied)
                } else {
                    info!(
                        confidence = proposal.confidence,
                        "final proposal below confidence minimum, not applying"
                    );
                    (proposal, AttemptOutcome::Rejected)
                }
            }
            InvestigationOutcome::Exhausted => (
                exhausted_placeholder(),
                AttemptOutcome::InvestigationExhausted,
            ),
        };

        // Rejected and exhausted attempts still get a commit: the message is
        // the only durable record that the attempt happened.
        let changes = if outcome == AttemptOutcome::Applied {
            proposal.changes.clone()
        } else {
            Vec::new()
        };
        let message = history::format_commit_message(attempt, tier, &proposal, fix_id);
        if let Err(e) = self.vcs.commit_changes(&message, &changes) {
            error!(error = %e, attempt, "failed to apply/commit the fix");
            return RunReport::aborted(Some(fix_id.to_string()), e);
        }

        let mut report = RunReport {
            fix_id: Some(fix_id.to_string()),
            attempt_number: Some(attempt),
            tier: Some(tier),
            confidence: Some(proposal.confidence),
            outcome: Some(outcome),
            ..RunReport::bare(ActionTaken::Attempted)
        };
        if let Err(e) = self.vcs.push(branch) {
            warn!(error = %e, branch, "push failed after committing the attempt");
            report.error = Some(format!("push failed: {e}"));
        }
        report
    }

    /// Case: attempt limit reached. One tracking issue per fix id, ever.
    async fn escalate(&self, fix_id: &str, branch: &str, prior: &[AttemptRecord]) -> RunReport {
        let title = format!("Automated remediation exhausted for {fix_id}");
        let body = escalation_body(fix_id, branch, prior);
        let label = format!("mender-escalation-{fix_id}");
        match self.hub.open_tracking_issue(&title, &body, &label).await {
            Ok(outcome) => {
                if outcome.already_existed {
                    info!(issue = outcome.issue.number, "escalation already filed");
                } else {
                    info!(issue = outcome.issue.number, "escalated to a human");
                }
                RunReport {
                    fix_id: Some(fix_id.to_string()),
                    attempt_number: prior.last().map(|a| a.number),
                    issue_url: Some(outcome.issue.url),
                    ..RunReport::bare(ActionTaken::Escalated)
                }
            }
            Err(e) => {
                error!(error = %e, "failed to open escalation issue");
                RunReport::aborted(Some(fix_id.to_string()), e)
            }
        }
    }

    /// Case: fix branch built green. Summarize everything for human review.
    async fn propose_merge(&self, fix_id: String, branch: &str) -> RunReport {
        let commits = match self.vcs.list_commits(branch, HISTORY_SCAN_LIMIT) {
            Ok(commits) => commits,
            Err(e) => return RunReport::aborted(Some(fix_id), e),
        };
        let attempts = history::collect_attempts(&commits);
        let diff = match self.vcs.diff(branch, &self.base_branch) {
            Ok(diff) => diff,
            Err(e) => {
                warn!(error = %e, "diff unavailable for merge proposal");
                String::from("(diff unavailable)")
            }
        };

        let title = format!("Automated fix for {fix_id}");
        let body = merge_body(&fix_id, &attempts, &diff);
        match self
            .hub
            .open_change_request(&title, &body, branch, &self.base_branch)
            .await
        {
            Ok(change) => {
                info!(pr = change.number, "merge proposed");
                RunReport {
                    fix_id: Some(fix_id),
                    attempt_number: attempts.last().map(|a| a.number),
                    confidence: attempts.last().map(|a| a.confidence),
                    change_url: Some(change.url),
                    ..RunReport::bare(ActionTaken::MergeProposed)
                }
            }
            Err(e) => {
                error!(error = %e, "failed to open merge proposal");
                RunReport::aborted(Some(fix_id), e)
            }
        }
    }

    /// Stable failure identity shared by every flavor racing on the same
    /// revision.
    fn derive_fix_id(&self, evidence: &FailureEvidence) -> String {
        match self.vcs.head_sha() {
            Ok(sha) => sha.chars().take(8).collect(),
            Err(e) => {
                warn!(error = %e, "no HEAD sha available, keying on the failure signature");
                evidence.signature()
            }
        }
    }

    async fn release_lock(&self, coordinator: &Coordinator<'_>, lock: Option<&LockRecord>) {
        if let Some(lock) = lock {
            coordinator.release(lock).await;
        }
    }
}

fn exhausted_placeholder() -> FixProposal {
    FixProposal {
        description: "investigation exhausted without a proposal".into(),
        root_cause: "undetermined".into(),
        reasoning: String::new(),
        confidence: 0.0,
        changes: Vec::new(),
    }
}

/// Full literal attempt trail; a human must be able to audit every step.
fn attempt_trail(attempts: &[AttemptRecord]) -> String {
    if attempts.is_empty() {
        return "No attempt records were recovered from the branch.".to_string();
    }
    let mut out = String::new();
    for a in attempts {
        out.push_str(&format!(
            "### Attempt {} ({}, confidence {:.2})\n{}\n",
            a.number, a.tier, a.confidence, a.description
        ));
        if let Some(cause) = &a.root_cause {
            out.push_str(&format!("- Root cause: {}\n", cause));
        }
        if let Some(reasoning) = &a.reasoning {
            out.push_str(&format!("- Reasoning: {}\n", reasoning));
        }
        out.push('\n');
    }
    out
}

fn escalation_body(fix_id: &str, branch: &str, attempts: &[AttemptRecord]) -> String {
    format!(
        "Automated remediation for `{fix_id}` reached its attempt limit without a \
         green build. A human needs to take over on branch `{branch}`.\n\n\
         ## Attempt history\n\n{}",
        attempt_trail(attempts)
    )
}

fn merge_body(fix_id: &str, attempts: &[AttemptRecord], diff: &str) -> String {
    format!(
        "The build for `{fix_id}` is green after {} automated attempt(s). \
         Review the accumulated change before merging.\n\n\
         ## Attempt history\n\n{}\n## Accumulated diff\n\n```diff\n{}\n```",
        attempts.len(),
        attempt_trail(attempts),
        diff
    )
}
