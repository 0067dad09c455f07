//! Bounded multi-turn negotiation with the reasoning backend.
//!
//! One session covers one remediation attempt. The backend is stateless, so
//! every turn resends the full transcript. The loop is bounded two ways: a
//! turn cap and a cumulative token budget. Hitting either bound forces a
//! terminal decision from whatever was proposed so far.

use crate::context::ArtifactFetcher;
use crate::errors::InvestigationError;
use crate::escalation::ReasoningTier;
use crate::evidence::FailureEvidence;
use crate::history::AttemptRecord;
use crate::reasoning::{
    BackendReply, FixProposal, NegotiationResponse, ReasoningBackend, Role, Transcript,
};
use tracing::{debug, info, warn};

/// Budgets for one session. All three come from `[investigation]` config.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_turns: u32,
    pub token_budget: u64,
    pub min_confidence: f64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_turns: 8,
            token_budget: 200_000,
            min_confidence: 0.5,
        }
    }
}

/// One round of the negotiation loop.
#[derive(Debug, Clone)]
pub struct InvestigationTurn {
    pub turn_index: u32,
    pub requested_artifacts: Vec<String>,
    pub tokens_consumed: u64,
    pub decision: TurnDecision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnDecision {
    NeedMoreContext,
    ProposeFix,
}

/// How the session ended.
#[derive(Debug, Clone)]
pub enum InvestigationOutcome {
    /// A proposal to hand to the orchestrator. `forced` is set when the
    /// session hit a budget and fell back to the best proposal seen.
    Proposal { proposal: FixProposal, forced: bool },
    /// Budgets ran out before any proposal was ever made.
    Exhausted,
}

#[derive(Debug)]
pub struct InvestigationReport {
    pub outcome: InvestigationOutcome,
    pub turns: Vec<InvestigationTurn>,
    pub tokens_used: u64,
}

pub struct InvestigationSession<'a> {
    backend: &'a dyn ReasoningBackend,
    fetcher: &'a dyn ArtifactFetcher,
    limits: SessionLimits,
}

impl<'a> InvestigationSession<'a> {
    pub fn new(
        backend: &'a dyn ReasoningBackend,
        fetcher: &'a dyn ArtifactFetcher,
        limits: SessionLimits,
    ) -> Self {
        Self {
            backend,
            fetcher,
            limits,
        }
    }

    /// Run the negotiation to completion for one attempt.
    pub async fn run(
        &self,
        evidence: &FailureEvidence,
        tier: ReasoningTier,
        prior_attempts: &[AttemptRecord],
    ) -> Result<InvestigationReport, InvestigationError> {
        let mut transcript = Transcript::new();
        transcript.push(Role::Orchestrator, opening_prompt(evidence, prior_attempts));

        let mut turns: Vec<InvestigationTurn> = Vec::new();
        let mut tokens_used: u64 = 0;
        let mut best_proposal: Option<FixProposal> = None;

        for turn_index in 1..=self.limits.max_turns {
            let response = self.negotiate_with_retry(&transcript, tier, turn_index).await?;
            tokens_used += response.tokens_used;

            match response.reply {
                BackendReply::ProposeFix(raw) => {
                    let proposal = raw.normalized();
                    debug!(
                        turn = turn_index,
                        confidence = proposal.confidence,
                        "backend proposed a fix"
                    );
                    turns.push(InvestigationTurn {
                        turn_index,
                        requested_artifacts: Vec::new(),
                        tokens_consumed: response.tokens_used,
                        decision: TurnDecision::ProposeFix,
                    });

                    if proposal.confidence >= self.limits.min_confidence {
                        info!(
                            turn = turn_index,
                            tokens_used, "investigation settled on a proposal"
                        );
                        return Ok(InvestigationReport {
                            outcome: InvestigationOutcome::Proposal {
                                proposal,
                                forced: false,
                            },
                            turns,
                            tokens_used,
                        });
                    }

                    // Below the bar: remember it, tell the backend, keep going.
                    transcript.push(Role::Backend, render_proposal(&proposal));
                    transcript.push(
                        Role::Orchestrator,
                        format!(
                            "Your confidence ({:.2}) is below the acceptance minimum ({:.2}). \
                             Request more context or refine your proposal.",
                            proposal.confidence, self.limits.min_confidence
                        ),
                    );
                    if best_proposal
                        .as_ref()
                        .is_none_or(|best| proposal.confidence > best.confidence)
                    {
                        best_proposal = Some(proposal);
                    }
                }
                BackendReply::RequestContext(requests) => {
                    let descriptors: Vec<String> =
                        requests.iter().map(|r| r.descriptor()).collect();
                    debug!(turn = turn_index, requests = ?descriptors, "backend asked for context");
                    turns.push(InvestigationTurn {
                        turn_index,
                        requested_artifacts: descriptors,
                        tokens_consumed: response.tokens_used,
                        decision: TurnDecision::NeedMoreContext,
                    });

                    transcript.push(Role::Backend, render_requests(&requests));
                    let mut fulfilled = Vec::with_capacity(requests.len());
                    for request in &requests {
                        match self.fetcher.fetch(request) {
                            Ok(text) => fulfilled.push(text),
                            Err(e) => {
                                warn!(request = %request.descriptor(), error = %e, "artifact fetch failed");
                                fulfilled.push(format!(
                                    "### Unavailable: {} ({})",
                                    request.descriptor(),
                                    e
                                ));
                            }
                        }
                    }
                    transcript.push(Role::Orchestrator, fulfilled.join("\n\n"));
                }
            }

            if tokens_used >= self.limits.token_budget {
                info!(tokens_used, budget = self.limits.token_budget, "token budget exhausted");
                break;
            }
        }

        // Forced decision: best proposal seen, or nothing at all.
        let outcome = match best_proposal {
            Some(proposal) => InvestigationOutcome::Proposal {
                proposal,
                forced: true,
            },
            None => InvestigationOutcome::Exhausted,
        };
        Ok(InvestigationReport {
            outcome,
            turns,
            tokens_used,
        })
    }

    /// One backend call, retried once on failure. A second failure is fatal
    /// for the attempt.
    async fn negotiate_with_retry(
        &self,
        transcript: &Transcript,
        tier: ReasoningTier,
        turn: u32,
    ) -> Result<NegotiationResponse, InvestigationError> {
        match self.backend.negotiate(transcript, tier).await {
            Ok(response) => Ok(response),
            Err(first) => {
                warn!(turn, error = %first, "backend call failed, retrying once");
                self.backend
                    .negotiate(transcript, tier)
                    .await
                    .map_err(|e| InvestigationError::BackendFailed {
                        turn,
                        message: e.to_string(),
                    })
            }
        }
    }
}

fn opening_prompt(evidence: &FailureEvidence, prior_attempts: &[AttemptRecord]) -> String {
    let mut prompt = format!(
        "A build failed and needs a fix.\n\nFailure kind: {}\n\nFailure log excerpt:\n```\n{}\n```\n",
        evidence.kind, evidence.excerpt
    );
    if prior_attempts.is_empty() {
        prompt.push_str("\nThis is the first remediation attempt for this failure.\n");
    } else {
        prompt.push_str("\nPrior attempts that did NOT resolve the failure:\n");
        for attempt in prior_attempts {
            prompt.push_str(&format!(
                "- Attempt {} ({}, confidence {:.2}): {}\n",
                attempt.number, attempt.tier, attempt.confidence, attempt.description
            ));
            if let Some(cause) = &attempt.root_cause {
                prompt.push_str(&format!("  Suspected root cause: {}\n", cause));
            }
        }
        prompt.push_str("\nDo not repeat an approach that already failed.\n");
    }
    prompt
}

fn render_requests(requests: &[crate::reasoning::ArtifactRequest]) -> String {
    let lines: Vec<String> = requests
        .iter()
        .map(|r| format!("- {}", r.descriptor()))
        .collect();
    format!("Requesting context:\n{}", lines.join("\n"))
}

fn render_proposal(proposal: &FixProposal) -> String {
    format!(
        "Proposed fix (confidence {:.2}): {}\nRoot cause: {}",
        proposal.confidence, proposal.description, proposal.root_cause
    )
}
