//! The reasoning-backend boundary.
//!
//! The backend is stateless: there is no server-side session, so the full
//! running transcript is resent on every call. The transcript is therefore
//! an explicit value owned by the investigation session, never hidden
//! connection state.

pub mod anthropic;

use crate::escalation::ReasoningTier;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Who produced a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The orchestrator: failure evidence, fetched artifacts, notes.
    Orchestrator,
    /// The reasoning backend: context requests and fix proposals.
    Backend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
}

/// The accumulated conversation for one attempt.
///
/// Append-only; each backend call receives the whole thing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        self.entries.push(TranscriptEntry {
            role,
            content: content.into(),
        });
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One artifact the backend wants before it will commit to a fix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArtifactRequest {
    /// Full content of a repository file.
    File { path: String, reason: String },
    /// Lines of the failure log around a search term.
    LogExcerpt { search: String, reason: String },
    /// Recent commit history, optionally limited to one path.
    History { path: Option<String>, reason: String },
}

impl ArtifactRequest {
    /// Short descriptor for logging and error messages.
    pub fn descriptor(&self) -> String {
        match self {
            ArtifactRequest::File { path, .. } => format!("file:{}", path),
            ArtifactRequest::LogExcerpt { search, .. } => format!("log:{}", search),
            ArtifactRequest::History { path, .. } => {
                format!("history:{}", path.as_deref().unwrap_or("*"))
            }
        }
    }
}

/// One file mutation in a proposed fix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub action: ChangeAction,
    /// Full new content for Edit/Create; ignored for Delete.
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Edit,
    Create,
    Delete,
}

/// A candidate fix from the backend, with its self-assessed confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixProposal {
    pub description: String,
    pub root_cause: String,
    pub reasoning: String,
    /// Self-assessed confidence in [0, 1]. Clamped on construction.
    pub confidence: f64,
    pub changes: Vec<FileChange>,
}

impl FixProposal {
    /// Clamp confidence into [0, 1]; backends occasionally return junk.
    pub fn normalized(mut self) -> Self {
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self
    }
}

/// What the backend said this turn.
#[derive(Debug, Clone)]
pub enum BackendReply {
    /// The backend needs more context before proposing a fix.
    RequestContext(Vec<ArtifactRequest>),
    /// The backend proposes a fix.
    ProposeFix(FixProposal),
}

/// A backend reply plus the tokens the call consumed, which the session
/// charges against its token budget.
#[derive(Debug, Clone)]
pub struct NegotiationResponse {
    pub reply: BackendReply,
    pub tokens_used: u64,
}

/// The reasoning backend boundary. Stateless per call: implementations must
/// not retain conversation state between calls. Failures are plain
/// `anyhow` errors; the investigation session decides whether to retry and
/// wraps them with the turn number.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    async fn negotiate(
        &self,
        transcript: &Transcript,
        tier: ReasoningTier,
    ) -> anyhow::Result<NegotiationResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_is_append_only_and_ordered() {
        let mut t = Transcript::new();
        assert!(t.is_empty());
        t.push(Role::Orchestrator, "failure evidence");
        t.push(Role::Backend, "need main.rs");
        t.push(Role::Orchestrator, "here is main.rs");
        assert_eq!(t.len(), 3);
        assert_eq!(t.entries()[0].role, Role::Orchestrator);
        assert_eq!(t.entries()[1].role, Role::Backend);
        assert_eq!(t.entries()[2].content, "here is main.rs");
    }

    #[test]
    fn artifact_request_descriptor() {
        let req = ArtifactRequest::File {
            path: "src/main.rs".into(),
            reason: "referenced in error".into(),
        };
        assert_eq!(req.descriptor(), "file:src/main.rs");

        let req = ArtifactRequest::History { path: None, reason: "recent churn".into() };
        assert_eq!(req.descriptor(), "history:*");
    }

    #[test]
    fn artifact_request_serde_tagged() {
        let json = r#"{"type":"file","path":"Cargo.toml","reason":"check deps"}"#;
        let req: ArtifactRequest = serde_json::from_str(json).unwrap();
        assert!(matches!(req, ArtifactRequest::File { .. }));

        let json = r#"{"type":"log_excerpt","search":"E0425","reason":"context"}"#;
        let req: ArtifactRequest = serde_json::from_str(json).unwrap();
        assert!(matches!(req, ArtifactRequest::LogExcerpt { .. }));
    }

    #[test]
    fn proposal_confidence_is_clamped() {
        let p = FixProposal {
            description: "d".into(),
            root_cause: "r".into(),
            reasoning: "w".into(),
            confidence: 1.7,
            changes: vec![],
        }
        .normalized();
        assert_eq!(p.confidence, 1.0);

        let p = FixProposal {
            description: "d".into(),
            root_cause: "r".into(),
            reasoning: "w".into(),
            confidence: -0.2,
            changes: vec![],
        }
        .normalized();
        assert_eq!(p.confidence, 0.0);
    }

    #[test]
    fn file_change_default_content_is_empty() {
        let json = r#"{"path":"old.rs","action":"delete"}"#;
        let change: FileChange = serde_json::from_str(json).unwrap();
        assert_eq!(change.action, ChangeAction::Delete);
        assert!(change.content.is_empty());
    }
}
