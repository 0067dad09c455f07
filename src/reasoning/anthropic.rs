//! Anthropic Messages API implementation of the reasoning backend.
//!
//! Each negotiation call sends the entire transcript (the API is stateless)
//! and asks for a single JSON object in the reply: either a context request
//! or a fix proposal. The tier is resolved to a concrete model ID through
//! configuration.

use super::{
    ArtifactRequest, BackendReply, FixProposal, NegotiationResponse, ReasoningBackend, Role,
    Transcript,
};
use crate::escalation::ReasoningTier;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8192;
const DEFAULT_TIMEOUT_SECS: u64 = 120;

const SYSTEM_PROMPT: &str = "You are a build-failure remediation assistant. \
You receive build failure evidence and repository artifacts, and you reply with \
exactly one JSON object, either:\n\
{\"request_context\": [{\"type\": \"file\", \"path\": \"...\", \"reason\": \"...\"}, ...]}\n\
to ask for more context (types: file, log_excerpt, history), or:\n\
{\"propose_fix\": {\"description\": \"...\", \"root_cause\": \"...\", \"reasoning\": \"...\", \
\"confidence\": 0.0, \"changes\": [{\"path\": \"...\", \"action\": \"edit|create|delete\", \
\"content\": \"...\"}]}}\n\
to propose a fix. Confidence is your honest estimate in [0,1]. \
Reply with the JSON object only, optionally inside a ```json fence.";

/// Anthropic-backed reasoning client. Tier-to-model mapping comes from
/// configuration so operators can reassign tiers without a rebuild.
pub struct AnthropicBackend {
    client: reqwest::Client,
    api_key: String,
    models: HashMap<ReasoningTier, String>,
    max_tokens: u32,
}

impl AnthropicBackend {
    pub fn new(api_key: String, models: HashMap<ReasoningTier, String>) -> Result<Self> {
        if api_key.is_empty() {
            anyhow::bail!("Anthropic API key is empty; set ANTHROPIC_API_KEY");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_key,
            models,
            max_tokens: DEFAULT_MAX_TOKENS,
        })
    }

    fn model_for(&self, tier: ReasoningTier) -> Result<&str> {
        self.models
            .get(&tier)
            .map(String::as_str)
            .with_context(|| format!("No model configured for {}", tier))
    }
}

#[async_trait]
impl ReasoningBackend for AnthropicBackend {
    async fn negotiate(
        &self,
        transcript: &Transcript,
        tier: ReasoningTier,
    ) -> Result<NegotiationResponse> {
        let model = self.model_for(tier)?;
        let body = json!({
            "model": model,
            "max_tokens": self.max_tokens,
            "system": SYSTEM_PROMPT,
            "messages": render_messages(transcript),
        });

        tracing::debug!(model, turns = transcript.len(), "negotiating with reasoning backend");

        let resp = self
            .client
            .post(ANTHROPIC_MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .context("Failed to send negotiation request")?
            .error_for_status()
            .context("Reasoning backend returned error status")?
            .json::<MessagesResponse>()
            .await
            .context("Failed to parse reasoning backend response")?;

        let text = resp
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");

        let reply = parse_reply(&text)?;
        Ok(NegotiationResponse {
            reply,
            tokens_used: resp.usage.input_tokens + resp.usage.output_tokens,
        })
    }
}

/// Flatten the transcript into the alternating message list the API wants.
/// Orchestrator entries become `user` turns, backend entries `assistant`.
fn render_messages(transcript: &Transcript) -> Vec<serde_json::Value> {
    transcript
        .entries()
        .iter()
        .map(|entry| {
            let role = match entry.role {
                Role::Orchestrator => "user",
                Role::Backend => "assistant",
            };
            json!({ "role": role, "content": entry.content })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Wire shape of the backend's structured reply.
#[derive(Debug, Serialize, Deserialize)]
struct WireReply {
    #[serde(default)]
    request_context: Option<Vec<ArtifactRequest>>,
    #[serde(default)]
    propose_fix: Option<FixProposal>,
}

/// Parse the model's reply text into a `BackendReply`.
///
/// Tolerant of markdown fences and surrounding prose: extracts the first
/// fenced JSON block if present, otherwise the outermost `{...}` span.
pub fn parse_reply(text: &str) -> Result<BackendReply> {
    let raw = extract_json(text)
        .with_context(|| format!("No JSON object found in backend reply: {:.200}", text))?;
    let wire: WireReply = serde_json::from_str(raw)
        .with_context(|| format!("Malformed JSON in backend reply: {:.200}", raw))?;

    if let Some(proposal) = wire.propose_fix {
        return Ok(BackendReply::ProposeFix(proposal.normalized()));
    }
    if let Some(requests) = wire.request_context {
        if requests.is_empty() {
            anyhow::bail!("Backend sent an empty context request");
        }
        return Ok(BackendReply::RequestContext(requests));
    }
    anyhow::bail!("Backend reply contained neither request_context nor propose_fix")
}

/// Extract the JSON payload from reply text: fenced block first, then the
/// outermost braces.
fn extract_json(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let after = &text[start + 7..];
        if let Some(end) = after.find("```") {
            return Some(after[..end].trim());
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasoning::ChangeAction;

    // ── extract_json ─────────────────────────────────────────────────

    #[test]
    fn extracts_from_json_fence() {
        let text = "Here is my answer:\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(extract_json(text), Some("{\"a\": 1}"));
    }

    #[test]
    fn extracts_bare_braces() {
        let text = "prefix {\"a\": 1} suffix";
        assert_eq!(extract_json(text), Some("{\"a\": 1}"));
    }

    #[test]
    fn extracts_outermost_braces() {
        let text = "{\"a\": {\"b\": 2}}";
        assert_eq!(extract_json(text), Some("{\"a\": {\"b\": 2}}"));
    }

    #[test]
    fn no_json_returns_none() {
        assert_eq!(extract_json("no json here"), None);
    }

    // ── parse_reply ──────────────────────────────────────────────────

    #[test]
    fn parses_context_request() {
        let text = r#"```json
{"request_context": [{"type": "file", "path": "src/lib.rs", "reason": "error points here"}]}
```"#;
        let reply = parse_reply(text).unwrap();
        match reply {
            BackendReply::RequestContext(reqs) => {
                assert_eq!(reqs.len(), 1);
                assert_eq!(reqs[0].descriptor(), "file:src/lib.rs");
            }
            _ => panic!("Expected RequestContext"),
        }
    }

    #[test]
    fn parses_fix_proposal() {
        let text = r#"{"propose_fix": {
            "description": "Pin the protobuf version",
            "root_cause": "protobuf 4.x removed the API",
            "reasoning": "build log shows AttributeError from protobuf internals",
            "confidence": 0.85,
            "changes": [{"path": "requirements.txt", "action": "edit", "content": "protobuf==3.20\n"}]
        }}"#;
        let reply = parse_reply(text).unwrap();
        match reply {
            BackendReply::ProposeFix(p) => {
                assert_eq!(p.description, "Pin the protobuf version");
                assert!((p.confidence - 0.85).abs() < f64::EPSILON);
                assert_eq!(p.changes.len(), 1);
                assert_eq!(p.changes[0].action, ChangeAction::Edit);
            }
            _ => panic!("Expected ProposeFix"),
        }
    }

    #[test]
    fn proposal_takes_priority_when_both_present() {
        let text = r#"{"request_context": [{"type": "file", "path": "a", "reason": "r"}],
                       "propose_fix": {"description": "d", "root_cause": "rc",
                       "reasoning": "w", "confidence": 0.6, "changes": []}}"#;
        assert!(matches!(parse_reply(text).unwrap(), BackendReply::ProposeFix(_)));
    }

    #[test]
    fn out_of_range_confidence_is_clamped() {
        let text = r#"{"propose_fix": {"description": "d", "root_cause": "rc",
                       "reasoning": "w", "confidence": 3.5, "changes": []}}"#;
        match parse_reply(text).unwrap() {
            BackendReply::ProposeFix(p) => assert_eq!(p.confidence, 1.0),
            _ => panic!("Expected ProposeFix"),
        }
    }

    #[test]
    fn empty_context_request_is_rejected() {
        let text = r#"{"request_context": []}"#;
        assert!(parse_reply(text).is_err());
    }

    #[test]
    fn neither_field_is_rejected() {
        assert!(parse_reply(r#"{"something": "else"}"#).is_err());
    }

    #[test]
    fn prose_without_json_is_rejected() {
        assert!(parse_reply("I cannot help with that.").is_err());
    }

    // ── render_messages ──────────────────────────────────────────────

    #[test]
    fn renders_alternating_roles() {
        let mut t = Transcript::new();
        t.push(Role::Orchestrator, "evidence");
        t.push(Role::Backend, "need file");
        t.push(Role::Orchestrator, "file content");
        let messages = render_messages(&t);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"], "file content");
    }

    // ── construction ─────────────────────────────────────────────────

    #[test]
    fn empty_api_key_is_rejected() {
        assert!(AnthropicBackend::new(String::new(), HashMap::new()).is_err());
    }

    #[test]
    fn missing_tier_model_is_an_error() {
        let mut models = HashMap::new();
        models.insert(ReasoningTier::Tier1, "claude-sonnet-4-5".to_string());
        let backend = AnthropicBackend::new("key".into(), models).unwrap();
        assert!(backend.model_for(ReasoningTier::Tier1).is_ok());
        assert!(backend.model_for(ReasoningTier::Tier3).is_err());
    }
}
