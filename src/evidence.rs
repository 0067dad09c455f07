//! Failure evidence: the excerpt of a build log the orchestrator hands to
//! the reasoning backend, plus a stable signature used to derive the
//! coordination resource key.
//!
//! Extraction is deliberately shallow. The orchestrator treats log parsing
//! as a narrow collaborator surface: take the tail of the log, anchor it on
//! the last line that looks like an error, classify it into a broad bucket,
//! and hash a normalized form for deduplication.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::LazyLock;

/// Broad classification of a build failure, used only for labeling and
/// prompt context. The reasoning backend does the real diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Compile,
    Test,
    Link,
    Dependency,
    Infra,
    Unknown,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Compile => "compile",
            FailureKind::Test => "test",
            FailureKind::Link => "link",
            FailureKind::Dependency => "dependency",
            FailureKind::Infra => "infra",
            FailureKind::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Evidence for one observed build failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEvidence {
    pub kind: FailureKind,
    /// Log excerpt anchored on the last detected error line.
    pub excerpt: String,
    pub excerpt_lines: usize,
}

impl FailureEvidence {
    /// Load evidence from a failure log file.
    pub fn from_log_file(path: &Path, max_lines: usize) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read failure log: {}", path.display()))?;
        Ok(Self::from_log(&content, max_lines))
    }

    /// Extract evidence from raw log content.
    ///
    /// Takes a window of up to `max_lines` anchored on the last error-looking
    /// line, with a few lines of lead-in above it. The window follows the
    /// anchor rather than the end of the log, so a long teardown tail after
    /// the error never evicts it. Without an anchor, takes the tail.
    pub fn from_log(content: &str, max_lines: usize) -> Self {
        let lines: Vec<&str> = content.lines().collect();
        let anchor = find_last_error_line(&lines);

        let budget = max_lines.max(1);
        let (start, end) = match anchor {
            Some(idx) => {
                let start = idx.saturating_sub(10.min(budget - 1));
                (start, lines.len().min(start + budget))
            }
            None => (lines.len().saturating_sub(budget), lines.len()),
        };

        let excerpt_lines: Vec<&str> = lines[start..end].to_vec();
        let excerpt = excerpt_lines.join("\n");
        let kind = classify(&excerpt);

        Self {
            kind,
            excerpt_lines: excerpt_lines.len(),
            excerpt,
        }
    }

    /// Evidence representing a missing or unreadable log.
    pub fn unavailable() -> Self {
        Self {
            kind: FailureKind::Unknown,
            excerpt: "No failure log available".to_string(),
            excerpt_lines: 0,
        }
    }

    /// Stable hex signature of the normalized excerpt. Two flavors failing
    /// with the same root cause should usually produce the same signature,
    /// which is what the coordination lock keys on (together with the
    /// triggering revision).
    pub fn signature(&self) -> String {
        let normalized: String = self
            .excerpt
            .lines()
            .map(normalize_line)
            .collect::<Vec<_>>()
            .join("\n");
        let digest = Sha256::digest(normalized.as_bytes());
        // 16 hex chars is plenty for dedup keys and keeps issue titles short.
        hex_prefix(&digest, 16)
    }
}

fn hex_prefix(digest: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{:02x}", byte);
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

static HEX_LITERAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"0x[0-9a-fA-F]+").unwrap());

/// Strip volatile tokens (timestamps, addresses, durations) so signatures
/// stay stable across reruns of the same failure.
fn normalize_line(line: &str) -> String {
    let line = HEX_LITERAL_RE.replace_all(line, "0x#");
    let mut out = String::with_capacity(line.len());
    let mut in_digits = false;
    for ch in line.chars() {
        if ch.is_ascii_digit() {
            if !in_digits {
                out.push('#');
                in_digits = true;
            }
        } else {
            in_digits = false;
            out.push(ch);
        }
    }
    out
}

fn find_last_error_line(lines: &[&str]) -> Option<usize> {
    const MARKERS: [&str; 6] = ["error:", "error[", "ERROR", "FAILED", "Traceback", "fatal:"];
    lines
        .iter()
        .rposition(|line| MARKERS.iter().any(|m| line.contains(m)))
}

fn classify(excerpt: &str) -> FailureKind {
    // Order matters: more specific buckets first.
    if excerpt.contains("undefined reference")
        || excerpt.contains("linker")
        || excerpt.contains("ld returned")
    {
        FailureKind::Link
    } else if excerpt.contains("could not resolve")
        || excerpt.contains("failed to download")
        || excerpt.contains("No matching distribution")
        || excerpt.contains("404 Not Found")
    {
        FailureKind::Dependency
    } else if excerpt.contains("test result: FAILED")
        || excerpt.contains("assertion")
        || excerpt.contains("FAILED (")
        || excerpt.contains("tests failed")
    {
        FailureKind::Test
    } else if excerpt.contains("error[E")
        || excerpt.contains("error:")
        || excerpt.contains("SyntaxError")
        || excerpt.contains("compilation terminated")
    {
        FailureKind::Compile
    } else if excerpt.contains("Connection reset")
        || excerpt.contains("timed out")
        || excerpt.contains("No space left on device")
    {
        FailureKind::Infra
    } else {
        FailureKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_compile_error() {
        let ev = FailureEvidence::from_log("building...\nerror[E0425]: cannot find value `x`\n", 100);
        assert_eq!(ev.kind, FailureKind::Compile);
    }

    #[test]
    fn classifies_test_failure() {
        let ev = FailureEvidence::from_log("running 5 tests\ntest result: FAILED. 4 passed; 1 failed\n", 100);
        assert_eq!(ev.kind, FailureKind::Test);
    }

    #[test]
    fn classifies_linker_before_compile() {
        let log = "error: linking failed\nundefined reference to `frobnicate`\ncollect2: ld returned 1\n";
        let ev = FailureEvidence::from_log(log, 100);
        assert_eq!(ev.kind, FailureKind::Link);
    }

    #[test]
    fn classifies_dependency_failure() {
        let ev = FailureEvidence::from_log("pip install\nNo matching distribution found for foo\n", 100);
        assert_eq!(ev.kind, FailureKind::Dependency);
    }

    #[test]
    fn unknown_when_no_markers() {
        let ev = FailureEvidence::from_log("all quiet\nnothing to see\n", 100);
        assert_eq!(ev.kind, FailureKind::Unknown);
    }

    #[test]
    fn excerpt_is_capped_at_max_lines() {
        let log: String = (0..500).map(|i| format!("line {}\n", i)).collect();
        let ev = FailureEvidence::from_log(&log, 50);
        assert_eq!(ev.excerpt_lines, 50);
        assert!(ev.excerpt.contains("line 499"));
        assert!(!ev.excerpt.contains("line 400\n"));
    }

    #[test]
    fn excerpt_anchors_on_last_error_line() {
        let mut log = String::new();
        for i in 0..100 {
            log.push_str(&format!("noise {}\n", i));
        }
        log.push_str("error: the real problem\n");
        log.push_str("note: aftermath\n");
        let ev = FailureEvidence::from_log(&log, 400);
        assert!(ev.excerpt.contains("error: the real problem"));
        assert!(ev.excerpt.contains("note: aftermath"));
    }

    #[test]
    fn long_teardown_after_the_error_keeps_the_error_in_view() {
        let mut log = String::new();
        log.push_str("error: the real problem\n");
        for i in 0..200 {
            log.push_str(&format!("teardown noise {}\n", i));
        }
        let ev = FailureEvidence::from_log(&log, 80);
        assert!(ev.excerpt.starts_with("error: the real problem"));
        assert_eq!(ev.excerpt_lines, 80);
        assert_eq!(ev.kind, FailureKind::Compile);
    }

    #[test]
    fn signature_is_stable_across_volatile_tokens() {
        let a = FailureEvidence::from_log("[12:01:33] error: widget broke at 0x7fa3\n", 100);
        let b = FailureEvidence::from_log("[14:55:09] error: widget broke at 0x9bc1\n", 100);
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn signature_differs_for_different_errors() {
        let a = FailureEvidence::from_log("error: widget broke\n", 100);
        let b = FailureEvidence::from_log("error: sprocket missing\n", 100);
        assert_ne!(a.signature(), b.signature());
    }

    #[test]
    fn signature_is_fixed_length_hex() {
        let ev = FailureEvidence::from_log("error: x\n", 100);
        let sig = ev.signature();
        assert_eq!(sig.len(), 16);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn unavailable_evidence_has_no_lines() {
        let ev = FailureEvidence::unavailable();
        assert_eq!(ev.excerpt_lines, 0);
        assert_eq!(ev.kind, FailureKind::Unknown);
    }

    #[test]
    fn from_log_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.log");
        std::fs::write(&path, "error: broken\n").unwrap();
        let ev = FailureEvidence::from_log_file(&path, 100).unwrap();
        assert_eq!(ev.kind, FailureKind::Compile);
    }

    #[test]
    fn from_log_file_missing_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = FailureEvidence::from_log_file(&dir.path().join("nope.log"), 100);
        assert!(result.is_err());
    }
}
