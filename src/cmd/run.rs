//! The main entry point, `mender run`.

use crate::CliStatus;
use anyhow::{Context, Result};
use console::style;
use mender::config::MenderToml;
use mender::context::RepoFetcher;
use mender::evidence::FailureEvidence;
use mender::git::{GitWorkspace, Vcs};
use mender::hub::GitHubHub;
use mender::orchestrator::{BuildStatus, Invocation, Orchestrator};
use mender::reasoning::anthropic::AnthropicBackend;
use mender::report::{ActionTaken, RunReport};
use std::path::Path;

/// Lines of failure log kept as the evidence excerpt.
const EXCERPT_LINES: usize = 80;

pub async fn run_remediation(
    project_dir: &Path,
    status: CliStatus,
    branch: Option<String>,
    log: Option<&Path>,
    worker: Option<String>,
    output: Option<&Path>,
) -> Result<()> {
    let config = MenderToml::load_or_default(project_dir)?;
    for warning in config.validate() {
        eprintln!("{} {}", style("warning:").yellow().bold(), warning);
    }
    let policy = config.escalation_policy()?;

    let vcs = GitWorkspace::open(project_dir)?;
    let branch = match branch {
        Some(branch) => branch,
        None => vcs.current_branch()?,
    };
    let worker = worker
        .or_else(|| std::env::var("BUILD_FLAVOR").ok())
        .unwrap_or_else(|| format!("local-{}", uuid::Uuid::new_v4().simple()));

    let log_content = match log {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read failure log: {}", path.display()))?,
        ),
        None => None,
    };
    let evidence = log_content
        .as_deref()
        .map(|content| FailureEvidence::from_log(content, EXCERPT_LINES));

    let token = std::env::var("GITHUB_TOKEN").context("GITHUB_TOKEN is not set")?;
    let repo = std::env::var("GITHUB_REPOSITORY")
        .context("GITHUB_REPOSITORY (owner/repo) is not set")?;
    let hub = GitHubHub::new(token, repo)?;

    let api_key = std::env::var("ANTHROPIC_API_KEY").context("ANTHROPIC_API_KEY is not set")?;
    let backend = AnthropicBackend::new(api_key, config.models())?;

    let fetcher = RepoFetcher::new(
        project_dir.to_path_buf(),
        log_content,
        config.investigation.max_fetch_bytes,
    );

    let orchestrator = Orchestrator::new(
        &vcs,
        &hub,
        &backend,
        &fetcher,
        policy,
        config.session_limits(),
        config.coordination_config(),
        config.git.base_branch.clone(),
    );
    let invocation = Invocation {
        branch,
        status: match status {
            CliStatus::Success => BuildStatus::Success,
            CliStatus::Failure => BuildStatus::Failure,
        },
        evidence,
        worker,
    };

    let report = orchestrator.run(&invocation).await;
    print_summary(&report);

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write result to {}", path.display()))?;
    }

    if report.action == ActionTaken::Aborted {
        anyhow::bail!(
            "remediation aborted: {}",
            report.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    Ok(())
}

fn print_summary(report: &RunReport) {
    let action = match report.action {
        ActionTaken::NoOp => style("no-op").dim(),
        ActionTaken::CoordinationSkip => style("coordination-skip").cyan(),
        ActionTaken::HumanTakeover => style("human-takeover").cyan(),
        ActionTaken::Attempted => style("attempted").green(),
        ActionTaken::Escalated => style("escalated").yellow().bold(),
        ActionTaken::MergeProposed => style("merge-proposed").green().bold(),
        ActionTaken::Aborted => style("aborted").red().bold(),
    };
    println!("{} {}", style("action:").bold(), action);

    if let Some(fix_id) = &report.fix_id {
        println!("{} {}", style("fix id:").bold(), fix_id);
    }
    if let (Some(attempt), Some(tier)) = (report.attempt_number, report.tier) {
        println!("{} {} at {}", style("attempt:").bold(), attempt, tier);
    }
    if let Some(confidence) = report.confidence {
        println!("{} {:.2}", style("confidence:").bold(), confidence);
    }
    if let Some(url) = &report.change_url {
        println!("{} {}", style("change request:").bold(), url);
    }
    if let Some(url) = &report.issue_url {
        println!("{} {}", style("tracking issue:").bold(), url);
    }
    if let Some(error) = &report.error {
        println!("{} {}", style("error:").red().bold(), error);
    }
}
