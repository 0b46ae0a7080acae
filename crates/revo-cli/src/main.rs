//! Revo - review supervisor CLI
//!
//! The `revo` command drives the supervisor against scripted collaborators
//! described by a JSON fixture, so a review can be run end to end without any
//! hosting provider.
//!
//! ## Commands
//!
//! - `review`: run one review and print the outcome as JSON
//! - `graph`: print the stage graph a request would run with
//! - `config`: print the effective configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, Level};

use revo_core::agents::fakes::{sample_metadata, Scripted, ScriptedRepository, Step};
use revo_core::{
    AgentError, AnalysisReport, AnalyticsNote, ChangeMetadata, Collaborators, ContextItem,
    LogFormat, OrchestratorConfig, ReviewOutcome, ReviewRequest, Supervisor, TaskGraph,
};

#[derive(Parser)]
#[command(name = "revo")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Merge-request review supervisor", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (TOML); REVO_* variables override it
    #[arg(short, long, global = true, env = "REVO_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Review a merge request and print the outcome
    Review {
        /// Repository, e.g. org/service
        repo: String,

        /// Merge request identifier
        change: String,

        /// Correlation id (generated if omitted)
        #[arg(long)]
        correlation_id: Option<String>,

        /// Collaborator fixture (JSON); built-in sample if omitted
        #[arg(short, long)]
        fixture: Option<PathBuf>,

        /// Build the review but do not post it
        #[arg(long)]
        no_post: bool,
    },

    /// Print the stage graph for a request
    Graph {
        /// Repository, e.g. org/service
        repo: String,

        /// Merge request identifier
        change: String,

        /// Plan without the posting stage
        #[arg(long)]
        no_post: bool,
    },

    /// Print the effective configuration
    Config {
        #[arg(long, value_enum, default_value_t = Format::Toml)]
        format: Format,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Toml,
    Json,
}

/// Scripted collaborator outputs. Every collaborator answers the same way on
/// every call, after an optional per-stage delay.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct Fixture {
    /// Defaults to a sample record for the requested change.
    metadata: Option<ChangeMetadata>,
    /// Make the repository report the change as missing.
    missing_change: bool,
    context: Vec<ContextItem>,
    analysis: AnalysisReport,
    analytics: Vec<AnalyticsNote>,
    receipt: String,
    /// Delay per stage name, in milliseconds.
    delays_ms: BTreeMap<String, u64>,
}

impl Default for Fixture {
    fn default() -> Self {
        Self {
            metadata: None,
            missing_change: false,
            context: Vec::new(),
            analysis: AnalysisReport::default(),
            analytics: Vec::new(),
            receipt: "receipt-local".to_string(),
            delays_ms: BTreeMap::new(),
        }
    }
}

impl Fixture {
    fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .context(format!("Failed to read fixture: {:?}", path))?;
        serde_json::from_str(&raw).context("Failed to parse fixture as JSON")
    }

    fn delay(&self, stage: &str) -> Duration {
        Duration::from_millis(self.delays_ms.get(stage).copied().unwrap_or(0))
    }

    fn collaborators(&self, repo: &str, change: &str) -> Collaborators {
        let metadata = self
            .metadata
            .clone()
            .unwrap_or_else(|| sample_metadata(repo, change));
        let fetch = if self.missing_change {
            Step::err(AgentError::NotFound {
                resource: format!("{repo}!{change}"),
            })
        } else {
            Step::ok(metadata.clone())
        };

        let repository = ScriptedRepository::new(metadata)
            .with_metadata_script(vec![fetch.after(self.delay("fetch_metadata"))])
            .with_post_script(vec![
                Step::ok(self.receipt.clone()).after(self.delay("post_comments"))
            ]);
        let context = Scripted::context(vec![
            Step::ok(self.context.clone()).after(self.delay("retrieve_context"))
        ]);
        let analyzer = Scripted::analyzer(vec![
            Step::ok(self.analysis.clone()).after(self.delay("analyze_code"))
        ]);
        let analytics = Scripted::analytics(vec![
            Step::ok(self.analytics.clone()).after(self.delay("collect_analytics"))
        ]);

        Collaborators {
            repository: Arc::new(repository),
            context: Some(Arc::new(context)),
            analyzer: Arc::new(analyzer),
            analytics: Some(Arc::new(analytics)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    if !revo_core::init_tracing(LogFormat::from_json_flag(cli.json), level) {
        debug!("tracing subscriber already installed");
    }

    let config = OrchestratorConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Review {
            repo,
            change,
            correlation_id,
            fixture,
            no_post,
        } => {
            let fixture = match fixture {
                Some(path) => Fixture::from_file(&path)?,
                None => Fixture::default(),
            };
            let request = build_request(&repo, &change, correlation_id, no_post);
            let outcome = run_review(config, &fixture, request).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Commands::Graph {
            repo,
            change,
            no_post,
        } => {
            let request = build_request(&repo, &change, None, no_post);
            let graph = config
                .graph_builder()
                .build(&request)
                .context("Failed to build stage graph")?;
            print!("{}", render_graph(&graph)?);
            Ok(())
        }
        Commands::Config { format } => {
            println!("{}", render_config(&config, format)?);
            Ok(())
        }
    }
}

fn build_request(
    repo: &str,
    change: &str,
    correlation_id: Option<String>,
    no_post: bool,
) -> ReviewRequest {
    let mut request = ReviewRequest::new(repo, change);
    if let Some(id) = correlation_id {
        request = request.with_correlation_id(id);
    }
    if no_post {
        request = request.without_posting();
    }
    request
}

/// Submit the request, log each phase change, and wait for the outcome.
async fn run_review(
    config: OrchestratorConfig,
    fixture: &Fixture,
    request: ReviewRequest,
) -> Result<ReviewOutcome> {
    let collaborators = fixture.collaborators(request.repository(), request.change_id());
    let supervisor =
        Supervisor::new(config, collaborators).context("Failed to start supervisor")?;

    let acceptance = supervisor
        .submit(request)
        .context("Request was not accepted")?;
    let id = acceptance.correlation_id;
    info!(correlation_id = %id, "review submitted");

    let mut rx = supervisor
        .subscribe(&id)
        .context("Submitted request is not tracked")?;
    let mut last = None;
    loop {
        let phase = rx.borrow_and_update().phase;
        if last != Some(phase) {
            info!(correlation_id = %id, phase = ?phase, "phase changed");
            last = Some(phase);
        }
        if phase.is_terminal() || rx.changed().await.is_err() {
            break;
        }
    }

    supervisor
        .wait(&id)
        .await
        .context(format!("Review {id} failed"))
}

fn render_graph(graph: &TaskGraph) -> Result<String> {
    let mut out = String::new();
    for (i, level) in graph.levels()?.iter().enumerate() {
        out.push_str(&format!("level {i}\n"));
        for spec in level {
            let deps: Vec<String> = graph
                .dependencies_of(&spec.id)?
                .iter()
                .map(|d| d.to_string())
                .collect();
            out.push_str(&format!(
                "  {:<18} {:<8} timeout={}ms attempts={}",
                spec.id.as_str(),
                if spec.is_required() { "required" } else { "optional" },
                spec.timeout.as_millis(),
                spec.retry.max_attempts,
            ));
            if !deps.is_empty() {
                out.push_str(&format!(" after={}", deps.join(",")));
            }
            out.push('\n');
        }
    }
    Ok(out)
}

fn render_config(config: &OrchestratorConfig, format: Format) -> Result<String> {
    match format {
        Format::Toml => toml::to_string_pretty(config).context("Failed to encode config as TOML"),
        Format::Json => {
            serde_json::to_string_pretty(config).context("Failed to encode config as JSON")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revo_core::{OrchestratorError, StageKind};

    const SAMPLE: &str = include_str!("../fixtures/sample.json");

    fn sample() -> Fixture {
        serde_json::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_review_args_parse() {
        let cli = Cli::try_parse_from([
            "revo",
            "--json",
            "review",
            "org/service",
            "42",
            "--correlation-id",
            "corr-1",
            "--no-post",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Review {
                repo,
                change,
                correlation_id,
                no_post,
                fixture,
            } => {
                assert_eq!(repo, "org/service");
                assert_eq!(change, "42");
                assert_eq!(correlation_id.as_deref(), Some("corr-1"));
                assert!(no_post);
                assert!(fixture.is_none());
            }
            _ => panic!("expected review command"),
        }
    }

    #[test]
    fn test_sample_fixture_parses() {
        let fixture = sample();
        assert_eq!(fixture.analysis.findings.len(), 2);
        assert_eq!(fixture.receipt, "note-9001");
        assert_eq!(fixture.delay("analyze_code"), Duration::from_millis(400));
        assert_eq!(fixture.delay("post_comments"), Duration::ZERO);
    }

    #[test]
    fn test_fixture_fields_default() {
        let fixture: Fixture = serde_json::from_str("{}").unwrap();
        assert!(fixture.metadata.is_none());
        assert_eq!(fixture.receipt, "receipt-local");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_review_with_sample_fixture() {
        let request = build_request("org/service", "42", Some("corr-cli".into()), false);
        let outcome = run_review(OrchestratorConfig::default(), &sample(), request)
            .await
            .unwrap();

        let ack = outcome.ack.unwrap();
        assert_eq!(ack.receipt_id, "note-9001");
        assert_eq!(outcome.review.title.as_deref(), Some("Rework cache eviction"));
        assert_eq!(outcome.review.comments_from(StageKind::AnalyzeCode).count(), 2);
        let context: Vec<_> = outcome
            .review
            .comments_from(StageKind::RetrieveContext)
            .collect();
        assert_eq!(context.len(), 1);
        assert_eq!(context[0].supplements, Some(StageKind::AnalyzeCode));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_review_without_posting() {
        let request = build_request("org/service", "42", None, true);
        let outcome = run_review(OrchestratorConfig::default(), &sample(), request)
            .await
            .unwrap();
        assert!(outcome.ack.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_change_is_reported() {
        let fixture = Fixture {
            missing_change: true,
            ..sample()
        };
        let request = build_request("org/service", "404", None, false);
        let err = run_review(OrchestratorConfig::default(), &fixture, request)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_render_graph_levels() {
        let request = build_request("org/service", "42", None, false);
        let graph = OrchestratorConfig::default()
            .graph_builder()
            .build(&request)
            .unwrap();
        let text = render_graph(&graph).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "level 0");
        assert!(lines[1].trim_start().starts_with("fetch_metadata"));
        assert!(lines.last().unwrap().contains("post_comments"));
        assert!(text.contains("after=consolidate"));
    }

    #[test]
    fn test_render_config_round_trips_through_file() {
        let mut config = OrchestratorConfig::default();
        config.worker_pool_size = 3;
        let text = render_config(&config, Format::Toml).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("revo.toml");
        std::fs::write(&path, text).unwrap();
        let loaded = OrchestratorConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
