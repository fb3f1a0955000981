//! accessfix - automated web-accessibility remediation
//!
//! ## Commands
//!
//! - `run`: analyze a repository, fix what can be fixed, open one pull request
//! - `config`: print the effective configuration as TOML
//!
//! The model endpoint is configured through GROQ_API_KEY, INTELLIGENCE_BASE_URL,
//! MODEL_NAME, TEMPERATURE and MAX_TOKENS; pull requests need GITHUB_TOKEN.
//! A `.env` file in the working directory is loaded first.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use accessfix_adapters::{ChatCompletionsClient, GitCliClient, GitHubClient};
use accessfix_core::{cancel_pair, Orchestrator, RepoRef, RunConfig, RunStatus, Severity};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "accessfix")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Find and fix WCAG issues in a web repository", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Remediate a repository and open a pull request with approved fixes
    Run(RunArgs),

    /// Print the effective configuration
    Config {
        /// TOML configuration file
        #[arg(short, long, env = "ACCESSFIX_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Repository URL to clone
    repo_url: String,

    /// `owner/repo` name (derived from the URL when omitted)
    #[arg(long)]
    repo_name: Option<String>,

    /// TOML configuration file
    #[arg(short, long, env = "ACCESSFIX_CONFIG")]
    config: Option<PathBuf>,

    /// Attempts per location before a fix is abandoned
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Locations processed concurrently
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Only fix issues of these severities (repeatable or comma separated)
    #[arg(long, value_delimiter = ',')]
    severity: Vec<Severity>,

    /// Branch to commit fixes to
    #[arg(long)]
    branch: Option<String>,

    /// Branch the pull request targets
    #[arg(long)]
    base: Option<String>,

    /// Write the report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn load_config(path: Option<&Path>) -> Result<RunConfig> {
    match path {
        Some(path) => RunConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(RunConfig::default()),
    }
}

/// Apply command-line overrides on top of file config.
fn effective_config(args: &RunArgs) -> Result<RunConfig> {
    let mut config = load_config(args.config.as_deref())?;

    if let Some(max_attempts) = args.max_attempts {
        config.max_attempts = max_attempts;
    }
    if let Some(max_parallel) = args.max_parallel {
        config.max_parallel_handlers = max_parallel;
    }
    if !args.severity.is_empty() {
        config.severity_filter = args.severity.iter().copied().collect();
    }
    if let Some(branch) = &args.branch {
        config.branch_name = branch.clone();
    }
    if let Some(base) = &args.base {
        config.base_branch = base.clone();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn repo_ref(args: &RunArgs) -> Result<RepoRef> {
    match &args.repo_name {
        Some(name) => Ok(RepoRef::new(args.repo_url.trim(), name.trim())),
        None => match RepoRef::from_url(&args.repo_url) {
            Some(repo) => Ok(repo),
            None => bail!(
                "Cannot derive owner/repo from '{}'; pass --repo-name",
                args.repo_url
            ),
        },
    }
}

async fn cmd_run(args: RunArgs) -> Result<RunStatus> {
    let config = effective_config(&args)?;
    let repo = repo_ref(&args)?;

    let intelligence =
        ChatCompletionsClient::from_env().context("Failed to configure the model endpoint")?;
    let github = match GitHubClient::from_env() {
        Ok(client) => Some(client),
        Err(e) => {
            warn!(error = %e, "pull requests disabled");
            None
        }
    };
    let vcs = GitCliClient::new(github);

    let (handle, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            handle.cancel();
        }
    });

    let orchestrator = Orchestrator::new(Arc::new(intelligence), Arc::new(vcs), config);
    let report = orchestrator
        .execute_with_cancel(&repo, signal)
        .await
        .with_context(|| format!("Run against {repo} failed"))?;

    let json = report.to_json_pretty().context("Failed to serialize report")?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, format!("{json}\n"))
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            info!(path = %path.display(), "report written");
        }
        None => println!("{json}"),
    }

    match report.pull_request() {
        Some(pr) => info!(url = %pr.url, approved = report.approved_count(), "pull request opened"),
        None => info!(approved = report.approved_count(), "no pull request opened"),
    }
    Ok(report.status)
}

fn cmd_config(path: Option<&Path>) -> Result<()> {
    let config = load_config(path)?;
    let rendered = config
        .to_toml_string()
        .context("Failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    accessfix_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run(args) => {
            let status = cmd_run(args).await?;
            if status != RunStatus::Completed {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Config { config } => cmd_config(config.as_deref()),
    }
}
