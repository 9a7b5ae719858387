use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use extract_refresh::config::AppConfig;
use extract_refresh::extract::SqliteExtractEngine;
use extract_refresh::server::rest::RestServer;
use extract_refresh::watermark::WatermarkStore;
use extract_refresh::{RefreshOrchestrator, RunContext, RunOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LoggingLevel {
    Debug,
    Info,
    Error,
}

impl LoggingLevel {
    fn directive(self) -> &'static str {
        match self {
            LoggingLevel::Debug => "debug",
            LoggingLevel::Info => "info",
            LoggingLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(name = "extract-refresh")]
#[command(about = "Perform incremental refresh on published extract datasources")]
struct Args {
    /// Configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Server address
    #[arg(short, long)]
    server: String,

    /// Username to sign in with
    #[arg(short, long)]
    username: String,

    /// Password, or @file to read it from a file (or set TABLEAU_PASSWORD)
    #[arg(short, long)]
    password: Option<String>,

    /// Project holding the datasources
    #[arg(short = 'P', long)]
    project: String,

    /// Site content URL (default site when omitted)
    #[arg(short = 'S', long, default_value = "")]
    site: String,

    /// Trigger extract refresh jobs and wait for them
    #[arg(short, long)]
    wait: bool,

    /// Max wait time in seconds
    #[arg(short, long, default_value_t = 3600)]
    timeout: u64,

    /// Job check frequency in seconds
    #[arg(short, long, default_value_t = 10)]
    frequency: u64,

    /// Local extract directory (when executed on the server host)
    #[arg(short = 'H', long, requires = "download")]
    hyper: Option<PathBuf>,

    /// Local download directory for extracts copied from --hyper
    #[arg(short = 'D', long)]
    download: Option<PathBuf>,

    /// Logging level
    #[arg(short, long, value_enum, default_value = "error")]
    logging_level: LoggingLevel,

    /// One or more datasources to refresh
    #[arg(required = true)]
    datasources: Vec<String>,
}

fn resolve_password(arg: Option<String>) -> Result<String> {
    match arg {
        Some(value) => match value.strip_prefix('@') {
            Some(file) => {
                let content = std::fs::read_to_string(file)
                    .with_context(|| format!("Failed to read password file {}", file))?;
                Ok(content.trim_end_matches(['\r', '\n']).to_string())
            }
            None => Ok(value),
        },
        None => std::env::var("TABLEAU_PASSWORD")
            .context("No password given: use --password or set TABLEAU_PASSWORD"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.logging_level.directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if args.wait && args.timeout == 0 {
        bail!("--timeout must be greater than zero when waiting on refresh jobs");
    }

    let config = AppConfig::load(&args.config)
        .with_context(|| format!("Failed to load configuration {}", args.config.display()))?;
    config.require_datasources(&args.datasources)?;
    let watermarks = WatermarkStore::load(&config.parameters.update_values)
        .context("Failed to load the watermark store")?;
    let password = resolve_password(args.password.clone())?;

    info!("extract refresh starting for {} datasource(s)", args.datasources.len());

    let server = Arc::new(RestServer::sign_in(&args.server, &args.site, &args.username, &password).await?);
    let options = RunOptions {
        project: args.project.clone(),
        wait: args.wait,
        timeout: Duration::from_secs(args.timeout),
        poll_interval: Duration::from_secs(args.frequency),
        local_extract_dir: args.hyper.clone(),
        download_dir: args.download.clone(),
    };

    let summary = match RunContext::prepare(config, watermarks, options, server.as_ref()).await {
        Ok(context) => {
            let mut orchestrator =
                RefreshOrchestrator::new(context, server.clone(), Box::new(SqliteExtractEngine::new()));
            Some(orchestrator.run_all(&args.datasources).await)
        }
        Err(e) => {
            error!("{}", e);
            None
        }
    };

    if let Err(e) = server.sign_out().await {
        warn!("sign out failed: {}", e);
    }

    let Some(summary) = summary else {
        bail!("run aborted before any datasource was processed");
    };
    for (name, outcome) in &summary.outcomes {
        println!("{}: {}", name, outcome);
    }
    if let Some(job_error) = &summary.job_error {
        println!("{}", job_error);
    }
    if !summary.success() {
        std::process::exit(1);
    }

    Ok(())
}
