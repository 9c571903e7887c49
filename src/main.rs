use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use graph_heartbeat::auth::DeviceCodeProvider;
use graph_heartbeat::config::{self, ScopeMode, TargetMode};
use graph_heartbeat::graph::GraphClient;
use graph_heartbeat::heartbeat::HeartbeatWorkflow;
use graph_heartbeat::model::WorkflowVariant;
use graph_heartbeat::notify::Notifier;
use graph_heartbeat::runner::{self, EXIT_FAILURE};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run one Microsoft Graph heartbeat (drive, mail, calendar) and report it to a webhook"
)]
struct Args {
    /// Path to an optional YAML config file; environment variables override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Permission set requested during sign-in
    #[arg(long, value_enum)]
    scope: Option<ScopeMode>,

    /// Drive addressed by the quota read and file upload
    #[arg(long, value_enum)]
    target: Option<TargetMode>,

    /// Steps to run
    #[arg(long, value_enum)]
    variant: Option<WorkflowVariant>,
}

/// `RUST_LOG` when it parses, otherwise `info` so each step is narrated.
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .with_target(false)
        .compact()
        .init();

    match dotenvy::dotenv() {
        Ok(path) => debug!(path = %path.display(), "loaded .env"),
        Err(err) => debug!(%err, "no .env loaded"),
    }

    let args = Args::parse();
    let mut cfg = match config::load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(%err, "configuration error; set TENANT_ID, CLIENT_ID and TARGET_UPN");
            std::process::exit(EXIT_FAILURE);
        }
    };
    if let Some(scope) = args.scope {
        cfg.scope = scope;
    }
    if let Some(target) = args.target {
        cfg.target = target;
    }
    if let Some(variant) = args.variant {
        cfg.variant = variant;
    }

    let http = reqwest::Client::builder()
        .user_agent(concat!("graph-heartbeat/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let provider =
        DeviceCodeProvider::from_config(&cfg, http.clone(), Box::new(|msg: &str| println!("{msg}")))?;
    let graph = GraphClient::new(http.clone(), cfg.graph_base_url()?);
    let workflow = HeartbeatWorkflow::new(&graph, cfg.target_upn.clone(), cfg.target, cfg.variant);
    let notifier = Notifier::new(http, cfg.webhook()?);

    let summary = runner::run(&provider, &workflow, &notifier).await;
    if summary.succeeded() {
        info!(
            variant = cfg.variant.as_str(),
            "heartbeat run finished successfully"
        );
    }
    std::process::exit(summary.exit_code);
}
