mod api;
mod backend;
mod config;
mod connection;
mod flows;
mod state;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::Request;
use clap::Parser;
use dotenvy::dotenv;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use std::collections::HashMap;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::backend::ExecutionBackend;
use crate::backend::http::HttpBackend;
use crate::connection::ConnectionState;
use crate::connection::manager::RunOutcome;
use crate::flows::Flow;
use crate::flows::request::{ModelSelection, RunConfig};
use crate::state::recovery::{self, RecoveryOutcome};
use crate::state::store::{FlowUpdate, UpdateKind};

#[derive(Parser)]
#[command(name = "hedgeflow", about = "Runs agent flows against the hedge-fund backend")]
enum Cli {
    /// Start the HTTP server (default when no subcommand is given)
    Serve,
    /// Run a flow file once and stream its progress to the terminal
    Run {
        /// Flow definition (.json, .yaml or .yml)
        #[arg(long)]
        flow: PathBuf,
        /// Node to start the run from
        #[arg(long)]
        start: String,
        /// Tickers; comma-separated values are split
        #[arg(long, num_args = 1..)]
        tickers: Vec<String>,
        #[arg(long, requires = "provider")]
        model: Option<String>,
        #[arg(long, requires = "model")]
        provider: Option<String>,
        /// YYYY-MM-DD, defaults to three months before the end date
        #[arg(long)]
        start_date: Option<String>,
        /// YYYY-MM-DD, defaults to today
        #[arg(long)]
        end_date: Option<String>,
        #[arg(long)]
        initial_cash: Option<String>,
        #[arg(long)]
        margin_requirement: Option<String>,
    },
    /// Fetch the last backend run of a flow
    Recover {
        #[arg(long)]
        flow_id: String,
        /// Keep streaming if the run is still in progress
        #[arg(long)]
        follow: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    // Default to Serve when no subcommand is given, but keep --help working.
    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 { Cli::Serve } else { Cli::parse() };

    let config = config::Config::from_env();
    init_tracing();
    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: true,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    let backend: Arc<dyn ExecutionBackend> = Arc::new(HttpBackend::new(
        build_http_client()?,
        &config.backend_url,
    ));
    let state = api::AppState::new(backend, config.retry);

    match cli {
        Cli::Serve => run_server(&config, state).await,
        Cli::Run {
            flow,
            start,
            tickers,
            model,
            provider,
            start_date,
            end_date,
            initial_cash,
            margin_requirement,
        } => {
            let run_config = RunConfig {
                tickers,
                agent_models: HashMap::new(),
                model: model.zip(provider).map(|(model_name, model_provider)| ModelSelection {
                    model_name,
                    model_provider,
                }),
                start_date,
                end_date,
                initial_cash: initial_cash.unwrap_or_default(),
                margin_requirement: margin_requirement.unwrap_or_default(),
            };
            run_once(&state, &flow, &start, &run_config).await?;
            Ok(())
        }
        Cli::Recover { flow_id, follow } => {
            recover_once(&state, &flow_id, follow).await?;
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hedgeflow=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();
}

/// No overall request timeout: run streams stay open for the length of a run.
fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")
}

async fn run_server(config: &config::Config, state: api::AppState) -> Result<(), Box<dyn Error>> {
    tracing::info!(backend = %config.backend_url, attempts = config.retry.attempts, "starting hedgeflow");

    let app = api::create_app(state)
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let port = config.port;
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    println!("Listening on http://{addr}");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn run_once(state: &api::AppState, path: &std::path::Path, start: &str, config: &RunConfig) -> Result<()> {
    let flow = Flow::load(path)?;
    let rx = state.store.subscribe();

    match state.manager.run_flow(&flow.id, &flow, start, config).await? {
        RunOutcome::Started { run_id } => println!("▶ {} ({run_id})", display_name(&flow)),
        RunOutcome::AlreadyActive => anyhow::bail!("flow {} is already running", flow.id),
    }
    follow(state, rx, &flow.id).await
}

async fn recover_once(state: &api::AppState, flow_id: &str, follow_live: bool) -> Result<()> {
    let rx = state.store.subscribe();
    let outcome = recovery::recover(
        &state.manager,
        state.backend.as_ref(),
        state.retry,
        flow_id,
    )
    .await
    .with_context(|| format!("failed to recover flow {flow_id}"))?;

    match outcome {
        RecoveryOutcome::NothingToRecover => println!("nothing to recover for {flow_id}"),
        RecoveryOutcome::LocalRunActive | RecoveryOutcome::Superseded => {
            println!("{flow_id} is already streaming")
        }
        RecoveryOutcome::Restored { status, error } => {
            println!("restored last run of {flow_id} ({status:?})");
            if let Some(error) = error {
                println!("  backend error: {error}");
            }
            print_snapshot(state, flow_id).await?;
        }
        RecoveryOutcome::Attached { run_id } => {
            println!("{flow_id} is still running, attached ({run_id})");
            if follow_live {
                return follow(state, rx, flow_id).await;
            }
            print_snapshot(state, flow_id).await?;
        }
    }
    Ok(())
}

/// Print agent progress for `flow_id` until its run reaches a terminal state.
async fn follow(app: &api::AppState, mut rx: broadcast::Receiver<FlowUpdate>, flow_id: &str) -> Result<()> {
    loop {
        let update = match rx.recv().await {
            Ok(update) => update,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "terminal output fell behind");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        };
        if update.flow_id != flow_id {
            continue;
        }

        match update.kind {
            UpdateKind::AgentUpdated { agent_id, data } => {
                println!(
                    "  {:<28} {:<12} {}",
                    flows::base_agent_key(&agent_id),
                    data.status.as_str(),
                    data.message.as_deref().unwrap_or_default()
                );
            }
            UpdateKind::Connection { state: ConnectionState::Stopped, .. } => {
                print_snapshot(app, flow_id).await?;
                println!("✓ done");
                return Ok(());
            }
            UpdateKind::Connection {
                state: ConnectionState::Error,
                error,
            } => {
                anyhow::bail!("✗ run failed: {}", error.unwrap_or_default());
            }
            UpdateKind::Connection { state, .. } => println!("· {state}"),
            UpdateKind::Reset | UpdateKind::OutputReady | UpdateKind::Recovered => {}
        }
    }
}

async fn print_snapshot(state: &api::AppState, flow_id: &str) -> Result<()> {
    let snapshot = state.store.snapshot(flow_id).await;
    match snapshot.output_data {
        Some(output) => println!(
            "{}",
            serde_json::to_string_pretty(&output).context("failed to render run output")?
        ),
        None => println!("(no output yet, {} agents reported)", snapshot.agent_data.len()),
    }
    Ok(())
}

fn display_name(flow: &Flow) -> &str {
    if flow.name.is_empty() { &flow.id } else { &flow.name }
}
