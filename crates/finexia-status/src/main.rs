use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use finexia_client::api::DEFAULT_BASE_URL;
use finexia_client::channel::DEFAULT_MAX_RECONNECT_ATTEMPTS;
use finexia_client::{
    status_channel_url, ApiClient, ApiClientConfig, ChannelConfig, PipelineRunConfig,
    PollingCoordinator, StatusApi, StatusChannel, StatusSynchronizer, SystemView,
};
use finexia_core::PipelineState;
use std::{env, io, sync::Arc, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "finexia-status")]
#[command(about = "Finexia backend status and pipeline control", long_about = None)]
struct Args {
    /// REST base URL (falls back to FINEXIA_API_URL)
    #[arg(long, default_value = "")]
    base_url: String,
    /// Bearer token (falls back to FINEXIA_TOKEN)
    #[arg(long, default_value = "")]
    token: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print one status snapshot
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Print recent pipeline log lines
    Logs {
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Ask the backend to start a pipeline run
    RunPipeline {
        #[arg(long)]
        force: bool,
        /// Step to run; repeat for several. Omit to run every default step.
        #[arg(long = "step")]
        steps: Vec<String>,
        #[arg(long)]
        max_symbols: Option<u32>,
    },
    /// Follow live status until interrupted
    Watch {
        /// Seconds between fallback polls
        #[arg(long, default_value_t = 30)]
        poll_interval: u64,
        #[arg(long)]
        no_channel: bool,
        /// Skip polls while the push channel is connected
        #[arg(long)]
        quiet_poll: bool,
        #[arg(long, default_value_t = DEFAULT_MAX_RECONNECT_ATTEMPTS)]
        max_reconnect_attempts: u32,
    },
}

#[derive(Debug, Clone)]
struct RuntimeConfig {
    base_url: String,
    token: Option<String>,
    log_stdout: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args);
    init_logging(&config);

    let api = Arc::new(
        ApiClient::new(
            ApiClientConfig::new(config.base_url.clone())
                .with_token(config.token.clone())
                .with_unauthorized_hook(|| warn!(event = "session_unauthorized")),
        )
        .context("failed to build api client")?,
    );

    match args.command {
        Command::Status { json } => {
            let response = api
                .fetch_status()
                .await
                .context("failed to fetch system status")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                let sync = StatusSynchronizer::new();
                sync.apply_status_response(response);
                print_view(&sync.view());
            }
        }
        Command::Logs { limit } => {
            let logs = api
                .fetch_logs(limit)
                .await
                .context("failed to fetch pipeline logs")?;
            if logs.is_empty() {
                println!("No log entries");
            }
            for entry in logs {
                println!("{} {:<7} {}", entry.timestamp, entry.level, entry.message);
            }
        }
        Command::RunPipeline {
            force,
            steps,
            max_symbols,
        } => {
            let sync = StatusSynchronizer::new();
            let response = sync
                .start_pipeline_run(
                    api.as_ref(),
                    PipelineRunConfig {
                        force,
                        steps: steps_from_flags(steps),
                        max_symbols,
                    },
                )
                .await
                .context("failed to start pipeline")?;
            println!("{}", response.message);
            print_view(&sync.view());
        }
        Command::Watch {
            poll_interval,
            no_channel,
            quiet_poll,
            max_reconnect_attempts,
        } => {
            watch(
                &config,
                api,
                Duration::from_secs(poll_interval.max(1)),
                !no_channel,
                quiet_poll,
                max_reconnect_attempts,
            )
            .await?;
        }
    }
    Ok(())
}

async fn watch(
    config: &RuntimeConfig,
    api: Arc<ApiClient>,
    poll_every: Duration,
    use_channel: bool,
    quiet_poll: bool,
    max_reconnect_attempts: u32,
) -> Result<()> {
    let sync = Arc::new(StatusSynchronizer::new());
    if let Err(err) = sync.refresh(api.as_ref()).await {
        warn!(event = "initial_fetch_failed", error = %err);
    }

    let channel = if use_channel {
        let url = status_channel_url(&config.base_url, config.token.as_deref())
            .context("failed to derive status channel url")?;
        let channel = StatusChannel::new(
            ChannelConfig::new(url.to_string())
                .with_max_reconnect_attempts(max_reconnect_attempts),
            sync.clone(),
        );
        channel.connect();
        Some(channel)
    } else {
        None
    };

    let mut poller = PollingCoordinator::new(api, sync.clone());
    if let (true, Some(channel)) = (quiet_poll, &channel) {
        poller = poller.suppress_while_connected(channel.clone());
    }
    poller.start(poll_every);
    info!(
        event = "watch_started",
        channel = use_channel,
        poll_secs = poll_every.as_secs()
    );

    let mut updates = sync.subscribe();
    let mut last_line = String::new();
    let mut last_log: Option<String> = None;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    print_view(&updates.borrow_and_update());
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = updates.borrow_and_update().clone();
                let line = summary_line(&view);
                if line != last_line {
                    println!("{line}");
                    last_line = line;
                }
                let newest = view.logs.newest().map(|entry| entry.message.clone());
                if newest.is_some() && newest != last_log {
                    if let Some(message) = &newest {
                        println!("  log: {message}");
                    }
                    last_log = newest;
                }
            }
            _ = &mut shutdown => break,
        }
    }

    poller.stop();
    if let Some(channel) = channel {
        channel.close();
    }
    info!(event = "watch_stopped");
    Ok(())
}

fn print_view(view: &SystemView) {
    let stats = &view.stats;
    println!(
        "server {} | database {} | predictions {} total, {} today, {} verified ({:.1}%)",
        stats.status,
        stats.database_status,
        stats.total_predictions,
        stats.today_predictions,
        stats.verified_predictions,
        stats.verified_prediction_percent
    );
    println!(
        "models {} files, {:.1} MB, {} trained recently",
        stats.model_file_count, stats.model_directory_size_mb, stats.recent_model_training_count
    );
    println!("{}", summary_line(view));
    if let Some(error) = &view.last_error {
        println!("last error: {error}");
    }
}

fn summary_line(view: &SystemView) -> String {
    let pipeline = &view.pipeline;
    let mut line = format!("pipeline {}", pipeline.state);
    if pipeline.state != PipelineState::Idle {
        line.push_str(&format!(" {:.0}%", pipeline.progress));
    }
    if let Some(step) = &pipeline.current_step {
        line.push_str(&format!(" step={step}"));
    }
    if let Some(by) = &pipeline.requested_by {
        line.push_str(&format!(" by={by}"));
    }
    if let Some(last_run) = pipeline.last_run {
        line.push_str(&format!(" last_run={}", last_run.format("%Y-%m-%d %H:%M")));
    }
    line
}

fn steps_from_flags(steps: Vec<String>) -> Option<Vec<String>> {
    if steps.is_empty() {
        None
    } else {
        Some(steps)
    }
}

fn load_config(args: &Args) -> RuntimeConfig {
    RuntimeConfig {
        base_url: resolve_base_url(&args.base_url),
        token: resolve_token(&args.token),
        log_stdout: resolve_log_stdout(),
    }
}

fn init_logging(config: &RuntimeConfig) {
    let level = env::var("FINEXIA_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = if config.log_stdout {
        BoxMakeWriter::new(io::stderr)
    } else {
        BoxMakeWriter::new(io::sink)
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn resolve_base_url(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    if let Ok(value) = env::var("FINEXIA_API_URL") {
        if !value.trim().is_empty() {
            return value.trim().to_string();
        }
    }
    DEFAULT_BASE_URL.to_string()
}

fn resolve_token(flag: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    env::var("FINEXIA_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_log_stdout() -> bool {
    env::var("FINEXIA_LOG_STDOUT")
        .map(|value| parse_flag(&value))
        .unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
