use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use wanvid_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use wanvid_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, RuntimeLogMode, DEFAULT_LOG_FILTER,
};
use wanvid_core::server::{app_router, app_state_from_config, GenerateResponse};

#[derive(Parser)]
#[command(
    name = "wanvid",
    about = "Image-to-video generation service backed by a ComfyUI workflow",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate one video without starting the HTTP server.
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(help = "URL of the input image (http or https)")]
    image_url: String,
    #[arg(long, help = "Destination bucket (overrides OUTPUT_BUCKET)")]
    bucket: Option<String>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        RuntimeLogMode::Cli
    } else {
        RuntimeLogMode::Server
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        mode,
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(mode, &resolved_data_dir);

    match cli.command {
        Some(Commands::Run(run)) => run_once(run, &resolved_data_dir).await,
        None => run_server(cli.port, cli.host, &resolved_data_dir).await,
    }
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    let options = LoggingInitOptions {
        mode: RuntimeLogMode::Server,
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        noise_filter: noise_base.to_string(),
        ..Default::default()
    };

    logging::compose_logging_filters(&options).console_filter
}

fn init_logging(
    mode: RuntimeLogMode,
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) {
    let init_options = LoggingInitOptions {
        mode,
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(logging::redacting_make_writer(ready.appender))
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: &Path) {
    info!(
        mode = mode.name(),
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

/// File config from the data directory with process environment applied on top.
fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let mut config = match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    config.apply_env_overrides();
    config
}

fn resolve_port(port_override: Option<u16>, env_port: Option<&str>, configured: u16) -> u16 {
    port_override
        .or_else(|| env_port.and_then(|v| v.trim().parse().ok()))
        .unwrap_or(configured)
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: &Path,
) -> Result<()> {
    let config = load_config(data_dir);

    let port = resolve_port(
        port_override,
        std::env::var("PORT").ok().as_deref(),
        config.server.port,
    );
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    if config.output_bucket().is_none() {
        warn!("OUTPUT_BUCKET is not set; generation requests will be rejected");
    }

    let state = app_state_from_config(config).await?;
    let app = app_router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting wanvid server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_once(args: RunArgs, data_dir: &Path) -> Result<()> {
    let mut config = load_config(data_dir);
    if let Some(bucket) = args.bucket {
        config.storage.bucket = Some(bucket);
    }
    let bucket = config
        .output_bucket()
        .map(str::to_string)
        .context("no output bucket configured: pass --bucket or set OUTPUT_BUCKET")?;

    let state = app_state_from_config(config).await?;
    let stored = state.generator().generate(&args.image_url, &bucket).await?;

    let response = GenerateResponse {
        output_video_url: stored.public_url,
    };
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn run_subcommand_takes_url_and_optional_bucket() {
        let cli = Cli::try_parse_from([
            "wanvid",
            "run",
            "https://example.com/cat.png",
            "--bucket",
            "renders",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Run(run)) => {
                assert_eq!(run.image_url, "https://example.com/cat.png");
                assert_eq!(run.bucket.as_deref(), Some("renders"));
            }
            None => panic!("expected run subcommand"),
        }
    }

    #[test]
    fn no_subcommand_means_server_mode() {
        let cli = Cli::try_parse_from(["wanvid", "--port", "9000", "-v"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.verbose, 1);
    }

    #[test]
    fn port_flag_beats_env_which_beats_config() {
        assert_eq!(resolve_port(Some(1), Some("2"), 3), 1);
        assert_eq!(resolve_port(None, Some(" 2 "), 3), 2);
        assert_eq!(resolve_port(None, Some("nope"), 3), 3);
        assert_eq!(resolve_port(None, None, 3), 3);
    }
}
