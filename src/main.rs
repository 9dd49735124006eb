use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::probe::{self, ProbeReport};
use turnstile::ratelimit::Router;

#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about = "Admission control against a shared counter store")]
struct Cli {
    /// YAML configuration file; TURNSTILE__* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List configured routes
    Routes,

    /// Run admission checks on a route and print each decision
    Check {
        route: String,

        #[arg(long, default_value_t = 1)]
        count: u32,
    },

    /// Offer a fixed request rate to a route and report the accept rate
    Probe {
        route: String,

        /// Requests per second to offer
        #[arg(long)]
        rate: f64,

        #[arg(long, default_value_t = 10.0)]
        seconds: f64,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Probe at half, exactly, and twice the route's rate threshold
    Sweep {
        route: String,

        #[arg(long, default_value_t = 10.0)]
        seconds: f64,

        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config =
        TurnstileConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(cli.log_format, config.debug);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        store = %config.store.url(),
        rate_threshold = config.limits.rate_threshold,
        tokens_per_bucket = config.limits.tokens_per_bucket,
        on_store_failure = ?config.limits.on_store_failure,
        "Configuration loaded"
    );

    if let Command::Routes = cli.command {
        for (route, route_config) in &config.routes {
            println!("{}\t{}", route, route_config.algorithm);
        }
        return Ok(());
    }

    let router = Router::connect(&config)
        .await
        .context("Failed to initialize rate limiters")?;

    tokio::select! {
        result = run(&cli.command, &config, &router) => result?,
        _ = shutdown_signal() => {}
    }

    info!("Turnstile stopped");
    Ok(())
}

fn init_tracing(format: LogFormat, debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(command: &Command, config: &TurnstileConfig, router: &Router) -> anyhow::Result<()> {
    match command {
        Command::Routes => {}
        Command::Check { route, count } => {
            for i in 1..=*count {
                let decision = router.admit(route).await?;
                println!("{}\t{}\t{:?}", route, i, decision);
            }
        }
        Command::Probe {
            route,
            rate,
            seconds,
            json,
        } => {
            let report = probe::run(router, route, *rate, seconds_to_duration(*seconds)?).await?;
            print_reports(&[report], *json)?;
        }
        Command::Sweep {
            route,
            seconds,
            json,
        } => {
            let threshold = config.settings_for(route)?.rate_threshold();
            println!("{}: rate threshold {}/s", route, threshold);
            let duration = seconds_to_duration(*seconds)?;
            let reports = probe::sweep(router, route, threshold, duration).await?;
            print_reports(&reports, *json)?;
        }
    }
    Ok(())
}

fn seconds_to_duration(seconds: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(seconds).context("--seconds must be a non-negative number")
}

fn print_reports(reports: &[ProbeReport], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reports)?);
    } else {
        for report in reports {
            println!("{}", report);
        }
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
