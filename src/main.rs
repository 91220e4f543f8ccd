use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use slidewarden::config::WardenConfig;
use slidewarden::ratelimit::{secs_to_ms, ThrottlerRules, DEFAULT_CLIENT_ID};
use slidewarden::{
    store, Clock, LimiterOptions, RateLimitGuard, SlidingWindowLimiter, SystemClock,
};

/// Sliding-window rate limiting against a shared counter store.
#[derive(Debug, Parser)]
#[command(name = "slidewarden", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
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
    /// Run a caller/route pair through the configured throttlers
    Check {
        /// Caller identity, e.g. a client IP
        #[arg(long)]
        caller: String,
        /// Request route
        #[arg(long)]
        route: String,
        /// Number of requests to send
        #[arg(long, default_value_t = 1)]
        repeat: u32,
        /// Throttler rules file, replacing the configured throttlers
        #[arg(long)]
        rules: Option<PathBuf>,
    },
    /// Record one hit for a raw key with explicit limits
    Record {
        #[arg(long)]
        key: String,
        #[arg(long)]
        window_secs: u64,
        #[arg(long)]
        limit: u64,
        #[arg(long, default_value_t = 0)]
        block_secs: u64,
        #[arg(long, default_value = DEFAULT_CLIENT_ID)]
        client_id: String,
    },
    /// Check that the counter store is reachable
    Ping,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = WardenConfig::load(cli.config.as_deref())?;
    info!(backend = ?config.store.backend, "Configuration loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = store::connect(&config.store, clock.clone()).await?;
    let limiter = Arc::new(SlidingWindowLimiter::with_options(
        store.clone(),
        clock,
        LimiterOptions::from(&config.limiter),
    ));

    match cli.command {
        Command::Check {
            caller,
            route,
            repeat,
            rules,
        } => {
            let rules = match rules {
                Some(path) => ThrottlerRules::from_file(path)?,
                None => config.guard.rules()?,
            };
            if rules.is_empty() {
                warn!("No throttlers configured, every request will be admitted");
            }

            let guard = RateLimitGuard::new(limiter, rules, config.guard.failure_policy);
            for _ in 0..repeat {
                let admission = guard.admit(&caller, &route).await?;
                println!("{}", serde_json::to_string(&admission)?);
            }
        }
        Command::Record {
            key,
            window_secs,
            limit,
            block_secs,
            client_id,
        } => {
            let decision = limiter
                .check_and_record(
                    &key,
                    secs_to_ms(window_secs, "window")?,
                    limit,
                    secs_to_ms(block_secs, "block duration")?,
                    &client_id,
                )
                .await?;
            println!("{}", serde_json::to_string(&decision)?);
        }
        Command::Ping => {
            store.ping().await?;
            println!("ok");
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
