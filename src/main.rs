use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::{AdmissionGuard, LimiterRegistry};

/// Request admission control with per-identity token buckets.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting Turnstile admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TurnstileConfig::load(args.config.as_deref())?;
    let rl = &config.rate_limiting;
    info!(
        idle_ttl_secs = rl.idle_ttl_secs,
        sweep_interval_secs = rl.sweep_interval_secs,
        global_enabled = rl.global.enabled,
        policies = rl.policies.len(),
        "Configuration loaded"
    );

    // The registry is the single owner of limiter state; guards borrow from it.
    let registry = LimiterRegistry::with_settings(rl.registry_settings())?;

    let mut guards = BTreeMap::new();
    if rl.global.enabled {
        let guard = AdmissionGuard::per_address(&registry, rl.global.limit()?)?;
        guards.insert("global".to_string(), guard);
    }
    for (name, policy) in &rl.policies {
        let guard = AdmissionGuard::with_options(&registry, policy.to_options()?)?;
        guards.insert(name.clone(), guard);
    }

    for (name, guard) in &guards {
        info!(policy = %name, registry_key = %guard.limiter_set().key(), "Admission guard ready");
    }
    info!(
        guards = guards.len(),
        limiter_sets = registry.set_count(),
        "Rate limiter initialized"
    );

    shutdown_signal().await;

    drop(guards);
    registry.shutdown().await;

    info!("Turnstile admission control stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
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
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
