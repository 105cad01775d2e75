// src/main.rs

//! Entry point for every fleet role process. Which role runs is selected
//! by the first positional argument (`hub`, `brain`, `server`, `cluster`);
//! each role then loads the same `config.toml` shape and connects to the
//! hub over `WebSocket`.

use anyhow::{Context, Result, anyhow};
use hikari_fleet::config::FleetConfig;
use hikari_fleet::{hub, roles};
use std::env;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("hikari-fleet version {VERSION}");
        return Ok(());
    }

    let Some(role) = args.get(1).cloned() else {
        eprintln!("Usage: fleet <hub|brain|server|cluster> [--config path] [options]");
        std::process::exit(1);
    };

    let config_path = flag_value(&args, "--config").unwrap_or_else(|| "config.toml".to_string());
    let config = match FleetConfig::from_file(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    let reload_handle = init_logging(&config.log_level);
    spawn_log_reload_on_sighup(reload_handle, config_path.clone());

    let hub_uri = flag_value(&args, "--hub-uri").unwrap_or_else(|| format!("ws://{}:{}", config.host, config.port));

    let result = match role.as_str() {
        "hub" => hub::run(config).await.map_err(Into::into),
        "brain" => roles::brain::run(&hub_uri, &config).await.map_err(Into::into),
        "server" => roles::server_role::run(&hub_uri, &config).await.map_err(Into::into),
        "cluster" => run_cluster(&args, &hub_uri, &config).await,
        other => Err(anyhow!("unknown role '{other}'; expected hub, brain, server, or cluster")),
    };

    if let Err(e) = &result {
        error!("{role} runtime error: {e}");
    }
    result
}

async fn run_cluster(args: &[String], hub_uri: &str, config: &FleetConfig) -> Result<()> {
    let shard_ids = flag_value(args, "--shard-ids")
        .context("cluster role requires --shard-ids")?
        .split(',')
        .map(|s| s.parse::<u32>().context("invalid shard id"))
        .collect::<Result<Vec<_>>>()?;
    let server_uid = flag_value(args, "--server-uid")
        .context("cluster role requires --server-uid")?
        .parse::<u32>()
        .context("invalid --server-uid")?;

    roles::cluster::run(hub_uri, config, server_uid, shard_ids)
        .await
        .map_err(Into::into)
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1)).cloned()
}

type LogReloadHandle = Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>;

/// Sets up a reloadable log filter, matching the layered registry setup
/// used across the rest of this ecosystem, and returns the handle so a
/// caller can change the level at runtime without a restart.
fn init_logging(configured_level: &str) -> LogReloadHandle {
    let initial_level = std::env::var("RUST_LOG").unwrap_or_else(|_| configured_level.to_string());
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();

    Arc::new(reload_handle)
}

/// On Unix, reloads the `RUST_LOG`-style filter from `config_path`'s
/// `log_level` field every time the process receives `SIGHUP`, the same
/// hot-reload trigger most long-running daemons in this ecosystem use.
fn spawn_log_reload_on_sighup(reload_handle: LogReloadHandle, config_path: String) {
    #[cfg(unix)]
    {
        tokio::spawn(async move {
            let Ok(mut sighup) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                warn!("failed to install SIGHUP handler; log level reload disabled");
                return;
            };
            loop {
                sighup.recv().await;
                match FleetConfig::from_file(&config_path) {
                    Ok(config) => match EnvFilter::try_new(&config.log_level) {
                        Ok(filter) => match reload_handle.reload(filter) {
                            Ok(()) => info!(log_level = %config.log_level, "reloaded log level"),
                            Err(e) => warn!(error = %e, "failed to apply reloaded log level"),
                        },
                        Err(e) => warn!(error = %e, "invalid log_level in reloaded config"),
                    },
                    Err(e) => warn!(error = %e, "failed to reload config on SIGHUP"),
                }
            }
        });
    }
    #[cfg(not(unix))]
    {
        let _ = (reload_handle, config_path);
    }
}
