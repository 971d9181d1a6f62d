use anyhow::{Context, Result};
use oxmon_agent::config::{AgentConfig, ConfigSource, FileConfigSource};
use oxmon_agent::logging::LogSink;
use oxmon_agent::{AgentInstance, InstanceOptions};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const DEFAULT_CONFIG_PATH: &str = "config/agent.toml";

fn print_usage() {
    println!(
        "Usage:
  oxmon-agent [config.toml]          Run the agent (default: {DEFAULT_CONFIG_PATH})
  oxmon-agent check-config [path]    Validate a config file and its custom checks
  oxmon-agent --help                 Show this message

Signals:
  SIGHUP            Reload the config file and the custom check file
  SIGINT, SIGTERM   Shut down gracefully"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("-h" | "--help") => {
            print_usage();
            return Ok(());
        }
        Some("check-config") => {
            let path = args.get(1).map_or(DEFAULT_CONFIG_PATH, String::as_str);
            return check_config(path);
        }
        _ => {}
    }

    let config_path = args
        .first()
        .cloned()
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let source = Arc::new(FileConfigSource::new(&config_path));

    // an unreadable config is reported by the instance; logging starts with defaults
    let log_config = AgentConfig::load(&config_path)
        .map(|c| c.log)
        .unwrap_or_default();
    let log_sink = LogSink::init(&log_config)?;
    tracing::info!(
        config = %config_path,
        version = env!("CARGO_PKG_VERSION"),
        "oxmon-agent starting"
    );

    let root = CancellationToken::new();
    let instance = AgentInstance::start(InstanceOptions::new(source.clone(), log_sink), &root);

    wait_for_signals(&instance, &source).await?;
    instance
        .shutdown()
        .await
        .context("oxmon-agent stopped with an error")?;
    tracing::info!("oxmon-agent stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signals(instance: &AgentInstance, source: &Arc<FileConfigSource>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = instance.stopped() => return Ok(()),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received interrupt, shutting down");
                return Ok(());
            }
            _ = terminate.recv() => {
                tracing::info!("Received SIGTERM, shutting down");
                return Ok(());
            }
            _ = hangup.recv() => {
                tracing::info!("Received SIGHUP, reloading configuration");
                reload_from_disk(instance, source).await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(instance: &AgentInstance, _source: &Arc<FileConfigSource>) -> Result<()> {
    tokio::select! {
        _ = instance.stopped() => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("Received interrupt, shutting down"),
    }
    Ok(())
}

#[cfg_attr(not(unix), allow(dead_code))]
async fn reload_from_disk(instance: &AgentInstance, source: &Arc<FileConfigSource>) {
    let loader = source.clone();
    let config = match tokio::task::spawn_blocking(move || loader.load_config()).await {
        Ok(Ok(config)) => config,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Reload failed, keeping current configuration");
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Reload task failed");
            return;
        }
    };

    let custom_path = config.custom_checks_path.clone();
    if let Err(e) = instance.reload(config).await {
        tracing::warn!(error = %e, "Reload rejected, keeping current configuration");
        return;
    }

    if let Some(path) = custom_path {
        let loader = source.clone();
        match tokio::task::spawn_blocking(move || loader.load_custom_checks(&path)).await {
            Ok(Ok(checks)) => {
                if let Err(e) = instance.reload_custom_checks(checks).await {
                    tracing::warn!(error = %e, "Custom check reload rejected");
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Custom check reload failed, keeping current list")
            }
            Err(e) => tracing::warn!(error = %e, "Custom check reload task failed"),
        }
    }
    tracing::info!("Configuration reloaded");
}

fn check_config(path: &str) -> Result<()> {
    let source = FileConfigSource::new(path);
    let config = source.load_config()?;
    println!(
        "{path}: ok (agent_id={}, interval={}s, exporters={})",
        config.agent_id,
        config.collection_interval_secs,
        config.exporters.len()
    );
    if let Some(custom) = &config.custom_checks_path {
        let checks = source.load_custom_checks(custom)?;
        println!("{custom}: ok ({} custom checks)", checks.len());
    }
    Ok(())
}
