#![allow(dead_code)]

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use axum::body::Bytes;
use oxmon_agent::config::{AgentConfig, ConfigSource, CustomCheckConfig};
use oxmon_agent::logging::LogSink;
use oxmon_agent::ConfigError;
use oxmon_agent::{AgentInstance, InstanceOptions};
use oxmon_collector::Check;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Config with a 1 s batch interval, no webserver and no push.
pub fn test_config(agent_id: &str) -> AgentConfig {
    let mut config: AgentConfig =
        toml::from_str(&format!("agent_id = \"{agent_id}\"")).expect("minimal config parses");
    config.collection_interval_secs = 1;
    config.webserver.enabled = false;
    config
}

pub fn custom_check(name: &str, command: &str) -> CustomCheckConfig {
    CustomCheckConfig {
        name: name.to_string(),
        command: command.to_string(),
        interval_secs: 1,
        timeout_secs: None,
        enabled: true,
    }
}

/// In-memory configuration source whose answers can be changed between
/// loads.
pub struct StaticSource {
    config: Mutex<Option<AgentConfig>>,
    custom: Mutex<std::result::Result<Vec<CustomCheckConfig>, String>>,
    custom_loads: AtomicUsize,
}

impl StaticSource {
    pub fn new(config: AgentConfig) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(Some(config)),
            custom: Mutex::new(Ok(Vec::new())),
            custom_loads: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(None),
            custom: Mutex::new(Ok(Vec::new())),
            custom_loads: AtomicUsize::new(0),
        })
    }

    pub fn set_custom(&self, custom: std::result::Result<Vec<CustomCheckConfig>, String>) {
        *self.custom.lock().unwrap() = custom;
    }

    pub fn custom_loads(&self) -> usize {
        self.custom_loads.load(Ordering::SeqCst)
    }
}

impl ConfigSource for StaticSource {
    fn load_config(&self) -> std::result::Result<AgentConfig, ConfigError> {
        self.config
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ConfigError::Invalid("config file missing".to_string()))
    }

    fn load_custom_checks(
        &self,
        _path: &str,
    ) -> std::result::Result<Vec<CustomCheckConfig>, ConfigError> {
        self.custom_loads.fetch_add(1, Ordering::SeqCst);
        self.custom.lock().unwrap().clone().map_err(ConfigError::Invalid)
    }
}

/// Check returning a fixed value.
pub struct Constant {
    pub name: &'static str,
    pub value: Value,
}

#[async_trait]
impl Check for Constant {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&mut self, _cancel: &CancellationToken) -> anyhow::Result<Value> {
        Ok(self.value.clone())
    }
}

/// Check that reports which generation created it and tracks how many
/// instances are alive.
pub struct GenerationCheck {
    generation: usize,
    alive: Arc<AtomicUsize>,
}

impl GenerationCheck {
    pub fn new(generation: usize, alive: Arc<AtomicUsize>) -> Self {
        alive.fetch_add(1, Ordering::SeqCst);
        Self { generation, alive }
    }
}

impl Drop for GenerationCheck {
    fn drop(&mut self) {
        self.alive.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Check for GenerationCheck {
    fn name(&self) -> &str {
        "generation"
    }

    async fn run(&mut self, _cancel: &CancellationToken) -> anyhow::Result<Value> {
        Ok(json!(self.generation))
    }
}

/// Counts concurrent entries into a section and remembers the maximum.
#[derive(Clone, Default)]
pub struct ConcurrencyGauge {
    current: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
    entered: Arc<AtomicUsize>,
    exited: Arc<AtomicUsize>,
}

pub struct GaugeGuard(ConcurrencyGauge);

impl ConcurrencyGauge {
    pub fn enter(&self) -> GaugeGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        self.entered.fetch_add(1, Ordering::SeqCst);
        GaugeGuard(self.clone())
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    pub fn exited(&self) -> usize {
        self.exited.load(Ordering::SeqCst)
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
        self.0.exited.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn constant_checks() -> Vec<Box<dyn Check>> {
    vec![Box::new(Constant {
        name: "uptime",
        value: json!(1),
    })]
}

pub fn start_instance(source: Arc<StaticSource>) -> AgentInstance {
    start_instance_with(source, Arc::new(constant_checks))
}

pub fn start_instance_with(
    source: Arc<StaticSource>,
    checks: oxmon_agent::instance::CheckFactory,
) -> AgentInstance {
    let options = InstanceOptions {
        source,
        checks,
        log_sink: LogSink::detached(),
    };
    AgentInstance::start(options, &CancellationToken::new())
}

/// Waits for the next published snapshot and decodes it.
pub async fn next_snapshot(rx: &mut watch::Receiver<Option<Bytes>>) -> Result<Value> {
    tokio::time::timeout(Duration::from_secs(5), rx.changed())
        .await
        .context("no snapshot within 5s")?
        .map_err(|_| anyhow!("snapshot cache closed"))?;
    let bytes = rx
        .borrow_and_update()
        .clone()
        .ok_or_else(|| anyhow!("snapshot cache still empty"))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Reads snapshots until `accept` returns true, giving up after `limit`.
pub async fn snapshot_matching(
    rx: &mut watch::Receiver<Option<Bytes>>,
    limit: usize,
    accept: impl Fn(&Value) -> bool,
) -> Result<Value> {
    for _ in 0..limit {
        let snapshot = next_snapshot(rx).await?;
        if accept(&snapshot) {
            return Ok(snapshot);
        }
    }
    Err(anyhow!("no matching snapshot in {limit} attempts"))
}
