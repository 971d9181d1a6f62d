//! Built-in checks and item actions for the oxmon agent.
//!
//! Each [`Check`] implementation gathers one category of host telemetry
//! (CPU, memory, disk, network, load, processes, host facts) and returns it
//! as a JSON value keyed by the check name in the published snapshot.
//!
//! The [`command`] and [`exporter`] modules hold the actions behind
//! independently scheduled items: user-defined commands and Prometheus
//! endpoint scrapes.

pub mod command;
pub mod cpu;
pub mod disk;
pub mod exporter;
pub mod host;
#[cfg(not(windows))]
pub mod load;
pub mod memory;
pub mod network;
pub mod process;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// A built-in metric check run in lockstep with the other checks once per
/// collection interval.
///
/// `Send` is required because the batch body runs on a spawned task.
#[async_trait]
pub trait Check: Send {
    /// Returns the check name (e.g., `"cpu"`, `"disk"`), used as the key in
    /// the snapshot and for logging.
    fn name(&self) -> &str;

    /// Decides whether this check takes part in batches for the given
    /// settings. Called once per scheduler start.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are unusable for this check; the
    /// check is then left out of every batch.
    fn configure(&mut self, settings: &CheckSettings) -> Result<bool> {
        Ok(settings.is_enabled(self.name()))
    }

    /// Collects the current value.
    ///
    /// `cancel` fires when the batch deadline passes or the agent shuts
    /// down; long-running checks should stop early when it does.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying system API call fails.
    async fn run(&mut self, cancel: &CancellationToken) -> Result<serde_json::Value>;
}

/// Per-check switches from the `[checks]` section of the agent config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSettings {
    /// Names of built-in checks to leave out of every batch.
    #[serde(default)]
    pub disabled: Vec<String>,
    /// Number of processes reported by the `process` check.
    #[serde(default = "default_process_top")]
    pub process_top: usize,
}

fn default_process_top() -> usize {
    5
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            disabled: Vec::new(),
            process_top: default_process_top(),
        }
    }
}

impl CheckSettings {
    pub fn is_enabled(&self, name: &str) -> bool {
        !self.disabled.iter().any(|d| d == name)
    }
}

/// The registry of built-in checks for the current platform.
pub fn default_checks() -> Vec<Box<dyn Check>> {
    let mut checks: Vec<Box<dyn Check>> = vec![
        Box::new(cpu::CpuCheck::new()),
        Box::new(memory::MemoryCheck::new()),
        Box::new(disk::DiskCheck::new()),
        Box::new(network::NetworkCheck::new()),
        Box::new(process::ProcessCheck::new()),
        Box::new(host::HostCheck),
    ];
    #[cfg(not(windows))]
    checks.push(Box::new(load::LoadCheck));
    checks
}

/// Runs a system query on the blocking pool. A hung syscall then stalls a
/// pool thread instead of the async worker, and the caller's deadline still
/// fires.
pub(crate) async fn blocking<T, F>(query: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(query)
        .await
        .context("system query panicked")?
}

/// Poison-tolerant lock for sysinfo state shared with the blocking pool.
pub(crate) fn lock<T>(state: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Percentage of `part` in `total`, `0.0` when `total` is zero.
pub(crate) fn percent(part: u64, total: u64) -> f64 {
    if total > 0 {
        (part as f64 / total as f64) * 100.0
    } else {
        0.0
    }
}
