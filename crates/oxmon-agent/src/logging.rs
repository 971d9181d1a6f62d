//! Process-wide log sink with a reloadable level filter and a switchable
//! destination (stderr or an append-only file).
//!
//! The sink is configured from the `[log]` section and reconfigured on every
//! config reload. When `RUST_LOG` is set it owns the filter and reloads only
//! switch the destination.

use crate::config::LogConfig;
use crate::error::{AgentError, Result};
use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload::{self, Handle};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

pub type FilterHandle = Handle<EnvFilter, Registry>;

#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Filter directive for a configured level, e.g. `"debug"` becomes
/// `"oxmon=debug"`.
pub fn filter_directive(level: &str) -> String {
    format!("oxmon={}", level.trim())
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(filter_directive(level))
        .map_err(|e| AgentError::Logging(format!("invalid log level '{level}': {e}")))
}

#[derive(Debug)]
enum Destination {
    Stderr,
    File { path: PathBuf, file: File },
}

/// Shared log destination, usable as a `MakeWriter`.
#[derive(Debug, Clone)]
pub struct LogTarget {
    inner: Arc<Mutex<Destination>>,
}

impl Default for LogTarget {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Destination::Stderr)),
        }
    }
}

impl LogTarget {
    fn lock(&self) -> MutexGuard<'_, Destination> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Switches to `path` (opened for append) or back to stderr. Opening
    /// the same file again is a no-op.
    pub fn set(&self, path: Option<&Path>) -> Result<()> {
        let next = match path {
            None => Destination::Stderr,
            Some(path) => {
                if let Destination::File { path: current, .. } = &*self.lock() {
                    if current == path {
                        return Ok(());
                    }
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| {
                        AgentError::Logging(format!("cannot open log file {}: {e}", path.display()))
                    })?;
                Destination::File {
                    path: path.to_path_buf(),
                    file,
                }
            }
        };
        *self.lock() = next;
        Ok(())
    }

    pub fn current_file(&self) -> Option<PathBuf> {
        match &*self.lock() {
            Destination::Stderr => None,
            Destination::File { path, .. } => Some(path.clone()),
        }
    }
}

pub struct TargetWriter {
    inner: Arc<Mutex<Destination>>,
}

impl Write for TargetWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut dest = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match &mut *dest {
            Destination::Stderr => io::stderr().write(buf),
            Destination::File { file, .. } => file.write(buf),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut dest = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match &mut *dest {
            Destination::Stderr => io::stderr().write_all(buf),
            Destination::File { file, .. } => file.write_all(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut dest = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match &mut *dest {
            Destination::Stderr => io::stderr().flush(),
            Destination::File { file, .. } => file.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogTarget {
    type Writer = TargetWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TargetWriter {
            inner: self.inner.clone(),
        }
    }
}

/// Handle on the process log sink.
#[derive(Clone)]
pub struct LogSink {
    filter: Option<FilterHandle>,
    env_override: bool,
    target: LogTarget,
}

impl LogSink {
    /// Installs the global subscriber. Call once per process.
    pub fn init(config: &LogConfig) -> Result<Self> {
        let target = LogTarget::default();
        target.set(config.file.as_deref())?;

        let env_override = std::env::var_os(EnvFilter::DEFAULT_ENV).is_some();
        let filter = if env_override {
            EnvFilter::from_default_env()
        } else {
            build_filter(&config.level)?
        };
        let (filter_layer, handle) = reload::Layer::new(filter);

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(
                fmt::layer()
                    .with_timer(LocalTimer)
                    .with_ansi(false)
                    .with_writer(target.clone()),
            )
            .try_init()
            .map_err(|e| AgentError::Logging(e.to_string()))?;

        Ok(Self {
            filter: Some(handle),
            env_override,
            target,
        })
    }

    /// A sink that is not wired to any subscriber. Updates still switch the
    /// destination, which keeps instance tests free of global state.
    pub fn detached() -> Self {
        Self {
            filter: None,
            env_override: false,
            target: LogTarget::default(),
        }
    }

    pub fn target(&self) -> &LogTarget {
        &self.target
    }

    /// Applies a new `[log]` section.
    pub fn update(&self, config: &LogConfig) -> Result<()> {
        // validate before touching anything
        let filter = build_filter(&config.level)?;
        self.target.set(config.file.as_deref())?;

        if let Some(handle) = &self.filter {
            if !self.env_override {
                handle
                    .reload(filter)
                    .map_err(|e| AgentError::Logging(format!("failed to reload filter: {e}")))?;
            }
        }
        tracing::debug!(level = %config.level, file = ?config.file, "Log sink updated");
        Ok(())
    }
}
