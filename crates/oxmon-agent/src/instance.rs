//! Agent instance supervisor.
//!
//! One control loop owns every piece of mutable runtime state: the current
//! configuration generation (check runner, exporter handler, publication),
//! the custom-check handler and the last-value table. The public handle
//! talks to it through a bounded request queue; every request carries a
//! oneshot acknowledgement that is answered once the loop has finished
//! applying it.
//!
//! Generations never overlap. A reload tears the old generation down
//! (joining every task it spawned) before the new one starts.

use crate::aggregate::{encode_snapshot, LastValues};
use crate::config::{AgentConfig, ConfigSource, CustomCheckConfig};
use crate::error::{AgentError, ConfigError, Result};
use crate::items::{custom_check_handler, exporter_handler, CustomCheckHandler, ExporterHandler};
use crate::logging::LogSink;
use crate::publish::{
    bind_webserver, snapshot_cache, Publication, SnapshotCache, PUBLISH_TIMEOUT,
};
use crate::runner::CheckRunner;
use axum::body::Bytes;
use oxmon_collector::exporter::Scrape;
use oxmon_collector::Check;
use oxmon_common::types::{CheckBatch, ResultEnvelope};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

const CONTROL_QUEUE: usize = 16;
const RESULT_QUEUE: usize = 64;

/// Produces a fresh set of built-in checks for each generation.
pub type CheckFactory = Arc<dyn Fn() -> Vec<Box<dyn Check>> + Send + Sync>;

pub struct InstanceOptions {
    pub source: Arc<dyn ConfigSource>,
    pub checks: CheckFactory,
    pub log_sink: LogSink,
}

impl InstanceOptions {
    /// Options for the production agent: built-in checks for this platform.
    pub fn new(source: Arc<dyn ConfigSource>, log_sink: LogSink) -> Self {
        Self {
            source,
            checks: Arc::new(oxmon_collector::default_checks),
            log_sink,
        }
    }
}

enum Control {
    Reload {
        config: Box<AgentConfig>,
        ack: oneshot::Sender<Result<()>>,
    },
    ReloadCustomChecks {
        checks: Vec<CustomCheckConfig>,
        ack: oneshot::Sender<Result<()>>,
    },
    Status {
        ack: oneshot::Sender<InstanceStatus>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Point-in-time view of the running generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceStatus {
    pub configured: bool,
    pub runner_running: bool,
    pub enabled_checks: Vec<String>,
    pub exporters_running: usize,
    pub custom_checks_running: usize,
    pub custom_checks_loaded: bool,
    pub webserver_addr: Option<SocketAddr>,
    pub last_values: usize,
}

/// Handle on a running agent instance.
pub struct AgentInstance {
    control: mpsc::Sender<Control>,
    stopped: CancellationToken,
    snapshots: SnapshotCache,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl AgentInstance {
    /// Spawns the control loop and starts loading the configuration in the
    /// background. Returns immediately.
    ///
    /// A failure of that first load (or of the first custom-check load) is
    /// fatal: the loop exits and [`AgentInstance::shutdown`] returns the
    /// error.
    pub fn start(options: InstanceOptions, parent: &CancellationToken) -> Self {
        let (control, requests) = mpsc::channel(CONTROL_QUEUE);
        let stopped = CancellationToken::new();
        let snapshots = snapshot_cache();

        let (supervisor, inboxes) =
            Supervisor::new(options, parent.child_token(), snapshots.clone());
        let done = stopped.clone();
        let task = tokio::spawn(async move {
            let result = supervisor.run(requests, inboxes).await;
            done.cancel();
            result
        });

        Self {
            control,
            stopped,
            snapshots,
            task: Mutex::new(Some(task)),
        }
    }

    /// Applies a new configuration. Resolves once the new generation is
    /// running, or with the reason it was rejected.
    pub async fn reload(&self, config: AgentConfig) -> Result<()> {
        self.request(|ack| Control::Reload {
            config: Box::new(config),
            ack,
        })
        .await?
    }

    /// Replaces the custom-check list.
    pub async fn reload_custom_checks(&self, checks: Vec<CustomCheckConfig>) -> Result<()> {
        self.request(|ack| Control::ReloadCustomChecks { checks, ack })
            .await?
    }

    pub async fn status(&self) -> Result<InstanceStatus> {
        self.request(|ack| Control::Status { ack }).await
    }

    /// Stops the instance and waits for every task it spawned. Returns the
    /// fatal error that ended the loop, if any. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.stopped.is_cancelled() {
            // a failed request means the loop is already gone
            let _ = self.request(|ack| Control::Shutdown { ack }).await;
        }
        self.join().await
    }

    /// Latest published snapshot. Survives reloads.
    pub fn subscribe(&self) -> watch::Receiver<Option<Bytes>> {
        self.snapshots.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.is_cancelled()
    }

    /// Resolves when the control loop has exited, for whatever reason.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await;
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Control) -> Result<T> {
        let (ack, done) = oneshot::channel();
        tokio::select! {
            biased;
            _ = self.stopped.cancelled() => return Err(AgentError::Stopped),
            sent = self.control.send(make(ack)) => sent.map_err(|_| AgentError::Stopped)?,
        }
        done.await.map_err(|_| AgentError::Stopped)
    }

    async fn join(&self) -> Result<()> {
        let Some(task) = self.task.lock().await.take() else {
            return Ok(());
        };
        match task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "Agent control loop panicked");
                Err(AgentError::Stopped)
            }
        }
    }
}

/// Everything spawned for one configuration.
struct Generation {
    runner: CheckRunner,
    exporters: ExporterHandler,
    publication: Option<Publication>,
}

impl Generation {
    async fn shutdown(mut self) {
        self.runner.shutdown().await;
        self.exporters.shutdown().await;
        if let Some(publication) = self.publication.take() {
            publication.shutdown().await;
        }
    }
}

type Loading<T> = Option<JoinHandle<std::result::Result<T, ConfigError>>>;

struct Supervisor {
    source: Arc<dyn ConfigSource>,
    checks: CheckFactory,
    log_sink: LogSink,
    cancel: CancellationToken,
    snapshots: SnapshotCache,
    http: reqwest::Client,

    config: Option<AgentConfig>,
    generation: Option<Generation>,
    custom: Option<CustomCheckHandler>,
    custom_loaded: bool,
    last_values: LastValues,

    batch_tx: mpsc::Sender<CheckBatch>,
    custom_tx: mpsc::Sender<ResultEnvelope<serde_json::Value>>,
    exporter_tx: mpsc::Sender<ResultEnvelope<Scrape>>,
}

struct Inboxes {
    batches: mpsc::Receiver<CheckBatch>,
    custom: mpsc::Receiver<ResultEnvelope<serde_json::Value>>,
    exporters: mpsc::Receiver<ResultEnvelope<Scrape>>,
}

impl Supervisor {
    fn new(
        options: InstanceOptions,
        cancel: CancellationToken,
        snapshots: SnapshotCache,
    ) -> (Self, Inboxes) {
        let (batch_tx, batches) = mpsc::channel(RESULT_QUEUE);
        let (custom_tx, custom) = mpsc::channel(RESULT_QUEUE);
        let (exporter_tx, exporters) = mpsc::channel(RESULT_QUEUE);
        (
            Self {
                source: options.source,
                checks: options.checks,
                log_sink: options.log_sink,
                cancel,
                snapshots,
                http: reqwest::Client::new(),
                config: None,
                generation: None,
                custom: None,
                custom_loaded: false,
                last_values: LastValues::new(),
                batch_tx,
                custom_tx,
                exporter_tx,
            },
            Inboxes {
                batches,
                custom,
                exporters,
            },
        )
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Control>,
        mut inboxes: Inboxes,
    ) -> Result<()> {
        tracing::info!("Agent instance starting");
        let source = self.source.clone();
        let mut initial: Loading<AgentConfig> =
            Some(tokio::task::spawn_blocking(move || source.load_config()));
        let mut custom_load: Loading<Vec<CustomCheckConfig>> = None;
        let mut shutdown_ack = None;

        let result = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::info!("Agent instance cancelled");
                    break Ok(());
                }
                request = requests.recv() => match request {
                    Some(Control::Shutdown { ack }) => {
                        shutdown_ack = Some(ack);
                        break Ok(());
                    }
                    Some(Control::Reload { config, ack }) => {
                        if let Some(pending) = initial.take() {
                            tracing::debug!("Explicit reload supersedes the initial configuration load");
                            pending.abort();
                        }
                        let applied = self.apply_config(*config, &mut custom_load).await;
                        if let Err(e) = &applied {
                            tracing::error!(error = %e, "Configuration reload rejected");
                        }
                        let _ = ack.send(applied);
                    }
                    Some(Control::ReloadCustomChecks { checks, ack }) => {
                        if let Some(pending) = custom_load.take() {
                            pending.abort();
                        }
                        self.apply_custom_checks(checks).await;
                        let _ = ack.send(Ok(()));
                    }
                    Some(Control::Status { ack }) => {
                        let _ = ack.send(self.status());
                    }
                    None => {
                        tracing::info!("All instance handles dropped");
                        break Ok(());
                    }
                },
                loaded = wait_for(&mut initial) => {
                    initial = None;
                    let applied = match flatten(loaded) {
                        Ok(config) => self.apply_config(config, &mut custom_load).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = applied {
                        tracing::error!(error = %e, "Initial configuration failed");
                        break Err(e);
                    }
                }
                loaded = wait_for(&mut custom_load) => {
                    custom_load = None;
                    match flatten(loaded) {
                        Ok(checks) => self.apply_custom_checks(checks).await,
                        Err(e) if !self.custom_loaded => {
                            tracing::error!(error = %e, "Initial custom check load failed");
                            break Err(e);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Custom check load failed, keeping current list");
                        }
                    }
                }
                Some(batch) = inboxes.batches.recv() => {
                    if let Err(e) = self.publish(batch).await {
                        tracing::error!(error = %e, "Snapshot could not be encoded");
                        break Err(e);
                    }
                }
                Some(envelope) = inboxes.custom.recv() => {
                    if self.custom.as_ref().is_some_and(|h| h.names().any(|n| n == envelope.name)) {
                        self.last_values.record(&envelope);
                    }
                }
                Some(envelope) = inboxes.exporters.recv() => {
                    let current = self
                        .generation
                        .as_ref()
                        .is_some_and(|g| g.exporters.names().any(|n| n == envelope.name));
                    if current {
                        self.last_values.record(&envelope);
                    }
                }
            }
        };

        if let Some(pending) = initial.take() {
            pending.abort();
        }
        if let Some(pending) = custom_load.take() {
            pending.abort();
        }
        self.teardown().await;
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
        result
    }

    /// Swaps in a new configuration generation. Validation failures and an
    /// unavailable new listen address leave the current generation
    /// untouched.
    async fn apply_config(
        &mut self,
        config: AgentConfig,
        custom_load: &mut Loading<Vec<CustomCheckConfig>>,
    ) -> Result<()> {
        config.validate()?;

        // a new listen address is bound while the old generation still
        // serves, so a bind failure leaves it running
        let listener = if config.webserver.enabled && !self.serves(&config) {
            Some(bind_webserver(&config.webserver).await?)
        } else {
            None
        };

        if let Err(e) = self.log_sink.update(&config.log) {
            tracing::warn!(error = %e, "Log settings not applied, keeping previous ones");
        }

        if let Some(previous) = self.generation.take() {
            tracing::info!("Stopping previous configuration generation");
            previous.shutdown().await;
        }

        let mut start_error = None;
        let publication = match Publication::start_with(
            &config,
            listener,
            self.snapshots.clone(),
            &self.cancel,
        )
        .await
        {
            Ok(publication) => Some(publication),
            Err(e) => {
                tracing::error!(error = %e, "Publication not started");
                start_error = Some(e);
                None
            }
        };

        let mut runner = CheckRunner::new(
            config.collection_interval(),
            (self.checks)(),
            self.batch_tx.clone(),
        );
        if let Err(e) = runner.start(&self.cancel, &config.checks) {
            if let Some(publication) = publication {
                publication.shutdown().await;
            }
            return Err(e);
        }

        let mut exporters = exporter_handler(&config.exporters, &self.http, self.exporter_tx.clone());
        exporters.start(&self.cancel);

        if let Some(previous) = &self.config {
            let current: HashSet<&str> = exporters.names().collect();
            self.last_values.forget(
                previous
                    .exporters
                    .iter()
                    .map(|e| e.name.as_str())
                    .filter(|name| !current.contains(name)),
            );
        }

        let path_changed = self
            .config
            .as_ref()
            .map_or(true, |previous| previous.custom_checks_path != config.custom_checks_path);
        if path_changed {
            match &config.custom_checks_path {
                Some(path) => {
                    if let Some(pending) = custom_load.take() {
                        pending.abort();
                    }
                    tracing::info!(path = %path, "Loading custom checks");
                    let source = self.source.clone();
                    let path = path.clone();
                    *custom_load =
                        Some(tokio::task::spawn_blocking(move || source.load_custom_checks(&path)));
                }
                None if !self.custom_loaded => self.custom_loaded = true,
                None => {}
            }
        }

        tracing::info!(
            agent_id = %config.agent_id,
            interval = ?config.collection_interval(),
            checks = runner.enabled_checks().len(),
            exporters = exporters.running(),
            webserver = ?publication.as_ref().and_then(Publication::local_addr),
            push = config.push.is_some(),
            "Configuration applied"
        );

        self.generation = Some(Generation {
            runner,
            exporters,
            publication,
        });
        self.config = Some(config);
        start_error.map_or(Ok(()), Err)
    }

    /// True when the running webserver already listens where `config`
    /// asks for; that address can only be rebound after teardown.
    fn serves(&self, config: &AgentConfig) -> bool {
        let running = self
            .generation
            .as_ref()
            .is_some_and(|g| g.publication.as_ref().is_some_and(|p| p.local_addr().is_some()));
        running
            && self.config.as_ref().is_some_and(|previous| {
                previous.webserver.enabled && previous.webserver.listen == config.webserver.listen
            })
    }

    async fn apply_custom_checks(&mut self, checks: Vec<CustomCheckConfig>) {
        let previous: Vec<String> = match self.custom.take() {
            Some(mut handler) => {
                handler.shutdown().await;
                handler.names().map(str::to_string).collect()
            }
            None => Vec::new(),
        };

        let mut handler = custom_check_handler(&checks, self.custom_tx.clone());
        handler.start(&self.cancel);
        {
            let current: HashSet<&str> = handler.names().collect();
            self.last_values.forget(
                previous
                    .iter()
                    .map(String::as_str)
                    .filter(|name| !current.contains(name)),
            );
        }

        tracing::info!(
            configured = checks.len(),
            running = handler.running(),
            "Custom checks applied"
        );
        self.custom = Some(handler);
        self.custom_loaded = true;
    }

    async fn publish(&mut self, batch: CheckBatch) -> Result<()> {
        let mut snapshot = batch.values;
        self.last_values.merge_into(&mut snapshot);
        let encoded = Bytes::from(encode_snapshot(&snapshot)?);

        let Some(publication) = self
            .generation
            .as_ref()
            .and_then(|g| g.publication.as_ref())
        else {
            tracing::debug!("No publication running, snapshot dropped");
            return Ok(());
        };

        let written = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            written = publication.write(encoded, PUBLISH_TIMEOUT) => written,
        };
        if let Err(e) = written {
            tracing::warn!(error = %e, "Snapshot dropped");
        }
        Ok(())
    }

    fn status(&self) -> InstanceStatus {
        let generation = self.generation.as_ref();
        InstanceStatus {
            configured: self.config.is_some(),
            runner_running: generation.is_some_and(|g| g.runner.is_running()),
            enabled_checks: generation
                .map(|g| g.runner.enabled_checks().to_vec())
                .unwrap_or_default(),
            exporters_running: generation.map_or(0, |g| g.exporters.running()),
            custom_checks_running: self.custom.as_ref().map_or(0, |h| h.running()),
            custom_checks_loaded: self.custom_loaded,
            webserver_addr: generation
                .and_then(|g| g.publication.as_ref())
                .and_then(Publication::local_addr),
            last_values: self.last_values.len(),
        }
    }

    async fn teardown(&mut self) {
        self.cancel.cancel();
        if let Some(mut custom) = self.custom.take() {
            custom.shutdown().await;
        }
        if let Some(generation) = self.generation.take() {
            generation.shutdown().await;
        }
        tracing::info!("Agent instance stopped");
    }
}

async fn wait_for<T>(slot: &mut Option<JoinHandle<T>>) -> std::result::Result<T, JoinError> {
    match slot {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn flatten<T>(
    joined: std::result::Result<std::result::Result<T, ConfigError>, JoinError>,
) -> Result<T> {
    Ok(joined??)
}
