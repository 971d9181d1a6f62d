//! Fixed-interval batch scheduling of the built-in checks.
//!
//! Every tick spawns one batch task. Batch bodies are serialized by a mutex
//! that also owns the checks, so a slow batch defers the next one instead
//! of overlapping it. At most one tick waits behind a running body; later
//! ticks are skipped. A batch that misses its deadline is discarded whole.

use crate::error::{AgentError, Result};
use oxmon_collector::{Check, CheckSettings};
use oxmon_common::types::{CheckBatch, Snapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Bounded wait for room in the batch queue.
pub const BATCH_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

const DEADLINE_MARGIN: Duration = Duration::from_secs(1);

/// How long an overdue or cancelled batch body gets to unwind after abort.
const ABANDON_GRACE: Duration = Duration::from_millis(250);

/// Hard deadline of one batch: one second short of the interval, or 90% of
/// it for sub-second-margin intervals.
pub fn batch_timeout(interval: Duration) -> Duration {
    if interval > DEADLINE_MARGIN {
        interval - DEADLINE_MARGIN
    } else {
        interval * 9 / 10
    }
}

type SharedChecks = Arc<Mutex<Vec<Box<dyn Check>>>>;

pub struct CheckRunner {
    interval: Duration,
    timeout: Duration,
    delivery_timeout: Duration,
    pending: Option<Vec<Box<dyn Check>>>,
    results: mpsc::Sender<CheckBatch>,
    cancel: CancellationToken,
    ticker: Option<JoinHandle<()>>,
    batches: TaskTracker,
    enabled: Vec<String>,
}

impl CheckRunner {
    pub fn new(
        interval: Duration,
        checks: Vec<Box<dyn Check>>,
        results: mpsc::Sender<CheckBatch>,
    ) -> Self {
        Self {
            interval,
            timeout: batch_timeout(interval),
            delivery_timeout: BATCH_DELIVERY_TIMEOUT,
            pending: Some(checks),
            results,
            cancel: CancellationToken::new(),
            ticker: None,
            batches: TaskTracker::new(),
            enabled: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Names of the checks that made it through `configure`.
    pub fn enabled_checks(&self) -> &[String] {
        &self.enabled
    }

    /// Configures the checks and starts ticking. The first batch starts
    /// immediately.
    ///
    /// Checks that are disabled or fail to configure are left out of every
    /// batch; the runner itself still starts.
    pub fn start(&mut self, parent: &CancellationToken, settings: &CheckSettings) -> Result<()> {
        if self.interval.is_zero() {
            return Err(AgentError::ZeroInterval {
                name: "check runner".to_string(),
            });
        }
        let Some(checks) = self.pending.take() else {
            return Err(AgentError::AlreadyStarted("check runner".to_string()));
        };

        let mut active = Vec::with_capacity(checks.len());
        for mut check in checks {
            match check.configure(settings) {
                Ok(true) => active.push(check),
                Ok(false) => tracing::debug!(check = check.name(), "Check disabled"),
                Err(e) => {
                    tracing::warn!(check = check.name(), error = %e, "Check configuration failed, skipping");
                }
            }
        }
        self.enabled = active.iter().map(|c| c.name().to_string()).collect();

        tracing::info!(
            interval = ?self.interval,
            timeout = ?self.timeout,
            checks = ?self.enabled,
            "Check runner started"
        );

        self.cancel = parent.child_token();
        self.ticker = Some(tokio::spawn(tick_loop(
            self.interval,
            BatchContext {
                checks: Arc::new(Mutex::new(active)),
                timeout: self.timeout,
                delivery_timeout: self.delivery_timeout,
                results: self.results.clone(),
                cancel: self.cancel.clone(),
            },
            self.batches.clone(),
        )));
        Ok(())
    }

    /// True while the ticker or any batch task is still alive.
    pub fn is_running(&self) -> bool {
        self.ticker.as_ref().is_some_and(|t| !t.is_finished()) || !self.batches.is_empty()
    }

    /// Stops the ticker, cancels the in-flight batch and waits for every
    /// batch task to exit.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(ticker) = self.ticker.take() {
            if let Err(e) = ticker.await {
                tracing::error!(error = %e, "Check ticker panicked");
            }
        }
        self.batches.close();
        self.batches.wait().await;
        tracing::info!("Check runner stopped");
    }
}

#[derive(Clone)]
struct BatchContext {
    checks: SharedChecks,
    timeout: Duration,
    delivery_timeout: Duration,
    results: mpsc::Sender<CheckBatch>,
    cancel: CancellationToken,
}

async fn tick_loop(interval: Duration, ctx: BatchContext, batches: TaskTracker) {
    // one body running plus one tick queued behind it
    let slots = Arc::new(Semaphore::new(2));
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        match slots.clone().try_acquire_owned() {
            Ok(slot) => {
                batches.spawn(run_batch(ctx.clone(), slot));
            }
            Err(_) => {
                tracing::warn!("Previous batch still running, skipping tick");
            }
        }
    }
}

async fn run_batch(ctx: BatchContext, slot: OwnedSemaphorePermit) {
    let checks = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return,
        guard = ctx.checks.clone().lock_owned() => guard,
    };

    // the body gets its own task so the deadline fires even when a check
    // blocks the thread it runs on
    let batch_cancel = ctx.cancel.child_token();
    let mut body = tokio::spawn(collect(checks, batch_cancel.clone(), slot));
    let outcome = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => None,
        joined = tokio::time::timeout(ctx.timeout, &mut body) => Some(joined),
    };
    batch_cancel.cancel();

    let (values, _checks) = match outcome {
        Some(Ok(Ok(collected))) => collected,
        Some(Ok(Err(e))) => {
            tracing::error!(error = %e, "Batch task panicked");
            return;
        }
        Some(Err(_)) => {
            tracing::error!(
                timeout = ?ctx.timeout,
                "Batch exceeded its deadline, discarding partial results; consider a longer collection interval"
            );
            abandon(body).await;
            return;
        }
        None => {
            abandon(body).await;
            return;
        }
    };
    let batch = CheckBatch::new(values);
    tracing::debug!(checks = batch.len(), "Batch collected");

    // delivered while still holding the checks so batches leave in tick order
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => {}
        sent = ctx.results.send_timeout(batch, ctx.delivery_timeout) => match sent {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                tracing::warn!(timeout = ?ctx.delivery_timeout, "Batch queue full, dropping batch");
            }
            Err(SendTimeoutError::Closed(_)) => {
                tracing::debug!("Batch queue closed, dropping batch");
            }
        },
    }
}

/// Aborts an overdue body and gives it a short grace period to unwind. A
/// body stuck in a blocking call is left behind; it releases the checks and
/// its slot once that call returns.
async fn abandon<T>(body: JoinHandle<T>) {
    body.abort();
    if tokio::time::timeout(ABANDON_GRACE, body).await.is_err() {
        tracing::warn!("Overdue batch is blocked in a check, leaving it behind");
    }
}

/// Runs every check in turn. The checks travel with the body and come back
/// with its values so the caller can keep holding them during delivery.
async fn collect(
    mut checks: OwnedMutexGuard<Vec<Box<dyn Check>>>,
    cancel: CancellationToken,
    _slot: OwnedSemaphorePermit,
) -> (Snapshot, OwnedMutexGuard<Vec<Box<dyn Check>>>) {
    let mut values = Snapshot::new();
    for check in checks.iter_mut() {
        match check.run(&cancel).await {
            Ok(value) => {
                values.insert(check.name().to_string(), value);
            }
            Err(e) => {
                tracing::warn!(check = check.name(), error = %format!("{e:#}"), "Check failed");
            }
        }
    }
    (values, checks)
}
