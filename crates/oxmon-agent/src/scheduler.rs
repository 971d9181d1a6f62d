//! Independent-item scheduling.
//!
//! An [`Executor`] owns one [`Item`] and runs it on the item's own ticker;
//! a [`Handler`] owns the executors for a whole item list and starts or
//! stops them as a unit. Handlers are never edited in place: a changed item
//! list means shutting the handler down and starting a new one.
//!
//! The same machinery drives custom command checks and exporter scrapes,
//! see [`crate::items`].

use crate::error::{AgentError, Result};
use async_trait::async_trait;
use oxmon_common::types::ResultEnvelope;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// How long a finished run may wait for room in the result queue before
/// its result is dropped.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// A dynamically configured unit of work with its own schedule.
#[async_trait]
pub trait Item: Send + Sync + 'static {
    type Output: Send + 'static;

    fn name(&self) -> &str;

    fn interval(&self) -> Duration;

    /// Upper bound for a single run. Must not exceed [`Item::interval`].
    fn timeout(&self) -> Duration;

    /// Performs one run. `cancel` fires when the executor shuts down.
    async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<Self::Output>;
}

/// Lifecycle of an [`Executor`]. Transitions only move forward and a
/// started executor always passes through `ShuttingDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

pub struct Executor<I: Item> {
    item: Arc<I>,
    results: mpsc::Sender<ResultEnvelope<I::Output>>,
    delivery_timeout: Duration,
    state: ExecutorState,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<I: Item> Executor<I> {
    pub fn new(item: I, results: mpsc::Sender<ResultEnvelope<I::Output>>) -> Self {
        Self {
            item: Arc::new(item),
            results,
            delivery_timeout: DELIVERY_TIMEOUT,
            state: ExecutorState::Created,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        self.item.name()
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    /// True while the run task exists and has not finished.
    pub fn is_open(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Validates the item schedule and starts ticking. The first run
    /// happens immediately.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the interval is zero or the
    /// timeout exceeds the interval; the item is then never run.
    pub fn start(&mut self, parent: &CancellationToken) -> Result<()> {
        if self.state != ExecutorState::Created {
            return Err(AgentError::AlreadyStarted(format!(
                "executor '{}'",
                self.item.name()
            )));
        }
        if let Err(e) = validate(self.item.as_ref()) {
            self.state = ExecutorState::Stopped;
            return Err(e);
        }

        self.cancel = parent.child_token();
        self.task = Some(tokio::spawn(run_loop(
            self.item.clone(),
            self.results.clone(),
            self.delivery_timeout,
            self.cancel.clone(),
        )));
        self.state = ExecutorState::Running;
        Ok(())
    }

    /// Cancels the in-flight run (if any), stops the ticker and joins the
    /// run task.
    pub async fn shutdown(&mut self) {
        match self.state {
            ExecutorState::Stopped => return,
            ExecutorState::Created => {
                self.state = ExecutorState::Stopped;
                return;
            }
            ExecutorState::Running | ExecutorState::ShuttingDown => {}
        }

        self.state = ExecutorState::ShuttingDown;
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(item = self.item.name(), error = %e, "Item task panicked");
            }
        }
        self.state = ExecutorState::Stopped;
    }
}

fn validate<I: Item>(item: &I) -> Result<()> {
    if item.interval().is_zero() {
        return Err(AgentError::ZeroInterval {
            name: item.name().to_string(),
        });
    }
    if item.timeout() > item.interval() {
        return Err(AgentError::TimeoutExceedsInterval {
            name: item.name().to_string(),
            timeout: item.timeout(),
            interval: item.interval(),
        });
    }
    Ok(())
}

async fn run_loop<I: Item>(
    item: Arc<I>,
    results: mpsc::Sender<ResultEnvelope<I::Output>>,
    delivery_timeout: Duration,
    cancel: CancellationToken,
) {
    let name = item.name().to_string();
    let timeout = item.timeout();
    let mut tick = tokio::time::interval(item.interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(item = %name, interval = ?item.interval(), ?timeout, "Item scheduled");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        let envelope = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outcome = tokio::time::timeout(timeout, item.run(&cancel)) => match outcome {
                Ok(Ok(value)) => ResultEnvelope::success(name.as_str(), value),
                Ok(Err(e)) => {
                    tracing::warn!(item = %name, error = %format!("{e:#}"), "Item run failed");
                    ResultEnvelope::failure(name.as_str(), format!("{e:#}"))
                }
                Err(_) => {
                    tracing::warn!(item = %name, ?timeout, "Item run timed out");
                    ResultEnvelope::failure(name.as_str(), format!("timed out after {timeout:?}"))
                }
            },
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = results.send_timeout(envelope, delivery_timeout) => match sent {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    tracing::warn!(item = %name, timeout = ?delivery_timeout, "Result queue full, dropping result");
                }
                Err(SendTimeoutError::Closed(_)) => {
                    tracing::debug!(item = %name, "Result queue closed, stopping item");
                    break;
                }
            },
        }
    }

    tracing::debug!(item = %name, "Item stopped");
}

/// Owns the executors of one item list.
pub struct Handler<I: Item> {
    kind: &'static str,
    executors: Vec<Executor<I>>,
}

impl<I: Item> Handler<I> {
    /// Builds one executor per item. `kind` names the item family in logs.
    pub fn new(
        kind: &'static str,
        items: Vec<I>,
        results: mpsc::Sender<ResultEnvelope<I::Output>>,
    ) -> Self {
        let executors = items
            .into_iter()
            .map(|item| Executor::new(item, results.clone()))
            .collect();
        Self { kind, executors }
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.executors = self
            .executors
            .into_iter()
            .map(|e| e.with_delivery_timeout(timeout))
            .collect();
        self
    }

    /// Starts every executor. Items that fail validation are logged and
    /// returned; the others keep running.
    pub fn start(&mut self, parent: &CancellationToken) -> Vec<AgentError> {
        let mut failures = Vec::new();
        for executor in &mut self.executors {
            if let Err(e) = executor.start(parent) {
                tracing::error!(kind = self.kind, item = executor.name(), error = %e, "Item not scheduled");
                failures.push(e);
            }
        }
        tracing::info!(
            kind = self.kind,
            running = self.running(),
            failed = failures.len(),
            "Item handler started"
        );
        failures
    }

    /// Stops all executors concurrently and returns once every one of them
    /// has joined.
    pub async fn shutdown(&mut self) {
        futures::future::join_all(self.executors.iter_mut().map(Executor::shutdown)).await;
        tracing::info!(kind = self.kind, items = self.executors.len(), "Item handler stopped");
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.executors.iter().map(Executor::name)
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// Number of executors currently in the `Running` state.
    pub fn running(&self) -> usize {
        self.executors
            .iter()
            .filter(|e| e.state() == ExecutorState::Running)
            .count()
    }

    /// Number of run tasks that have not finished yet.
    pub fn open_tasks(&self) -> usize {
        self.executors.iter().filter(|e| e.is_open()).count()
    }

    pub fn states(&self) -> Vec<(String, ExecutorState)> {
        self.executors
            .iter()
            .map(|e| (e.name().to_string(), e.state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: String,
        interval: Duration,
        timeout: Duration,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Item for Counting {
        type Output = usize;

        fn name(&self) -> &str {
            &self.name
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        async fn run(&self, _cancel: &CancellationToken) -> anyhow::Result<usize> {
            Ok(self.runs.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    fn counting(name: &str, interval_ms: u64, timeout_ms: u64) -> (Counting, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        (
            Counting {
                name: name.to_string(),
                interval: Duration::from_millis(interval_ms),
                timeout: Duration::from_millis(timeout_ms),
                runs: runs.clone(),
            },
            runs,
        )
    }

    #[tokio::test]
    async fn executor_walks_through_its_states() {
        let (item, _) = counting("a", 50, 50);
        let (tx, _rx) = mpsc::channel(16);
        let mut executor = Executor::new(item, tx);
        assert_eq!(executor.state(), ExecutorState::Created);

        executor.start(&CancellationToken::new()).unwrap();
        assert_eq!(executor.state(), ExecutorState::Running);
        assert!(executor.is_open());

        executor.shutdown().await;
        assert_eq!(executor.state(), ExecutorState::Stopped);
        assert!(!executor.is_open());
    }

    #[tokio::test]
    async fn executor_cannot_be_started_twice() {
        let (item, _) = counting("a", 50, 50);
        let (tx, _rx) = mpsc::channel(16);
        let mut executor = Executor::new(item, tx);
        let cancel = CancellationToken::new();
        executor.start(&cancel).unwrap();
        assert!(matches!(
            executor.start(&cancel),
            Err(AgentError::AlreadyStarted(_))
        ));
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let (item, runs) = counting("zero", 0, 0);
        let (tx, _rx) = mpsc::channel(16);
        let mut executor = Executor::new(item, tx);
        let err = executor.start(&CancellationToken::new()).unwrap_err();
        assert!(matches!(err, AgentError::ZeroInterval { .. }));
        assert_eq!(executor.state(), ExecutorState::Stopped);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn first_run_happens_immediately() {
        let (item, _) = counting("eager", 60_000, 1_000);
        let (tx, mut rx) = mpsc::channel(16);
        let mut executor = Executor::new(item, tx);
        executor.start(&CancellationToken::new()).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.name, "eager");
        assert!(first.is_success());
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn parent_cancellation_stops_the_loop() {
        let (item, _) = counting("a", 20, 20);
        let (tx, _rx) = mpsc::channel(1024);
        let parent = CancellationToken::new();
        let mut executor = Executor::new(item, tx);
        executor.start(&parent).unwrap();

        parent.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!executor.is_open());
        executor.shutdown().await;
        assert_eq!(executor.state(), ExecutorState::Stopped);
    }

    #[tokio::test]
    async fn stalled_consumer_loses_results_instead_of_blocking() {
        let (item, runs) = counting("busy", 20, 20);
        let (tx, mut rx) = mpsc::channel(1);
        let mut executor =
            Executor::new(item, tx).with_delivery_timeout(Duration::from_millis(10));
        executor.start(&CancellationToken::new()).unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        // the loop kept running while nobody consumed
        assert!(runs.load(Ordering::SeqCst) > 3);

        let kept = rx.recv().await.unwrap();
        assert!(kept.is_success());
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn handler_shutdown_joins_every_executor() {
        let (tx, _rx) = mpsc::channel(1024);
        let items = (0..5)
            .map(|i| counting(&format!("item-{i}"), 30, 30).0)
            .collect();
        let mut handler = Handler::new("test", items, tx);
        let failures = handler.start(&CancellationToken::new());
        assert!(failures.is_empty());
        assert_eq!(handler.running(), 5);
        assert_eq!(handler.open_tasks(), 5);

        handler.shutdown().await;
        assert_eq!(handler.running(), 0);
        assert_eq!(handler.open_tasks(), 0);
        assert!(handler
            .states()
            .iter()
            .all(|(_, s)| *s == ExecutorState::Stopped));
    }
}
