//! Publication boundary of one configuration generation.
//!
//! The supervisor writes encoded snapshots into a single-slot queue. A
//! distributor task takes them out and hands each one to the sinks: the
//! instance-wide snapshot cache (read by the local webserver) and the
//! optional push task. Everything here is started per generation and torn
//! down before the next one starts; only the cache outlives it.

use crate::config::{AgentConfig, PushConfig, WebserverConfig};
use crate::error::{AgentError, Result};
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// How long the supervisor waits for the publication queue to accept a
/// snapshot before dropping it.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Latest encoded snapshot, `None` until the first batch is published.
pub type SnapshotCache = Arc<watch::Sender<Option<Bytes>>>;

pub fn snapshot_cache() -> SnapshotCache {
    Arc::new(watch::channel(None).0)
}

pub struct Publication {
    writer: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    local_addr: Option<SocketAddr>,
}

impl Publication {
    /// Binds the webserver (when enabled) and starts the distributor and
    /// push tasks.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Bind`] when the listen address is unavailable.
    pub async fn start(
        config: &AgentConfig,
        cache: SnapshotCache,
        parent: &CancellationToken,
    ) -> Result<Self> {
        Self::start_with(config, None, cache, parent).await
    }

    /// Like [`Publication::start`], serving on `listener` when one was bound
    /// ahead of time with [`bind_webserver`].
    pub async fn start_with(
        config: &AgentConfig,
        listener: Option<TcpListener>,
        cache: SnapshotCache,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let cancel = parent.child_token();
        let tasks = TaskTracker::new();
        let (writer, inbox) = mpsc::channel(1);

        let mut local_addr = None;
        if config.webserver.enabled {
            let listener = match listener {
                Some(listener) => listener,
                None => bind_webserver(&config.webserver).await?,
            };
            local_addr = listener.local_addr().ok();
            tracing::info!(addr = ?local_addr, "Snapshot webserver listening");

            let app = router(WebState {
                agent_id: Arc::from(config.agent_id.as_str()),
                snapshots: cache.subscribe(),
                started: Instant::now(),
            });
            let shutdown = cancel.clone();
            tasks.spawn(async move {
                let server = axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await });
                if let Err(e) = server.await {
                    tracing::error!(error = %e, "Snapshot webserver error");
                }
            });
        }

        let push = match &config.push {
            Some(push) => {
                let (tx, rx) = watch::channel(None);
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_secs(push.timeout_secs))
                    .build()?;
                tasks.spawn(push_loop(push.clone(), client, rx, cancel.clone()));
                Some(tx)
            }
            None => None,
        };

        tasks.spawn(distribute(inbox, cache, push, cancel.clone()));
        tasks.close();

        Ok(Self {
            writer,
            cancel,
            tasks,
            local_addr,
        })
    }

    /// Address the webserver actually bound to, if it runs.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Hands a snapshot to the distributor, waiting at most `wait` for the
    /// queue slot to free up.
    pub async fn write(&self, snapshot: Bytes, wait: Duration) -> Result<()> {
        match self.writer.send_timeout(snapshot, wait).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(AgentError::PublishTimeout(wait)),
            Err(SendTimeoutError::Closed(_)) => Err(AgentError::PublishClosed),
        }
    }

    /// Stops the webserver, distributor and push tasks and waits for them.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tasks.wait().await;
        tracing::debug!("Publication stopped");
    }
}

/// Binds the webserver listen address.
///
/// # Errors
///
/// Returns [`AgentError::Bind`] when the address is unavailable.
pub async fn bind_webserver(config: &WebserverConfig) -> Result<TcpListener> {
    let addr = config.listen;
    TcpListener::bind(addr)
        .await
        .map_err(|source| AgentError::Bind { addr, source })
}

async fn distribute(
    mut inbox: mpsc::Receiver<Bytes>,
    cache: SnapshotCache,
    push: Option<watch::Sender<Option<Bytes>>>,
    cancel: CancellationToken,
) {
    loop {
        let snapshot = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = inbox.recv() => match next {
                Some(snapshot) => snapshot,
                None => break,
            },
        };
        tracing::debug!(bytes = snapshot.len(), "Snapshot published");
        if let Some(push) = &push {
            push.send_replace(Some(snapshot.clone()));
        }
        cache.send_replace(Some(snapshot));
    }
}

/// Pushes the newest snapshot to the configured endpoint. Snapshots that
/// arrive while a push is in flight are coalesced.
async fn push_loop(
    config: PushConfig,
    client: reqwest::Client,
    mut latest: watch::Receiver<Option<Bytes>>,
    cancel: CancellationToken,
) {
    tracing::info!(url = %config.url, "Snapshot push enabled");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = latest.changed() => if changed.is_err() { break },
        }
        let Some(body) = latest.borrow_and_update().clone() else {
            continue;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = push_once(&client, &config, body) => match result {
                Ok(()) => tracing::debug!(url = %config.url, "Snapshot pushed"),
                Err(e) => tracing::warn!(url = %config.url, error = %format!("{e:#}"), "Snapshot push failed"),
            },
        }
    }
}

async fn push_once(client: &reqwest::Client, config: &PushConfig, body: Bytes) -> anyhow::Result<()> {
    let mut request = client
        .post(&config.url)
        .header(header::CONTENT_TYPE.as_str(), "application/json")
        .body(body);
    if let Some(token) = &config.auth_token {
        request = request.bearer_auth(token);
    }
    let resp = request.send().await?;
    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("server returned HTTP {}", status.as_u16());
    }
    Ok(())
}

#[derive(Clone)]
struct WebState {
    agent_id: Arc<str>,
    snapshots: watch::Receiver<Option<Bytes>>,
    started: Instant,
}

fn router(state: WebState) -> Router {
    Router::new()
        .route("/", get(latest_snapshot))
        .route("/metrics", get(latest_snapshot))
        .route("/health", get(health))
        .layer(middleware::from_fn(request_logging))
        .with_state(state)
}

async fn latest_snapshot(State(state): State<WebState>) -> Response {
    let snapshot = state.snapshots.borrow().clone();
    match snapshot {
        Some(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "no snapshot collected yet").into_response(),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    agent_id: String,
    version: &'static str,
    uptime_secs: u64,
    has_snapshot: bool,
}

async fn health(State(state): State<WebState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        agent_id: state.agent_id.to_string(),
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started.elapsed().as_secs(),
        has_snapshot: state.snapshots.borrow().is_some(),
    })
}

fn format_elapsed(elapsed_us: u128) -> String {
    if elapsed_us < 1000 {
        format!("{elapsed_us}µs")
    } else if elapsed_us < 1_000_000 {
        format!("{}ms", elapsed_us / 1000)
    } else {
        format!("{:.1}s", elapsed_us as f64 / 1_000_000.0)
    }
}

async fn request_logging(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let resp = next.run(req).await;
    tracing::debug!(
        %method,
        path = %path,
        status = resp.status().as_u16(),
        elapsed = %format_elapsed(start.elapsed().as_micros()),
        "HTTP request"
    );
    resp
}
