//! The two item families scheduled by [`crate::scheduler::Handler`].

use crate::config::{CustomCheckConfig, ExporterConfig};
use crate::scheduler::{Handler, Item};
use async_trait::async_trait;
use oxmon_collector::command::run_command;
use oxmon_collector::exporter::{scrape, Scrape};
use oxmon_common::types::ResultEnvelope;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type CustomCheckHandler = Handler<CustomCheck>;
pub type ExporterHandler = Handler<ExporterTarget>;

/// A user-defined shell command run on its own schedule.
#[derive(Debug, Clone)]
pub struct CustomCheck {
    config: CustomCheckConfig,
}

impl CustomCheck {
    pub fn new(config: CustomCheckConfig) -> Self {
        Self { config }
    }

    pub fn command(&self) -> &str {
        &self.config.command
    }
}

#[async_trait]
impl Item for CustomCheck {
    type Output = serde_json::Value;

    fn name(&self) -> &str {
        &self.config.name
    }

    fn interval(&self) -> Duration {
        self.config.interval()
    }

    fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<serde_json::Value> {
        run_command(&self.config.command, cancel).await
    }
}

/// A Prometheus endpoint scraped on its own schedule.
#[derive(Debug, Clone)]
pub struct ExporterTarget {
    config: ExporterConfig,
    client: reqwest::Client,
}

impl ExporterTarget {
    pub fn new(config: ExporterConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

#[async_trait]
impl Item for ExporterTarget {
    type Output = Scrape;

    fn name(&self) -> &str {
        &self.config.name
    }

    fn interval(&self) -> Duration {
        self.config.interval()
    }

    fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<Scrape> {
        scrape(&self.client, &self.config.url, self.timeout(), cancel).await
    }
}

/// Builds a handler for the enabled entries of a custom-check list.
pub fn custom_check_handler(
    configs: &[CustomCheckConfig],
    results: mpsc::Sender<ResultEnvelope<serde_json::Value>>,
) -> CustomCheckHandler {
    let items = configs
        .iter()
        .filter(|c| {
            if !c.enabled {
                tracing::debug!(check = %c.name, "Custom check disabled");
            }
            c.enabled
        })
        .cloned()
        .map(CustomCheck::new)
        .collect();
    Handler::new("custom_check", items, results)
}

/// Builds a handler for the enabled exporters, sharing one HTTP client.
pub fn exporter_handler(
    configs: &[ExporterConfig],
    client: &reqwest::Client,
    results: mpsc::Sender<ResultEnvelope<Scrape>>,
) -> ExporterHandler {
    let items = configs
        .iter()
        .filter(|c| {
            if !c.enabled {
                tracing::debug!(exporter = %c.name, "Exporter disabled");
            }
            c.enabled
        })
        .map(|c| ExporterTarget::new(c.clone(), client.clone()))
        .collect();
    Handler::new("exporter", items, results)
}
