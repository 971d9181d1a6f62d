mod common;

use anyhow::Result;
use common::{
    next_snapshot, snapshot_matching, start_instance, start_instance_with, test_config,
    GenerationCheck, StaticSource,
};
use axum::routing::get;
use axum::Router;
use oxmon_agent::config::ExporterConfig;
use oxmon_agent::{AgentError, ConfigError};
use oxmon_collector::Check;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn publishes_snapshots_after_initial_load() -> Result<()> {
    let instance = start_instance(StaticSource::new(test_config("agent-a")));
    let mut rx = instance.subscribe();

    let snapshot = next_snapshot(&mut rx).await?;
    assert_eq!(snapshot["uptime"], json!(1));

    let status = instance.status().await?;
    assert!(status.configured);
    assert!(status.runner_running);
    assert_eq!(status.enabled_checks, ["uptime".to_string()]);
    assert!(status.custom_checks_loaded);

    instance.shutdown().await?;
    assert!(!instance.is_running());
    Ok(())
}

#[tokio::test]
async fn failed_initial_load_stops_the_instance() -> Result<()> {
    let instance = start_instance(StaticSource::failing());

    tokio::time::timeout(Duration::from_secs(5), instance.stopped()).await?;
    assert!(!instance.is_running());
    let err = instance.shutdown().await.unwrap_err();
    assert!(matches!(err, AgentError::Config(ConfigError::Invalid(_))), "{err}");

    // requests after the loop is gone fail instead of hanging
    assert!(matches!(instance.status().await, Err(AgentError::Stopped)));
    Ok(())
}

#[tokio::test]
async fn failed_first_custom_check_load_is_fatal() -> Result<()> {
    let mut config = test_config("agent-b");
    config.custom_checks_path = Some("custom.toml".to_string());
    let source = StaticSource::new(config);
    source.set_custom(Err("custom.toml: permission denied".to_string()));

    let instance = start_instance(source.clone());
    tokio::time::timeout(Duration::from_secs(5), instance.stopped()).await?;
    assert_eq!(source.custom_loads(), 1);
    assert!(instance.shutdown().await.is_err());
    Ok(())
}

#[tokio::test]
async fn reload_replaces_the_whole_generation() -> Result<()> {
    let generation = Arc::new(AtomicUsize::new(0));
    let alive = Arc::new(AtomicUsize::new(0));
    let factory = {
        let generation = generation.clone();
        let alive = alive.clone();
        Arc::new(move || {
            let id = generation.fetch_add(1, Ordering::SeqCst) + 1;
            vec![Box::new(GenerationCheck::new(id, alive.clone())) as Box<dyn Check>]
        })
    };

    let instance = start_instance_with(StaticSource::new(test_config("agent-c")), factory);
    let mut rx = instance.subscribe();
    let first = next_snapshot(&mut rx).await?;
    assert_eq!(first["generation"], json!(1));

    instance.reload(test_config("agent-c")).await?;
    // the previous runner and its checks are gone once reload resolves
    assert_eq!(alive.load(Ordering::SeqCst), 1);
    assert_eq!(generation.load(Ordering::SeqCst), 2);

    snapshot_matching(&mut rx, 5, |s| s["generation"] == json!(2)).await?;
    for _ in 0..2 {
        let snapshot = next_snapshot(&mut rx).await?;
        assert_eq!(snapshot["generation"], json!(2));
    }

    instance.shutdown().await?;
    assert_eq!(alive.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn invalid_reload_keeps_the_running_generation() -> Result<()> {
    let instance = start_instance(StaticSource::new(test_config("agent-d")));
    let mut rx = instance.subscribe();
    next_snapshot(&mut rx).await?;

    let mut broken = test_config("agent-d");
    broken.collection_interval_secs = 0;
    let err = instance.reload(broken).await.unwrap_err();
    assert!(matches!(err, AgentError::Config(ConfigError::Invalid(_))));

    let status = instance.status().await?;
    assert!(status.runner_running);
    next_snapshot(&mut rx).await?;

    instance.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_is_idempotent() -> Result<()> {
    let instance = start_instance(StaticSource::new(test_config("agent-e")));
    instance.shutdown().await?;
    instance.shutdown().await?;
    assert!(matches!(
        instance.reload(test_config("agent-e")).await,
        Err(AgentError::Stopped)
    ));
    Ok(())
}

#[tokio::test]
async fn webserver_address_is_reported() -> Result<()> {
    let mut config = test_config("agent-f");
    config.webserver.enabled = true;
    config.webserver.listen = "127.0.0.1:0".parse()?;
    let instance = start_instance(StaticSource::new(config));

    let mut rx = instance.subscribe();
    next_snapshot(&mut rx).await?;
    let addr = instance
        .status()
        .await?
        .webserver_addr
        .expect("webserver is enabled");

    let body: serde_json::Value = reqwest::get(format!("http://{addr}/metrics"))
        .await?
        .json()
        .await?;
    assert_eq!(body["uptime"], json!(1));

    instance.shutdown().await?;
    assert!(reqwest::get(format!("http://{addr}/health")).await.is_err());
    Ok(())
}

#[tokio::test]
async fn reload_to_an_unavailable_address_keeps_the_webserver() -> Result<()> {
    let mut config = test_config("agent-i");
    config.webserver.enabled = true;
    config.webserver.listen = "127.0.0.1:0".parse()?;
    let instance = start_instance(StaticSource::new(config.clone()));
    let mut rx = instance.subscribe();
    next_snapshot(&mut rx).await?;
    let addr = instance
        .status()
        .await?
        .webserver_addr
        .expect("webserver is enabled");

    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    config.webserver.listen = taken.local_addr()?;
    let err = instance.reload(config).await.unwrap_err();
    assert!(matches!(err, AgentError::Bind { .. }), "{err}");

    let status = instance.status().await?;
    assert_eq!(status.webserver_addr, Some(addr));
    assert!(status.runner_running);
    let resp = reqwest::get(format!("http://{addr}/metrics")).await?;
    assert_eq!(resp.status().as_u16(), 200);

    instance.shutdown().await?;
    Ok(())
}

const EXPOSITION: &str = "\
# HELP node_load1 1m load average.
# TYPE node_load1 gauge
node_load1 0.5
http_requests_total{code=\"200\"} 3
";

#[tokio::test]
async fn exporter_scrapes_are_merged_and_forgotten_on_reload() -> Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let exporter_addr = listener.local_addr()?;
    let app = Router::new().route("/metrics", get(|| async { EXPOSITION }));
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    let mut config = test_config("agent-j");
    config.exporters = vec![ExporterConfig {
        name: "node".to_string(),
        url: format!("http://{exporter_addr}/metrics"),
        interval_secs: 1,
        timeout_secs: None,
        enabled: true,
    }];
    let instance = start_instance(StaticSource::new(config));
    let mut rx = instance.subscribe();

    let snapshot = snapshot_matching(&mut rx, 10, |s| s.get("node").is_some()).await?;
    assert_eq!(snapshot["uptime"], json!(1));
    assert_eq!(snapshot["node"]["node_load1"][0]["value"], json!(0.5));
    assert_eq!(
        snapshot["node"]["http_requests_total"][0]["labels"]["code"],
        json!("200")
    );
    assert_eq!(instance.status().await?.exporters_running, 1);

    instance.reload(test_config("agent-j")).await?;
    assert_eq!(instance.status().await?.exporters_running, 0);
    snapshot_matching(&mut rx, 5, |s| s.get("node").is_none()).await?;
    for _ in 0..2 {
        let snapshot = next_snapshot(&mut rx).await?;
        assert!(snapshot.get("node").is_none(), "removed exporter still published");
    }

    instance.shutdown().await?;
    server.abort();
    Ok(())
}

#[cfg(unix)]
mod custom_checks {
    use super::*;
    use common::custom_check;

    #[tokio::test]
    async fn item_results_are_merged_into_snapshots() -> Result<()> {
        let mut config = test_config("agent-g");
        config.custom_checks_path = Some("custom.toml".to_string());
        let source = StaticSource::new(config);
        source.set_custom(Ok(vec![
            custom_check("c1", "echo 7"),
            custom_check("c2", "exit 3"),
        ]));

        let instance = start_instance(source);
        let mut rx = instance.subscribe();
        let snapshot =
            snapshot_matching(&mut rx, 10, |s| s.get("c1").is_some() && s.get("c2").is_some())
                .await?;
        assert_eq!(snapshot["uptime"], json!(1));
        assert_eq!(snapshot["c1"], json!(7));
        assert!(snapshot["c2"]["error"].is_string());

        instance.reload_custom_checks(Vec::new()).await?;
        let status = instance.status().await?;
        assert_eq!(status.custom_checks_running, 0);
        snapshot_matching(&mut rx, 5, |s| s.get("c1").is_none() && s.get("c2").is_none())
            .await?;

        instance.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn failed_custom_check_reload_keeps_the_current_list() -> Result<()> {
        let mut config = test_config("agent-k");
        config.custom_checks_path = Some("custom.toml".to_string());
        let source = StaticSource::new(config.clone());
        source.set_custom(Ok(vec![custom_check("c1", "echo 1")]));

        let instance = start_instance(source.clone());
        let mut rx = instance.subscribe();
        snapshot_matching(&mut rx, 10, |s| s.get("c1").is_some()).await?;

        source.set_custom(Err("other.toml: no such file".to_string()));
        config.custom_checks_path = Some("other.toml".to_string());
        instance.reload(config).await?;

        // the load runs in the background after the reload is acknowledged
        for _ in 0..50 {
            if source.custom_loads() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(source.custom_loads(), 2);

        for _ in 0..2 {
            let snapshot = next_snapshot(&mut rx).await?;
            assert_eq!(snapshot["c1"], json!(1));
        }
        assert!(instance.is_running());
        let status = instance.status().await?;
        assert_eq!(status.custom_checks_running, 1);
        assert!(status.custom_checks_loaded);

        instance.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn custom_checks_survive_config_reload() -> Result<()> {
        let mut config = test_config("agent-h");
        config.custom_checks_path = Some("custom.toml".to_string());
        let source = StaticSource::new(config.clone());
        source.set_custom(Ok(vec![custom_check("c1", "echo 1")]));

        let instance = start_instance(source.clone());
        let mut rx = instance.subscribe();
        snapshot_matching(&mut rx, 10, |s| s.get("c1").is_some()).await?;

        // same custom path: no second load, the handler keeps running
        instance.reload(config).await?;
        assert_eq!(source.custom_loads(), 1);
        assert_eq!(instance.status().await?.custom_checks_running, 1);

        instance.shutdown().await?;
        Ok(())
    }
}
