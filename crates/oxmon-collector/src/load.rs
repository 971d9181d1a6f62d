use crate::Check;
use anyhow::Result;
use async_trait::async_trait;
use sysinfo::System;
use tokio_util::sync::CancellationToken;

pub struct LoadCheck;

#[async_trait]
impl Check for LoadCheck {
    fn name(&self) -> &str {
        "load"
    }

    async fn run(&mut self, _cancel: &CancellationToken) -> Result<serde_json::Value> {
        let load_avg = System::load_average();
        Ok(serde_json::json!({
            "load_1": load_avg.one,
            "load_5": load_avg.five,
            "load_15": load_avg.fifteen,
            "uptime": System::uptime(),
        }))
    }
}
