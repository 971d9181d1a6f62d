use crate::{blocking, lock, percent, Check};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use sysinfo::System;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize)]
struct MemoryReport {
    total: u64,
    used: u64,
    available: u64,
    used_percent: f64,
    swap_total: u64,
    swap_used: u64,
    swap_percent: f64,
}

pub struct MemoryCheck {
    system: Arc<Mutex<System>>,
}

impl MemoryCheck {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }
}

impl Default for MemoryCheck {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Check for MemoryCheck {
    fn name(&self) -> &str {
        "memory"
    }

    async fn run(&mut self, _cancel: &CancellationToken) -> Result<serde_json::Value> {
        let system = self.system.clone();
        blocking(move || {
            let mut system = lock(&system);
            system.refresh_memory();

            let total = system.total_memory();
            let used = system.used_memory();
            let swap_total = system.total_swap();
            let swap_used = system.used_swap();

            let report = MemoryReport {
                total,
                used,
                available: system.available_memory(),
                used_percent: percent(used, total),
                swap_total,
                swap_used,
                swap_percent: percent(swap_used, swap_total),
            };
            Ok(serde_json::to_value(report)?)
        })
        .await
    }
}
