use crate::{blocking, lock, Check, CheckSettings};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use sysinfo::System;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize)]
struct ProcessReport {
    count: usize,
    top: Vec<ProcessUsage>,
}

#[derive(Debug, Serialize)]
struct ProcessUsage {
    pid: u32,
    name: String,
    cpu_percent: f32,
    memory: u64,
}

/// Process count plus the busiest processes by CPU.
pub struct ProcessCheck {
    system: Arc<Mutex<System>>,
    top: usize,
}

impl ProcessCheck {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
            top: CheckSettings::default().process_top,
        }
    }
}

impl Default for ProcessCheck {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Check for ProcessCheck {
    fn name(&self) -> &str {
        "process"
    }

    fn configure(&mut self, settings: &CheckSettings) -> Result<bool> {
        self.top = settings.process_top;
        Ok(settings.is_enabled(self.name()))
    }

    async fn run(&mut self, _cancel: &CancellationToken) -> Result<serde_json::Value> {
        let system = self.system.clone();
        let top = self.top;
        blocking(move || {
            let mut system = lock(&system);
            system.refresh_all();

            let mut usage: Vec<ProcessUsage> = system
                .processes()
                .iter()
                .map(|(pid, p)| ProcessUsage {
                    pid: pid.as_u32(),
                    name: p.name().to_string_lossy().to_string(),
                    cpu_percent: p.cpu_usage(),
                    memory: p.memory(),
                })
                .collect();
            let count = usage.len();

            usage.sort_by(|a, b| b.cpu_percent.total_cmp(&a.cpu_percent));
            usage.truncate(top);

            Ok(serde_json::to_value(ProcessReport { count, top: usage })?)
        })
        .await
    }
}
