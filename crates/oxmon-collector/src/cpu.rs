use crate::{blocking, lock, Check};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use sysinfo::System;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize)]
struct CpuReport {
    usage_percent: f32,
    core_count: usize,
    cores: Vec<CoreUsage>,
}

#[derive(Debug, Serialize)]
struct CoreUsage {
    core: usize,
    usage_percent: f32,
    frequency_mhz: u64,
}

pub struct CpuCheck {
    system: Arc<Mutex<System>>,
}

impl CpuCheck {
    pub fn new() -> Self {
        let mut system = System::new();
        // usage is computed from the delta between two refreshes
        system.refresh_cpu_all();
        Self {
            system: Arc::new(Mutex::new(system)),
        }
    }
}

impl Default for CpuCheck {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Check for CpuCheck {
    fn name(&self) -> &str {
        "cpu"
    }

    async fn run(&mut self, _cancel: &CancellationToken) -> Result<serde_json::Value> {
        let system = self.system.clone();
        blocking(move || {
            let mut system = lock(&system);
            system.refresh_cpu_all();

            let cores: Vec<CoreUsage> = system
                .cpus()
                .iter()
                .enumerate()
                .map(|(i, cpu)| CoreUsage {
                    core: i,
                    usage_percent: cpu.cpu_usage(),
                    frequency_mhz: cpu.frequency(),
                })
                .collect();

            let report = CpuReport {
                usage_percent: system.global_cpu_usage(),
                core_count: cores.len(),
                cores,
            };
            Ok(serde_json::to_value(report)?)
        })
        .await
    }
}
