use crate::{blocking, Check};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use sysinfo::System;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize)]
struct HostReport {
    hostname: Option<String>,
    os: Option<String>,
    os_version: Option<String>,
    kernel_version: Option<String>,
    arch: &'static str,
    uptime: u64,
    boot_time: u64,
}

pub struct HostCheck;

#[async_trait]
impl Check for HostCheck {
    fn name(&self) -> &str {
        "host"
    }

    async fn run(&mut self, _cancel: &CancellationToken) -> Result<serde_json::Value> {
        blocking(|| {
            let report = HostReport {
                hostname: System::host_name(),
                os: System::name(),
                os_version: System::os_version(),
                kernel_version: System::kernel_version(),
                arch: std::env::consts::ARCH,
                uptime: System::uptime(),
                boot_time: System::boot_time(),
            };
            Ok(serde_json::to_value(report)?)
        })
        .await
    }
}
