use crate::{blocking, percent, Check};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use sysinfo::Disks;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize)]
struct DiskUsage {
    file_system: String,
    total: u64,
    used: u64,
    available: u64,
    used_percent: f64,
}

/// Usage per mount point. The disk list is re-read every run so mounts
/// added or removed between batches show up. `statvfs` on a dead network
/// mount can hang, so the scan runs on the blocking pool.
#[derive(Default)]
pub struct DiskCheck;

impl DiskCheck {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Check for DiskCheck {
    fn name(&self) -> &str {
        "disk"
    }

    async fn run(&mut self, _cancel: &CancellationToken) -> Result<serde_json::Value> {
        blocking(|| {
            let disks = Disks::new_with_refreshed_list();
            let mut mounts = BTreeMap::new();

            for disk in disks.iter() {
                let mount = disk.mount_point().to_string_lossy().to_string();
                let total = disk.total_space();
                let available = disk.available_space();
                let used = total.saturating_sub(available);

                mounts.insert(
                    mount,
                    DiskUsage {
                        file_system: disk.file_system().to_string_lossy().to_string(),
                        total,
                        used,
                        available,
                        used_percent: percent(used, total),
                    },
                );
            }

            Ok(serde_json::to_value(mounts)?)
        })
        .await
    }
}
