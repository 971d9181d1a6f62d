use crate::{blocking, Check};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use sysinfo::Networks;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    received: u64,
    transmitted: u64,
    packets_received: u64,
    packets_transmitted: u64,
}

#[derive(Debug, Serialize)]
struct InterfaceDelta {
    bytes_recv: u64,
    bytes_sent: u64,
    packets_recv: u64,
    packets_sent: u64,
}

/// Per-interface traffic since the previous run. The first run of an
/// interface reports zero deltas.
pub struct NetworkCheck {
    previous: HashMap<String, Counters>,
}

impl NetworkCheck {
    pub fn new() -> Self {
        Self {
            previous: HashMap::new(),
        }
    }
}

impl Default for NetworkCheck {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Check for NetworkCheck {
    fn name(&self) -> &str {
        "network"
    }

    async fn run(&mut self, _cancel: &CancellationToken) -> Result<serde_json::Value> {
        let previous = std::mem::take(&mut self.previous);
        let (report, seen) = blocking(move || {
            let networks = Networks::new_with_refreshed_list();
            let mut interfaces = BTreeMap::new();
            let mut seen = HashMap::new();

            for (name, data) in networks.iter() {
                let now = Counters {
                    received: data.total_received(),
                    transmitted: data.total_transmitted(),
                    packets_received: data.total_packets_received(),
                    packets_transmitted: data.total_packets_transmitted(),
                };
                let prev = previous.get(name).copied().unwrap_or(now);

                interfaces.insert(
                    name.clone(),
                    InterfaceDelta {
                        bytes_recv: now.received.saturating_sub(prev.received),
                        bytes_sent: now.transmitted.saturating_sub(prev.transmitted),
                        packets_recv: now.packets_received.saturating_sub(prev.packets_received),
                        packets_sent: now
                            .packets_transmitted
                            .saturating_sub(prev.packets_transmitted),
                    },
                );
                seen.insert(name.clone(), now);
            }
            Ok((serde_json::to_value(interfaces)?, seen))
        })
        .await?;

        // interfaces that disappeared are forgotten
        self.previous = seen;
        Ok(report)
    }
}
