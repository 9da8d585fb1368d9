//! Engine configuration. Defaults suit a local four-node cluster; every
//! knob can come from the environment so deployments stay image-identical.

use std::time::Duration;

use accord_core::Node;

use crate::monitor::MonitorConfig;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub node_id: String,
    pub nodes: Vec<Node>,
    /// Explicit f; `None` derives the largest f with `n >= 3f + 1`.
    pub fault_tolerance: Option<usize>,
    /// How long a submitter waits for its commit before giving up.
    pub request_timeout: Duration,
    /// Per-slot protocol deadline before a view change is voted.
    pub protocol_timeout: Duration,
    pub tick_interval: Duration,
    /// Early votes held while the matching PRE_PREPARE is in flight.
    pub vote_buffer_cap: usize,
    pub enable_monitoring: bool,
    pub monitor: MonitorConfig,
}

impl EngineConfig {
    pub fn new(node_id: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            node_id: node_id.into(),
            nodes,
            fault_tolerance: None,
            request_timeout: Duration::from_secs(30),
            protocol_timeout: Duration::from_secs(3),
            tick_interval: Duration::from_millis(100),
            vote_buffer_cap: 256,
            enable_monitoring: true,
            monitor: MonitorConfig::default(),
        }
    }

    /// Reads `ACCORD_NODE_ID` and `ACCORD_NODES` (required) plus optional
    /// overrides. `ACCORD_NODES` is a comma list of `id@host:port` entries.
    pub fn from_env() -> anyhow::Result<Self> {
        let node_id = std::env::var("ACCORD_NODE_ID")
            .map_err(|_| anyhow::anyhow!("ACCORD_NODE_ID is not set"))?;
        let raw = std::env::var("ACCORD_NODES")
            .map_err(|_| anyhow::anyhow!("ACCORD_NODES is not set"))?;
        let nodes = parse_node_list(&raw)?;

        let mut config = Self::new(node_id, nodes);
        config.fault_tolerance = std::env::var("ACCORD_FAULT_TOLERANCE")
            .ok()
            .and_then(|v| v.parse().ok());
        if let Some(ms) = env_u64("ACCORD_TIMEOUT_MS") {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("ACCORD_ROUND_TIMEOUT_MS") {
            config.protocol_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("ACCORD_TICK_MS") {
            config.tick_interval = Duration::from_millis(ms);
        }
        config.enable_monitoring = std::env::var("ACCORD_MONITORING")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(true);
        Ok(config)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn parse_node_list(raw: &str) -> anyhow::Result<Vec<Node>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, address) = entry
                .split_once('@')
                .ok_or_else(|| anyhow::anyhow!("bad node entry {entry:?}, expected id@addr"))?;
            if id.is_empty() || address.is_empty() {
                anyhow::bail!("bad node entry {entry:?}, expected id@addr");
            }
            Ok(Node::new(id, address))
        })
        .collect()
}
