//! Health tracking over the engine's event stream. The monitor never touches
//! protocol state; it folds [`EngineEvent`]s into counters, per-node health
//! and a bounded alert list, and pushes notifications for dashboards.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use accord_core::ClusterConfig;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::manager::{EngineEvent, EngineStatus};

const NOTIFY_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Success rate below which the cluster is reported degraded.
    pub warn_success_rate: f64,
    /// Success rate below which an alert fires and health turns critical.
    pub critical_success_rate: f64,
    /// Protocol violations per node before that node is flagged.
    pub violation_limit: u32,
    /// Latency samples retained for the rolling average.
    pub latency_window: usize,
    /// Retained alerts; older ones are dropped first.
    pub max_alerts: usize,
    /// A peer unseen for this long is marked unhealthy.
    pub stale_after: Duration,
    /// Consecutive view changes without a commit before a stall alert.
    pub stall_view_changes: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            warn_success_rate: 0.95,
            critical_success_rate: 0.80,
            violation_limit: 3,
            latency_window: 256,
            max_alerts: 64,
            stale_after: Duration::from_secs(10),
            stall_view_changes: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Clone, Debug, Serialize)]
pub struct ConsensusAlert {
    pub id: String,
    pub severity: Severity,
    /// What raised the alert: a node id, "metrics", "cluster" or "protocol".
    pub source: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeHealth {
    pub node_id: String,
    pub healthy: bool,
    /// Seconds since the node was last heard from; `None` if never.
    pub last_seen_secs: Option<u64>,
    pub violations: u32,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ConsensusMetrics {
    pub total_requests: u64,
    pub committed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub view_changes: u64,
    pub rejections: u64,
    pub violations: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
    Unknown,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthSummary {
    pub status: HealthStatus,
    pub healthy_nodes: usize,
    pub total_nodes: usize,
    pub quorum_size: usize,
    pub success_rate: f64,
    pub active_alerts: usize,
}

impl HealthSummary {
    pub fn unknown(cluster: &ClusterConfig) -> Self {
        Self {
            status: HealthStatus::Unknown,
            healthy_nodes: cluster.node_count(),
            total_nodes: cluster.node_count(),
            quorum_size: cluster.quorum_size(),
            success_rate: 0.0,
            active_alerts: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub enum MonitorNotification {
    MetricsUpdated(ConsensusMetrics),
    AlertCreated(ConsensusAlert),
}

struct PeerState {
    last_seen: Option<Instant>,
    healthy: bool,
    violations: u32,
    flagged: bool,
}

struct MonitorState {
    metrics: ConsensusMetrics,
    latencies: VecDeque<f64>,
    peers: HashMap<String, PeerState>,
    alerts: VecDeque<ConsensusAlert>,
    consecutive_view_changes: u32,
    stall_alerted: bool,
    quorum_alerted: bool,
    warn_rate_alerted: bool,
    critical_rate_alerted: bool,
    seen_activity: bool,
}

pub struct ConsensusMonitor {
    cfg: MonitorConfig,
    cluster: Arc<ClusterConfig>,
    inner: RwLock<MonitorState>,
    notify_tx: broadcast::Sender<MonitorNotification>,
}

impl ConsensusMonitor {
    pub fn new(cfg: MonitorConfig, cluster: Arc<ClusterConfig>) -> Self {
        let peers = cluster
            .nodes()
            .iter()
            .map(|node| {
                (
                    node.id.clone(),
                    PeerState {
                        last_seen: None,
                        // everyone starts healthy until staleness proves otherwise
                        healthy: true,
                        violations: 0,
                        flagged: false,
                    },
                )
            })
            .collect();
        let (notify_tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            cfg,
            cluster,
            inner: RwLock::new(MonitorState {
                metrics: ConsensusMetrics::default(),
                latencies: VecDeque::new(),
                peers,
                alerts: VecDeque::new(),
                consecutive_view_changes: 0,
                stall_alerted: false,
                quorum_alerted: false,
                warn_rate_alerted: false,
                critical_rate_alerted: false,
                seen_activity: false,
            }),
            notify_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorNotification> {
        self.notify_tx.subscribe()
    }

    pub fn handle_event(&self, event: &EngineEvent) {
        let mut state = self.inner.write();
        state.seen_activity = true;
        match event {
            EngineEvent::Submitted { .. } => {
                state.metrics.total_requests += 1;
            }
            EngineEvent::Committed { latency_ms, .. } => {
                state.metrics.committed += 1;
                state.consecutive_view_changes = 0;
                state.stall_alerted = false;
                if state.latencies.len() >= self.cfg.latency_window {
                    state.latencies.pop_front();
                }
                state.latencies.push_back(*latency_ms);
                self.refresh_rates(&mut state);
            }
            EngineEvent::TimedOut { request_id } => {
                state.metrics.timed_out += 1;
                warn!(request_id = %request_id, "request timed out before commit");
                self.refresh_rates(&mut state);
            }
            EngineEvent::Failed { request_id, reason } => {
                state.metrics.failed += 1;
                warn!(request_id = %request_id, reason = %reason, "request failed");
                self.refresh_rates(&mut state);
            }
            EngineEvent::ViewChanged { view, leader } => {
                state.metrics.view_changes += 1;
                state.consecutive_view_changes += 1;
                if state.consecutive_view_changes >= self.cfg.stall_view_changes
                    && !state.stall_alerted
                {
                    state.stall_alerted = true;
                    self.raise(
                        &mut state,
                        Severity::Warning,
                        "protocol",
                        format!(
                            "{} consecutive view changes without a commit (now view {view}, leader {leader})",
                            self.cfg.stall_view_changes
                        ),
                    );
                }
            }
            EngineEvent::Rejected { .. } => {
                state.metrics.rejections += 1;
            }
            EngineEvent::Violation { node, kind } => {
                state.metrics.violations += 1;
                let mut newly_flagged = None;
                if let Some(peer) = state.peers.get_mut(node.as_str()) {
                    peer.violations += 1;
                    if peer.violations >= self.cfg.violation_limit && !peer.flagged {
                        peer.flagged = true;
                        peer.healthy = false;
                        newly_flagged = Some(peer.violations);
                    }
                }
                if let Some(violations) = newly_flagged {
                    self.raise(
                        &mut state,
                        Severity::Critical,
                        node,
                        format!("node {node} exceeded violation limit ({violations} violations, last: {kind:?})"),
                    );
                }
            }
            EngineEvent::PeerObserved { node } => {
                if let Some(peer) = state.peers.get_mut(node.as_str()) {
                    peer.last_seen = Some(Instant::now());
                    // a flagged node stays unhealthy no matter how chatty it is
                    peer.healthy = !peer.flagged;
                }
            }
        }
        let metrics = state.metrics.clone();
        drop(state);
        let _ = self
            .notify_tx
            .send(MonitorNotification::MetricsUpdated(metrics));
    }

    /// Periodic sweep: marks peers stale and checks the healthy count
    /// against the quorum size. The local node counts as seen.
    pub fn tick(&self) {
        let now = Instant::now();
        let mut state = self.inner.write();
        if !state.seen_activity {
            return;
        }
        let self_id = self.cluster.self_id().to_string();
        if let Some(me) = state.peers.get_mut(self_id.as_str()) {
            me.last_seen = Some(now);
            me.healthy = true;
        }
        for (node_id, peer) in state.peers.iter_mut() {
            let stale = match peer.last_seen {
                Some(seen) => now.duration_since(seen) > self.cfg.stale_after,
                None => true,
            };
            if stale && peer.healthy {
                peer.healthy = false;
                warn!(node = %node_id, "peer went stale");
            }
        }
        let healthy = state.peers.values().filter(|p| p.healthy).count();
        if healthy < self.cluster.quorum_size() {
            if !state.quorum_alerted {
                state.quorum_alerted = true;
                self.raise(
                    &mut state,
                    Severity::Critical,
                    "cluster",
                    format!(
                        "only {healthy}/{} nodes healthy, below quorum of {}",
                        self.cluster.node_count(),
                        self.cluster.quorum_size()
                    ),
                );
            }
        } else {
            state.quorum_alerted = false;
        }
    }

    pub fn metrics(&self) -> ConsensusMetrics {
        self.inner.read().metrics.clone()
    }

    pub fn node_health(&self) -> Vec<NodeHealth> {
        let now = Instant::now();
        let state = self.inner.read();
        let mut out: Vec<NodeHealth> = state
            .peers
            .iter()
            .map(|(node_id, peer)| NodeHealth {
                node_id: node_id.clone(),
                healthy: peer.healthy,
                last_seen_secs: peer.last_seen.map(|seen| now.duration_since(seen).as_secs()),
                violations: peer.violations,
            })
            .collect();
        out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        out
    }

    pub fn alerts(&self) -> Vec<ConsensusAlert> {
        self.inner.read().alerts.iter().cloned().collect()
    }

    pub fn clear_alerts(&self) {
        self.inner.write().alerts.clear();
    }

    pub fn health_summary(&self) -> HealthSummary {
        let state = self.inner.read();
        let healthy = state.peers.values().filter(|p| p.healthy).count();
        let rate = state.metrics.success_rate;
        let finished = state.metrics.committed + state.metrics.failed + state.metrics.timed_out;
        let status = if !state.seen_activity {
            HealthStatus::Unknown
        } else if healthy < self.cluster.quorum_size()
            || (finished > 0 && rate < self.cfg.critical_success_rate)
        {
            HealthStatus::Critical
        } else if healthy < self.cluster.node_count()
            || (finished > 0 && rate < self.cfg.warn_success_rate)
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        HealthSummary {
            status,
            healthy_nodes: healthy,
            total_nodes: self.cluster.node_count(),
            quorum_size: self.cluster.quorum_size(),
            success_rate: rate,
            active_alerts: state.alerts.len(),
        }
    }

    /// Plain-text operator report.
    pub fn render_report(&self, status: &EngineStatus, cluster: &ClusterConfig) -> String {
        let state = self.inner.read();
        let mut out = String::new();
        out.push_str("=== accord consensus report ===\n");
        out.push_str(&format!(
            "node: {}   view: {}   leader: {}\n",
            status.node_id,
            status.view,
            cluster.leader_of(status.view)
        ));
        out.push_str(&format!(
            "sequence: {}   committed: {}   phase: {:?}\n",
            status.sequence, status.last_committed, status.phase
        ));
        let m = &state.metrics;
        if m.total_requests == 0 {
            out.push_str("requests: no data yet\n");
        } else {
            out.push_str(&format!(
                "requests: {} total, {} committed, {} failed, {} timed out ({:.1}% success)\n",
                m.total_requests,
                m.committed,
                m.failed,
                m.timed_out,
                m.success_rate * 100.0
            ));
        }
        if state.latencies.is_empty() {
            out.push_str("latency: no data yet\n");
        } else {
            out.push_str(&format!(
                "latency: {:.1} ms avg, {:.1} ms p95\n",
                m.avg_latency_ms, m.p95_latency_ms
            ));
        }
        out.push_str(&format!(
            "view changes: {}   rejections: {}   violations: {}\n",
            m.view_changes, m.rejections, m.violations
        ));
        out.push_str("nodes:\n");
        let mut ids: Vec<&String> = state.peers.keys().collect();
        ids.sort();
        for id in ids {
            if let Some(peer) = state.peers.get(id) {
                out.push_str(&format!(
                    "  {id}: {}{}\n",
                    if peer.healthy { "healthy" } else { "stale" },
                    if peer.violations > 0 {
                        format!(" ({} violations)", peer.violations)
                    } else {
                        String::new()
                    }
                ));
            }
        }
        if state.alerts.is_empty() {
            out.push_str("alerts: none\n");
        } else {
            out.push_str(&format!("alerts ({}):\n", state.alerts.len()));
            for alert in &state.alerts {
                out.push_str(&format!(
                    "  [{:?}] {} ({})\n",
                    alert.severity,
                    alert.message,
                    alert.created_at.format("%H:%M:%S")
                ));
            }
        }
        out
    }

    fn refresh_rates(&self, state: &mut MonitorState) {
        let finished = state.metrics.committed + state.metrics.failed + state.metrics.timed_out;
        state.metrics.success_rate = if finished == 0 {
            0.0
        } else {
            state.metrics.committed as f64 / finished as f64
        };
        if state.latencies.is_empty() {
            state.metrics.avg_latency_ms = 0.0;
            state.metrics.p95_latency_ms = 0.0;
        } else {
            state.metrics.avg_latency_ms =
                state.latencies.iter().sum::<f64>() / state.latencies.len() as f64;
            let mut sorted: Vec<f64> = state.latencies.iter().copied().collect();
            sorted.sort_by(|a, b| a.total_cmp(b));
            let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
            state.metrics.p95_latency_ms = sorted[rank.saturating_sub(1)];
        }
        let rate = state.metrics.success_rate;
        if finished >= 3 {
            if rate < self.cfg.critical_success_rate && !state.critical_rate_alerted {
                state.critical_rate_alerted = true;
                state.warn_rate_alerted = true;
                self.raise(
                    state,
                    Severity::Critical,
                    "metrics",
                    format!("success rate dropped to {:.1}%", rate * 100.0),
                );
            } else if rate < self.cfg.warn_success_rate && !state.warn_rate_alerted {
                state.warn_rate_alerted = true;
                self.raise(
                    state,
                    Severity::Warning,
                    "metrics",
                    format!("success rate below target at {:.1}%", rate * 100.0),
                );
            }
        }
        if rate >= self.cfg.warn_success_rate {
            state.warn_rate_alerted = false;
            state.critical_rate_alerted = false;
        }
    }

    fn raise(&self, state: &mut MonitorState, severity: Severity, source: &str, message: String) {
        warn!(severity = ?severity, source = %source, alert = %message, "consensus alert");
        let alert = ConsensusAlert {
            id: Uuid::new_v4().to_string(),
            severity,
            source: source.to_string(),
            message,
            created_at: Utc::now(),
        };
        if state.alerts.len() >= self.cfg.max_alerts {
            state.alerts.pop_front();
        }
        state.alerts.push_back(alert.clone());
        let _ = self.notify_tx.send(MonitorNotification::AlertCreated(alert));
    }
}
