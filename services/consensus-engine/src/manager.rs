//! Client-facing orchestration. The manager owns the coordinator behind a
//! single-writer actor task: commands and inbound messages are serialized
//! through one mpsc channel, so phase transitions and quorum counting are
//! atomic with respect to concurrent arrival.
//!
//! The network transport stays external: broadcasts surface on the channel
//! returned by [`ConsensusManager::take_outbound`], and peer traffic is
//! injected with [`ConsensusManager::deliver`]. The actor also feeds every
//! broadcast back into its own coordinator so our votes count toward quorum.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use accord_core::{ClusterConfig, ConfigError, MessageAuthenticator};
use ed25519_dalek::{SigningKey, VerifyingKey};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::coordinator::{Coordinator, CoordinatorEvent, RejectReason, ViolationKind};
use crate::messages::{ConsensusMessage, Phase};
use crate::monitor::{ConsensusMetrics, ConsensusMonitor, HealthStatus, HealthSummary};
use crate::request::{NewRequest, Priority, Request, RequestKind};

const OUTBOUND_CAPACITY: usize = 1024;
const EVENT_CAPACITY: usize = 256;
/// Timed-out request ids remembered so a late commit is not re-reported.
const ABANDONED_RETENTION: usize = 1024;

/// Lifecycle events emitted on the broadcast channel and consumed by the
/// monitor.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    Submitted {
        request_id: String,
        kind: RequestKind,
        priority: Priority,
    },
    Committed {
        request_id: String,
        seq: u64,
        latency_ms: f64,
    },
    TimedOut {
        request_id: String,
    },
    Failed {
        request_id: String,
        reason: String,
    },
    ViewChanged {
        view: u64,
        leader: String,
    },
    Rejected {
        sender: String,
        reason: RejectReason,
    },
    Violation {
        node: String,
        kind: ViolationKind,
    },
    PeerObserved {
        node: String,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct MonitoringStatus {
    pub enabled: bool,
    pub active_alerts: usize,
    pub metrics: Option<ConsensusMetrics>,
}

/// Read-only snapshot of engine state; refreshed by the actor, never
/// computed from live protocol state on the caller's thread.
#[derive(Clone, Debug, Serialize)]
pub struct EngineStatus {
    pub node_id: String,
    pub view: u64,
    pub sequence: u64,
    pub last_committed: u64,
    pub phase: Phase,
    pub active_nodes: usize,
    pub fault_tolerance: usize,
    pub quorum_size: usize,
    pub pending_requests: usize,
    pub completed_requests: u64,
    pub health: HealthStatus,
    pub monitoring: MonitoringStatus,
}

enum Command {
    Submit {
        request: Request,
        reply: oneshot::Sender<bool>,
    },
    Deliver(ConsensusMessage),
    Abandon {
        request_id: String,
    },
    Shutdown,
}

pub struct ConsensusManager {
    cluster: Arc<ClusterConfig>,
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<EngineEvent>,
    status: Arc<RwLock<EngineStatus>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<ConsensusMessage>>>,
    monitor: Option<Arc<ConsensusMonitor>>,
    actor: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    request_timeout: Duration,
}

impl ConsensusManager {
    /// Builds the engine and spawns its actor. Configuration errors (node
    /// set not of the form `n = 3f + 1`, self missing from the cluster) are
    /// fatal here; nothing starts half-configured.
    pub fn new(
        config: EngineConfig,
        signing_key: SigningKey,
        keyring: HashMap<String, VerifyingKey>,
    ) -> Result<Self, ConfigError> {
        let cluster = Arc::new(ClusterConfig::new(
            config.nodes.clone(),
            &config.node_id,
            config.fault_tolerance,
        )?);
        let auth = Arc::new(MessageAuthenticator::new(
            config.node_id.clone(),
            signing_key,
            keyring,
        ));
        let coordinator = Coordinator::new(
            cluster.clone(),
            auth,
            config.protocol_timeout,
            config.vote_buffer_cap,
        );

        let monitor = config
            .enable_monitoring
            .then(|| Arc::new(ConsensusMonitor::new(config.monitor.clone(), cluster.clone())));

        let (cmd_tx, cmd_rx) = mpsc::channel(EVENT_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let status = Arc::new(RwLock::new(EngineStatus {
            node_id: config.node_id.clone(),
            view: 0,
            sequence: 0,
            last_committed: 0,
            phase: Phase::Idle,
            active_nodes: cluster.node_count(),
            fault_tolerance: cluster.fault_tolerance(),
            quorum_size: cluster.quorum_size(),
            pending_requests: 0,
            completed_requests: 0,
            health: HealthStatus::Unknown,
            monitoring: MonitoringStatus {
                enabled: monitor.is_some(),
                active_alerts: 0,
                metrics: None,
            },
        }));

        let actor = Actor {
            coordinator,
            cluster: cluster.clone(),
            ledger: PendingLedger::default(),
            completed: 0,
            cmd_rx,
            outbound_tx,
            events_tx: events_tx.clone(),
            status: status.clone(),
            monitor: monitor.clone(),
            tick_interval: config.tick_interval,
        };
        let handle = tokio::spawn(actor.run());
        info!(node = %config.node_id, nodes = cluster.node_count(), f = cluster.fault_tolerance(), "consensus engine started");

        Ok(Self {
            cluster,
            cmd_tx,
            events_tx,
            status,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            monitor,
            actor: Mutex::new(Some(handle)),
            shutting_down: AtomicBool::new(false),
            request_timeout: config.request_timeout,
        })
    }

    /// Submits a request and suspends until it commits, fails, or the
    /// manager timeout elapses.
    ///
    /// A `false` return after a timeout means the manager stopped waiting,
    /// not that the cluster rejected the value: the protocol may still
    /// commit the slot later. Re-submitting after `false` can therefore
    /// order the same payload twice; callers that care must deduplicate by
    /// request id.
    pub async fn submit_request(&self, new: NewRequest) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        let request = Request::from_new(new, self.cluster.self_id());
        let request_id = request.id.clone();
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Submit { request, reply })
            .await
            .is_err()
        {
            return false;
        }
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(committed)) => committed,
            Ok(Err(_)) => false, // actor gone
            Err(_) => {
                debug!(request_id = %request_id, "request timed out, abandoning");
                let _ = self.cmd_tx.send(Command::Abandon { request_id }).await;
                false
            }
        }
    }

    /// Injects a protocol message received from a peer.
    pub async fn deliver(&self, msg: ConsensusMessage) {
        let _ = self.cmd_tx.send(Command::Deliver(msg)).await;
    }

    /// Hands the outbound broadcast stream to the transport layer. Yields
    /// `Some` exactly once.
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<ConsensusMessage>> {
        self.outbound_rx.lock().take()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events_tx.subscribe()
    }

    pub fn monitor(&self) -> Option<&Arc<ConsensusMonitor>> {
        self.monitor.as_ref()
    }

    /// Cached snapshot; never touches live protocol state.
    pub fn status(&self) -> EngineStatus {
        self.status.read().clone()
    }

    pub fn health_summary(&self) -> HealthSummary {
        match &self.monitor {
            Some(monitor) => monitor.health_summary(),
            None => HealthSummary::unknown(self.cluster.as_ref()),
        }
    }

    pub fn generate_report(&self) -> String {
        let status = self.status();
        match &self.monitor {
            Some(monitor) => monitor.render_report(&status, self.cluster.as_ref()),
            None => format!(
                "=== accord consensus report ===\nnode: {}   view: {}   leader: {}\nsequence: {}   committed: {}   phase: {:?}\nmonitoring disabled\n",
                status.node_id,
                status.view,
                self.cluster.leader_of(status.view),
                status.sequence,
                status.last_committed,
                status.phase,
            ),
        }
    }

    /// Stops intake, fails in-flight submissions with a shutdown reason and
    /// joins the actor. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        let handle = self.actor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(node = %self.cluster.self_id(), "consensus engine stopped");
    }
}

struct PendingEntry {
    reply: oneshot::Sender<bool>,
    submitted: Instant,
}

/// Tracks in-flight submissions. A submission that times out is remembered
/// so a late commit of the same request is not reported as a second success.
#[derive(Default)]
struct PendingLedger {
    pending: HashMap<String, PendingEntry>,
    abandoned: HashSet<String>,
}

impl PendingLedger {
    fn track(&mut self, request_id: String, reply: oneshot::Sender<bool>, now: Instant) {
        self.pending.insert(
            request_id,
            PendingEntry {
                reply,
                submitted: now,
            },
        );
    }

    /// Drops the waiter after a timeout. Returns false when there is nothing
    /// to abandon (already committed, failed or abandoned).
    fn abandon(&mut self, request_id: &str) -> bool {
        if self.pending.remove(request_id).is_none() {
            return false;
        }
        if self.abandoned.len() >= ABANDONED_RETENTION {
            self.abandoned.clear();
        }
        self.abandoned.insert(request_id.to_string());
        true
    }

    /// Settles a commit. `None` means the submission was already reported as
    /// timed out and must not be counted again; otherwise the latency in
    /// milliseconds, zero for slots this node never tracked (remote
    /// submissions and fill requests).
    fn commit(&mut self, request_id: &str, now: Instant) -> Option<f64> {
        if let Some(entry) = self.pending.remove(request_id) {
            let latency = now.duration_since(entry.submitted).as_secs_f64() * 1000.0;
            let _ = entry.reply.send(true);
            Some(latency)
        } else if self.abandoned.remove(request_id) {
            None
        } else {
            Some(0.0)
        }
    }

    fn len(&self) -> usize {
        self.pending.len()
    }

    fn drain(&mut self) -> Vec<(String, oneshot::Sender<bool>)> {
        self.abandoned.clear();
        self.pending
            .drain()
            .map(|(id, entry)| (id, entry.reply))
            .collect()
    }
}

struct Actor {
    coordinator: Coordinator,
    cluster: Arc<ClusterConfig>,
    ledger: PendingLedger,
    completed: u64,
    cmd_rx: mpsc::Receiver<Command>,
    outbound_tx: mpsc::Sender<ConsensusMessage>,
    events_tx: broadcast::Sender<EngineEvent>,
    status: Arc<RwLock<EngineStatus>>,
    monitor: Option<Arc<ConsensusMonitor>>,
    tick_interval: Duration,
}

impl Actor {
    async fn run(mut self) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Submit { request, reply }) => self.on_submit(request, reply),
                        Some(Command::Deliver(msg)) => self.on_deliver(msg),
                        Some(Command::Abandon { request_id }) => self.on_abandon(request_id),
                        Some(Command::Shutdown) | None => break,
                    }
                }
                _ = interval.tick() => self.on_tick(),
            }
            self.refresh_status();
        }
        self.drain_on_shutdown();
    }

    fn on_submit(&mut self, request: Request, reply: oneshot::Sender<bool>) {
        let now = Instant::now();
        self.emit(EngineEvent::Submitted {
            request_id: request.id.clone(),
            kind: request.kind,
            priority: request.priority,
        });
        self.ledger.track(request.id.clone(), reply, now);
        let out = self.coordinator.start_request(request, now);
        self.pump(out, Vec::new(), now);
    }

    fn on_deliver(&mut self, msg: ConsensusMessage) {
        let now = Instant::now();
        let (out, events) = self.coordinator.handle_message(msg, now);
        self.pump(out, events, now);
    }

    fn on_abandon(&mut self, request_id: String) {
        if self.ledger.abandon(&request_id) {
            self.emit(EngineEvent::TimedOut { request_id });
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        let (out, events) = self.coordinator.on_tick(now);
        self.pump(out, events, now);
        if let Some(monitor) = &self.monitor {
            monitor.tick();
        }
    }

    /// Broadcasts outbound messages and loops them back through our own
    /// coordinator until the exchange quiesces locally.
    fn pump(
        &mut self,
        mut queue: Vec<ConsensusMessage>,
        mut events: Vec<CoordinatorEvent>,
        now: Instant,
    ) {
        loop {
            for event in events.drain(..) {
                self.on_coordinator_event(event, now);
            }
            let Some(msg) = queue.pop() else { break };
            if let Err(err) = self.outbound_tx.try_send(msg.clone()) {
                warn!(error = %err, "outbound channel saturated, dropping broadcast");
            }
            let (out, more) = self.coordinator.handle_message(msg, now);
            queue.extend(out);
            events.extend(more);
        }
    }

    fn on_coordinator_event(&mut self, event: CoordinatorEvent, now: Instant) {
        match event {
            CoordinatorEvent::Committed {
                seq, request_id, ..
            } => match self.ledger.commit(&request_id, now) {
                Some(latency_ms) => {
                    self.completed += 1;
                    self.emit(EngineEvent::Committed {
                        request_id,
                        seq,
                        latency_ms,
                    });
                }
                None => {
                    debug!(request_id = %request_id, seq, "commit after the timeout was already reported");
                }
            },
            CoordinatorEvent::ViewChanged { view, leader } => {
                self.emit(EngineEvent::ViewChanged { view, leader });
            }
            CoordinatorEvent::Violation { node, kind } => {
                self.emit(EngineEvent::Violation { node, kind });
            }
            CoordinatorEvent::Rejected { sender, reason } => {
                self.emit(EngineEvent::Rejected { sender, reason });
            }
            CoordinatorEvent::PeerObserved { node } => {
                self.emit(EngineEvent::PeerObserved { node });
            }
        }
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(monitor) = &self.monitor {
            monitor.handle_event(&event);
        }
        let _ = self.events_tx.send(event);
    }

    fn refresh_status(&self) {
        let (health, active_nodes, active_alerts, metrics) = match &self.monitor {
            Some(monitor) => {
                let summary = monitor.health_summary();
                (
                    summary.status,
                    summary.healthy_nodes,
                    summary.active_alerts,
                    Some(monitor.metrics()),
                )
            }
            None => (
                HealthStatus::Unknown,
                self.cluster.node_count(),
                0,
                None,
            ),
        };
        let mut status = self.status.write();
        status.view = self.coordinator.view();
        status.sequence = self.coordinator.sequence();
        status.last_committed = self.coordinator.last_committed();
        status.phase = self.coordinator.current_phase();
        status.active_nodes = active_nodes;
        status.pending_requests = self.ledger.len();
        status.completed_requests = self.completed;
        status.health = health;
        status.monitoring.active_alerts = active_alerts;
        status.monitoring.metrics = metrics;
    }

    fn drain_on_shutdown(&mut self) {
        for (request_id, reply) in self.ledger.drain() {
            let _ = reply.send(false);
            if let Some(monitor) = &self.monitor {
                monitor.handle_event(&EngineEvent::Failed {
                    request_id: request_id.clone(),
                    reason: "shutdown".into(),
                });
            }
            let _ = self.events_tx.send(EngineEvent::Failed {
                request_id,
                reason: "shutdown".into(),
            });
        }
        self.refresh_status();
        debug!("engine actor drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracked_commit_resolves_the_waiter() {
        let mut ledger = PendingLedger::default();
        let now = Instant::now();
        let (reply, mut rx) = oneshot::channel();
        ledger.track("r1".into(), reply, now);
        let latency = ledger.commit("r1", now + Duration::from_millis(40));
        assert!(latency.is_some_and(|ms| ms >= 40.0));
        assert_eq!(rx.try_recv().ok(), Some(true));
        assert_eq!(ledger.len(), 0);
    }

    #[test]
    fn late_commit_after_timeout_is_not_counted_again() {
        let mut ledger = PendingLedger::default();
        let now = Instant::now();
        let (reply, mut rx) = oneshot::channel();
        ledger.track("r1".into(), reply, now);

        assert!(ledger.abandon("r1"));
        assert!(!ledger.abandon("r1"), "second timeout reports nothing");
        // the waiter is gone without a success signal
        assert!(rx.try_recv().is_err());

        // the commit eventually lands, once: swallowed the first time,
        // treated as an ordinary remote commit if the id ever reappears
        assert_eq!(ledger.commit("r1", now), None);
        assert_eq!(ledger.commit("r1", now), Some(0.0));
    }

    #[test]
    fn untracked_commit_counts_with_zero_latency() {
        let mut ledger = PendingLedger::default();
        assert_eq!(ledger.commit("noop-1-4", Instant::now()), Some(0.0));
    }
}
