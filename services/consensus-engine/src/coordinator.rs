//! The pBFT coordinator: a single-writer state machine owned by the engine
//! actor. All methods take `&mut self` and return the messages to broadcast
//! plus the events that occurred; the caller is responsible for delivering
//! our own broadcasts back into `handle_message` so our votes count toward
//! quorum like everyone else's.
//!
//! Phases per slot: Idle -> PrePrepared -> Prepared -> Committed, with the
//! view-change path able to interrupt any of them. Committed slots are
//! reported strictly in sequence order; a slot that gathers its commit
//! quorum early is held until its predecessors land.
//!
//! Timing is externalized: `on_tick` receives `Instant`s from the caller,
//! so tests drive the protocol with a synthetic clock.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use accord_core::auth::{short_hex, Digest};
use accord_core::{ClusterConfig, MessageAuthenticator};
use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Meter};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::messages::{
    sign_message, unsigned, verify_message, ConsensusMessage, Phase, PreparedProof,
};
use crate::request::Request;

/// Committed digests retained below the watermark for duplicate detection.
const COMMITTED_RETENTION: usize = 128;

static METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("accord_consensus"));

struct ProtocolCounters {
    messages_total: Counter<u64>,
    rejected_total: Counter<u64>,
    view_changes_total: Counter<u64>,
    commits_total: Counter<u64>,
}

static COUNTERS: Lazy<ProtocolCounters> = Lazy::new(|| ProtocolCounters {
    messages_total: METER
        .u64_counter("accord_messages_total")
        .with_description("Protocol messages processed")
        .build(),
    rejected_total: METER
        .u64_counter("accord_rejected_total")
        .with_description("Messages rejected (invalid, stale or conflicting)")
        .build(),
    view_changes_total: METER
        .u64_counter("accord_view_changes_total")
        .with_description("Adopted view changes")
        .build(),
    commits_total: METER
        .u64_counter("accord_commits_total")
        .with_description("Committed sequence numbers")
        .build(),
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Two PRE_PREPAREs with different digests for the same slot.
    ConflictingPrePrepare,
    /// A vote whose digest contradicts the slot's assigned digest.
    ConflictingVote,
    /// A PRE_PREPARE from a node that is not the leader of its view.
    LeaderImpersonation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    BadSignature,
    WrongView,
    StaleView,
    NotLeader,
    ConflictingDigest,
    AlreadyCommitted,
    BadCertificate,
}

#[derive(Clone, Debug)]
pub enum CoordinatorEvent {
    Committed {
        seq: u64,
        digest: Digest,
        request_id: String,
    },
    ViewChanged {
        view: u64,
        leader: String,
    },
    Violation {
        node: String,
        kind: ViolationKind,
    },
    Rejected {
        sender: String,
        reason: RejectReason,
    },
    /// A correctly signed message arrived from this node; the monitor uses
    /// it as a liveness signal. Forged traffic never produces one.
    PeerObserved {
        node: String,
    },
}

#[derive(Debug)]
struct Slot {
    view: u64,
    seq: u64,
    digest: Digest,
    request_id: String,
    phase: Phase,
    prepares: HashSet<String>,
    commits: HashSet<String>,
    deadline: Instant,
}

pub struct Coordinator {
    cluster: Arc<ClusterConfig>,
    auth: Arc<MessageAuthenticator>,
    timeout: Duration,
    vote_buffer_cap: usize,

    view: u64,
    next_seq: u64,
    last_committed: u64,
    slots: BTreeMap<u64, Slot>,
    committed: BTreeMap<u64, (Digest, String)>,
    /// Slots we prepared in an earlier view; a new leader must not assign
    /// them a different digest.
    locked: HashMap<u64, Digest>,
    /// Locally submitted requests not yet committed anywhere.
    outstanding: Vec<Request>,
    /// Votes that arrived before their PRE_PREPARE, bounded with
    /// oldest-first eviction.
    vote_buffer: VecDeque<ConsensusMessage>,
    view_change_votes: BTreeMap<u64, HashMap<String, ConsensusMessage>>,
    highest_view_change_sent: Option<u64>,
    view_change_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,
}

impl Coordinator {
    pub fn new(
        cluster: Arc<ClusterConfig>,
        auth: Arc<MessageAuthenticator>,
        timeout: Duration,
        vote_buffer_cap: usize,
    ) -> Self {
        Self {
            cluster,
            auth,
            timeout,
            vote_buffer_cap,
            view: 0,
            next_seq: 1,
            last_committed: 0,
            slots: BTreeMap::new(),
            committed: BTreeMap::new(),
            locked: HashMap::new(),
            outstanding: Vec::new(),
            vote_buffer: VecDeque::new(),
            view_change_votes: BTreeMap::new(),
            highest_view_change_sent: None,
            view_change_deadline: None,
            idle_deadline: None,
        }
    }

    pub fn view(&self) -> u64 {
        self.view
    }

    pub fn last_committed(&self) -> u64 {
        self.last_committed
    }

    /// Highest sequence number assigned so far.
    pub fn sequence(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Phase of the lowest in-flight slot, `Idle` when nothing is in flight.
    pub fn current_phase(&self) -> Phase {
        self.slots
            .values()
            .find(|s| s.phase < Phase::Committed)
            .map(|s| s.phase)
            .unwrap_or(Phase::Idle)
    }

    /// Slots prepared but not yet committed, carried through view changes.
    fn prepared_proofs(&self) -> Vec<PreparedProof> {
        self.slots
            .values()
            .filter(|s| s.phase >= Phase::Prepared && s.seq > self.last_committed)
            .map(|s| PreparedProof {
                view: s.view,
                seq: s.seq,
                digest: s.digest,
                request_id: s.request_id.clone(),
            })
            .collect()
    }

    /// Accepts a request from the manager. When we lead the current view the
    /// request is proposed immediately; otherwise it is relayed to the whole
    /// cluster so every replica arms its no-progress timer, and view changes
    /// keep firing until some leader orders it.
    pub fn start_request(&mut self, request: Request, now: Instant) -> Vec<ConsensusMessage> {
        self.outstanding.push(request.clone());
        if self.cluster.is_leader(self.view) {
            vec![self.propose(&request)]
        } else {
            if self.idle_deadline.is_none() {
                self.idle_deadline = Some(now + self.timeout);
            }
            debug!(request_id = %request.id, view = self.view, "relaying request to the cluster");
            let mut msg = ConsensusMessage::Forward {
                view: self.view,
                request,
                sender: self.cluster.self_id().to_string(),
                signature: unsigned(),
            };
            sign_message(&self.auth, &mut msg);
            vec![msg]
        }
    }

    fn propose(&mut self, request: &Request) -> ConsensusMessage {
        let seq = self.next_seq;
        self.next_seq += 1;
        let mut msg = ConsensusMessage::PrePrepare {
            view: self.view,
            seq,
            digest: request.digest(),
            request_id: request.id.clone(),
            sender: self.cluster.self_id().to_string(),
            signature: unsigned(),
        };
        sign_message(&self.auth, &mut msg);
        info!(seq, view = self.view, request_id = %request.id, "proposing request");
        msg
    }

    /// Processes one inbound protocol message. Invalid messages are dropped
    /// (reported through a `Rejected` event), never propagated as errors.
    #[instrument(skip_all, fields(phase = msg.phase_name(), sender = %msg.sender(), view = msg.view()))]
    pub fn handle_message(
        &mut self,
        msg: ConsensusMessage,
        now: Instant,
    ) -> (Vec<ConsensusMessage>, Vec<CoordinatorEvent>) {
        COUNTERS.messages_total.add(1, &[]);
        let mut out = Vec::new();
        let mut events = Vec::new();

        if !verify_message(&self.auth, &msg) {
            self.reject(&mut events, msg.sender(), RejectReason::BadSignature);
            return (out, events);
        }
        events.push(CoordinatorEvent::PeerObserved {
            node: msg.sender().to_string(),
        });
        self.dispatch(msg, now, &mut out, &mut events);
        (out, events)
    }

    /// Fires due timers: per-slot deadlines and the pending-work idle
    /// deadline trigger VIEW_CHANGE votes; a view change that itself stalls
    /// escalates to the next view.
    pub fn on_tick(&mut self, now: Instant) -> (Vec<ConsensusMessage>, Vec<CoordinatorEvent>) {
        let mut out = Vec::new();
        let events = Vec::new();

        let slot_overdue = self
            .slots
            .values()
            .any(|s| s.phase < Phase::Committed && s.deadline <= now);
        let idle_overdue =
            !self.outstanding.is_empty() && self.idle_deadline.is_some_and(|d| d <= now);

        let target = match self.highest_view_change_sent {
            // A view change we voted for has not completed: escalate.
            Some(v) if v > self.view => self
                .view_change_deadline
                .is_some_and(|d| d <= now)
                .then_some(v + 1),
            _ => (slot_overdue || idle_overdue).then_some(self.view + 1),
        };

        if let Some(new_view) = target {
            out.push(self.make_view_change(new_view, now));
        }
        (out, events)
    }

    fn make_view_change(&mut self, new_view: u64, now: Instant) -> ConsensusMessage {
        self.highest_view_change_sent = Some(new_view);
        self.view_change_deadline = Some(now + self.timeout);
        self.idle_deadline = Some(now + self.timeout);
        for slot in self.slots.values_mut() {
            slot.deadline = now + self.timeout;
        }
        let mut msg = ConsensusMessage::ViewChange {
            new_view,
            last_committed: self.last_committed,
            prepared: self.prepared_proofs(),
            sender: self.cluster.self_id().to_string(),
            signature: unsigned(),
        };
        sign_message(&self.auth, &mut msg);
        warn!(
            new_view,
            view = self.view,
            last_committed = self.last_committed,
            "timeout, voting for view change"
        );
        msg
    }

    fn reject(&self, events: &mut Vec<CoordinatorEvent>, sender: &str, reason: RejectReason) {
        COUNTERS.rejected_total.add(1, &[]);
        debug!(sender = %sender, reason = ?reason, "message rejected");
        events.push(CoordinatorEvent::Rejected {
            sender: sender.to_string(),
            reason,
        });
    }

    fn violation(&self, events: &mut Vec<CoordinatorEvent>, node: &str, kind: ViolationKind) {
        warn!(node = %node, kind = ?kind, "protocol violation detected");
        events.push(CoordinatorEvent::Violation {
            node: node.to_string(),
            kind,
        });
    }

    fn dispatch(
        &mut self,
        msg: ConsensusMessage,
        now: Instant,
        out: &mut Vec<ConsensusMessage>,
        events: &mut Vec<CoordinatorEvent>,
    ) {
        match msg {
            ConsensusMessage::PrePrepare {
                view,
                seq,
                digest,
                request_id,
                sender,
                ..
            } => self.on_pre_prepare(view, seq, digest, request_id, sender, now, out, events),
            ConsensusMessage::Prepare { .. } | ConsensusMessage::Commit { .. } => {
                self.on_vote(msg, now, out, events)
            }
            ConsensusMessage::ViewChange { .. } => self.on_view_change(msg, now, out, events),
            ConsensusMessage::NewView {
                view,
                view_changes,
                sender,
                ..
            } => self.on_new_view(view, view_changes, sender, now, events),
            ConsensusMessage::Forward {
                request, sender, ..
            } => self.on_forward(request, sender, now, out),
        }
    }

    /// A peer relayed a client request. The leader orders it right away;
    /// everyone else remembers it and starts the no-progress timer, so a
    /// leader that ignores the request gets voted out by the full cluster.
    fn on_forward(
        &mut self,
        request: Request,
        sender: String,
        now: Instant,
        out: &mut Vec<ConsensusMessage>,
    ) {
        if self.is_request_known(&request.id) {
            debug!(request_id = %request.id, sender = %sender, "forwarded request already known");
            return;
        }
        debug!(request_id = %request.id, sender = %sender, "accepted forwarded request");
        self.outstanding.push(request.clone());
        if self.cluster.is_leader(self.view) {
            out.push(self.propose(&request));
        } else if self.idle_deadline.is_none() {
            self.idle_deadline = Some(now + self.timeout);
        }
    }

    fn is_request_known(&self, request_id: &str) -> bool {
        self.outstanding.iter().any(|r| r.id == request_id)
            || self.slots.values().any(|s| s.request_id == request_id)
            || self.committed.values().any(|(_, id)| id == request_id)
    }

    #[allow(clippy::too_many_arguments)]
    fn on_pre_prepare(
        &mut self,
        view: u64,
        seq: u64,
        digest: Digest,
        request_id: String,
        sender: String,
        now: Instant,
        out: &mut Vec<ConsensusMessage>,
        events: &mut Vec<CoordinatorEvent>,
    ) {
        if view != self.view {
            self.reject(events, &sender, RejectReason::WrongView);
            return;
        }
        if sender != self.cluster.leader_of(view) {
            self.violation(events, &sender, ViolationKind::LeaderImpersonation);
            self.reject(events, &sender, RejectReason::NotLeader);
            return;
        }
        if seq <= self.last_committed || self.committed.contains_key(&seq) {
            self.reject(events, &sender, RejectReason::AlreadyCommitted);
            return;
        }
        if let Some(lock) = self.locked.get(&seq) {
            if *lock != digest {
                // A value we prepared must survive leader rotation.
                self.violation(events, &sender, ViolationKind::ConflictingPrePrepare);
                self.reject(events, &sender, RejectReason::ConflictingDigest);
                return;
            }
        }
        match self.slots.get(&seq) {
            Some(slot) if slot.digest != digest => {
                self.violation(events, &sender, ViolationKind::ConflictingPrePrepare);
                self.reject(events, &sender, RejectReason::ConflictingDigest);
                return;
            }
            Some(_) => {
                debug!(seq, view, "duplicate PRE_PREPARE ignored");
                return;
            }
            None => {}
        }

        self.slots.insert(
            seq,
            Slot {
                view,
                seq,
                digest,
                request_id,
                phase: Phase::PrePrepared,
                prepares: HashSet::new(),
                commits: HashSet::new(),
                deadline: now + self.timeout,
            },
        );
        self.next_seq = self.next_seq.max(seq + 1);
        debug!(seq, view, digest = %short_hex(&digest), "accepted PRE_PREPARE");

        let mut prepare = ConsensusMessage::Prepare {
            view,
            seq,
            digest,
            sender: self.cluster.self_id().to_string(),
            signature: unsigned(),
        };
        sign_message(&self.auth, &mut prepare);
        out.push(prepare);

        self.replay_buffered(view, seq, now, out, events);
    }

    /// Re-evaluates votes that were buffered ahead of this PRE_PREPARE.
    fn replay_buffered(
        &mut self,
        view: u64,
        seq: u64,
        now: Instant,
        out: &mut Vec<ConsensusMessage>,
        events: &mut Vec<CoordinatorEvent>,
    ) {
        let matches = |m: &ConsensusMessage| match m {
            ConsensusMessage::Prepare { view: v, seq: s, .. }
            | ConsensusMessage::Commit { view: v, seq: s, .. } => *v == view && *s == seq,
            _ => false,
        };
        let mut replay = Vec::new();
        self.vote_buffer.retain(|m| {
            if matches(m) {
                replay.push(m.clone());
                false
            } else {
                true
            }
        });
        for msg in replay {
            // already signature-checked before buffering
            self.on_vote(msg, now, out, events);
        }
    }

    fn on_vote(
        &mut self,
        msg: ConsensusMessage,
        now: Instant,
        out: &mut Vec<ConsensusMessage>,
        events: &mut Vec<CoordinatorEvent>,
    ) {
        let (view, seq, digest, sender, is_commit) = match &msg {
            ConsensusMessage::Prepare {
                view,
                seq,
                digest,
                sender,
                ..
            } => (*view, *seq, *digest, sender.clone(), false),
            ConsensusMessage::Commit {
                view,
                seq,
                digest,
                sender,
                ..
            } => (*view, *seq, *digest, sender.clone(), true),
            _ => return,
        };

        if view != self.view {
            self.reject(events, &sender, RejectReason::WrongView);
            return;
        }
        if seq <= self.last_committed || self.committed.contains_key(&seq) {
            self.reject(events, &sender, RejectReason::AlreadyCommitted);
            return;
        }
        let Some(slot) = self.slots.get_mut(&seq) else {
            // PREPARE/COMMIT can outrun their PRE_PREPARE over the network.
            if self.vote_buffer.len() >= self.vote_buffer_cap {
                let evicted = self.vote_buffer.pop_front();
                warn!(
                    evicted = evicted.map(|m| m.phase_name()),
                    "vote buffer full, evicting oldest"
                );
            }
            self.vote_buffer.push_back(msg);
            return;
        };
        if slot.digest != digest {
            self.violation(events, &sender, ViolationKind::ConflictingVote);
            self.reject(events, &sender, RejectReason::ConflictingDigest);
            return;
        }

        let quorum = self.cluster.quorum_size();
        if is_commit {
            if !slot.commits.insert(sender.clone()) {
                debug!(seq, sender = %sender, "duplicate COMMIT ignored");
                return;
            }
        } else {
            if !slot.prepares.insert(sender.clone()) {
                debug!(seq, sender = %sender, "duplicate PREPARE ignored");
                return;
            }
            if slot.phase == Phase::PrePrepared && slot.prepares.len() >= quorum {
                slot.phase = Phase::Prepared;
                debug!(seq, view, "prepare quorum reached");
                let mut commit = ConsensusMessage::Commit {
                    view,
                    seq,
                    digest,
                    sender: self.cluster.self_id().to_string(),
                    signature: unsigned(),
                };
                sign_message(&self.auth, &mut commit);
                out.push(commit);
            }
        }
        self.try_finalize(seq, now, events);
    }

    /// Marks a slot committed once it is prepared with a commit quorum, then
    /// advances the watermark, reporting slots strictly in sequence order.
    fn try_finalize(&mut self, seq: u64, _now: Instant, events: &mut Vec<CoordinatorEvent>) {
        let quorum = self.cluster.quorum_size();
        if let Some(slot) = self.slots.get_mut(&seq) {
            if slot.phase == Phase::Prepared && slot.commits.len() >= quorum {
                slot.phase = Phase::Committed;
                debug!(seq, "commit quorum reached");
            }
        }
        while let Some(slot) = self.slots.get(&(self.last_committed + 1)) {
            if slot.phase != Phase::Committed {
                break;
            }
            let slot = self
                .slots
                .remove(&(self.last_committed + 1))
                .expect("slot present");
            self.last_committed = slot.seq;
            self.committed
                .insert(slot.seq, (slot.digest, slot.request_id.clone()));
            self.locked.remove(&slot.seq);
            self.outstanding.retain(|r| r.id != slot.request_id);
            COUNTERS.commits_total.add(1, &[]);
            info!(seq = slot.seq, view = self.view, request_id = %slot.request_id, digest = %short_hex(&slot.digest), "commit finalized");
            events.push(CoordinatorEvent::Committed {
                seq: slot.seq,
                digest: slot.digest,
                request_id: slot.request_id,
            });
        }
        while self.committed.len() > COMMITTED_RETENTION {
            self.committed.pop_first();
        }
        if self.slots.is_empty() && self.outstanding.is_empty() {
            self.idle_deadline = None;
        }
    }

    fn on_view_change(
        &mut self,
        msg: ConsensusMessage,
        now: Instant,
        out: &mut Vec<ConsensusMessage>,
        events: &mut Vec<CoordinatorEvent>,
    ) {
        let (new_view, sender) = match &msg {
            ConsensusMessage::ViewChange {
                new_view, sender, ..
            } => (*new_view, sender.clone()),
            _ => return,
        };
        if new_view <= self.view {
            self.reject(events, &sender, RejectReason::StaleView);
            return;
        }
        let votes = self.view_change_votes.entry(new_view).or_default();
        if votes.contains_key(&sender) {
            debug!(new_view, sender = %sender, "duplicate VIEW_CHANGE ignored");
            return;
        }
        votes.insert(sender.clone(), msg);
        let vote_count = votes.len();
        info!(new_view, votes = vote_count, sender = %sender, "view change vote recorded");

        // Liveness echo: once f + 1 nodes want this view, join them even if
        // our own timers have not fired yet.
        let echo_threshold = self.cluster.fault_tolerance() + 1;
        if vote_count >= echo_threshold
            && self.highest_view_change_sent.map_or(true, |v| v < new_view)
        {
            out.push(self.make_view_change(new_view, now));
        }

        if self
            .view_change_votes
            .get(&new_view)
            .map(|v| v.len())
            .unwrap_or(0)
            >= self.cluster.quorum_size()
        {
            self.adopt_view(new_view, now, out, events);
        }
    }

    /// Enters `new_view` after observing a quorum of VIEW_CHANGE votes. The
    /// new leader broadcasts the NEW_VIEW certificate, re-issues PRE_PREPARE
    /// for every carried-forward prepared value under its original sequence
    /// number, and proposes whatever it still has pending.
    fn adopt_view(
        &mut self,
        new_view: u64,
        now: Instant,
        out: &mut Vec<ConsensusMessage>,
        events: &mut Vec<CoordinatorEvent>,
    ) {
        let votes = self.view_change_votes.remove(&new_view).unwrap_or_default();

        // Highest-view prepared value per sequence number from the quorum.
        let mut carried: BTreeMap<u64, PreparedProof> = BTreeMap::new();
        for vc in votes.values() {
            if let ConsensusMessage::ViewChange { prepared, .. } = vc {
                for proof in prepared {
                    if proof.seq <= self.last_committed {
                        continue;
                    }
                    match carried.get(&proof.seq) {
                        Some(existing) if existing.view >= proof.view => {}
                        _ => {
                            carried.insert(proof.seq, proof.clone());
                        }
                    }
                }
            }
        }

        self.enter_view(new_view, &mut carried, events);

        if self.cluster.is_leader(new_view) {
            let mut new_view_msg = ConsensusMessage::NewView {
                view: new_view,
                view_changes: votes.into_values().collect(),
                sender: self.cluster.self_id().to_string(),
                signature: unsigned(),
            };
            sign_message(&self.auth, &mut new_view_msg);
            out.push(new_view_msg);

            let carried_ids: HashSet<String> =
                carried.values().map(|p| p.request_id.clone()).collect();
            for proof in carried.values() {
                self.next_seq = self.next_seq.max(proof.seq + 1);
                let mut msg = ConsensusMessage::PrePrepare {
                    view: new_view,
                    seq: proof.seq,
                    digest: proof.digest,
                    request_id: proof.request_id.clone(),
                    sender: self.cluster.self_id().to_string(),
                    signature: unsigned(),
                };
                sign_message(&self.auth, &mut msg);
                info!(seq = proof.seq, new_view, "re-issuing carried prepared value");
                out.push(msg);
            }
            // Sequence numbers the old leader assigned but never revealed
            // would block the ordered watermark forever; fill them with
            // no-op requests so commits above them can be reported.
            let highest_assigned = self
                .slots
                .keys()
                .chain(carried.keys())
                .max()
                .copied()
                .unwrap_or(self.last_committed);
            for seq in (self.last_committed + 1)..highest_assigned {
                if self.slots.contains_key(&seq) || carried.contains_key(&seq) {
                    continue;
                }
                let fill = Request::noop(new_view, seq, self.cluster.self_id());
                let mut msg = ConsensusMessage::PrePrepare {
                    view: new_view,
                    seq,
                    digest: fill.digest(),
                    request_id: fill.id.clone(),
                    sender: self.cluster.self_id().to_string(),
                    signature: unsigned(),
                };
                sign_message(&self.auth, &mut msg);
                info!(seq, new_view, "filling sequence gap with a no-op");
                out.push(msg);
            }
            let fresh: Vec<Request> = self
                .outstanding
                .iter()
                .filter(|r| !carried_ids.contains(&r.id))
                .cloned()
                .collect();
            for request in fresh {
                out.push(self.propose(&request));
            }
        } else if !self.outstanding.is_empty() {
            self.idle_deadline = Some(now + self.timeout);
        }
    }

    /// Common view-adoption bookkeeping: lock locally prepared digests,
    /// drop stale in-flight slots, bump the view.
    fn enter_view(
        &mut self,
        new_view: u64,
        carried: &mut BTreeMap<u64, PreparedProof>,
        events: &mut Vec<CoordinatorEvent>,
    ) {
        let old_slots = std::mem::take(&mut self.slots);
        for (seq, slot) in old_slots {
            if slot.phase == Phase::Committed {
                // Commit quorum already reached, only held for ordering.
                self.slots.insert(seq, slot);
            } else if slot.phase >= Phase::Prepared {
                self.locked.insert(seq, slot.digest);
                match carried.get(&seq) {
                    Some(existing) if existing.view >= slot.view => {}
                    _ => {
                        carried.insert(
                            seq,
                            PreparedProof {
                                view: slot.view,
                                seq,
                                digest: slot.digest,
                                request_id: slot.request_id.clone(),
                            },
                        );
                    }
                }
            }
        }
        // Sequence numbers of dropped (never prepared) slots are reused so
        // the committed sequence stays gapless; carried and ordering-held
        // slots keep theirs.
        let held_max = self.slots.keys().max().copied().unwrap_or(0);
        let carried_max = carried.keys().max().copied().unwrap_or(0);
        self.next_seq = self.last_committed.max(held_max).max(carried_max) + 1;

        self.view = new_view;
        self.view_change_votes.retain(|v, _| *v > new_view);
        self.view_change_deadline = None;
        COUNTERS.view_changes_total.add(1, &[]);
        let leader = self.cluster.leader_of(new_view).to_string();
        info!(view = new_view, leader = %leader, "view adopted");
        events.push(CoordinatorEvent::ViewChanged {
            view: new_view,
            leader,
        });
    }

    /// NEW_VIEW lets nodes that missed the vote quorum catch up; the
    /// certificate must carry a quorum of valid VIEW_CHANGE messages.
    fn on_new_view(
        &mut self,
        view: u64,
        view_changes: Vec<ConsensusMessage>,
        sender: String,
        now: Instant,
        events: &mut Vec<CoordinatorEvent>,
    ) {
        if view <= self.view {
            self.reject(events, &sender, RejectReason::StaleView);
            return;
        }
        if sender != self.cluster.leader_of(view) {
            self.violation(events, &sender, ViolationKind::LeaderImpersonation);
            self.reject(events, &sender, RejectReason::NotLeader);
            return;
        }
        let mut signers = HashSet::new();
        let mut carried: BTreeMap<u64, PreparedProof> = BTreeMap::new();
        for vc in &view_changes {
            match vc {
                ConsensusMessage::ViewChange {
                    new_view,
                    prepared,
                    sender: vc_sender,
                    ..
                } if *new_view == view && verify_message(&self.auth, vc) => {
                    signers.insert(vc_sender.clone());
                    for proof in prepared {
                        if proof.seq > self.last_committed {
                            match carried.get(&proof.seq) {
                                Some(existing) if existing.view >= proof.view => {}
                                _ => {
                                    carried.insert(proof.seq, proof.clone());
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        if signers.len() < self.cluster.quorum_size() {
            self.reject(events, &sender, RejectReason::BadCertificate);
            return;
        }
        self.enter_view(view, &mut carried, events);
        if !self.outstanding.is_empty() {
            self.idle_deadline = Some(now + self.timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{NewRequest, Request};
    use accord_core::{Node, NodeRole};
    use ed25519_dalek::SigningKey;
    use serde_json::json;

    fn node_id(i: usize) -> String {
        format!("node-{i}")
    }

    fn signing_key(i: usize) -> SigningKey {
        SigningKey::from_bytes(&[i as u8 + 1; 32])
    }

    struct Harness {
        coords: Vec<Coordinator>,
        now: Instant,
        down: HashSet<usize>,
    }

    impl Harness {
        fn new(n: usize) -> Self {
            let nodes: Vec<Node> = (0..n)
                .map(|i| Node {
                    id: node_id(i),
                    address: format!("127.0.0.1:{}", 9000 + i),
                    role: NodeRole::Participant,
                })
                .collect();
            let keyring: HashMap<String, _> = (0..n)
                .map(|i| (node_id(i), signing_key(i).verifying_key()))
                .collect();
            let coords = (0..n)
                .map(|i| {
                    let cluster =
                        Arc::new(ClusterConfig::new(nodes.clone(), &node_id(i), None).unwrap());
                    let auth = Arc::new(MessageAuthenticator::new(
                        node_id(i),
                        signing_key(i),
                        keyring.clone(),
                    ));
                    Coordinator::new(cluster, auth, Duration::from_secs(3), 256)
                })
                .collect();
            Self {
                coords,
                now: Instant::now(),
                down: HashSet::new(),
            }
        }

        /// Delivers every message to every live node (sender included) until
        /// the network quiesces; returns (node index, event) pairs.
        fn pump(&mut self, seed: Vec<ConsensusMessage>) -> Vec<(usize, CoordinatorEvent)> {
            let mut queue: VecDeque<ConsensusMessage> = seed.into();
            let mut all_events = Vec::new();
            while let Some(msg) = queue.pop_front() {
                for i in 0..self.coords.len() {
                    if self.down.contains(&i) {
                        continue;
                    }
                    let (out, events) = self.coords[i].handle_message(msg.clone(), self.now);
                    queue.extend(out);
                    all_events.extend(events.into_iter().map(|e| (i, e)));
                }
            }
            all_events
        }

        fn tick_all(&mut self, advance: Duration) -> Vec<(usize, CoordinatorEvent)> {
            self.now += advance;
            let mut seed = Vec::new();
            for i in 0..self.coords.len() {
                if self.down.contains(&i) {
                    continue;
                }
                let (out, _) = self.coords[i].on_tick(self.now);
                seed.extend(out);
            }
            self.pump(seed)
        }

        fn submit(&mut self, node: usize, request: Request) -> Vec<(usize, CoordinatorEvent)> {
            let out = self.coords[node].start_request(request, self.now);
            self.pump(out)
        }
    }

    fn request(id: &str) -> Request {
        let mut req = Request::from_new(NewRequest::update(json!({"id": id})), "node-0");
        req.id = id.to_string();
        req
    }

    fn committed_seqs(events: &[(usize, CoordinatorEvent)], node: usize) -> Vec<u64> {
        events
            .iter()
            .filter_map(|(i, e)| match e {
                CoordinatorEvent::Committed { seq, .. } if *i == node => Some(*seq),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn happy_path_commits_on_all_nodes() {
        let mut h = Harness::new(4);
        let events = h.submit(0, request("r1"));
        for node in 0..4 {
            assert_eq!(committed_seqs(&events, node), vec![1], "node {node}");
            assert_eq!(h.coords[node].last_committed(), 1);
        }
        let digests: HashSet<_> = events
            .iter()
            .filter_map(|(_, e)| match e {
                CoordinatorEvent::Committed { digest, .. } => Some(*digest),
                _ => None,
            })
            .collect();
        assert_eq!(digests.len(), 1, "all nodes committed the same digest");
    }

    #[test]
    fn duplicate_delivery_is_idempotent() {
        let mut h = Harness::new(4);
        let out = h.coords[0].start_request(request("r1"), h.now);
        // deliver the whole exchange twice
        let mut queue: VecDeque<ConsensusMessage> = out.into();
        let mut commits_per_node = vec![0usize; 4];
        while let Some(msg) = queue.pop_front() {
            for _ in 0..2 {
                for i in 0..4 {
                    let (o, e) = h.coords[i].handle_message(msg.clone(), h.now);
                    queue.extend(o);
                    commits_per_node[i] += e
                        .iter()
                        .filter(|ev| matches!(ev, CoordinatorEvent::Committed { .. }))
                        .count();
                }
            }
        }
        assert_eq!(commits_per_node, vec![1, 1, 1, 1]);
    }

    #[test]
    fn equivocating_pre_prepare_is_flagged() {
        let mut h = Harness::new(4);
        let r1 = request("r1");
        let r2 = request("r2");
        // leader signs two conflicting proposals for seq 1
        let a = h.coords[0].start_request(r1, h.now).remove(0);
        let mut b = ConsensusMessage::PrePrepare {
            view: 0,
            seq: 1,
            digest: r2.digest(),
            request_id: r2.id.clone(),
            sender: node_id(0),
            signature: unsigned(),
        };
        let leader_auth =
            MessageAuthenticator::new(node_id(0), signing_key(0), HashMap::new());
        sign_message(&leader_auth, &mut b);

        let (_, _) = h.coords[1].handle_message(a, h.now);
        let (_, events) = h.coords[1].handle_message(b, h.now);
        assert!(events.iter().any(|e| matches!(
            e,
            CoordinatorEvent::Violation {
                node,
                kind: ViolationKind::ConflictingPrePrepare
            } if node == "node-0"
        )));
    }

    #[test]
    fn faulty_leader_recovers_via_view_change() {
        let mut h = Harness::new(4);
        let r1 = request("r1");
        let r2 = request("r2");
        h.down.insert(0);

        // node-1 holds the request; the relay reaches nodes 2 and 3 but the
        // leader never orders it
        let events = h.submit(1, r1.clone());
        assert!(committed_seqs(&events, 1).is_empty());

        // the leader equivocates: digest of r1 to node-1, digest of r2 to
        // nodes 2 and 3, then goes silent
        let leader_auth =
            MessageAuthenticator::new(node_id(0), signing_key(0), HashMap::new());
        let mut pp_a = ConsensusMessage::PrePrepare {
            view: 0,
            seq: 1,
            digest: r1.digest(),
            request_id: r1.id.clone(),
            sender: node_id(0),
            signature: unsigned(),
        };
        sign_message(&leader_auth, &mut pp_a);
        let mut pp_b = ConsensusMessage::PrePrepare {
            view: 0,
            seq: 1,
            digest: r2.digest(),
            request_id: r2.id.clone(),
            sender: node_id(0),
            signature: unsigned(),
        };
        sign_message(&leader_auth, &mut pp_b);

        let _ = h.coords[1].handle_message(pp_a, h.now);
        let _ = h.coords[2].handle_message(pp_b.clone(), h.now);
        let _ = h.coords[3].handle_message(pp_b, h.now);

        // all three followers time out, a quorum of VIEW_CHANGE votes
        // elects node-1 as leader of view 1, which re-proposes r1
        let events = h.tick_all(Duration::from_secs(4));
        let viewed: Vec<_> = events
            .iter()
            .filter_map(|(i, e)| match e {
                CoordinatorEvent::ViewChanged { view, leader } if *i == 1 => {
                    Some((*view, leader.clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(viewed, vec![(1, "node-1".to_string())]);

        for node in 1..4 {
            assert_eq!(h.coords[node].last_committed(), 1, "node {node}");
        }
        assert_eq!(committed_seqs(&events, 1), vec![1]);
    }

    #[test]
    fn forwarded_request_rotates_silent_leader() {
        let mut h = Harness::new(4);
        h.down.insert(0);

        // only node-1 submits; the relay arms the no-progress timer on
        // nodes 2 and 3 as well, so a view-change quorum can form
        let events = h.submit(1, request("r1"));
        assert!(committed_seqs(&events, 1).is_empty());

        let events = h.tick_all(Duration::from_secs(4));
        assert!(events
            .iter()
            .any(|(i, e)| *i == 1 && matches!(e, CoordinatorEvent::ViewChanged { view: 1, .. })));
        for node in 1..4 {
            assert_eq!(h.coords[node].last_committed(), 1, "node {node}");
        }
    }

    #[test]
    fn new_leader_fills_sequence_gaps() {
        let mut h = Harness::new(4);
        h.down.insert(0);

        // the leader assigns seq 2, withholds seq 1 and goes silent; the
        // followers reach commit quorum on seq 2 but must hold it
        let r2 = request("r2");
        let leader_auth = MessageAuthenticator::new(node_id(0), signing_key(0), HashMap::new());
        let mut pp = ConsensusMessage::PrePrepare {
            view: 0,
            seq: 2,
            digest: r2.digest(),
            request_id: r2.id.clone(),
            sender: node_id(0),
            signature: unsigned(),
        };
        sign_message(&leader_auth, &mut pp);
        let events = h.pump(vec![pp]);
        assert!(
            events
                .iter()
                .all(|(_, e)| !matches!(e, CoordinatorEvent::Committed { .. })),
            "seq 2 must wait for seq 1"
        );

        let events = h.submit(1, request("r3"));
        assert!(committed_seqs(&events, 1).is_empty());

        // after the view change the new leader plugs seq 1 with a no-op, so
        // the held seq 2 and the fresh request both land
        let events = h.tick_all(Duration::from_secs(4));
        assert_eq!(committed_seqs(&events, 2), vec![1, 2, 3]);
        for node in 1..4 {
            assert_eq!(h.coords[node].last_committed(), 3, "node {node}");
        }
    }

    #[test]
    fn liveness_credit_requires_a_valid_signature() {
        let mut h = Harness::new(4);
        // claims node-0 but carries node-3's signature
        let mut forged = ConsensusMessage::Prepare {
            view: 0,
            seq: 1,
            digest: [7u8; 32],
            sender: node_id(0),
            signature: unsigned(),
        };
        let auth3 = MessageAuthenticator::new(node_id(3), signing_key(3), HashMap::new());
        sign_message(&auth3, &mut forged);
        let (_, events) = h.coords[1].handle_message(forged, h.now);
        assert!(events
            .iter()
            .all(|e| !matches!(e, CoordinatorEvent::PeerObserved { .. })));

        let mut genuine = ConsensusMessage::Prepare {
            view: 0,
            seq: 1,
            digest: [7u8; 32],
            sender: node_id(2),
            signature: unsigned(),
        };
        let auth2 = MessageAuthenticator::new(node_id(2), signing_key(2), HashMap::new());
        sign_message(&auth2, &mut genuine);
        let (_, events) = h.coords[1].handle_message(genuine, h.now);
        assert!(events
            .iter()
            .any(|e| matches!(e, CoordinatorEvent::PeerObserved { node } if node == "node-2")));
    }

    #[test]
    fn insufficient_quorum_stalls_without_commit() {
        let mut h = Harness::new(4);
        h.down.insert(2);
        h.down.insert(3);

        let events = h.submit(0, request("r1"));
        assert!(events
            .iter()
            .all(|(_, e)| !matches!(e, CoordinatorEvent::Committed { .. })));

        // repeated timeouts keep escalating view changes, never adopting
        for _ in 0..3 {
            let events = h.tick_all(Duration::from_secs(4));
            assert!(events
                .iter()
                .all(|(_, e)| !matches!(e, CoordinatorEvent::Committed { .. })));
            assert!(events
                .iter()
                .all(|(_, e)| !matches!(e, CoordinatorEvent::ViewChanged { .. })));
        }
        assert_eq!(h.coords[0].view(), 0);
        assert_eq!(h.coords[0].last_committed(), 0);
    }

    #[test]
    fn early_votes_are_buffered_until_pre_prepare() {
        let mut h = Harness::new(4);
        let r = request("r1");
        let pre_prepare = h.coords[0].start_request(r.clone(), h.now).remove(0);

        // build prepares from nodes 2 and 3 and deliver them to node-1 first
        for i in [2usize, 3] {
            let mut prepare = ConsensusMessage::Prepare {
                view: 0,
                seq: 1,
                digest: r.digest(),
                sender: node_id(i),
                signature: unsigned(),
            };
            let auth = MessageAuthenticator::new(node_id(i), signing_key(i), HashMap::new());
            sign_message(&auth, &mut prepare);
            let (out, _) = h.coords[1].handle_message(prepare, h.now);
            assert!(out.is_empty(), "vote before PRE_PREPARE must not advance");
        }

        // once the PRE_PREPARE lands, the buffered prepares complete the
        // quorum (own prepare arrives via the returned broadcast)
        let (out, _) = h.coords[1].handle_message(pre_prepare, h.now);
        let own_prepare = out
            .iter()
            .find(|m| matches!(m, ConsensusMessage::Prepare { .. }))
            .cloned()
            .unwrap();
        let (out, _) = h.coords[1].handle_message(own_prepare, h.now);
        assert!(
            out.iter()
                .any(|m| matches!(m, ConsensusMessage::Commit { .. })),
            "prepare quorum should produce a COMMIT"
        );
    }

    #[test]
    fn commits_are_reported_in_sequence_order() {
        let mut h = Harness::new(4);
        let r1 = request("r1");
        let r2 = request("r2");
        let pp1 = h.coords[0].start_request(r1.clone(), h.now).remove(0);
        let pp2 = h.coords[0].start_request(r2.clone(), h.now).remove(0);

        let node = &mut h.coords[1];
        let mut events = Vec::new();
        let (_, e) = node.handle_message(pp1, h.now);
        events.extend(e);
        let (_, e) = node.handle_message(pp2, h.now);
        events.extend(e);

        // full quorum of votes for seq 2 first: commit quorum reached but
        // held back for ordering
        for seq in [2u64, 1] {
            let digest = if seq == 1 { r1.digest() } else { r2.digest() };
            for i in [0usize, 2, 3] {
                let auth =
                    MessageAuthenticator::new(node_id(i), signing_key(i), HashMap::new());
                let mut prepare = ConsensusMessage::Prepare {
                    view: 0,
                    seq,
                    digest,
                    sender: node_id(i),
                    signature: unsigned(),
                };
                sign_message(&auth, &mut prepare);
                let (_, e) = node.handle_message(prepare, h.now);
                events.extend(e);
                let mut commit = ConsensusMessage::Commit {
                    view: 0,
                    seq,
                    digest,
                    sender: node_id(i),
                    signature: unsigned(),
                };
                sign_message(&auth, &mut commit);
                let (_, e) = node.handle_message(commit, h.now);
                events.extend(e);
            }
            if seq == 2 {
                assert!(
                    !events
                        .iter()
                        .any(|e| matches!(e, CoordinatorEvent::Committed { .. })),
                    "seq 2 must wait for seq 1"
                );
            }
        }
        let seqs: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                CoordinatorEvent::Committed { seq, .. } => Some(*seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn bad_signature_is_dropped() {
        let mut h = Harness::new(4);
        let r = request("r1");
        let mut msg = ConsensusMessage::PrePrepare {
            view: 0,
            seq: 1,
            digest: r.digest(),
            request_id: r.id.clone(),
            sender: node_id(0),
            signature: unsigned(),
        };
        // signed with the wrong key
        let auth = MessageAuthenticator::new(node_id(3), signing_key(3), HashMap::new());
        sign_message(&auth, &mut msg);
        let (out, events) = h.coords[1].handle_message(msg, h.now);
        assert!(out.is_empty());
        assert!(events.iter().any(|e| matches!(
            e,
            CoordinatorEvent::Rejected {
                reason: RejectReason::BadSignature,
                ..
            }
        )));
    }
}
