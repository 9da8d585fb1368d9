//! Protocol message types. One enum, dispatched by variant - no trait
//! objects. Every message carries the sender id and an ed25519 signature
//! over [`ConsensusMessage::signing_bytes`].

use accord_core::auth::Digest;
use accord_core::MessageAuthenticator;
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};

use crate::request::Request;

/// Slot progress through the three-phase protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    PrePrepared,
    Prepared,
    Committed,
}

/// Proof that a slot reached the prepare quorum in an earlier view; carried
/// inside VIEW_CHANGE so the value survives leader rotation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreparedProof {
    pub view: u64,
    pub seq: u64,
    pub digest: Digest,
    pub request_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ConsensusMessage {
    PrePrepare {
        view: u64,
        seq: u64,
        digest: Digest,
        request_id: String,
        sender: String,
        signature: Signature,
    },
    Prepare {
        view: u64,
        seq: u64,
        digest: Digest,
        sender: String,
        signature: Signature,
    },
    Commit {
        view: u64,
        seq: u64,
        digest: Digest,
        sender: String,
        signature: Signature,
    },
    ViewChange {
        new_view: u64,
        last_committed: u64,
        prepared: Vec<PreparedProof>,
        sender: String,
        signature: Signature,
    },
    NewView {
        view: u64,
        view_changes: Vec<ConsensusMessage>,
        sender: String,
        signature: Signature,
    },
    /// A client request relayed by a non-leader replica so every node can
    /// hold the current leader to a deadline for it.
    Forward {
        view: u64,
        request: Request,
        sender: String,
        signature: Signature,
    },
}

impl ConsensusMessage {
    pub fn phase_name(&self) -> &'static str {
        match self {
            Self::PrePrepare { .. } => "PRE_PREPARE",
            Self::Prepare { .. } => "PREPARE",
            Self::Commit { .. } => "COMMIT",
            Self::ViewChange { .. } => "VIEW_CHANGE",
            Self::NewView { .. } => "NEW_VIEW",
            Self::Forward { .. } => "FORWARD",
        }
    }

    pub fn sender(&self) -> &str {
        match self {
            Self::PrePrepare { sender, .. }
            | Self::Prepare { sender, .. }
            | Self::Commit { sender, .. }
            | Self::ViewChange { sender, .. }
            | Self::NewView { sender, .. }
            | Self::Forward { sender, .. } => sender,
        }
    }

    pub fn view(&self) -> u64 {
        match self {
            Self::PrePrepare { view, .. }
            | Self::Commit { view, .. }
            | Self::Prepare { view, .. }
            | Self::NewView { view, .. }
            | Self::Forward { view, .. } => *view,
            Self::ViewChange { new_view, .. } => *new_view,
        }
    }

    pub fn signature(&self) -> &Signature {
        match self {
            Self::PrePrepare { signature, .. }
            | Self::Prepare { signature, .. }
            | Self::Commit { signature, .. }
            | Self::ViewChange { signature, .. }
            | Self::NewView { signature, .. }
            | Self::Forward { signature, .. } => signature,
        }
    }

    fn set_signature(&mut self, sig: Signature) {
        match self {
            Self::PrePrepare { signature, .. }
            | Self::Prepare { signature, .. }
            | Self::Commit { signature, .. }
            | Self::ViewChange { signature, .. }
            | Self::NewView { signature, .. }
            | Self::Forward { signature, .. } => *signature = sig,
        }
    }

    /// Canonical byte encoding of everything except the signature itself.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(96);
        match self {
            Self::PrePrepare {
                view,
                seq,
                digest,
                request_id,
                sender,
                ..
            } => {
                buf.push(0x01);
                buf.extend_from_slice(&view.to_le_bytes());
                buf.extend_from_slice(&seq.to_le_bytes());
                buf.extend_from_slice(digest);
                buf.extend_from_slice(request_id.as_bytes());
                buf.push(0x00);
                buf.extend_from_slice(sender.as_bytes());
            }
            Self::Prepare {
                view,
                seq,
                digest,
                sender,
                ..
            } => {
                buf.push(0x02);
                buf.extend_from_slice(&view.to_le_bytes());
                buf.extend_from_slice(&seq.to_le_bytes());
                buf.extend_from_slice(digest);
                buf.extend_from_slice(sender.as_bytes());
            }
            Self::Commit {
                view,
                seq,
                digest,
                sender,
                ..
            } => {
                buf.push(0x03);
                buf.extend_from_slice(&view.to_le_bytes());
                buf.extend_from_slice(&seq.to_le_bytes());
                buf.extend_from_slice(digest);
                buf.extend_from_slice(sender.as_bytes());
            }
            Self::ViewChange {
                new_view,
                last_committed,
                prepared,
                sender,
                ..
            } => {
                buf.push(0x04);
                buf.extend_from_slice(&new_view.to_le_bytes());
                buf.extend_from_slice(&last_committed.to_le_bytes());
                buf.extend_from_slice(&(prepared.len() as u64).to_le_bytes());
                for proof in prepared {
                    buf.extend_from_slice(&proof.view.to_le_bytes());
                    buf.extend_from_slice(&proof.seq.to_le_bytes());
                    buf.extend_from_slice(&proof.digest);
                    buf.extend_from_slice(proof.request_id.as_bytes());
                    buf.push(0x00);
                }
                buf.extend_from_slice(sender.as_bytes());
            }
            Self::NewView {
                view,
                view_changes,
                sender,
                ..
            } => {
                buf.push(0x05);
                buf.extend_from_slice(&view.to_le_bytes());
                buf.extend_from_slice(&(view_changes.len() as u64).to_le_bytes());
                // summarize the certificate by its signers; the embedded
                // messages carry their own signatures
                for vc in view_changes {
                    buf.extend_from_slice(vc.sender().as_bytes());
                    buf.push(0x00);
                }
                buf.extend_from_slice(sender.as_bytes());
            }
            Self::Forward {
                view,
                request,
                sender,
                ..
            } => {
                buf.push(0x06);
                buf.extend_from_slice(&view.to_le_bytes());
                // the digest covers id, kind, priority and payload
                buf.extend_from_slice(&request.digest());
                buf.extend_from_slice(request.id.as_bytes());
                buf.push(0x00);
                buf.extend_from_slice(sender.as_bytes());
            }
        }
        buf
    }
}

/// Signs `msg` in place with the local key.
pub fn sign_message(auth: &MessageAuthenticator, msg: &mut ConsensusMessage) {
    let sig = auth.sign(&msg.signing_bytes());
    msg.set_signature(sig);
}

/// Checks the signature against the claimed sender's key.
pub fn verify_message(auth: &MessageAuthenticator, msg: &ConsensusMessage) -> bool {
    auth.verify(&msg.signing_bytes(), msg.signature(), msg.sender())
}

/// Placeholder signature used while constructing a message, always replaced
/// by [`sign_message`] before the message leaves the coordinator.
pub fn unsigned() -> Signature {
    Signature::from_bytes(&[0u8; 64])
}
