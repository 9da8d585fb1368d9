//! Message authentication: ed25519 signatures over protocol messages and
//! Sha256 digests of request payloads.
//!
//! Key material is injected by the host; nothing here generates long-lived
//! keys. Verification failures are values, not errors - a bad signature is
//! logged and dropped by the caller, it must never stall the protocol.

use std::collections::HashMap;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest as Sha2Digest, Sha256};
use tracing::warn;

/// Fixed-size fingerprint of a request, agreed on instead of the payload.
pub type Digest = [u8; 32];

/// Short hex prefix of a digest, for log lines.
pub fn short_hex(digest: &Digest) -> String {
    hex::encode(&digest[..6])
}

/// Sha256 over a sequence of byte chunks. Chunk lengths are mixed into the
/// hash so `["ab", "c"]` and `["a", "bc"]` do not collide.
pub fn digest_chunks<'a, I>(chunks: I) -> Digest
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update((chunk.len() as u64).to_le_bytes());
        hasher.update(chunk);
    }
    hasher.finalize().into()
}

/// Signs outgoing protocol messages with this node's key and verifies
/// peer signatures against the fixed cluster keyring.
pub struct MessageAuthenticator {
    self_id: String,
    signing_key: SigningKey,
    keyring: HashMap<String, VerifyingKey>,
}

impl MessageAuthenticator {
    pub fn new(
        self_id: impl Into<String>,
        signing_key: SigningKey,
        keyring: HashMap<String, VerifyingKey>,
    ) -> Self {
        Self {
            self_id: self_id.into(),
            signing_key,
            keyring,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn sign(&self, bytes: &[u8]) -> Signature {
        self.signing_key.sign(bytes)
    }

    /// Returns false for unknown senders or invalid signatures. Never panics
    /// and never returns an error - the coordinator drops bad messages.
    pub fn verify(&self, bytes: &[u8], signature: &Signature, claimed_sender: &str) -> bool {
        let Some(key) = self.keyring.get(claimed_sender) else {
            warn!(sender = %claimed_sender, "signature from unknown sender rejected");
            return false;
        };
        match key.verify(bytes, signature) {
            Ok(()) => true,
            Err(_) => {
                warn!(sender = %claimed_sender, "invalid signature rejected");
                false
            }
        }
    }
}

impl std::fmt::Debug for MessageAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageAuthenticator")
            .field("self_id", &self.self_id)
            .field("known_keys", &self.keyring.len())
            .finish()
    }
}
