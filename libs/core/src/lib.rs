//! Core shared primitives for the accord consensus engine: cluster identity,
//! quorum arithmetic and message authentication.

pub mod auth;
pub mod identity;

pub use auth::{digest_chunks, Digest, MessageAuthenticator};
pub use identity::{ClusterConfig, ConfigError, Node, NodeRole};
