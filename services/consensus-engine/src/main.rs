use std::collections::HashMap;
use std::time::Duration;

use accord_consensus::{ConsensusManager, EngineConfig};
use ed25519_dalek::SigningKey;
use sha2::{Digest as _, Sha256};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::from_env()?;
    info!(node = %config.node_id, nodes = config.nodes.len(), "starting consensus engine");

    // Development key material: each node's signing key is derived from its
    // id so a local cluster needs no key exchange. Production deployments
    // inject real keys instead.
    let signing_key = dev_key(&config.node_id);
    let keyring: HashMap<_, _> = config
        .nodes
        .iter()
        .map(|node| (node.id.clone(), dev_key(&node.id).verifying_key()))
        .collect();

    let manager = ConsensusManager::new(config, signing_key, keyring)?;

    // Transport stub: real deployments forward this stream to peers and
    // feed received messages back through `deliver`.
    if let Some(mut outbound) = manager.take_outbound() {
        tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                info!(phase = msg.phase_name(), view = msg.view(), "broadcast");
            }
        });
    }

    let mut report_timer = tokio::time::interval(Duration::from_secs(30));
    report_timer.tick().await; // first tick fires immediately
    loop {
        tokio::select! {
            _ = report_timer.tick() => {
                info!("\n{}", manager.generate_report());
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    error!(error = %err, "signal handler failed");
                }
                break;
            }
        }
    }

    info!("shutting down");
    manager.shutdown().await;
    Ok(())
}

fn dev_key(node_id: &str) -> SigningKey {
    let mut hasher = Sha256::new();
    hasher.update(b"accord-dev-key:");
    hasher.update(node_id.as_bytes());
    SigningKey::from_bytes(&hasher.finalize().into())
}
