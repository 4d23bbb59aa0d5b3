//! Node orchestrator.
//!
//! Starts the P2P layer, logs what arrives in the inbox and stops
//! everything on SIGINT/SIGTERM.

use std::net::SocketAddr;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use raintree_p2p::{InboundMessage, MessageKind, P2pHandle, P2pNode};

use crate::config::NodeConfig;
use crate::shutdown::wait_for_shutdown_signal;

/// The main node structure.
pub struct Node {
    config: NodeConfig,
}

/// A node whose P2P layer is running in the background.
pub struct RunningNode {
    /// Address the listener actually bound to.
    pub bound_addr: SocketAddr,
    /// Handle for issuing P2P operations.
    pub handle: P2pHandle,
    shutdown_tx: mpsc::Sender<()>,
    p2p_task: JoinHandle<()>,
    inbox_task: JoinHandle<()>,
}

impl Node {
    /// Create a new node with the given configuration.
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    /// Get the node configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Run the node until a shutdown signal arrives.
    pub async fn run(self, announce: Option<String>) -> anyhow::Result<()> {
        tracing::info!("Starting RainTree node...");
        tracing::info!("  Address: {}", self.config.p2p.address);
        tracing::info!("  Listen address: {}", self.config.p2p.listen_address);
        tracing::info!("  Validators: {}", self.config.validators.len());
        tracing::info!("  Bootstrap peers: {}", self.config.p2p.peers.len());
        tracing::info!("  Redundancy: {}", self.config.p2p.redundancy);

        let running = self.start().await?;

        if let Some(text) = announce {
            match running.handle.broadcast(text.into_bytes()).await {
                Ok(nonce) => tracing::info!(nonce, "Announcement broadcast"),
                Err(e) => tracing::warn!(error = %e, "Announcement failed"),
            }
        }

        // Wait for shutdown signal
        if let Err(e) = wait_for_shutdown_signal().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signals");
        }

        tracing::info!("Shutting down node...");
        running.stop().await;
        tracing::info!("Node shutdown complete");
        Ok(())
    }

    /// Start the P2P layer and return once its listener is bound.
    pub async fn start(self) -> anyhow::Result<RunningNode> {
        let mut p2p_node = P2pNode::new(self.config.p2p, self.config.validators)?;

        // Get the receivers BEFORE running
        let addr_rx = p2p_node.bound_addr_receiver();
        let inbox = p2p_node.inbox_receiver();
        let shutdown_tx = p2p_node.shutdown_handle();
        let handle = p2p_node.handle();

        let p2p_task = tokio::spawn(async move {
            match p2p_node.run().await {
                Ok(()) => tracing::info!("P2P node stopped gracefully"),
                Err(e) => tracing::error!("P2P node error: {}", e),
            }
        });
        let inbox_task = tokio::spawn(log_inbox(inbox));

        let bound_addr = addr_rx
            .await
            .map_err(|_| anyhow::anyhow!("Failed to receive bound P2P address"))?;
        tracing::info!("P2P node started on {}", bound_addr);

        Ok(RunningNode {
            bound_addr,
            handle,
            shutdown_tx,
            p2p_task,
            inbox_task,
        })
    }
}

impl RunningNode {
    /// Stop the P2P layer and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.p2p_task.await;
        self.inbox_task.abort();
    }
}

async fn log_inbox(mut inbox: mpsc::Receiver<InboundMessage>) {
    while let Some(msg) = inbox.recv().await {
        let text = String::from_utf8_lossy(&msg.payload);
        match msg.kind {
            MessageKind::Broadcast => {
                tracing::info!(from = %msg.from, nonce = msg.nonce, "Broadcast received: {}", text)
            }
            MessageKind::Direct => {
                tracing::info!(from = %msg.from, nonce = msg.nonce, "Message received: {}", text)
            }
        }
    }
}
