//! Shard-split donor: durable split operations and per-tenant access gates
//! that survive process restarts.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub mod access_blocker;
pub mod admin_server;
pub mod client;
pub mod document;
pub mod donor;
pub mod error;
pub mod failpoint;
pub mod garbage_collector;
pub mod node;
pub mod op_time;
pub mod recovery;
pub mod split_manager;
pub mod store;

pub use access_blocker::{Access, AccessKind, AccessState, BlockerRegistry, BlockerView};
pub use client::{DonorClient, RemoteError};
pub use document::{AbortCode, AbortReason, Decision, OperationId, SplitDocument, SplitState, TenantId};
pub use donor::{DonorConfig, DonorService, Outcome, OperationStatus, SplittingRecoveryPolicy};
pub use error::{DonorError, DonorResult};
pub use failpoint::FailPoints;
pub use node::{run_node, run_node_with_shutdown, NodeArgs};
pub use op_time::OpTime;
pub use recovery::{RecoveryAction, RecoveryReport};
pub use store::{DocumentStore, FjallDocumentStore, MemoryDocumentStore};

/// Minimal embeddable configuration for running a donor node inside another process.
#[derive(Clone, Debug)]
pub struct EmbeddedNodeConfig {
    pub listen: SocketAddr,
    pub data_dir: PathBuf,
    pub ready_timeout: Duration,
    pub quick_gc: bool,
    pub decision_timeout: Duration,
    pub splitting_recovery: SplittingRecoveryPolicy,
    /// Failpoints enabled before recovery runs.
    pub failpoints: Vec<String>,
}

impl EmbeddedNodeConfig {
    pub fn single_node(listen: SocketAddr, data_dir: PathBuf) -> Self {
        Self {
            listen,
            data_dir,
            ready_timeout: Duration::from_secs(20),
            quick_gc: false,
            decision_timeout: Duration::ZERO,
            splitting_recovery: SplittingRecoveryPolicy::Resume,
            failpoints: Vec::new(),
        }
    }
}

pub struct EmbeddedNodeHandle {
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl EmbeddedNodeHandle {
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        match self.task.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("split donor task join failed: {err}")),
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

pub fn build_node_args(config: &EmbeddedNodeConfig) -> anyhow::Result<NodeArgs> {
    use clap::Parser;
    use clap::ValueEnum;

    let policy = config
        .splitting_recovery
        .to_possible_value()
        .map(|v| v.get_name().to_string())
        .unwrap_or_else(|| "resume".to_string());
    let mut argv = vec![
        "split-donor-node".to_string(),
        "--listen".to_string(),
        config.listen.to_string(),
        "--data-dir".to_string(),
        config.data_dir.display().to_string(),
        "--decision-timeout-ms".to_string(),
        config.decision_timeout.as_millis().to_string(),
        "--splitting-recovery".to_string(),
        policy,
        "--failpoints".to_string(),
        config.failpoints.join(","),
    ];
    if config.quick_gc {
        argv.push("--quick-gc".to_string());
        argv.push("--gc-interval-ms".to_string());
        argv.push("50".to_string());
    }

    NodeArgs::try_parse_from(argv).map_err(|err| anyhow::anyhow!(err.to_string()))
}

pub async fn start_embedded_node(config: EmbeddedNodeConfig) -> anyhow::Result<EmbeddedNodeHandle> {
    let args = build_node_args(&config)?;
    let wait_addr = config.listen;
    let wait_timeout = config.ready_timeout.max(Duration::from_secs(1));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        run_node_with_shutdown(args, async move {
            let _ = shutdown_rx.await;
            Ok::<(), std::io::Error>(())
        })
        .await
    });

    wait_for_listener(wait_addr, wait_timeout, &task).await?;

    Ok(EmbeddedNodeHandle {
        shutdown_tx: Some(shutdown_tx),
        task,
    })
}

async fn wait_for_listener(
    addr: SocketAddr,
    timeout: Duration,
    task: &tokio::task::JoinHandle<anyhow::Result<()>>,
) -> anyhow::Result<()> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if task.is_finished() {
            return Err(anyhow::anyhow!(
                "embedded split donor exited before its listener became ready"
            ));
        }
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return Ok(());
        }
        if std::time::Instant::now() >= deadline {
            return Err(anyhow::anyhow!(
                "timeout waiting for split donor listener on {addr}"
            ));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
