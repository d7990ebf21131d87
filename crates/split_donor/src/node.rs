// Split donor node runtime.
//
// Opens the durable store, runs recovery before any listener is bound, then
// starts the background collector, the split manager, and the admin server.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::admin_server;
use crate::donor::{DonorConfig, DonorService, SplittingRecoveryPolicy};
use crate::failpoint::FailPoints;
use crate::garbage_collector::{self, GarbageCollectorConfig};
use crate::split_manager::{self, SplitManagerConfig};
use crate::store::FjallDocumentStore;

/// CLI options for running a donor node.
#[derive(Parser, Debug, Clone)]
pub struct NodeArgs {
    /// Admin (RESP) listen address.
    #[arg(long, env = "SPLIT_DONOR_LISTEN", default_value = "127.0.0.1:16379")]
    pub listen: SocketAddr,

    #[arg(long, env = "SPLIT_DONOR_DATA_DIR")]
    pub data_dir: String,

    /// Replica term stamped into new operation-time markers.
    #[arg(long, env = "SPLIT_DONOR_TERM", default_value_t = 1)]
    pub term: u64,

    /// Delay between marking an operation garbage collectable and deleting it (ms).
    #[arg(long, env = "SPLIT_DONOR_GC_DELAY_MS", default_value_t = 900_000)]
    pub gc_delay_ms: u64,

    /// Delete collectable operations immediately.
    #[arg(long, env = "SPLIT_DONOR_QUICK_GC")]
    pub quick_gc: bool,

    /// Garbage collector sweep interval (ms).
    #[arg(long, env = "SPLIT_DONOR_GC_INTERVAL_MS", default_value_t = 1000)]
    pub gc_interval_ms: u64,

    /// Abort splits that stay in blocking longer than this (ms). `0` disables.
    #[arg(long, env = "SPLIT_DONOR_DECISION_TIMEOUT_MS", default_value_t = 0)]
    pub decision_timeout_ms: u64,

    /// Split manager evaluation interval (ms).
    #[arg(long, env = "SPLIT_DONOR_MANAGER_INTERVAL_MS", default_value_t = 500)]
    pub manager_interval_ms: u64,

    /// What recovery does with operations found in the splitting state.
    #[arg(
        long,
        env = "SPLIT_DONOR_SPLITTING_RECOVERY",
        value_enum,
        default_value_t = SplittingRecoveryPolicy::Resume
    )]
    pub splitting_recovery: SplittingRecoveryPolicy,

    /// Comma-separated failpoints enabled at startup.
    #[arg(long, env = "SPLIT_DONOR_FAILPOINTS", default_value = "")]
    pub failpoints: String,
}

impl NodeArgs {
    pub fn donor_config(&self) -> DonorConfig {
        DonorConfig {
            term: self.term.max(1),
            gc_delay: Duration::from_millis(self.gc_delay_ms),
            quick_gc: self.quick_gc,
            splitting_recovery: self.splitting_recovery,
        }
    }

    fn gc_config(&self) -> GarbageCollectorConfig {
        GarbageCollectorConfig {
            // Clamp to at least 1ms; tokio intervals panic on zero.
            interval: Duration::from_millis(self.gc_interval_ms.max(1)),
        }
    }

    fn manager_config(&self) -> SplitManagerConfig {
        SplitManagerConfig {
            interval: Duration::from_millis(self.manager_interval_ms.max(1)),
            decision_timeout: Duration::from_millis(self.decision_timeout_ms),
        }
    }
}

/// Run a node until ctrl-c.
pub async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    run_node_with_shutdown(args, tokio::signal::ctrl_c()).await
}

/// Run a node until `shutdown` resolves.
pub async fn run_node_with_shutdown<F>(args: NodeArgs, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = Result<(), std::io::Error>> + Send,
{
    let data_dir = PathBuf::from(&args.data_dir);
    fs::create_dir_all(&data_dir).context("create data dir")?;
    let storage_dir = data_dir.join("storage");
    fs::create_dir_all(&storage_dir).context("create storage dir")?;

    let keyspace = Arc::new(
        fjall::Config::new(&storage_dir)
            .open()
            .context("open fjall keyspace")?,
    );
    let store = Arc::new(FjallDocumentStore::open(keyspace).context("open split document store")?);
    let failpoints = FailPoints::from_list(&args.failpoints);

    // Recovery completes before the admin listener exists, so no request can
    // observe gates that were not rebuilt yet.
    let donor_config = args.donor_config();
    let (service, report) =
        tokio::task::spawn_blocking(move || DonorService::recover(donor_config, store, failpoints))
            .await
            .context("recovery task join failure")?
            .context("recover split operations")?;
    if !report.is_clean() {
        tracing::warn!(
            violations = report.violations.len(),
            "split donor started with quarantined tenants"
        );
    }

    let stop = CancellationToken::new();
    let gc_task = garbage_collector::spawn(service.clone(), args.gc_config(), stop.clone());
    let manager_task = split_manager::spawn(service.clone(), args.manager_config(), stop.clone());

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("bind admin listener {}", args.listen))?;
    tracing::info!(
        listen = %args.listen,
        data_dir = %data_dir.display(),
        recovered = report.recovered.len(),
        "split donor node ready"
    );
    let mut server_task = tokio::spawn(admin_server::serve(listener, service.clone(), stop.clone()));

    let server_res = tokio::select! {
        res = shutdown => {
            res.context("wait for shutdown signal")?;
            tracing::info!("split donor shutting down");
            None
        }
        res = &mut server_task => Some(res),
    };
    stop.cancel();
    let server_res = match server_res {
        Some(res) => res,
        None => server_task.await,
    };
    let _ = gc_task.await;
    let _ = manager_task.await;
    server_res.context("admin server task failed")?
}
