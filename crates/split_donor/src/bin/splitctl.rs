//! Minimal admin client for a split donor node.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use split_donor::{DonorClient, OperationId, OperationStatus};

#[derive(Parser)]
#[command(name = "splitctl")]
#[command(about = "Admin client for the split donor", long_about = None)]
struct Args {
    /// Admin address of the donor node (host:port).
    #[arg(long, default_value = "127.0.0.1:16379")]
    target: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a split operation for a set of tenants.
    Start {
        #[arg(required = true)]
        tenants: Vec<String>,
        #[arg(long)]
        recipient: Option<String>,
    },
    /// Print one operation as JSON.
    Status { id: String },
    /// Show all live operations.
    List,
    /// Show installed tenant access blockers.
    Blockers,
    /// Move an operation into the blocking state.
    Block { id: String },
    /// Drive an operation to a commit decision in the background.
    Commit { id: String },
    /// Record an abort decision for a blocking operation.
    Abort {
        id: String,
        #[arg(long, default_value = "aborted by operator")]
        reason: String,
    },
    /// Abandon an operation that has not been decided.
    Abandon {
        id: String,
        #[arg(long, default_value = "abandoned by operator")]
        reason: String,
    },
    /// Mark a decided operation garbage collectable.
    Forget { id: String },
    /// Wait for an operation decision.
    Wait {
        id: String,
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },
    /// Check whether writes to a tenant are currently admitted.
    Check { tenant: String },
    /// Enable or disable a failpoint.
    Failpoint {
        name: String,
        #[arg(long, action = clap::ArgAction::Set, value_parser = clap::value_parser!(bool))]
        enabled: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let target: SocketAddr = args.target.parse().context("parse --target")?;
    let mut client = DonorClient::connect(target).await?;

    match args.command {
        Command::Start { tenants, recipient } => {
            let tenants = tenants.iter().map(String::as_str).collect::<Vec<_>>();
            let status = client.start(&tenants, recipient.as_deref()).await?;
            println!("ok id={}", status.id);
        }
        Command::Status { id } => {
            let status = client.status(parse_id(&id)?).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::List => {
            let ops = client.list().await?;
            if ops.is_empty() {
                println!("no split operations");
            } else {
                let rows = ops.iter().map(operation_row).collect::<Vec<_>>();
                print_ascii_table(
                    &["ID", "STATE", "DECISION", "TENANTS", "BLOCK_AT", "EXPIRES"],
                    &rows,
                );
            }
        }
        Command::Blockers => {
            let blockers = client.blockers().await?;
            if blockers.is_empty() {
                println!("no tenant blockers installed");
            } else {
                let rows = blockers
                    .iter()
                    .map(|b| {
                        vec![
                            b.tenant_id.to_string(),
                            b.state.as_str().to_string(),
                            b.source_operation_id.to_string(),
                            if b.quarantined { "yes" } else { "no" }.to_string(),
                        ]
                    })
                    .collect::<Vec<_>>();
                print_ascii_table(&["TENANT", "ACCESS", "OPERATION", "QUARANTINED"], &rows);
            }
        }
        Command::Block { id } => {
            let status = client.begin_blocking(parse_id(&id)?).await?;
            println!("ok state={}", status.state);
        }
        Command::Commit { id } => {
            client.commit(parse_id(&id)?).await?;
            println!("ok (commit started)");
        }
        Command::Abort { id, reason } => {
            let status = client.decide_abort(parse_id(&id)?, &reason).await?;
            println!("ok state={}", status.state);
        }
        Command::Abandon { id, reason } => {
            let status = client.abandon(parse_id(&id)?, &reason).await?;
            println!("ok state={}", status.state);
        }
        Command::Forget { id } => {
            let status = client.forget(parse_id(&id)?).await?;
            println!(
                "ok expires_at_ms={}",
                status
                    .expire_at_unix_ms
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
        Command::Wait { id, timeout_ms } => {
            let decision = client
                .wait(parse_id(&id)?, Duration::from_millis(timeout_ms))
                .await?;
            println!("{decision}");
        }
        Command::Check { tenant } => {
            println!("{}", client.check_tenant(&tenant).await?);
        }
        Command::Failpoint { name, enabled } => {
            client.set_failpoint(&name, enabled).await?;
            println!("ok");
        }
    }

    Ok(())
}

fn parse_id(raw: &str) -> anyhow::Result<OperationId> {
    Ok(raw.parse::<OperationId>()?)
}

fn operation_row(op: &OperationStatus) -> Vec<String> {
    vec![
        op.id.to_string(),
        op.state.to_string(),
        op.decision.clone(),
        op.tenant_ids
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(","),
        op.block_op_time
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string()),
        op.expire_at_unix_ms
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string()),
    ]
}

fn print_ascii_table(headers: &[&str], rows: &[Vec<String>]) {
    let mut widths = headers.iter().map(|h| h.len()).collect::<Vec<_>>();
    for row in rows {
        for (idx, cell) in row.iter().enumerate() {
            if idx >= widths.len() {
                widths.push(cell.len());
            } else {
                widths[idx] = widths[idx].max(cell.len());
            }
        }
    }

    let separator = {
        let mut s = String::from("+");
        for w in &widths {
            s.push_str(&"-".repeat(*w + 2));
            s.push('+');
        }
        s
    };

    println!("{separator}");
    print!("|");
    for (idx, header) in headers.iter().enumerate() {
        print!(" {:width$} |", header, width = widths[idx]);
    }
    println!();
    println!("{separator}");
    for row in rows {
        print!("|");
        for (idx, cell) in row.iter().enumerate() {
            print!(" {:width$} |", cell, width = widths[idx]);
        }
        println!();
    }
    println!("{separator}");
}
