//! RESP2 operational surface for the split donor.
//!
//! Replies:
//! - operation commands return the operation status as a JSON bulk string
//! - `SPLIT.WAIT` returns the decision as a simple string
//! - `TENANT.CHECK` returns `+ALLOW` or `+BLOCK`
//! - donor errors are sent as `-<CODE> <message>`, parse errors as `-ERR ...`

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use redis_protocol::resp2::types::Resp2Frame;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::access_blocker::{Access, AccessKind};
use crate::document::{AbortReason, OperationId};
use crate::donor::{DonorService, Outcome};
use crate::error::DonorError;
use crate::op_time::OpTime;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdminOp {
    Ping,
    Start {
        tenants: Vec<String>,
        recipient: Option<String>,
    },
    Status(OperationId),
    List,
    Blockers,
    Block(OperationId),
    Commit(OperationId),
    Decide {
        id: OperationId,
        outcome: Outcome,
    },
    Abandon {
        id: OperationId,
        reason: String,
    },
    Forget(OperationId),
    Wait {
        id: OperationId,
        timeout: Option<Duration>,
    },
    TenantCheck {
        tenant: String,
        kind: AccessKind,
    },
    TenantWait {
        tenant: String,
        kind: AccessKind,
        timeout: Duration,
    },
    FailPoint {
        name: String,
        enabled: bool,
    },
    FailPointWait {
        name: String,
        timeout: Duration,
    },
}

/// Accept connections on an already bound listener until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    service: Arc<DonorService>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        let service = service.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, service, shutdown).await {
                tracing::debug!(peer = %peer, error = ?err, "admin connection closed");
            }
        });
    }
}

async fn handle_conn(
    socket: TcpStream,
    service: Arc<DonorService>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    socket.set_nodelay(true).ok();
    let mut framed = Framed::new(socket, Resp2::default());
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = framed.next() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        let resp = match parse_command(frame?) {
            Ok(Some(op)) => execute(&service, op, &shutdown).await,
            Ok(None) => continue,
            Err(err) => BytesFrame::Error(format!("ERR {err}").into()),
        };
        framed.send(resp).await?;
    }
    Ok(())
}

async fn execute(service: &Arc<DonorService>, op: AdminOp, shutdown: &CancellationToken) -> BytesFrame {
    tracing::debug!(op = ?op, "admin command");
    match op {
        AdminOp::Ping => simple("PONG"),
        AdminOp::Start { tenants, recipient } => {
            json_or_error(service.start_operation(&tenants, recipient).await)
        }
        AdminOp::Status(id) => json_or_error(service.operation_status(id).await),
        AdminOp::List => json_frame(&service.list_operations().await),
        AdminOp::Blockers => json_frame(&service.blockers().snapshot()),
        AdminOp::Block(id) => json_or_error(service.begin_blocking(id).await),
        AdminOp::Commit(id) => match service.commit_async(id).await {
            Ok(_) => simple("OK"),
            Err(err) => error_frame(&err),
        },
        AdminOp::Decide { id, outcome } => json_or_error(service.decide(id, outcome).await),
        AdminOp::Abandon { id, reason } => json_or_error(service.abandon(id, reason).await),
        AdminOp::Forget(id) => json_or_error(service.mark_garbage_collectable(id).await),
        AdminOp::Wait { id, timeout } => {
            // Shutting the server down cancels the wait; the caller sees "undecided".
            let cancel = shutdown.child_token();
            match service.wait_for_decision(id, timeout, &cancel).await {
                Ok(decision) => simple(decision.as_str()),
                Err(err) => error_frame(&err),
            }
        }
        AdminOp::TenantCheck { tenant, kind } => match service.check_access(&tenant, kind) {
            Ok(Access::Allow) => simple("ALLOW"),
            Ok(Access::Block(_)) => simple("BLOCK"),
            Err(err) => error_frame(&err),
        },
        AdminOp::TenantWait {
            tenant,
            kind,
            timeout,
        } => {
            // Shutting the server down ends the wait while the gate is still closed.
            let res = tokio::select! {
                _ = shutdown.cancelled() => return simple("BLOCK"),
                res = service.wait_for_access(&tenant, kind, timeout) => res,
            };
            match res {
                Ok(()) => simple("ALLOW"),
                Err(err) => error_frame(&err),
            }
        }
        AdminOp::FailPoint { name, enabled } => {
            service.failpoints().set(&name, enabled);
            simple("OK")
        }
        AdminOp::FailPointWait { name, timeout } => {
            match service.failpoints().wait_for_hit(&name, timeout).await {
                Ok(hits) => BytesFrame::Integer(hits.min(i64::MAX as u64) as i64),
                Err(err) => error_frame(&err),
            }
        }
    }
}

pub fn parse_command(frame: BytesFrame) -> anyhow::Result<Option<AdminOp>> {
    let BytesFrame::Array(parts) = frame else {
        anyhow::bail!("expected array frame");
    };
    if parts.is_empty() {
        return Ok(None);
    }
    let args = parts
        .iter()
        .map(|p| frame_string(p).ok_or_else(|| anyhow::anyhow!("invalid argument")))
        .collect::<anyhow::Result<Vec<String>>>()?;
    let cmd = args[0].to_ascii_uppercase();
    let rest = &args[1..];

    let op = match cmd.as_str() {
        "PING" => AdminOp::Ping,
        "SPLIT.START" => {
            let (tenants, recipient) = match rest.iter().position(|a| a.eq_ignore_ascii_case("RECIPIENT")) {
                Some(idx) => {
                    anyhow::ensure!(idx + 2 == rest.len(), "RECIPIENT expects exactly one name");
                    (rest[..idx].to_vec(), Some(rest[idx + 1].clone()))
                }
                None => (rest.to_vec(), None),
            };
            anyhow::ensure!(!tenants.is_empty(), "SPLIT.START expects at least one tenant");
            AdminOp::Start { tenants, recipient }
        }
        "SPLIT.STATUS" => AdminOp::Status(single_id(&cmd, rest)?),
        "SPLIT.LIST" => {
            anyhow::ensure!(rest.is_empty(), "SPLIT.LIST expects 0 arguments");
            AdminOp::List
        }
        "SPLIT.BLOCKERS" => {
            anyhow::ensure!(rest.is_empty(), "SPLIT.BLOCKERS expects 0 arguments");
            AdminOp::Blockers
        }
        "SPLIT.BLOCK" => AdminOp::Block(single_id(&cmd, rest)?),
        "SPLIT.COMMIT" => AdminOp::Commit(single_id(&cmd, rest)?),
        "SPLIT.FORGET" => AdminOp::Forget(single_id(&cmd, rest)?),
        "SPLIT.DECIDE" => {
            anyhow::ensure!(
                rest.len() >= 2,
                "SPLIT.DECIDE expects <id> COMMIT|ABORT [reason]"
            );
            let id = rest[0].parse::<OperationId>()?;
            let outcome = match rest[1].to_ascii_uppercase().as_str() {
                "COMMIT" => {
                    anyhow::ensure!(rest.len() == 2, "COMMIT takes no reason");
                    Outcome::Commit
                }
                "ABORT" => {
                    let reason = if rest.len() > 2 {
                        rest[2..].join(" ")
                    } else {
                        "abort requested".to_string()
                    };
                    Outcome::Abort(AbortReason::requested(reason))
                }
                other => anyhow::bail!("unknown decision {other}"),
            };
            AdminOp::Decide { id, outcome }
        }
        "SPLIT.ABANDON" => {
            anyhow::ensure!(rest.len() >= 2, "SPLIT.ABANDON expects <id> <reason>");
            AdminOp::Abandon {
                id: rest[0].parse::<OperationId>()?,
                reason: rest[1..].join(" "),
            }
        }
        "SPLIT.WAIT" => {
            anyhow::ensure!(rest.len() == 2, "SPLIT.WAIT expects <id> <timeout_ms>");
            let timeout_ms = parse_u64(&rest[1])?;
            AdminOp::Wait {
                id: rest[0].parse::<OperationId>()?,
                timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
            }
        }
        "TENANT.CHECK" => {
            anyhow::ensure!(!rest.is_empty(), "TENANT.CHECK expects <tenant> [WRITE|READ [term ts]]");
            AdminOp::TenantCheck {
                tenant: rest[0].clone(),
                kind: parse_access_kind(&rest[1..])?,
            }
        }
        "TENANT.WAIT" => {
            anyhow::ensure!(
                rest.len() >= 2,
                "TENANT.WAIT expects <tenant> <timeout_ms> [WRITE|READ [term ts]]"
            );
            AdminOp::TenantWait {
                tenant: rest[0].clone(),
                timeout: Duration::from_millis(parse_u64(&rest[1])?),
                kind: parse_access_kind(&rest[2..])?,
            }
        }
        "FAILPOINT" => {
            anyhow::ensure!(rest.len() == 2, "FAILPOINT expects <name> ON|OFF");
            let enabled = match rest[1].to_ascii_uppercase().as_str() {
                "ON" => true,
                "OFF" => false,
                other => anyhow::bail!("unknown failpoint mode {other}"),
            };
            AdminOp::FailPoint {
                name: rest[0].clone(),
                enabled,
            }
        }
        "FAILPOINT.WAIT" => {
            anyhow::ensure!(rest.len() == 2, "FAILPOINT.WAIT expects <name> <timeout_ms>");
            AdminOp::FailPointWait {
                name: rest[0].clone(),
                timeout: Duration::from_millis(parse_u64(&rest[1])?),
            }
        }
        other => anyhow::bail!("unknown command {other}"),
    };
    Ok(Some(op))
}

fn single_id(cmd: &str, rest: &[String]) -> anyhow::Result<OperationId> {
    anyhow::ensure!(rest.len() == 1, "{cmd} expects <id>");
    Ok(rest[0].parse::<OperationId>()?)
}

fn parse_access_kind(args: &[String]) -> anyhow::Result<AccessKind> {
    let Some(kind) = args.first() else {
        return Ok(AccessKind::Write);
    };
    match kind.to_ascii_uppercase().as_str() {
        "WRITE" => {
            anyhow::ensure!(args.len() == 1, "WRITE takes no read time");
            Ok(AccessKind::Write)
        }
        "READ" => match args.len() {
            1 => Ok(AccessKind::Read { at: None }),
            3 => Ok(AccessKind::Read {
                at: Some(OpTime::new(parse_u64(&args[1])?, parse_u64(&args[2])?)),
            }),
            _ => anyhow::bail!("READ expects either no read time or <term> <ts>"),
        },
        other => anyhow::bail!("unknown access kind {other}"),
    }
}

fn parse_u64(raw: &str) -> anyhow::Result<u64> {
    raw.parse::<u64>()
        .map_err(|_| anyhow::anyhow!("invalid integer {raw:?}"))
}

fn frame_string(frame: &BytesFrame) -> Option<String> {
    frame.as_str().map(str::to_string)
}

fn simple(text: &'static str) -> BytesFrame {
    BytesFrame::SimpleString(Bytes::from_static(text.as_bytes()))
}

fn json_frame<T: Serialize>(value: &T) -> BytesFrame {
    match serde_json::to_vec(value) {
        Ok(json) => BytesFrame::BulkString(Bytes::from(json)),
        Err(err) => BytesFrame::Error(format!("ERR failed to encode reply: {err}").into()),
    }
}

fn json_or_error<T: Serialize>(res: Result<T, DonorError>) -> BytesFrame {
    match res {
        Ok(value) => json_frame(&value),
        Err(err) => error_frame(&err),
    }
}

fn error_frame(err: &DonorError) -> BytesFrame {
    BytesFrame::Error(format!("{} {err}", err.code()).into())
}
