//! Async RESP client for the split donor admin surface.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::access_blocker::BlockerView;
use crate::document::OperationId;
use crate::donor::OperationStatus;

/// Error reply returned by the donor (`-<CODE> <message>`).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code} {message}")]
pub struct RemoteError {
    pub code: String,
    pub message: String,
}

impl RemoteError {
    fn parse(raw: &str) -> Self {
        let (code, message) = raw.split_once(' ').unwrap_or((raw, ""));
        Self {
            code: code.to_string(),
            message: message.to_string(),
        }
    }
}

pub struct DonorClient {
    framed: Framed<TcpStream, Resp2>,
}

impl DonorClient {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let socket = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect to {addr}"))?;
        socket.set_nodelay(true).ok();
        Ok(Self {
            framed: Framed::new(socket, Resp2::default()),
        })
    }

    /// Send one command and return the raw reply. Error replies are returned
    /// as [`RemoteError`].
    pub async fn command<S: AsRef<str>>(&mut self, parts: &[S]) -> anyhow::Result<BytesFrame> {
        let frame = BytesFrame::Array(
            parts
                .iter()
                .map(|p| BytesFrame::BulkString(Bytes::from(p.as_ref().as_bytes().to_vec())))
                .collect(),
        );
        self.framed.send(frame).await?;
        let resp = self
            .framed
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("connection closed"))??;
        match resp {
            BytesFrame::Error(err) => Err(RemoteError::parse(&err).into()),
            other => Ok(other),
        }
    }

    async fn text(&mut self, parts: &[&str]) -> anyhow::Result<String> {
        match self.command(parts).await? {
            BytesFrame::SimpleString(b) | BytesFrame::BulkString(b) => {
                Ok(String::from_utf8_lossy(&b).to_string())
            }
            other => anyhow::bail!("unexpected reply: {other:?}"),
        }
    }

    async fn json<T: serde::de::DeserializeOwned>(&mut self, parts: &[&str]) -> anyhow::Result<T> {
        let text = self.text(parts).await?;
        serde_json::from_str(&text).with_context(|| format!("parse reply {text:?}"))
    }

    pub async fn ping(&mut self) -> anyhow::Result<()> {
        let reply = self.text(&["PING"]).await?;
        anyhow::ensure!(reply == "PONG", "unexpected PING reply {reply:?}");
        Ok(())
    }

    pub async fn start(
        &mut self,
        tenants: &[&str],
        recipient: Option<&str>,
    ) -> anyhow::Result<OperationStatus> {
        let mut parts = vec!["SPLIT.START"];
        parts.extend_from_slice(tenants);
        if let Some(recipient) = recipient {
            parts.push("RECIPIENT");
            parts.push(recipient);
        }
        self.json(&parts).await
    }

    pub async fn status(&mut self, id: OperationId) -> anyhow::Result<OperationStatus> {
        self.json(&["SPLIT.STATUS", &id.to_string()]).await
    }

    pub async fn list(&mut self) -> anyhow::Result<Vec<OperationStatus>> {
        self.json(&["SPLIT.LIST"]).await
    }

    pub async fn blockers(&mut self) -> anyhow::Result<Vec<BlockerView>> {
        self.json(&["SPLIT.BLOCKERS"]).await
    }

    pub async fn begin_blocking(&mut self, id: OperationId) -> anyhow::Result<OperationStatus> {
        self.json(&["SPLIT.BLOCK", &id.to_string()]).await
    }

    /// Start the background commit driver.
    pub async fn commit(&mut self, id: OperationId) -> anyhow::Result<()> {
        self.text(&["SPLIT.COMMIT", &id.to_string()]).await?;
        Ok(())
    }

    pub async fn decide_commit(&mut self, id: OperationId) -> anyhow::Result<OperationStatus> {
        self.json(&["SPLIT.DECIDE", &id.to_string(), "COMMIT"]).await
    }

    pub async fn decide_abort(
        &mut self,
        id: OperationId,
        reason: &str,
    ) -> anyhow::Result<OperationStatus> {
        self.json(&["SPLIT.DECIDE", &id.to_string(), "ABORT", reason])
            .await
    }

    pub async fn abandon(&mut self, id: OperationId, reason: &str) -> anyhow::Result<OperationStatus> {
        self.json(&["SPLIT.ABANDON", &id.to_string(), reason]).await
    }

    pub async fn forget(&mut self, id: OperationId) -> anyhow::Result<OperationStatus> {
        self.json(&["SPLIT.FORGET", &id.to_string()]).await
    }

    /// Wait for a decision; returns `committed`, `aborted` or `undecided`.
    pub async fn wait(&mut self, id: OperationId, timeout: Duration) -> anyhow::Result<String> {
        let ms = timeout.as_millis().to_string();
        self.text(&["SPLIT.WAIT", &id.to_string(), &ms]).await
    }

    /// Non-blocking write admission check; returns `ALLOW` or `BLOCK`.
    pub async fn check_tenant(&mut self, tenant: &str) -> anyhow::Result<String> {
        self.text(&["TENANT.CHECK", tenant, "WRITE"]).await
    }

    pub async fn set_failpoint(&mut self, name: &str, enabled: bool) -> anyhow::Result<()> {
        self.text(&["FAILPOINT", name, if enabled { "ON" } else { "OFF" }])
            .await?;
        Ok(())
    }

    pub async fn wait_failpoint(&mut self, name: &str, timeout: Duration) -> anyhow::Result<u64> {
        let ms = timeout.as_millis().to_string();
        match self.command(&["FAILPOINT.WAIT", name, ms.as_str()]).await? {
            BytesFrame::Integer(hits) => Ok(u64::try_from(hits).unwrap_or(0)),
            other => anyhow::bail!("unexpected reply: {other:?}"),
        }
    }
}

/// Extract the donor error code from a client error, if it carries one.
pub fn remote_code(err: &anyhow::Error) -> Option<&str> {
    err.downcast_ref::<RemoteError>().map(|e| e.code.as_str())
}
