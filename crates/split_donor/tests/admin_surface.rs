//! End-to-end admin surface tests against an embedded donor node.

use std::net::{SocketAddr, TcpListener};
use std::time::Duration;

use split_donor::client::remote_code;
use split_donor::{
    start_embedded_node, AccessState, DonorClient, EmbeddedNodeConfig, SplitState,
};

/// Loopback address for the embedded node, or `None` when binding is not permitted.
fn free_addr(test: &str) -> Option<SocketAddr> {
    match TcpListener::bind("127.0.0.1:0").and_then(|l| l.local_addr()) {
        Ok(addr) => Some(addr),
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping {test}: cannot bind local port ({err})");
            None
        }
        Err(err) => panic!("bind ephemeral port failed: {err}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commit_lifecycle_over_resp() {
    let Some(addr) = free_addr("commit_lifecycle_over_resp") else {
        return;
    };
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = EmbeddedNodeConfig::single_node(addr, dir.path().to_path_buf());
    config.quick_gc = true;
    let node = start_embedded_node(config).await.expect("start node");

    let mut client = DonorClient::connect(addr).await.expect("connect");
    client.ping().await.expect("ping");

    let op = client
        .start(&["acme", "globex"], Some("rs-recipient"))
        .await
        .expect("start");
    assert_eq!(op.state, SplitState::Splitting);
    assert_eq!(op.recipient_set_name.as_deref(), Some("rs-recipient"));

    let err = client
        .start(&["globex", "initech"], None)
        .await
        .expect_err("overlapping start must be refused");
    assert_eq!(remote_code(&err), Some("CONFLICTINGOPERATION"));

    let blocking = client.begin_blocking(op.id).await.expect("block");
    assert_eq!(blocking.state, SplitState::Blocking);
    assert!(blocking.block_op_time.is_some());
    assert_eq!(client.check_tenant("acme").await.expect("check"), "BLOCK");
    assert_eq!(client.check_tenant("initech").await.expect("check"), "ALLOW");

    let blockers = client.blockers().await.expect("blockers");
    assert_eq!(blockers.len(), 2);
    assert!(blockers.iter().all(|b| b.state == AccessState::Block));

    client.commit(op.id).await.expect("commit");
    let decision = client
        .wait(op.id, Duration::from_secs(10))
        .await
        .expect("wait");
    assert_eq!(decision, "committed");

    let err = client
        .check_tenant("acme")
        .await
        .expect_err("committed tenant must be rejected");
    assert_eq!(remote_code(&err), Some("TENANTMIGRATED"));

    let err = client
        .abandon(op.id, "too late")
        .await
        .expect_err("abandon after commit");
    assert_eq!(remote_code(&err), Some("INVALIDSTATE"));

    let forgotten = client.forget(op.id).await.expect("forget");
    assert_eq!(forgotten.state, SplitState::GarbageCollectable);

    // Quick GC deletes the record and lifts the gates shortly after.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match client.status(op.id).await {
            Err(err) if remote_code(&err) == Some("NOSUCHOPERATION") => break,
            Ok(_) | Err(_) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            other => panic!("operation was not collected: {other:?}"),
        }
    }
    assert_eq!(client.check_tenant("acme").await.expect("check"), "ALLOW");
    assert!(client.blockers().await.expect("blockers").is_empty());

    let again = client.start(&["acme"], None).await.expect("restart split");
    assert_eq!(again.state, SplitState::Splitting);

    drop(client);
    node.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_and_wait_errors_over_resp() {
    let Some(addr) = free_addr("abort_and_wait_errors_over_resp") else {
        return;
    };
    let dir = tempfile::tempdir().expect("tempdir");
    let node = start_embedded_node(EmbeddedNodeConfig::single_node(addr, dir.path().to_path_buf()))
        .await
        .expect("start node");

    let mut client = DonorClient::connect(addr).await.expect("connect");
    let op = client.start(&["acme"], None).await.expect("start");

    let err = client
        .wait(op.id, Duration::from_millis(100))
        .await
        .expect_err("undecided wait must time out");
    assert_eq!(remote_code(&err), Some("OPERATIONTIMEDOUT"));

    let err = client
        .decide_commit(op.id)
        .await
        .expect_err("decide before blocking");
    assert_eq!(remote_code(&err), Some("INVALIDSTATE"));

    client.begin_blocking(op.id).await.expect("block");
    let aborted = client
        .decide_abort(op.id, "recipient unreachable")
        .await
        .expect("abort");
    assert_eq!(aborted.state, SplitState::Aborted);
    assert_eq!(
        aborted.abort_reason.map(|r| r.message),
        Some("recipient unreachable".to_string())
    );
    assert_eq!(
        client.wait(op.id, Duration::from_secs(1)).await.expect("wait"),
        "aborted"
    );
    assert_eq!(client.check_tenant("acme").await.expect("check"), "ALLOW");

    let err = client
        .check_tenant("bad tenant!")
        .await
        .expect_err("invalid tenant id");
    assert_eq!(remote_code(&err), Some("BADVALUE"));

    let err = client
        .command(&["SPLIT.NOPE"])
        .await
        .expect_err("unknown command");
    assert_eq!(remote_code(&err), Some("ERR"));

    let listed = client.list().await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, op.id);

    drop(client);
    node.shutdown().await.expect("shutdown");
}
