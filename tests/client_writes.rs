use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::init_tracing;
use fixtures::timeout;
use fixtures::RaftRouter;
use maplit::btreeset;
use raftkv::kv::Command;
use raftkv::raft::ClientWriteRequest;
use raftkv::ClientWriteError;
use raftkv::Config;

mod fixtures;

/// A write submitted to a non-leader is refused with a leader hint.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_leader_rejects_write_with_hint() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(config);
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;
    router.new_raft_node(3).await;

    let all = btreeset![1, 2, 3];
    router.initialize_from_single_node(1).await?;
    router.wait_for_log(&all, 1, timeout(), "init").await?;

    let leader = router.leader().expect("expected the cluster to have a leader");
    let follower = all.iter().copied().find(|id| *id != leader).expect("nonempty");

    let cmd = Command::Set {
        key: "city".into(),
        value: "osaka".into(),
    };
    let res = router
        .get_raft_handle(&follower)?
        .client_write(ClientWriteRequest::new(cmd))
        .await;

    match res {
        Err(ClientWriteError::ForwardToLeader(cmd, leader_id, leader_addr)) => {
            assert!(
                matches!(&cmd, Command::Set { key, value } if key == "city" && value == "osaka"),
                "expected the command to be handed back, got {:?}",
                cmd
            );
            assert_eq!(leader_id, Some(leader));
            assert_eq!(leader_addr, Some(RaftRouter::addr_of(leader)));
        }
        other => panic!("expected ForwardToLeader, got {:?}", other),
    }

    Ok(())
}

/// A write whose client gives up waiting still commits and becomes readable.
///
/// The client abandoning the response channel must not abort the proposal:
/// once the entry is in the log its fate is decided by replication alone.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandoned_write_still_commits() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(config);
    router.new_raft_node(1).await;

    router.initialize_from_single_node(1).await?;
    router.wait_for_log(&btreeset![1], 1, timeout(), "init").await?;

    let node = router.get_raft_handle(&1)?;
    let res = tokio::time::timeout(
        Duration::from_millis(0),
        node.client_write(ClientWriteRequest::new(Command::Set {
            key: "city".into(),
            value: "osaka".into(),
        })),
    )
    .await;
    assert!(res.is_err(), "expected the client-side wait to time out");

    // The proposal was already handed to the engine; it commits regardless.
    router.wait_for_log(&btreeset![1], 2, timeout(), "abandoned write").await?;
    let store = router.get_storage_handle(&1)?;
    assert_eq!(store.read("city").await.as_deref(), Some("osaka"));

    Ok(())
}

/// Deletes remove keys across the cluster.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delete_is_replicated() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(config);
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;
    router.new_raft_node(3).await;

    let all = btreeset![1, 2, 3];
    router.initialize_from_single_node(1).await?;
    router.wait_for_log(&all, 1, timeout(), "init").await?;

    let leader = router.leader().expect("expected the cluster to have a leader");
    let node = router.get_raft_handle(&leader)?;

    node.client_write(ClientWriteRequest::new(Command::Set {
        key: "city".into(),
        value: "osaka".into(),
    }))
    .await?;
    node.client_write(ClientWriteRequest::new(Command::Delete { key: "city".into() }))
        .await?;

    router.wait_for_log(&all, 3, timeout(), "set and delete").await?;
    for id in all.iter() {
        let store = router.get_storage_handle(id)?;
        assert_eq!(store.read("city").await, None, "node {} still has the deleted key", id);
    }

    Ok(())
}
