use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::init_tracing;
use fixtures::timeout;
use fixtures::RaftRouter;
use maplit::btreeset;
use raftkv::kv::Command;
use raftkv::raft::ClientWriteRequest;
use raftkv::Config;

mod fixtures;

/// Re-election after losing the leader.
///
/// - brings a 3-node cluster online and commits some data.
/// - isolates the leader.
/// - asserts the remaining majority elects a new leader and keeps accepting
///   writes.
/// - restores the old leader and asserts it rejoins as a follower and
///   catches up.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_failover() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(config);
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;
    router.new_raft_node(3).await;

    let all = btreeset![1, 2, 3];

    router.initialize_from_single_node(1).await?;
    router.wait_for_log(&all, 1, timeout(), "init").await?;

    let old_leader = router.leader().expect("expected the cluster to have a leader");
    router.client_request_many(old_leader, "client", 10).await;
    router.wait_for_log(&all, 11, timeout(), "write before failover").await?;

    tracing::info!("--- isolating leader {}", old_leader);
    router.isolate_node(old_leader);

    // The remaining majority must elect a replacement.
    let remaining: Vec<_> = all.iter().copied().filter(|id| *id != old_leader).collect();
    router
        .wait_for_metrics(
            &remaining[0],
            |m| m.current_leader.is_some() && m.current_leader != Some(old_leader),
            timeout(),
            "new leader elected",
        )
        .await?;
    let new_leader = router.leader().expect("expected a new leader after isolation");
    assert_ne!(new_leader, old_leader, "expected a different node to take over");

    // The new leader commits its initial blank entry, then client data.
    router.client_request_many(new_leader, "after", 5).await;
    let committed = 11 + 1 + 5;
    router
        .wait_for_log(&remaining.iter().copied().collect(), committed, timeout(), "write after failover")
        .await?;

    tracing::info!("--- restoring old leader {}", old_leader);
    router.restore_node(old_leader);

    // The old leader must step down to follower and catch up.
    router.wait_for_log(&btreeset![old_leader], committed, timeout(), "old leader catch-up").await?;
    router.assert_stable_cluster(None, Some(committed));

    let store = router.get_storage_handle(&old_leader)?;
    assert_eq!(store.read("after-4").await.as_deref(), Some("4"));

    Ok(())
}

/// A leader partitioned into the minority must not acknowledge writes.
///
/// - isolates the leader of a 3-node cluster.
/// - submits a write to it and asserts the client sees no acknowledgement.
/// - asserts the majority elects a new leader whose state machine never saw
///   the stalled write.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn minority_leader_does_not_commit() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(config);
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;
    router.new_raft_node(3).await;

    let all = btreeset![1, 2, 3];

    router.initialize_from_single_node(1).await?;
    router.wait_for_log(&all, 1, timeout(), "init").await?;

    let old_leader = router.leader().expect("expected the cluster to have a leader");
    router.client_request_many(old_leader, "client", 5).await;
    router.wait_for_log(&all, 6, timeout(), "write before partition").await?;

    tracing::info!("--- isolating leader {}", old_leader);
    router.isolate_node(old_leader);

    // The write reaches the stale leader's log but can never commit, so the
    // client must not get an acknowledgement.
    let stale = router.get_raft_handle(&old_leader)?;
    let pending = tokio::time::timeout(
        Duration::from_millis(500),
        stale.client_write(ClientWriteRequest::new(Command::Set {
            key: "stalled".into(),
            value: "never".into(),
        })),
    )
    .await;
    assert!(pending.is_err(), "expected the write on the minority leader to stall");

    // Meanwhile the majority elects a replacement.
    let remaining: Vec<_> = all.iter().copied().filter(|id| *id != old_leader).collect();
    router
        .wait_for_metrics(
            &remaining[0],
            |m| m.current_leader.is_some() && m.current_leader != Some(old_leader),
            timeout(),
            "new leader elected",
        )
        .await?;
    let new_leader = router.leader().expect("expected a new leader after isolation");

    // The stalled write must not be visible anywhere in the majority.
    let store = router.get_storage_handle(&new_leader)?;
    assert_eq!(store.read("stalled").await, None);

    // Once healed, the old leader discards the uncommitted entry in favor of
    // the new leader's log.
    router.restore_node(old_leader);
    let committed = 6 + 1; // the new leader's initial blank entry
    router
        .wait_for_metrics(
            &old_leader,
            |m| m.last_applied >= committed,
            timeout(),
            "old leader healed",
        )
        .await?;
    let store = router.get_storage_handle(&old_leader)?;
    assert_eq!(store.read("stalled").await, None);

    Ok(())
}
