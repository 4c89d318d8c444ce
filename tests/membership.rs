use std::sync::Arc;

use anyhow::Result;
use fixtures::init_tracing;
use fixtures::timeout;
use fixtures::RaftRouter;
use maplit::btreeset;
use raftkv::Config;
use raftkv::State;

mod fixtures;

/// Growing a cluster from one voter to three.
///
/// - starts a single-node cluster.
/// - adds two learners, then promotes both in one config change.
/// - asserts all three nodes settle on the uniform config and replicate
///   writes.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn grow_cluster_to_three_voters() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(config);
    router.new_raft_node(1).await;

    router.initialize_from_single_node(1).await?;
    router.wait_for_log(&btreeset![1], 1, timeout(), "init").await?;

    tracing::info!("--- adding learners 2 and 3");
    router.new_raft_node(2).await;
    router.new_raft_node(3).await;
    router.add_non_voter(1, 2).await?;
    router.add_non_voter(1, 3).await?;
    router.wait_for_log(&btreeset![2, 3], 1, timeout(), "learners synced").await?;

    tracing::info!("--- promoting to a 3-voter cluster");
    router.change_membership(1, btreeset![1, 2, 3]).await?;

    // Joint config + final config.
    let all = btreeset![1, 2, 3];
    router.wait_for_log(&all, 3, timeout(), "membership change").await?;
    router.wait_for_members(&all, all.clone(), timeout(), "uniform config").await?;
    router.assert_stable_cluster(Some(1), Some(3));

    router.client_request_many(1, "client", 10).await;
    router.wait_for_log(&all, 13, timeout(), "writes after growth").await?;
    for id in all.iter() {
        let store = router.get_storage_handle(id)?;
        assert_eq!(store.read("client-9").await.as_deref(), Some("9"));
    }

    Ok(())
}

/// A leader removed by its own config change steps down.
///
/// - builds a 3-voter cluster.
/// - changes membership to exclude the leader.
/// - asserts the leader demotes itself to non-voter and one of the remaining
///   voters takes over.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_steps_down_when_removed() -> Result<()> {
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
    let rest: std::collections::BTreeSet<_> = all.iter().copied().filter(|id| *id != leader).collect();

    tracing::info!("--- removing leader {} from the config", leader);
    router.change_membership(leader, rest.clone()).await?;

    router.wait_for_state(&btreeset![leader], State::NonVoter, timeout(), "removed leader demoted").await?;
    router
        .wait_for_metrics(
            rest.iter().next().expect("nonempty"),
            |m| m.current_leader.is_some() && m.current_leader != Some(leader),
            timeout(),
            "remaining voters elected a leader",
        )
        .await?;
    router.wait_for_members(&rest, rest.clone(), timeout(), "shrunk config").await?;

    // The shrunk cluster still makes progress.
    let new_leader = router.leader().expect("expected a replacement leader");
    router.client_request_many(new_leader, "after", 5).await;
    let want = router.get_metrics(&new_leader)?.last_log_index;
    for id in rest.iter() {
        router
            .wait_for_metrics(id, |m| m.last_applied >= want, timeout(), "writes replicated")
            .await?;
    }
    for id in rest.iter() {
        let store = router.get_storage_handle(id)?;
        assert_eq!(store.read("after-4").await.as_deref(), Some("4"));
    }

    Ok(())
}

/// Config change guard rails.
///
/// - promoting a node the leader has never seen as a learner is refused.
/// - proposing the current config is a no-op error.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn change_membership_guards() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(config);
    router.new_raft_node(1).await;

    router.initialize_from_single_node(1).await?;
    router.wait_for_log(&btreeset![1], 1, timeout(), "init").await?;

    let res = router.change_membership(1, btreeset![1, 9]).await;
    assert!(
        matches!(res, Err(raftkv::ChangeConfigError::InoperableConfig)),
        "expected InoperableConfig for an unknown member, got {:?}",
        res
    );

    let res = router.change_membership(1, btreeset![1]).await;
    assert!(
        matches!(res, Err(raftkv::ChangeConfigError::Noop)),
        "expected Noop for an unchanged config, got {:?}",
        res
    );

    Ok(())
}
