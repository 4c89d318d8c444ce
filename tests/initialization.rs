use std::sync::Arc;

use anyhow::Result;
use fixtures::init_tracing;
use fixtures::timeout;
use fixtures::RaftRouter;
use maplit::btreeset;
use raftkv::Config;
use raftkv::State;

mod fixtures;

/// Cluster initialization over multiple pristine nodes.
///
/// - brings 3 nodes online, all passive.
/// - initializes the cluster through one of them.
/// - asserts a leader was elected and every node agrees on the initial
///   config entry.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn initialization() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(config);
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;
    router.new_raft_node(3).await;

    let all = btreeset![1, 2, 3];

    router.wait_for_log(&all, 0, timeout(), "empty").await?;
    router.wait_for_state(&all, State::NonVoter, timeout(), "empty").await?;

    tracing::info!("--- initializing cluster");
    router.initialize_from_single_node(1).await?;

    router.wait_for_log(&all, 1, timeout(), "init").await?;
    router.assert_stable_cluster(Some(1), Some(1));

    // Every node must have adopted the full membership with the advertised
    // addresses.
    for id in all.iter() {
        let metrics = router.get_metrics(id)?;
        assert_eq!(metrics.membership_config.members, all);
        for member in all.iter() {
            assert_eq!(
                metrics.membership_config.addr_of(member),
                Some(RaftRouter::addr_of(*member)),
                "node {} is missing the address of {}",
                id,
                member
            );
        }
    }

    // A second init attempt against a settled cluster must be refused.
    let res = router.initialize_from_single_node(2).await;
    assert!(res.is_err(), "expected re-initialization to be rejected");

    Ok(())
}
