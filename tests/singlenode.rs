use std::sync::Arc;

use anyhow::Result;
use fixtures::init_tracing;
use fixtures::timeout;
use fixtures::RaftRouter;
use maplit::btreeset;
use raftkv::Config;
use raftkv::State;

mod fixtures;

/// Single-node cluster bootstrap.
///
/// - brings 1 node online with only knowledge of itself.
/// - asserts that it stays a passive non-voter.
/// - initializes the cluster with a membership of just the one node.
/// - asserts that it becomes leader without an election round trip and
///   commits its initial entry.
/// - writes and reads data through the single node.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(config);
    router.new_raft_node(1).await;

    // The node must stay passive until told otherwise.
    router.wait_for_log(&btreeset![1], 0, timeout(), "empty").await?;
    router.wait_for_state(&btreeset![1], State::NonVoter, timeout(), "empty").await?;

    tracing::info!("--- initializing cluster");
    router.initialize_from_single_node(1).await?;

    // Log 1: the initial config entry committed by the new leader.
    router.wait_for_log(&btreeset![1], 1, timeout(), "init").await?;
    router.assert_stable_cluster(Some(1), Some(1));

    router.client_request_many(1, "client", 100).await;
    router.assert_stable_cluster(Some(1), Some(101));

    // The applied commands are immediately readable.
    let store = router.get_storage_handle(&1)?;
    assert_eq!(store.read("client-0").await.as_deref(), Some("0"));
    assert_eq!(store.read("client-99").await.as_deref(), Some("99"));

    // A read barrier on a single-node cluster resolves locally.
    router.client_read(1).await?;

    Ok(())
}
