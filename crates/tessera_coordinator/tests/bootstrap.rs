//! Bootstrap: an empty cluster reaches `Stable` exactly once after the
//! minimum node count registers, with shards dealt evenly.

mod common;

use tessera_common::{ClusterState, ShardId};
use tessera_coordinator::procedure::{Procedure, ScatterProcedure};
use tessera_coordinator::DispatchCall;
use tessera_storage::ProcedureState;

#[tokio::test]
async fn bootstrap_two_nodes_four_shards() {
    let cluster = common::test_cluster(2, 4).await;

    // One node is not enough: the scheduler must not scatter.
    cluster.register_node("node0").await;
    assert_eq!(cluster.scheduler.tick().await.unwrap(), 0);
    assert_eq!(cluster.meta.snapshot().state(), ClusterState::Empty);

    // Quorum reached: one tick submits the scatter.
    cluster.register_node("node1").await;
    assert_eq!(cluster.scheduler.tick().await.unwrap(), 1);
    wait_for_stable(&cluster).await;

    let snapshot = cluster.meta.snapshot();
    assert_eq!(snapshot.state(), ClusterState::Stable);
    let node0_shards = snapshot.topology.shards_on_node("node0");
    let node1_shards = snapshot.topology.shards_on_node("node1");
    assert_eq!(node0_shards.len(), 2);
    assert_eq!(node1_shards.len(), 2);

    // Every shard got an OpenShard on its owner.
    let opens: Vec<(ShardId, String)> = cluster
        .dispatch
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            DispatchCall::OpenShard { endpoint, shard_id } => Some((shard_id, endpoint)),
            _ => None,
        })
        .collect();
    assert_eq!(opens.len(), 4);
    assert_eq!(opens[0], (ShardId(0), "node0".into()));
    assert_eq!(opens[3], (ShardId(3), "node1".into()));

    // Once both nodes advertise their shards, a tick finds nothing to do.
    cluster.advertise_owned("node0").await;
    cluster.advertise_owned("node1").await;
    assert_eq!(cluster.scheduler.tick().await.unwrap(), 0);
}

#[tokio::test]
async fn scatter_happens_exactly_once_under_races() {
    let cluster = common::test_cluster(2, 4).await;
    cluster.register_node("node0").await;
    cluster.register_node("node1").await;

    // Two racing scatters (two ticks firing concurrently): one must win,
    // the other fail on the stale snapshot, and the state transition
    // Empty -> Stable happens once.
    let snapshot = cluster.meta.snapshot();
    let a = ScatterProcedure::new(&snapshot, vec!["node0".into(), "node1".into()]).unwrap();
    let b = ScatterProcedure::new(&snapshot, vec!["node0".into(), "node1".into()]).unwrap();
    let ha = cluster.manager.submit(Procedure::Scatter(a)).await.unwrap();
    let hb = cluster.manager.submit(Procedure::Scatter(b)).await.unwrap();

    let (ra, rb) = tokio::join!(ha.wait(), hb.wait());
    let finished = [ra, rb]
        .iter()
        .filter(|s| **s == ProcedureState::Finished)
        .count();
    assert_eq!(finished, 1, "exactly one scatter may win, got {ra:?}/{rb:?}");
    assert_eq!(cluster.meta.snapshot().state(), ClusterState::Stable);

    // The cluster view went Empty -> Prepare -> Stable: two committed
    // version bumps, no more.
    assert_eq!(cluster.meta.snapshot().topology.cluster_view.version, 2);
}

#[tokio::test]
async fn scatter_remainder_prefers_first_nodes() {
    let cluster = common::test_cluster(2, 3).await;
    cluster.register_node("node0").await;
    cluster.register_node("node1").await;
    assert_eq!(cluster.scheduler.tick().await.unwrap(), 1);
    wait_for_stable(&cluster).await;

    let snapshot = cluster.meta.snapshot();
    assert_eq!(snapshot.topology.shards_on_node("node0").len(), 2);
    assert_eq!(snapshot.topology.shards_on_node("node1").len(), 1);
}

async fn wait_for_stable(cluster: &common::TestCluster) {
    for _ in 0..100 {
        if cluster.meta.snapshot().state() == ClusterState::Stable {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!(
        "cluster never became stable, state: {:?}",
        cluster.meta.snapshot().state()
    );
}
