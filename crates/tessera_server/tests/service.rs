//! Service-level behavior across two members sharing one KV: leader
//! gating, election handover, and the end-to-end write path through the
//! service surface.

use std::sync::Arc;
use std::time::Duration;

use tessera_common::config::MetaConfig;
use tessera_common::{ClusterState, MetaError, ShardId};
use tessera_coordinator::{FlowLimiter, MockEventDispatch};
use tessera_meta::CreateClusterOpts;
use tessera_server::member::Member;
use tessera_server::service::MetaService;
use tessera_storage::{KvBackend, MemKv, MetaStorage, NodeStats};

struct TestMember {
    service: Arc<MetaService>,
    member: Arc<Member>,
    dispatch: Arc<MockEventDispatch>,
}

fn build_member(kv: &Arc<MemKv>, addr: &str) -> TestMember {
    let mut config = MetaConfig::default();
    config.server.advertise_addr = addr.to_string();
    config.procedure.retry_backoff_ms = 5;

    let storage = MetaStorage::new(kv.clone() as Arc<dyn KvBackend>, "/tessera");
    let clusters = Arc::new(tessera_meta::ClusterManager::new(storage));
    let member = Member::new(
        kv.clone() as Arc<dyn KvBackend>,
        "/tessera",
        addr,
        Duration::from_millis(500),
    );
    let dispatch = MockEventDispatch::new();
    let limiter = FlowLimiter::new(config.limiter.clone());
    let service = MetaService::new(config, clusters, dispatch.clone(), limiter, member.clone());
    TestMember {
        service,
        member,
        dispatch,
    }
}

async fn elected_leader(kv: &Arc<MemKv>, addr: &str) -> TestMember {
    let m = build_member(kv, addr);
    assert!(m.member.try_campaign().await.unwrap());
    m.service.on_elected().await.unwrap();
    m
}

#[tokio::test]
async fn followers_reject_writes_with_not_leader() {
    let kv = Arc::new(MemKv::new());
    let leader = elected_leader(&kv, "a:8831").await;
    let follower = build_member(&kv, "b:8831");

    leader
        .service
        .create_cluster("c", CreateClusterOpts::default())
        .await
        .unwrap();

    let err = follower
        .service
        .create_cluster("d", CreateClusterOpts::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MetaError::NotLeader { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn create_and_drop_table_through_service() {
    let kv = Arc::new(MemKv::new());
    let leader = elected_leader(&kv, "a:8831").await;
    leader
        .service
        .create_cluster(
            "c",
            CreateClusterOpts {
                min_node_count: 1,
                shard_total: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let meta = leader.service.clusters().get_cluster("c").unwrap();
    meta.register_node("node0", NodeStats::default(), vec![])
        .await
        .unwrap();
    leader.service.scheduler("c").unwrap().tick().await.unwrap();
    for _ in 0..100 {
        if meta.snapshot().state() == ClusterState::Stable {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(meta.snapshot().state(), ClusterState::Stable);

    let table_id = leader
        .service
        .create_table(
            "c",
            "public",
            "cpu",
            None,
            None,
            vec![],
            "timeseries".into(),
            Default::default(),
        )
        .await
        .unwrap();
    let routes = leader
        .service
        .route_tables("c", "public", &["cpu".into()])
        .unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].table.id, table_id);

    leader.service.drop_table("c", "public", "cpu").await.unwrap();
    assert!(leader
        .service
        .route_tables("c", "public", &["cpu".into()])
        .unwrap()
        .is_empty());
    assert!(leader.dispatch.calls_len() >= 3); // opens + create + drop
}

#[tokio::test]
async fn alloc_ids_are_stable_per_name() {
    let kv = Arc::new(MemKv::new());
    let leader = elected_leader(&kv, "a:8831").await;
    leader
        .service
        .create_cluster("c", CreateClusterOpts::default())
        .await
        .unwrap();

    let s1 = leader.service.alloc_schema_id("c", "public").await.unwrap();
    let s2 = leader.service.alloc_schema_id("c", "public").await.unwrap();
    assert_eq!(s1, s2);

    let t1 = leader.service.alloc_table_id("c", "public", "cpu").await.unwrap();
    let t2 = leader.service.alloc_table_id("c", "public", "cpu").await.unwrap();
    assert_eq!(t1, t2);
}

#[tokio::test]
async fn new_leader_resumes_after_old_one_lapses() {
    let kv = Arc::new(MemKv::new());
    let leader = elected_leader(&kv, "a:8831").await;
    leader
        .service
        .create_cluster("c", CreateClusterOpts::default())
        .await
        .unwrap();

    // The old leader lapses (no keep-alive) and a new member takes over.
    leader.service.on_leadership_lost();
    leader.member.resign().await.unwrap();

    let successor = build_member(&kv, "b:8831");
    assert!(successor.member.try_campaign().await.unwrap());
    successor.service.on_elected().await.unwrap();

    // State created by the old leader is visible to the new one.
    let snapshot = successor.service.snapshot("c").unwrap();
    assert_eq!(snapshot.cluster.name, "c");
    assert_eq!(
        snapshot.topology.shard_views.len(),
        CreateClusterOpts::default().shard_total as usize
    );
}

#[tokio::test]
async fn flow_limiter_rejects_when_drained() {
    let kv = Arc::new(MemKv::new());
    let leader = elected_leader(&kv, "a:8831").await;
    leader
        .service
        .create_cluster("c", CreateClusterOpts::default())
        .await
        .unwrap();

    leader
        .service
        .limiter()
        .update(tessera_common::config::FlowLimiterConfig {
            enable: true,
            limit: 0,
            burst: 1,
        });
    assert!(leader.service.limiter().try_acquire());

    // Bucket empty: the next external procedure is turned away.
    let err = leader
        .service
        .transfer_leader("c", ShardId(0), "nowhere")
        .await
        .unwrap_err();
    assert!(matches!(err, MetaError::FlowLimited(_)));

    // Disabling restores admission (the transfer then fails validation,
    // which proves it got past the limiter).
    leader
        .service
        .limiter()
        .update(tessera_common::config::FlowLimiterConfig {
            enable: false,
            limit: 0,
            burst: 1,
        });
    let err = leader
        .service
        .transfer_leader("c", ShardId(0), "nowhere")
        .await
        .unwrap_err();
    assert!(matches!(err, MetaError::NodeNotFound(_)));
}
