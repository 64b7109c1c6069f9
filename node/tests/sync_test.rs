//! End-to-end sync tests.
//!
//! Every node runs on an in-memory SQLite database and reaches its peers
//! over the in-memory transport, so these exercise real sessions, real
//! persistence and real batching.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tandem_engine::{
    Entity, HlcTimestamp, HybridClock, ManualTimeSource, Mutation, Operation, Replica,
    VectorSummary, VersionVector,
};
use tandem_node::db::{self, Pool};
use tandem_node::session::{SessionReport, SyncMessage};
use tandem_node::transport::{Connection, FramedConnection, PeerTransport, TransportError};
use tandem_node::{schema, MemoryNetwork, NodeError, SessionConfig, SyncNode};

struct TestNode {
    node: Arc<SyncNode>,
    time: ManualTimeSource,
}

fn session_config() -> SessionConfig {
    SessionConfig {
        timeout: Duration::from_secs(5),
        retries: 2,
        retry_backoff: Duration::from_millis(10),
        batch_size: 2,
    }
}

async fn memory_pool() -> Pool {
    let pool = db::create_pool("sqlite::memory:", 1).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

async fn start(net: &MemoryNetwork, id: &str, now: u64) -> TestNode {
    start_with_pool(net, id, now, memory_pool().await).await
}

async fn start_with_pool(net: &MemoryNetwork, id: &str, now: u64, pool: Pool) -> TestNode {
    let time = ManualTimeSource::new(now);
    let clock = HybridClock::with_source(id, Arc::new(time.clone()));
    let replica = Replica::with_clock(schema::business_schema(), clock);
    let (transport, incoming) = net.join(id);
    let node = SyncNode::open(replica, pool, Arc::new(transport), session_config())
        .await
        .unwrap();
    let node = Arc::new(node);
    tokio::spawn(Arc::clone(&node).serve(incoming));
    TestNode { node, time }
}

async fn sync(a: &TestNode, b: &TestNode) -> SessionReport {
    a.node
        .sync_with_peer(&MemoryNetwork::handle(b.node.node_id()))
        .await
        .unwrap()
}

async fn entity(node: &TestNode, id: &str) -> Entity {
    node.node.get_entity_including_deleted(id).await.unwrap()
}

async fn all_entities(node: &TestNode) -> Vec<Entity> {
    node.node
        .query_entities("employee", |_| true)
        .await
        .unwrap()
}

// ============================================================================
// Reference scenarios
// ============================================================================

#[tokio::test]
async fn later_write_to_same_field_wins_on_both_nodes() {
    let net = MemoryNetwork::new();
    let n1 = start(&net, "n1", 1_000).await;
    let n2 = start(&net, "n2", 1_000).await;

    let ada = n1
        .node
        .create_entity("employee", &json!({"firstName": "Ada"}))
        .await
        .unwrap();
    sync(&n1, &n2).await;

    net.set_online("n2", false);
    n2.time.set(2_000);
    n2.node
        .update_field(&ada.id, "firstName", json!("Adah"))
        .await
        .unwrap();
    net.set_online("n2", true);

    sync(&n2, &n1).await;

    for node in [&n1, &n2] {
        let e = entity(node, &ada.id).await;
        assert_eq!(e.value("firstName"), Some(&json!("Adah")));
    }
    assert_eq!(entity(&n1, &ada.id).await, entity(&n2, &ada.id).await);
}

#[tokio::test]
async fn concurrent_writes_to_different_fields_both_survive() {
    let net = MemoryNetwork::new();
    let n1 = start(&net, "n1", 1_000).await;
    let n2 = start(&net, "n2", 1_000).await;

    let ada = n1
        .node
        .create_entity("employee", &json!({"firstName": "Ada"}))
        .await
        .unwrap();
    sync(&n1, &n2).await;

    n1.time.set(2_000);
    n2.time.set(2_000);
    n1.node
        .update_field(&ada.id, "jobTitle", json!("CTO"))
        .await
        .unwrap();
    n2.node
        .update_field(&ada.id, "department", json!("Engineering"))
        .await
        .unwrap();

    let report = sync(&n1, &n2).await;
    assert_eq!(report.sent, 1);
    assert_eq!(report.applied, 1);

    for node in [&n1, &n2] {
        let e = entity(node, &ada.id).await;
        assert_eq!(e.value("jobTitle"), Some(&json!("CTO")));
        assert_eq!(e.value("department"), Some(&json!("Engineering")));
    }
    assert_eq!(entity(&n1, &ada.id).await, entity(&n2, &ada.id).await);
}

#[tokio::test]
async fn delete_wins_over_later_offline_update() {
    let net = MemoryNetwork::new();
    let n1 = start(&net, "n1", 1_000).await;
    let n2 = start(&net, "n2", 1_000).await;

    let ada = n1
        .node
        .create_entity("employee", &json!({"firstName": "Ada"}))
        .await
        .unwrap();
    sync(&n1, &n2).await;

    net.set_online("n2", false);
    n1.time.set(3_000);
    n1.node.delete_entity(&ada.id).await.unwrap();
    n2.time.set(4_000);
    n2.node
        .update_field(&ada.id, "jobTitle", json!("CTO"))
        .await
        .unwrap();
    net.set_online("n2", true);

    sync(&n1, &n2).await;

    for node in [&n1, &n2] {
        assert!(node.node.get_entity(&ada.id).await.is_none());
        let e = entity(node, &ada.id).await;
        assert!(e.tombstone);
        assert_eq!(e.deleted_at.as_ref().map(|ts| ts.physical_time), Some(3_000));

        // the update is kept in history
        let history = node.node.operations_since(&ada.id, &VersionVector::new()).await;
        assert_eq!(history.len(), 3);
        assert!(history.iter().any(|op| op.origin == "n2"));
    }
    assert_eq!(entity(&n1, &ada.id).await, entity(&n2, &ada.id).await);
}

async fn send(conn: &mut Box<dyn Connection>, msg: SyncMessage) {
    conn.send(msg.encode().unwrap()).await.unwrap();
}

async fn receive(conn: &mut Box<dyn Connection>) -> SyncMessage {
    SyncMessage::decode(&conn.receive().await.unwrap()).unwrap()
}

#[tokio::test]
async fn duplicate_delta_batch_is_fully_rejected() {
    let net = MemoryNetwork::new();
    let a = start(&net, "a", 1_000).await;
    let b = start(&net, "b", 1_000).await;

    let ada = a
        .node
        .create_entity("employee", &json!({"firstName": "Ada"}))
        .await
        .unwrap();
    a.node
        .update_field(&ada.id, "jobTitle", json!("CTO"))
        .await
        .unwrap();
    a.node.add_to_set(&ada.id, "skills", "rust").await.unwrap();
    let ops = a.node.operations_since(&ada.id, &VersionVector::new()).await;
    assert_eq!(ops.len(), 3);

    // Drive a session by hand and deliver the same batch twice.
    let (tester, _incoming) = net.join("tester");
    let mut conn = tester
        .connect(&MemoryNetwork::handle("b"))
        .await
        .unwrap();

    send(
        &mut conn,
        SyncMessage::Hello {
            node_id: "tester".into(),
            clock: HlcTimestamp::new(5_000, 0, "tester"),
            schema_version: 1,
            session_id: "dup-1".into(),
        },
    )
    .await;
    assert!(matches!(receive(&mut conn).await, SyncMessage::Hello { node_id, .. } if node_id == "b"));

    send(&mut conn, SyncMessage::VectorSummary { entities: VectorSummary::new() }).await;
    assert!(matches!(receive(&mut conn).await, SyncMessage::VectorSummary { .. }));

    send(&mut conn, SyncMessage::DeltaRequest { since: VectorSummary::new() }).await;
    assert!(matches!(receive(&mut conn).await, SyncMessage::DeltaRequest { .. }));

    send(
        &mut conn,
        SyncMessage::DeltaBatch {
            sequence: 0,
            operations: ops.clone(),
            last: false,
        },
    )
    .await;
    send(
        &mut conn,
        SyncMessage::DeltaBatch {
            sequence: 1,
            operations: ops.clone(),
            last: true,
        },
    )
    .await;

    match receive(&mut conn).await {
        SyncMessage::DeltaBatch { operations, last, .. } => {
            assert!(operations.is_empty());
            assert!(last);
        }
        other => panic!("expected delta_batch, got {other:?}"),
    }

    send(&mut conn, SyncMessage::Ack { entities: VectorSummary::new() }).await;
    let acked = match receive(&mut conn).await {
        SyncMessage::Ack { entities } => entities,
        other => panic!("expected ack, got {other:?}"),
    };
    assert_eq!(acked.get(&ada.id), Some(&a.node.version_of(&ada.id).await));

    assert_eq!(entity(&b, &ada.id).await, entity(&a, &ada.id).await);
    assert_eq!(b.node.status().await.unwrap().operation_count, 3);
    assert_eq!(db::operation_count(b.node.pool()).await.unwrap(), 3);
    assert_eq!(
        db::load_entity(b.node.pool(), &ada.id).await.unwrap(),
        Some(entity(&b, &ada.id).await)
    );
    assert!(db::load_cursor(b.node.pool(), "tester").await.unwrap().is_some());

    // A third delivery straight into the merge path changes nothing.
    let before = entity(&b, &ada.id).await;
    let outcome = b.node.merge_remote_batch(ops).await.unwrap();
    assert_eq!(outcome.applied_count(), 0);
    assert_eq!(outcome.rejected_count(), 3);
    assert_eq!(outcome.malformed_count(), 0);
    assert_eq!(entity(&b, &ada.id).await, before);
}

#[tokio::test]
async fn dropped_connection_keeps_merged_batches_but_no_cursor() {
    let net = MemoryNetwork::new();
    let a = start(&net, "a", 1_000).await;
    let b = start(&net, "b", 1_000).await;

    let ada = a
        .node
        .create_entity("employee", &json!({"firstName": "Ada"}))
        .await
        .unwrap();
    a.node
        .update_field(&ada.id, "jobTitle", json!("CTO"))
        .await
        .unwrap();
    let ops = a.node.operations_since(&ada.id, &VersionVector::new()).await;

    // Wire a connection straight into b so the session outcome is visible.
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let inbound = FramedConnection::new(remote, "memory://tester");
    let responder = tokio::spawn({
        let node = Arc::clone(&b.node);
        async move { node.accept(Box::new(inbound)).await }
    });
    let mut conn: Box<dyn Connection> = Box::new(FramedConnection::new(local, "memory://b"));

    send(
        &mut conn,
        SyncMessage::Hello {
            node_id: "tester".into(),
            clock: HlcTimestamp::new(5_000, 0, "tester"),
            schema_version: 1,
            session_id: "drop-1".into(),
        },
    )
    .await;
    assert!(matches!(receive(&mut conn).await, SyncMessage::Hello { .. }));
    send(&mut conn, SyncMessage::VectorSummary { entities: VectorSummary::new() }).await;
    assert!(matches!(receive(&mut conn).await, SyncMessage::VectorSummary { .. }));
    send(&mut conn, SyncMessage::DeltaRequest { since: VectorSummary::new() }).await;
    assert!(matches!(receive(&mut conn).await, SyncMessage::DeltaRequest { .. }));

    send(
        &mut conn,
        SyncMessage::DeltaBatch {
            sequence: 0,
            operations: ops,
            last: false,
        },
    )
    .await;
    conn.disconnect().await;

    let result = tokio::time::timeout(Duration::from_secs(5), responder)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(NodeError::Transport(_))));
    assert_eq!(b.node.sessions().session_count(), 0);

    // The applied batch survives the abort, the cursor does not appear.
    assert_eq!(entity(&b, &ada.id).await, entity(&a, &ada.id).await);
    assert_eq!(db::operation_count(b.node.pool()).await.unwrap(), 2);
    assert!(db::load_cursor(b.node.pool(), "tester").await.unwrap().is_none());

    // The next full session converges and settles.
    a.time.advance(10);
    a.node.add_to_set(&ada.id, "skills", "rust").await.unwrap();
    let report = sync(&a, &b).await;
    assert_eq!(report.sent, 1);
    assert_eq!(entity(&b, &ada.id).await, entity(&a, &ada.id).await);
    assert!(db::load_cursor(b.node.pool(), "a").await.unwrap().is_some());
    assert!(db::load_cursor(b.node.pool(), "tester").await.unwrap().is_none());
}

#[tokio::test]
async fn batch_retyping_a_new_entity_is_not_persisted() {
    let pool = memory_pool().await;
    {
        let net = MemoryNetwork::new();
        let b = start_with_pool(&net, "b", 1_000, pool.clone()).await;
        let ops = vec![
            Operation::new("employee", "x", Mutation::Delete, HlcTimestamp::new(10, 0, "p"), 1),
            Operation::new("invoice", "x", Mutation::Delete, HlcTimestamp::new(11, 0, "p"), 2),
        ];

        let outcome = b.node.merge_remote_batch(ops).await.unwrap();
        assert_eq!(outcome.applied_count(), 1);
        assert_eq!(outcome.malformed_count(), 1);
        assert_eq!(db::operation_count(b.node.pool()).await.unwrap(), 1);
        assert_eq!(b.node.status().await.unwrap().operation_count, 1);
    }

    let net = MemoryNetwork::new();
    let b = start_with_pool(&net, "b", 1_000, pool).await;
    let x = entity(&b, "x").await;
    assert_eq!(x.entity_type, "employee");
    assert_eq!(b.node.version_of("x").await.get("p"), 1);
    assert_eq!(db::operation_count(b.node.pool()).await.unwrap(), 1);
}

async fn three_way(order: [(usize, usize); 3]) -> Vec<Vec<Entity>> {
    let net = MemoryNetwork::new();
    let nodes = [
        start(&net, "n1", 1_000).await,
        start(&net, "n2", 1_000).await,
        start(&net, "n3", 1_000).await,
    ];

    let ada = nodes[0]
        .node
        .create_entity("employee", &json!({"firstName": "Ada"}))
        .await
        .unwrap();
    sync(&nodes[0], &nodes[1]).await;
    sync(&nodes[0], &nodes[2]).await;

    nodes[0].time.set(2_000);
    nodes[1].time.set(2_100);
    nodes[2].time.set(2_200);
    nodes[0]
        .node
        .update_field(&ada.id, "jobTitle", json!("CTO"))
        .await
        .unwrap();
    nodes[1]
        .node
        .update_field(&ada.id, "department", json!("Engineering"))
        .await
        .unwrap();
    nodes[2]
        .node
        .update_field(&ada.id, "jobTitle", json!("VP Engineering"))
        .await
        .unwrap();

    for (from, to) in order {
        sync(&nodes[from], &nodes[to]).await;
    }

    let mut states = Vec::new();
    for node in &nodes {
        states.push(all_entities(node).await);
    }
    states
}

#[tokio::test]
async fn pairwise_sync_order_does_not_change_final_state() {
    let first = three_way([(0, 1), (1, 2), (2, 0)]).await;
    let second = three_way([(0, 2), (2, 1), (1, 0)]).await;

    assert_eq!(first[0], first[1]);
    assert_eq!(first[1], first[2]);
    assert_eq!(second[0], second[1]);
    assert_eq!(second[1], second[2]);
    assert_eq!(first[0], second[0]);

    let e = &first[0][0];
    assert_eq!(e.value("jobTitle"), Some(&json!("VP Engineering")));
    assert_eq!(e.value("department"), Some(&json!("Engineering")));
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn second_sync_takes_cursor_fast_path() {
    let net = MemoryNetwork::new();
    let a = start(&net, "a", 1_000).await;
    let b = start(&net, "b", 1_000).await;

    for name in ["Ada", "Grace", "Edsger"] {
        a.node
            .create_entity("employee", &json!({"firstName": name}))
            .await
            .unwrap();
    }
    b.node
        .create_entity("invoice", &json!({"number": "INV-1"}))
        .await
        .unwrap();

    let first = sync(&a, &b).await;
    assert!(!first.fast_path);
    assert_eq!(first.sent, 3);
    assert_eq!(first.applied, 1);
    assert_eq!(a.node.version_summary().await, b.node.version_summary().await);

    let second = sync(&a, &b).await;
    assert!(second.fast_path);
    assert_eq!(second.sent, 0);
    assert_eq!(second.applied, 0);

    a.time.advance(10);
    a.node
        .create_entity("employee", &json!({"firstName": "Barbara"}))
        .await
        .unwrap();
    let third = sync(&b, &a).await;
    assert!(!third.fast_path);
    assert_eq!(third.applied, 1);
    assert_eq!(b.node.status().await.unwrap().entity_count, 5);

    let cursor = db::load_cursor(a.node.pool(), "b").await.unwrap().unwrap();
    assert!(cursor.is_settled());
    assert_eq!(cursor.session_id, third.session_id);
}

#[tokio::test]
async fn unreachable_peer_is_retried_then_reported() {
    let net = MemoryNetwork::new();
    let a = start(&net, "a", 1_000).await;
    let _b = start(&net, "b", 1_000).await;
    net.set_online("b", false);

    let started = Instant::now();
    let err = a
        .node
        .sync_with_peer(&MemoryNetwork::handle("b"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        NodeError::Transport(TransportError::Unreachable(ref peer)) if peer == "b"
    ));
    // two retries after the first attempt: 10ms then 20ms
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(a.node.sessions().session_count(), 0);
    assert!(db::load_cursor(a.node.pool(), "b").await.unwrap().is_none());

    net.set_online("b", true);
    let report = a
        .node
        .sync_with_peer(&MemoryNetwork::handle("b"))
        .await
        .unwrap();
    assert_eq!(report.peer, "b");
}

#[tokio::test]
async fn sync_all_reaches_every_peer() {
    let net = MemoryNetwork::new();
    let nodes = [
        start(&net, "a", 1_000).await,
        start(&net, "b", 1_000).await,
        start(&net, "c", 1_000).await,
    ];
    for (i, node) in nodes.iter().enumerate() {
        node.node
            .create_entity("employee", &json!({"firstName": format!("worker {i}")}))
            .await
            .unwrap();
    }

    let results = nodes[0].node.sync_all().await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, r)| r.is_ok()));
    assert_eq!(all_entities(&nodes[0]).await.len(), 3);

    for node in &nodes[1..] {
        for (_, result) in node.node.sync_all().await.unwrap() {
            result.unwrap();
        }
    }
    let expected = all_entities(&nodes[0]).await;
    for node in &nodes {
        assert_eq!(all_entities(node).await, expected);
    }
}

#[tokio::test]
async fn mismatched_schema_aborts_session() {
    let net = MemoryNetwork::new();
    let a = start(&net, "a", 1_000).await;

    let time = ManualTimeSource::new(1_000);
    let mut other = schema::business_schema();
    other.version = 2;
    let replica = Replica::with_clock(other, HybridClock::with_source("b", Arc::new(time)));
    let (transport, incoming) = net.join("b");
    let b = Arc::new(
        SyncNode::open(replica, memory_pool().await, Arc::new(transport), session_config())
            .await
            .unwrap(),
    );
    tokio::spawn(Arc::clone(&b).serve(incoming));

    let err = a
        .node
        .sync_with_peer(&MemoryNetwork::handle("b"))
        .await
        .unwrap_err();
    assert!(!err.is_transient());
    assert_eq!(a.node.sessions().session_count(), 0);
    assert!(db::load_cursor(a.node.pool(), "b").await.unwrap().is_none());
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn restart_restores_entities_log_and_clock() {
    let pool = memory_pool().await;
    let ada_id;
    let last_clock;
    {
        let net = MemoryNetwork::new();
        let a = start_with_pool(&net, "a", 1_000, pool.clone()).await;
        let ada = a
            .node
            .create_entity("employee", &json!({"firstName": "Ada", "skills": ["math"]}))
            .await
            .unwrap();
        a.node
            .update_field(&ada.id, "jobTitle", json!("Analyst"))
            .await
            .unwrap();
        a.node.add_to_set(&ada.id, "skills", "poetry").await.unwrap();
        ada_id = ada.id;
        last_clock = a.node.clock().await;
    }

    let net = MemoryNetwork::new();
    // wall clock went backwards across the restart
    let a = start_with_pool(&net, "a", 500, pool).await;

    let ada = a.node.get_entity(&ada_id).await.unwrap();
    assert_eq!(ada.value("jobTitle"), Some(&json!("Analyst")));
    let mut skills = ada.set_elements("skills").unwrap();
    skills.sort();
    assert_eq!(skills, vec!["math", "poetry"]);
    assert_eq!(a.node.version_of(&ada_id).await.get("a"), 3);
    assert!(a.node.clock().await >= last_clock);

    let updated = a
        .node
        .update_field(&ada_id, "jobTitle", json!("Lead"))
        .await
        .unwrap();
    assert_eq!(updated.version.get("a"), 4);
    assert!(updated.field_timestamp("jobTitle").unwrap() > &last_clock);
    assert_eq!(db::operation_count(a.node.pool()).await.unwrap(), 4);
}

#[tokio::test]
async fn failed_persistence_leaves_clock_and_vector_untouched() {
    let net = MemoryNetwork::new();
    let a = start(&net, "a", 1_000).await;
    let ada = a
        .node
        .create_entity("employee", &json!({"firstName": "Ada"}))
        .await
        .unwrap();
    let clock = a.node.clock().await;
    let version = a.node.version_of(&ada.id).await;

    a.node.pool().close().await;
    a.time.advance(5);
    let err = a
        .node
        .update_field(&ada.id, "jobTitle", json!("CTO"))
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::Database(_)));

    assert_eq!(a.node.clock().await, clock);
    assert_eq!(a.node.version_of(&ada.id).await, version);
    assert_eq!(a.node.get_entity(&ada.id).await.unwrap().value("jobTitle"), None);
}

#[tokio::test]
async fn query_filters_active_entities_by_type() {
    let net = MemoryNetwork::new();
    let a = start(&net, "a", 1_000).await;
    for (name, dept) in [("Ada", "Eng"), ("Grace", "Eng"), ("Linus", "Ops")] {
        a.node
            .create_entity("employee", &json!({"firstName": name, "department": dept}))
            .await
            .unwrap();
    }
    let grace = a
        .node
        .query_entities("employee", |e| e.value("firstName") == Some(&json!("Grace")))
        .await
        .unwrap()
        .remove(0);
    a.node.delete_entity(&grace.id).await.unwrap();

    let eng = a
        .node
        .query_entities("employee", |e| e.value("department") == Some(&json!("Eng")))
        .await
        .unwrap();
    assert_eq!(eng.len(), 1);
    assert_eq!(eng[0].value("firstName"), Some(&json!("Ada")));

    let err = a.node.query_entities("robot", |_| true).await.unwrap_err();
    assert!(matches!(err, NodeError::Engine(_)));
}
