use std::time::Duration;

use fabric_network::*;
use fabric_protocol::*;

fn query_from(origin: &str, id: &str) -> ProtocolMessage {
    ProtocolMessage::Query(QueryMessage::originate(
        &NodeId::new(origin),
        CorrelationId::new(id),
        "SELECT * FROM T",
        1_000,
        100,
    ))
}

#[tokio::test]
async fn test_delayed_frames_still_arrive() {
    let mesh = LocalMesh::with_options(MeshOptions { latency_ms: Some((1, 20)) });
    let (a, _ai) = mesh.join(NodeId::new("a")).unwrap();
    let (_b, mut bi) = mesh.join(NodeId::new("b")).unwrap();

    for i in 0..10 {
        a.send(&NodeId::new("b"), &query_from("a", &format!("c-{i}"))).unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..10 {
        let frame = tokio::time::timeout(Duration::from_secs(2), bi.commands.recv())
            .await
            .expect("frame should arrive")
            .expect("inbox open");
        seen.push(ProtocolMessage::decode(&frame.data).unwrap().correlation_id().to_string());
    }
    seen.sort();
    assert_eq!(seen.len(), 10);
    assert_eq!(seen[0], "c-0");
}

#[tokio::test]
async fn test_custom_topics_are_used() {
    let mesh = LocalMesh::new();
    let (a, mut ai) = mesh
        .join_with_topics(NodeId::new("a"), "cmd/a".into(), "res/a".into(), 60)
        .unwrap();
    a.send(&NodeId::new("a"), &query_from("a", "c-1")).unwrap();
    assert_eq!(ai.commands.recv().await.unwrap().topic, "cmd/a");
}

#[test]
fn test_trace_counts_only_delivered_frames() {
    let mesh = LocalMesh::new();
    let (a, _ai) = mesh.join(NodeId::new("a")).unwrap();
    let (_b, _bi) = mesh.join(NodeId::new("b")).unwrap();
    let (_c, _ci) = mesh.join(NodeId::new("c")).unwrap();
    mesh.set_unreachable(&NodeId::new("c"), true);

    a.send(&NodeId::new("b"), &query_from("a", "c-9")).unwrap();
    assert!(a.send(&NodeId::new("c"), &query_from("a", "c-9")).is_err());

    assert_eq!(mesh.count_sent(&NodeId::new("a"), ACTION_QUERY, "c-9"), 1);
    assert_eq!(mesh.trace().len(), 2);
    assert_eq!(mesh.members().len(), 3);
}
