use fabric_protocol::*;

fn sample_aggregate() -> ResultAggregate {
    let mut agg = ResultAggregate::from_rows(
        NodeId::new("origin"),
        vec![Row::new().with("ID", "svc-1").with("PORT", 8080i64)],
    );
    agg.merge(ResultAggregate::failed(NodeId::new("b"), "table FABRIC.NODES missing"));
    agg
}

#[test]
fn test_partial_result_survives_the_wire() {
    let msg = ProtocolMessage::PartialResult(ResultMessage::new(
        CorrelationId::new("c-42"),
        NodeId::new("b"),
        sample_aggregate(),
    ));
    let decoded = ProtocolMessage::decode(&msg.encode().unwrap()).unwrap();
    assert_eq!(decoded, msg);
    assert_eq!(decoded.action(), ACTION_PARTIAL_RESULT);
}

#[test]
fn test_final_result_keeps_exceptions() {
    let msg = ProtocolMessage::FinalResult(ResultMessage::new(
        CorrelationId::new("c-43"),
        NodeId::new("origin"),
        sample_aggregate(),
    ));
    let decoded = ProtocolMessage::decode(&msg.encode().unwrap()).unwrap();
    match decoded {
        ProtocolMessage::FinalResult(r) => {
            assert!(r.aggregate.local_exception().is_none());
            assert_eq!(r.aggregate.node_exceptions().len(), 1);
            assert_eq!(r.aggregate.row_count(), 1);
        }
        other => panic!("unexpected message {other:?}"),
    }
}

#[test]
fn test_result_without_sender_is_rejected() {
    let raw = serde_json::json!({
        "action": "PARTIAL_RESULT",
        "correlation_id": "c-1",
        "from": "",
        "aggregate": {"node_results": {}}
    });
    let err = ProtocolMessage::decode(&serde_json::to_vec(&raw).unwrap()).unwrap_err();
    assert!(matches!(err, ProtocolError::MissingField("from")));
}

#[test]
fn test_query_missing_budget_is_malformed() {
    let raw = serde_json::json!({
        "action": "QUERY",
        "correlation_id": "c-1",
        "query_text": "SELECT * FROM T",
        "visited_marker": "abc"
    });
    let err = ProtocolMessage::decode(&serde_json::to_vec(&raw).unwrap()).unwrap_err();
    assert!(matches!(err, ProtocolError::Malformed(_)));
}

#[test]
fn test_garbage_bytes_are_malformed() {
    let err = ProtocolMessage::decode(b"not json at all").unwrap_err();
    assert!(matches!(err, ProtocolError::Malformed(_)));
}

#[test]
fn test_aggregate_bytes_keep_rows_and_exceptions() {
    let agg = sample_aggregate();
    let bytes = agg.to_json_bytes().unwrap();
    let decoded = ResultAggregate::from_json_bytes(&bytes).unwrap();
    assert_eq!(decoded, agg);
    assert_eq!(decoded.first_string().as_deref(), Some("svc-1"));
    assert!(decoded.node_exceptions().contains_key(&NodeId::new("b")));

    assert!(ResultAggregate::from_json_bytes(b"not json").is_err());
}
