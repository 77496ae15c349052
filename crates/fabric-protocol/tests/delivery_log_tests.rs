use fabric_protocol::DeliveryLog;

#[test]
fn test_first_delivery_is_not_duplicate() {
    let mut log = DeliveryLog::new();
    assert!(!log.check_and_insert("marker-abc"));
}

#[test]
fn test_second_delivery_is_duplicate() {
    let mut log = DeliveryLog::new();
    log.check_and_insert("marker-abc");
    assert!(log.check_and_insert("marker-abc"), "re-delivery should be flagged");
}

#[test]
fn test_expired_marker_is_forgotten() {
    let mut log = DeliveryLog::with_window(60);
    assert!(!log.check_and_insert_at("marker-abc", 1_000));
    assert!(log.check_and_insert_at("marker-abc", 1_030));
    assert!(!log.check_and_insert_at("marker-abc", 1_061), "marker outside window should be new again");
}

#[test]
fn test_distinct_markers_tracked_separately() {
    let mut log = DeliveryLog::new();
    assert!(!log.check_and_insert("m-1"));
    assert!(!log.check_and_insert("m-2"));
    assert!(!log.check_and_insert("m-3"));
    assert_eq!(log.size(), 3);
}
