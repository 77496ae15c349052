//! End-to-end queries over simulated meshes.

use std::io::Write;
use std::time::Duration;

use fabric_node::*;
use fabric_protocol::*;
use fabric_query::QueryError;

// ─── Helpers ────────────────────────────────────────────────────

/// Mesh file where every node holds one row in table T.
fn mesh_toml(defaults: &str, nodes: &[(&str, &[&str], &str)]) -> String {
    let mut toml = format!("[defaults]\n{defaults}\n");
    for (name, neighbors, extra) in nodes {
        let neighbors: Vec<String> = neighbors.iter().map(|n| format!("\"{n}\"")).collect();
        toml.push_str(&format!(
            "\n[[node]]\nname = \"{name}\"\nneighbors = [{}]\n{extra}\n[node.tables]\nT = [ {{ id = \"{name}-1\" }} ]\n",
            neighbors.join(", ")
        ));
    }
    toml
}

fn start(toml: &str) -> Simulation {
    Simulation::start(MeshConfig::parse(toml).unwrap()).unwrap()
}

fn distributed(timeout_ms: i64, decrement_ms: i64) -> QueryRequest {
    QueryRequest {
        timeout_ms: Some(timeout_ms),
        decrement_ms: Some(decrement_ms),
        scope: QueryScope::Distributed,
    }
}

fn ids(agg: &ResultAggregate) -> Vec<String> {
    let mut ids: Vec<String> = agg.rows().filter_map(|r| r.get_string("id")).collect();
    ids.sort();
    ids
}

fn frames_from(sim: &Simulation, node: &str, action: &str) -> usize {
    sim.mesh()
        .trace()
        .iter()
        .filter(|t| t.from == NodeId::new(node) && t.action == action && t.outcome == "delivered")
        .count()
}

// ─── Scenarios ──────────────────────────────────────────────────

#[tokio::test]
async fn test_line_topology_collects_three_nodes() {
    let sim = start(&mesh_toml(
        "",
        &[("origin", &["b"], ""), ("b", &["origin", "c"], ""), ("c", &["b"], "")],
    ));

    let agg = sim.run("origin", "SELECT * FROM T", distributed(5_000, 200)).await.unwrap();
    assert_eq!(agg.contributor_count(), 3);
    for node in ["origin", "b", "c"] {
        assert_eq!(agg.rows_for(&NodeId::new(node)).map(<[Row]>::len), Some(1), "node {node}");
    }
    assert_eq!(ids(&agg), vec!["b-1", "c-1", "origin-1"]);
    assert_eq!(
        sim.topology().neighbors(&NodeId::new("b")),
        vec![NodeId::new("c"), NodeId::new("origin")]
    );
}

#[tokio::test]
async fn test_isolated_originator_answers_alone() {
    let sim = start(&mesh_toml("", &[("origin", &[], ""), ("b", &[], "")]));

    let agg = sim.run("origin", "SELECT * FROM T", distributed(5_000, 200)).await.unwrap();
    assert_eq!(ids(&agg), vec!["origin-1"]);
    assert_eq!(frames_from(&sim, "origin", ACTION_QUERY), 1);
}

#[tokio::test]
async fn test_unreachable_neighbor_is_skipped_without_timeout() {
    let sim = start(&mesh_toml(
        "",
        &[
            ("origin", &["b", "c"], ""),
            ("b", &["origin"], "unreachable = true"),
            ("c", &["origin"], ""),
        ],
    ));

    let started = std::time::Instant::now();
    let agg = sim.run("origin", "SELECT * FROM T", distributed(10_000, 500)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(ids(&agg), vec!["c-1", "origin-1"]);
    assert!(agg.rows_for(&NodeId::new("b")).is_none());

    let stats = sim.node("origin").unwrap().stats();
    assert_eq!(stats.send_failures, 1);
    assert_eq!(stats.timeouts, 0);
}

#[tokio::test]
async fn test_ring_finalizes_without_timer() {
    let sim = start(&mesh_toml(
        "",
        &[
            ("origin", &["b", "c"], ""),
            ("b", &["origin", "c"], ""),
            ("c", &["origin", "b"], ""),
        ],
    ));

    let agg = tokio::time::timeout(
        Duration::from_secs(5),
        sim.run("origin", "SELECT * FROM T", distributed(10_000, 500)),
    )
    .await
    .expect("ring query must not hang")
    .unwrap();

    assert_eq!(ids(&agg), vec!["b-1", "c-1", "origin-1"]);
    for node in sim.nodes() {
        let stats = node.stats();
        assert_eq!(stats.timeouts, 0, "{} timed out", node.node_id());
        assert_eq!(stats.queries_received, 1, "{} handled twice", node.node_id());
    }
    let duplicates: u64 = sim.nodes().map(|n| n.stats().duplicates_answered).sum();
    assert!(duplicates >= 1);
}

// ─── Properties ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_lossy_link_still_terminates_with_partial_results() {
    let sim = start(&mesh_toml(
        "",
        &[("origin", &["b"], ""), ("b", &["origin", "c"], ""), ("c", &["b"], "lossy = true")],
    ));

    let agg = sim.run("origin", "SELECT * FROM T", distributed(2_000, 200)).await.unwrap();
    assert_eq!(ids(&agg), vec!["b-1", "origin-1"]);
    assert_eq!(sim.node("b").unwrap().stats().timeouts, 1);
    assert_eq!(sim.node("origin").unwrap().stats().timeouts, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_node_answers_upstream_once() {
    let sim = start(&mesh_toml(
        "",
        &[
            ("origin", &["a", "b", "c"], ""),
            ("a", &["origin", "b", "d"], ""),
            ("b", &["origin", "a", "c", "d"], ""),
            ("c", &["origin", "b", "d"], ""),
            ("d", &["a", "b", "c"], ""),
        ],
    ));

    let agg = sim.run("origin", "SELECT * FROM T", distributed(5_000, 100)).await.unwrap();
    assert_eq!(ids(&agg), vec!["a-1", "b-1", "c-1", "d-1", "origin-1"]);

    for node in sim.nodes() {
        let stats = node.stats();
        assert_eq!(stats.finalized, 1, "{} finalized {} times", node.node_id(), stats.finalized);
        assert!(stats.queries_flooded <= 1);
    }
    // One real partial per non-originator, plus one empty reply per duplicate.
    for name in ["a", "b", "c", "d"] {
        let node = sim.node(name).unwrap();
        let partials = frames_from(&sim, name, ACTION_PARTIAL_RESULT) as u64;
        assert_eq!(partials, 1 + node.stats().duplicates_answered, "node {name}");
    }
}

#[tokio::test]
async fn test_exhausted_budget_never_floods() {
    let sim = start(&mesh_toml(
        "",
        &[("origin", &["b"], ""), ("b", &["origin"], "")],
    ));

    let agg = sim.run("origin", "SELECT * FROM T", distributed(300, 200)).await.unwrap();
    assert_eq!(ids(&agg), vec!["origin-1"]);
    assert_eq!(frames_from(&sim, "origin", ACTION_QUERY), 1);
}

#[tokio::test]
async fn test_colocated_child_contributes_no_rows() {
    let sim = start(&mesh_toml(
        "",
        &[
            ("origin", &["b"], "registry_uid = \"shared\""),
            ("b", &["origin", "c"], "registry_uid = \"shared\""),
            ("c", &["b"], "registry_uid = \"other\""),
        ],
    ));

    let agg = sim.run("origin", "SELECT * FROM T", distributed(5_000, 200)).await.unwrap();
    assert_eq!(ids(&agg), vec!["c-1", "origin-1"]);
    assert_eq!(agg.rows_for(&NodeId::new("b")).map(<[Row]>::len), Some(0));
    assert_eq!(sim.node("b").unwrap().stats().local_skips, 1);
}

#[tokio::test]
async fn test_remote_failure_policies() {
    let nodes: &[(&str, &[&str], &str)] = &[
        ("origin", &["b"], ""),
        ("b", &["origin"], "fail_queries = \"disk full\""),
    ];

    let sim = start(&mesh_toml("", nodes));
    let agg = sim.run("origin", "SELECT * FROM T", distributed(5_000, 200)).await.unwrap();
    assert_eq!(ids(&agg), vec!["origin-1"]);
    assert!(agg.node_exceptions().contains_key(&NodeId::new("b")));

    let sim = start(&mesh_toml("remote_failure_policy = \"fail_fast\"", nodes));
    let err = sim
        .run("origin", "SELECT * FROM T", distributed(5_000, 200))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SimulationError::Query(QueryError::RemoteQueryFailure { ref node, .. }) if *node == NodeId::new("b")
    ));
}

#[tokio::test]
async fn test_local_scope_and_disabled_flooding() {
    let nodes: &[(&str, &[&str], &str)] = &[("origin", &["b"], ""), ("b", &["origin"], "")];

    let sim = start(&mesh_toml("", nodes));
    let local = QueryRequest {
        scope: QueryScope::Local,
        ..QueryRequest::default()
    };
    let agg = sim.run("origin", "SELECT * FROM T", local).await.unwrap();
    assert_eq!(ids(&agg), vec!["origin-1"]);
    assert!(sim.mesh().trace().is_empty());

    let sim = start(&mesh_toml("flood_remote_query = false", nodes));
    let agg = sim.run("origin", "SELECT * FROM T", distributed(5_000, 200)).await.unwrap();
    assert_eq!(ids(&agg), vec!["origin-1"]);
    assert_eq!(frames_from(&sim, "origin", ACTION_QUERY), 1);
}

#[tokio::test]
async fn test_unknown_origin_is_an_error() {
    let sim = start(&mesh_toml("", &[("origin", &[], "")]));
    let err = sim.run("nobody", "SELECT * FROM T", QueryRequest::default()).await.unwrap_err();
    assert!(matches!(err, SimulationError::UnknownNode(_)));
}

// ─── Config files ───────────────────────────────────────────────

#[tokio::test]
async fn test_mesh_file_round_trip_through_disk() {
    let toml = mesh_toml(
        "distributed_timeout_ms = 3000\ndistributed_timeout_decrement_ms = 100",
        &[("origin", &["b"], ""), ("b", &["origin"], "")],
    );
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(toml.as_bytes()).unwrap();

    let config = MeshConfig::load(file.path()).unwrap();
    assert_eq!(config.defaults.distributed_timeout_ms, 3000);

    let sim = Simulation::start(config).unwrap();
    let agg = sim.run("origin", "SELECT * FROM T", QueryRequest::default()).await.unwrap();
    assert_eq!(ids(&agg), vec!["b-1", "origin-1"]);
}

#[test]
fn test_missing_mesh_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let err = MeshConfig::load(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn test_node_config_file_loads() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "node_name = \"edge\"\ndistributed_timeout_decrement_ms = 250").unwrap();

    let config = NodeConfig::load(file.path()).unwrap();
    assert_eq!(config.node_name, NodeId::new("edge"));
    assert_eq!(config.engine_config().default_budget_decrement, 250);
    assert_eq!(config.command_topic(), "$fabric/edge/$registry/$command");
}
