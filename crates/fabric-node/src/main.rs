//! fabric-node: run distributed registry queries over a simulated mesh.
//!
//! Usage:
//!   fabric-node simulate --config mesh.toml --from origin --query "SELECT * FROM SERVICES"
//!   fabric-node check-config --config mesh.toml

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use fabric_node::{logging, MeshConfig, QueryRequest, Simulation};
use fabric_protocol::QueryScope;

#[derive(Parser, Debug)]
#[command(name = "fabric-node")]
#[command(about = "Fabric distributed registry node")]
#[command(version)]
struct Cli {
    /// Log filter used when RUST_LOG is unset (e.g. "debug", "fabric_query=trace").
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start every node of a mesh file and run one query.
    Simulate(SimulateArgs),
    /// Validate a mesh file and print a summary.
    CheckConfig(CheckConfigArgs),
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Mesh file; defaults to <config dir>/fabric-node/mesh.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Node that originates the query.
    #[arg(long)]
    from: String,

    #[arg(long)]
    query: String,

    /// Caller timeout budget in milliseconds.
    #[arg(long)]
    timeout_ms: Option<i64>,

    /// Budget removed per hop in milliseconds.
    #[arg(long)]
    decrement_ms: Option<i64>,

    /// Query only the originating node's store.
    #[arg(long)]
    local: bool,

    /// Print rows as a node-prefixed table instead of JSON.
    #[arg(long)]
    table: bool,

    /// Also print per-node engine counters.
    #[arg(long)]
    stats: bool,
}

#[derive(Parser, Debug)]
struct CheckConfigArgs {
    #[arg(long)]
    config: Option<PathBuf>,
}

fn resolve_config(path: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match path {
        Some(path) => Ok(path),
        None => MeshConfig::default_path().context("No --config given and no config directory found"),
    }
}

fn load_mesh(path: Option<PathBuf>) -> anyhow::Result<MeshConfig> {
    let path = resolve_config(path)?;
    MeshConfig::load(&path).with_context(|| format!("Failed to load mesh config {}", path.display()))
}

async fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let mesh = load_mesh(args.config)?;
    let simulation = Simulation::start(mesh).context("Failed to start simulated mesh")?;

    let request = QueryRequest {
        timeout_ms: args.timeout_ms,
        decrement_ms: args.decrement_ms,
        scope: if args.local {
            QueryScope::Local
        } else {
            QueryScope::Distributed
        },
    };
    let aggregate = simulation
        .run(&args.from, &args.query, request)
        .await
        .with_context(|| format!("Query from {} failed", args.from))?;

    if args.table {
        print!("{aggregate}");
    } else {
        println!("{}", serde_json::to_string_pretty(&aggregate)?);
    }

    if args.stats {
        for node in simulation.nodes() {
            println!(
                "{}\t{}",
                node.node_id(),
                serde_json::to_string(&node.stats())?
            );
        }
    }
    Ok(())
}

fn check_config(args: CheckConfigArgs) -> anyhow::Result<()> {
    let mesh = load_mesh(args.config)?;
    println!(
        "ok: {} nodes, {} links, timeout {} ms, decrement {} ms",
        mesh.nodes.len(),
        mesh.links().len(),
        mesh.defaults.distributed_timeout_ms,
        mesh.defaults.distributed_timeout_decrement_ms
    );
    for node in &mesh.nodes {
        println!(
            "  {}\tneighbors={}\ttables={}",
            node.name,
            node.neighbors.join(","),
            node.tables.keys().cloned().collect::<Vec<_>>().join(",")
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level.as_deref());

    match cli.command {
        Command::Simulate(args) => simulate(args).await,
        Command::CheckConfig(args) => check_config(args),
    }
}
