// SPDX-License-Identifier: Apache-2.0
//! Loom developer CLI: inspect snapshots, list patch logs, replay.

// The CLI is expected to print to stdout/stderr.
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::Table;
use loom_core::{Graph, GraphDto, PatchLog, Resolver};

#[derive(Parser)]
#[command(name = "loom", about = "Loom developer CLI: inspect, verify, replay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Summarize a graph snapshot (CBOR GraphDto).
    Inspect {
        /// Path to the snapshot file.
        snapshot: PathBuf,
        /// Emit the summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List the patches of a log (CBOR PatchLog).
    Log {
        /// Path to the log file.
        log: PathBuf,
    },
    /// Replay a log and report the resulting state hash.
    Replay {
        /// Path to the log file.
        log: PathBuf,
        /// Replay up to this version (defaults to the full log).
        #[arg(long)]
        to: Option<u64>,
    },
}

#[derive(serde::Serialize)]
struct SnapshotSummary {
    nodes: usize,
    edges: usize,
    state_hash: String,
}

fn load_snapshot(path: &Path) -> Result<Graph> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let dto: GraphDto =
        ciborium::de::from_reader(file).with_context(|| format!("decoding {}", path.display()))?;
    let resolver = Resolver::with_builtins();
    Graph::from_dto(&dto, &resolver).context("reconstructing graph")
}

fn load_log(path: &Path) -> Result<PatchLog> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    PatchLog::load(file).with_context(|| format!("decoding {}", path.display()))
}

fn cmd_inspect(path: &Path, json: bool) -> Result<()> {
    let graph = load_snapshot(path)?;
    let summary = SnapshotSummary {
        nodes: graph.node_count(),
        edges: graph.edge_count(),
        state_hash: hex::encode(graph.state_hash()),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    let mut table = Table::new();
    table.set_header(vec!["uid", "label", "tags"]);
    for node in graph.nodes() {
        table.add_row(vec![
            node.uid().short(),
            node.display_name(),
            node.entity
                .tags
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(","),
        ]);
    }
    println!(
        "{} nodes, {} edges, state {}",
        summary.nodes, summary.edges, summary.state_hash
    );
    println!("{table}");
    Ok(())
}

fn cmd_log(path: &Path) -> Result<()> {
    let log = load_log(path)?;
    let mut table = Table::new();
    table.set_header(vec!["#", "tick", "effects", "journal", "io", "digest"]);
    for (idx, patch) in log.patches().iter().enumerate() {
        table.add_row(vec![
            idx.to_string(),
            patch.tick_id.short(),
            patch.effects.len().to_string(),
            patch.journal.len().to_string(),
            patch.io.len().to_string(),
            hex::encode(&patch.digest()[..4]),
        ]);
    }
    let snapshots: Vec<String> = log.snapshot_versions().map(|v| v.to_string()).collect();
    println!(
        "{} patches, snapshots at [{}]",
        log.version(),
        snapshots.join(", ")
    );
    println!("{table}");
    Ok(())
}

fn cmd_replay(path: &Path, to: Option<u64>) -> Result<()> {
    let log = load_log(path)?;
    let resolver = Resolver::with_builtins();
    let version = to.unwrap_or_else(|| log.version());
    let graph = log
        .replay_to(version, &resolver)
        .with_context(|| format!("replaying to version {version}"))?;
    println!(
        "replayed {version} patches: {} nodes, {} edges, state {}",
        graph.node_count(),
        graph.edge_count(),
        hex::encode(graph.state_hash())
    );
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::WARN)
        .init();
    let cli = Cli::parse();
    match cli.command {
        Command::Inspect { snapshot, json } => cmd_inspect(&snapshot, json),
        Command::Log { log } => cmd_log(&log),
        Command::Replay { log, to } => cmd_replay(&log, to),
    }
}
