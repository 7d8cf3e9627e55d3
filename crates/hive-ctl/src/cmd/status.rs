//! Mesh status and shutdown commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json, post_json};

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatusResponse {
    self_id: Option<String>,
    nodes: Vec<NodeInfo>,
    batch: BatchInfo,
    transfers_in_flight: usize,
}

#[derive(Deserialize)]
struct NodeInfo {
    id: String,
    is_self: bool,
    connection: Option<ConnectionInfo>,
    module: ModuleInfo,
    scheduling: Option<SchedulingInfo>,
    assigned: usize,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct ConnectionInfo {
    signaling: String,
    connection: String,
    speed: Option<f64>,
}

#[derive(Deserialize)]
struct ModuleInfo {
    queued: u64,
    complete: u64,
    benchmark: f64,
}

#[derive(Deserialize)]
struct SchedulingInfo {
    deviation: f64,
    threshold: i64,
}

#[derive(Deserialize)]
struct BatchInfo {
    total: usize,
    complete: usize,
    assigned: usize,
    pending: usize,
    abandoned: usize,
    elapsed_ms: u64,
    finished: bool,
}

fn short(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Hive Node Status");
    println!("═══════════════════════════════════════");
    println!(
        "  Node id          : {}",
        resp.self_id.as_deref().unwrap_or("(awaiting identity)")
    );
    println!("  Known nodes      : {}", resp.nodes.len());
    println!("  Transfers active : {}", resp.transfers_in_flight);

    let b = &resp.batch;
    if b.total == 0 {
        println!("\n  No batch submitted.");
    } else {
        let state = if b.finished { "finished" } else { "running" };
        println!("\n  Batch ({}):", state);
        println!("    tasks     : {}", b.total);
        println!("    complete  : {}", b.complete);
        println!("    assigned  : {}", b.assigned);
        println!("    pending   : {}", b.pending);
        if b.abandoned > 0 {
            println!("    abandoned : {}", b.abandoned);
        }
        println!("    elapsed   : {:.1}s", b.elapsed_ms as f64 / 1000.0);
    }

    if !resp.nodes.is_empty() {
        println!("\n  Nodes:");
    }
    for n in &resp.nodes {
        let marker = if n.is_self { "★" } else { "·" };
        println!("  ┌─ {} {}", marker, short(&n.id));
        if let Some(c) = &n.connection {
            println!("  │  link      : {}", c.connection);
            match c.speed {
                Some(speed) => println!("  │  speed     : {:.2} MB/s", speed),
                None => println!("  │  speed     : (unmeasured)"),
            }
        }
        println!(
            "  │  module    : {} queued / {} complete",
            n.module.queued, n.module.complete
        );
        println!("  │  benchmark : {:.3}", n.module.benchmark);
        if let Some(s) = &n.scheduling {
            println!(
                "  │  schedule  : deviation {:+.3}, threshold {}",
                s.deviation, s.threshold
            );
        }
        println!("  └─ assigned  : {}", n.assigned);
    }

    Ok(())
}

pub async fn cmd_shutdown(port: u16) -> Result<()> {
    #[derive(Deserialize)]
    struct ShutdownResponse {
        message: String,
    }

    let resp: ShutdownResponse = post_json(&format!("{}/daemon/shutdown", base_url(port))).await?;
    println!("{}", resp.message);
    Ok(())
}
