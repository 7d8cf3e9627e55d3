//! Batch submission and result commands.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::http::{base_url, get_bytes, get_json, post_multipart};

#[derive(Deserialize)]
struct SubmitResponse {
    task_ids: Vec<String>,
    batch_total: usize,
}

#[derive(Deserialize)]
struct ResultsResponse {
    results: Vec<ResultInfo>,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct ResultInfo {
    task_id: String,
    name: String,
    bytes: usize,
    node: String,
    elapsed_ms: u64,
    completed_at: u64,
}

pub async fn cmd_submit(port: u16, paths: &[&str]) -> Result<()> {
    use reqwest::multipart;

    let mut form = multipart::Form::new();
    for path in paths {
        let data =
            std::fs::read(path).with_context(|| format!("failed to read file: {}", path))?;
        let filename = Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        form = form.part("file", multipart::Part::bytes(data).file_name(filename));
    }

    let resp: SubmitResponse =
        post_multipart(&format!("{}/batch", base_url(port)), form).await?;

    println!("Submitted {} task(s), batch now {}:", resp.task_ids.len(), resp.batch_total);
    for (path, id) in paths.iter().zip(&resp.task_ids) {
        println!("  {}  {}", &id[..16.min(id.len())], path);
    }
    Ok(())
}

pub async fn cmd_results(port: u16) -> Result<()> {
    let resp: ResultsResponse = get_json(&format!("{}/results", base_url(port))).await?;

    if resp.results.is_empty() {
        println!("No results yet.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Results ({})", resp.results.len());
    println!("═══════════════════════════════════════");

    for r in &resp.results {
        println!("  ┌─ ✓ {}", r.name);
        println!("  │  task    : {}", &r.task_id[..16.min(r.task_id.len())]);
        println!("  │  node    : {}", &r.node[..8.min(r.node.len())]);
        println!("  │  size    : {} bytes", r.bytes);
        println!("  └─ elapsed : {}ms", r.elapsed_ms);
    }
    Ok(())
}

/// Download every finished result into `dir`.
pub async fn cmd_download(port: u16, dir: &str) -> Result<()> {
    let resp: ResultsResponse = get_json(&format!("{}/results", base_url(port))).await?;
    if resp.results.is_empty() {
        println!("No results yet.");
        return Ok(());
    }

    let dir = Path::new(dir);
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    for r in &resp.results {
        let data = get_bytes(&format!("{}/results/{}", base_url(port), r.task_id)).await?;
        // Distinct tasks may share a file name.
        let target = dir.join(format!("{}-{}", &r.task_id[..8.min(r.task_id.len())], r.name));
        std::fs::write(&target, &data)
            .with_context(|| format!("failed to write {}", target.display()))?;
        println!("  ✓ {}", target.display());
    }
    Ok(())
}
