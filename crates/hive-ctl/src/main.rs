//! hive-ctl: command-line interface for the Hive daemon.

mod cmd;

use anyhow::{Context, Result};

const DEFAULT_PORT: u16 = 9101;

fn print_usage() {
    println!("Usage: hive-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  status                Show node, peers, scheduling and batch progress");
    println!("  submit <file>...      Submit files as a batch of tasks");
    println!("  results               List finished results");
    println!("  download <dir>        Save all finished results into <dir>");
    println!("  shutdown              Stop the daemon");
    println!();
    println!("Options:");
    println!("  --port <port>   API port (default: {})", DEFAULT_PORT);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args
                .get(i)
                .context("--port requires a value")?
                .parse()
                .context("--port must be a number")?;
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => cmd::status::cmd_status(port).await,
        ["submit", files @ ..] if !files.is_empty() => cmd::batch::cmd_submit(port, files).await,
        ["results"] => cmd::batch::cmd_results(port).await,
        ["download", dir] => cmd::batch::cmd_download(port, dir).await,
        ["shutdown"] => cmd::status::cmd_shutdown(port).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
