#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use ember_block::{FileBlockDevice, RamBlockDevice};
use ember_harness::{reference_geometry, run_scenario};
use std::env;
use std::sync::Arc;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("scenario") => scenario(args.get(1).map(String::as_str)),
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn scenario(image: Option<&str>) -> Result<()> {
    let geo = reference_geometry();
    let report = match image {
        Some(path) => {
            let dev = FileBlockDevice::open(path, &geo)
                .with_context(|| format!("failed to open backing image {path}"))?;
            run_scenario(Arc::new(dev), geo)
        }
        None => run_scenario(Arc::new(RamBlockDevice::new(&geo)), geo),
    }
    .context("reference scenario failed")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.reread_matches {
        bail!("read-back mismatch");
    }
    Ok(())
}

fn print_usage() {
    println!("ember-harness: exercise emberfs with the reference driver flow");
    println!();
    println!("usage:");
    println!("  ember-harness scenario [image]   run the driver scenario on a RAM");
    println!("                                   device, or on a file-backed image");
    println!("  ember-harness help               show this message");
}
