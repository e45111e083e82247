//! treesync: inspect a JSON tree fixture through a tree controller.
//!
//! Loads the fixture into the in-memory backend, expands and checks the
//! requested paths, then prints the visible outline and the checked change set.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tree_sync::ControllerConfig;
use tree_sync_cli::{Fixture, Inspector};

#[derive(Parser, Debug)]
#[command(name = "treesync")]
#[command(about = "Inspect a tree fixture through the sync engine")]
struct Args {
    /// Path to the JSON fixture
    #[arg(short, long)]
    fixture: PathBuf,

    /// Directory to expand (relative to the root, repeatable)
    #[arg(short, long)]
    expand: Vec<String>,

    /// Row to check (relative to the root, repeatable)
    #[arg(short, long)]
    check: Vec<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let fixture = Fixture::from_path(&args.fixture)
        .with_context(|| format!("Failed to load fixture {:?}", args.fixture))?;

    // Fixture settings win over the environment
    let config = match fixture.config.clone() {
        Some(config) => config,
        None => ControllerConfig::from_env().context("Invalid controller configuration")?,
    };
    info!("Max displayable children: {}", config.max_displayable_children);

    let inspector = Inspector::load(&fixture, config).await?;
    for path in &args.expand {
        inspector
            .expand(path)
            .await
            .with_context(|| format!("Failed to expand {}", path))?;
    }
    for path in &args.check {
        inspector
            .check(path)
            .await
            .with_context(|| format!("Failed to check {}", path))?;
    }

    let report = inspector.report().await?;
    print!("{}", report.view);
    if fixture.has_checkboxes {
        println!();
        println!("Checked ({}):", report.checked.len());
        for path in &report.checked {
            println!("  {}", path);
        }
    }

    Ok(())
}
