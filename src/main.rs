//! Meteor CLI
//!
//! Entry point for the `meteor` command-line tool.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use meteor_protocol::{BlockPlan, MAX_BLOCK_SIZE};
use meteor_scheduler::server::{ScriptMapper, ServerConfig};
use meteor_scheduler::ClientConfig;
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "meteor")]
#[command(about = "Round-robin job scheduler tools", version)]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show how a result file would be split into blocks
    Plan {
        /// Length of the result file in bytes
        #[arg(long)]
        length: u64,

        /// Block size the client asks for
        #[arg(long)]
        block_size: i64,

        /// Most blocks the client accepts
        #[arg(long)]
        max_blocks: i64,

        /// Server-side cap on the block size
        #[arg(long, default_value_t = MAX_BLOCK_SIZE)]
        max_block_size: u64,
    },

    /// Rewrite the file paths of a job script for one client
    MapScript {
        /// Script file to map
        file: PathBuf,

        /// Client the script belongs to
        #[arg(long)]
        client_id: String,

        /// Filesystem root (default: the server default)
        #[arg(long)]
        root: Option<String>,
    },

    /// Validate configuration files and print the effective settings
    Config {
        /// Server config file (TOML)
        #[arg(long)]
        server: Option<PathBuf>,

        /// Client config file (TOML)
        #[arg(long)]
        client: Option<PathBuf>,
    },
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.json);

    let result = match cli.command {
        Commands::Plan {
            length,
            block_size,
            max_blocks,
            max_block_size,
        } => run_plan(length, block_size, max_blocks, max_block_size),
        Commands::MapScript { file, client_id, root } => run_map_script(&file, &client_id, root),
        Commands::Config { server, client } => run_config(server, client),
    };

    if let Err(message) = result {
        eprintln!("Error: {}", message);
        process::exit(1);
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value).map_err(|e| format!("serializing output: {}", e))?;
    println!("{}", json);
    Ok(())
}

#[derive(Serialize)]
struct PlanOutput {
    #[serde(flatten)]
    plan: BlockPlan,
    last_block_len: u64,
}

fn run_plan(length: u64, block_size: i64, max_blocks: i64, max_block_size: u64) -> Result<(), String> {
    let plan = BlockPlan::negotiate(length, block_size, max_blocks, max_block_size).map_err(|e| e.to_string())?;
    let last = plan.total_blocks.saturating_sub(1);
    let range = plan.block_range(last);
    debug!(length, block_size, max_blocks, total = plan.total_blocks, "plan negotiated");
    print_json(&PlanOutput {
        plan,
        last_block_len: range.end - range.start,
    })
}

#[derive(Serialize)]
struct MapOutput {
    script: String,
    original_outputs: Vec<String>,
    mapped_outputs: Vec<String>,
}

fn run_map_script(file: &Path, client_id: &str, root: Option<String>) -> Result<(), String> {
    let script = fs::read_to_string(file).map_err(|e| format!("{}: {}", file.display(), e))?;
    let root = root.unwrap_or_else(|| ServerConfig::default().filesystem_root);
    let mapped = ScriptMapper::new(root).map(client_id, &script).map_err(|e| e.to_string())?;
    print_json(&MapOutput {
        script: mapped.script,
        original_outputs: mapped.original_outputs,
        mapped_outputs: mapped.mapped_outputs,
    })
}

#[derive(Serialize)]
struct EffectiveConfig {
    server: ServerConfig,
    client: ClientConfig,
}

fn run_config(server: Option<PathBuf>, client: Option<PathBuf>) -> Result<(), String> {
    let server = match server {
        Some(path) => ServerConfig::from_file(&path).map_err(|e| format!("server config: {}", e))?,
        None => ServerConfig::default(),
    };
    let client = match client {
        Some(path) => ClientConfig::from_file(&path).map_err(|e| format!("client config: {}", e))?,
        None => ClientConfig::default(),
    };
    print_json(&EffectiveConfig { server, client })
}
