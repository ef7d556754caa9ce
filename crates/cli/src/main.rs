// Adaptive pool CLI
//
// Design Decision: Use clap derive for argument parsing, with env fallbacks matching PoolSettings::from_env.
// Design Decision: Support text/json output formats for scripting.
// Design Decision: Logs go to stderr so json output on stdout stays parseable.

mod commands;
mod output;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "adaptive-pool")]
#[command(about = "Drive synthetic load through a CPU-aware adaptive worker pool")]
#[command(version)]
pub struct Cli {
    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json"])]
    pub output: String,

    /// Suppress the progress bar and non-essential output
    #[arg(long, short)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Push a CPU-bound workload through a pool and report its metrics
    Run(commands::run::RunArgs),

    /// Print raw and smoothed host CPU readings
    Cpu(commands::cpu::CpuArgs),
}

/// Log filter from RUST_LOG, else LOG_LEVEL applied to our crates, else info
fn init_logging() {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .map(|level| format!("adaptive_pool={level},adaptive_pool_cli={level}"))
        })
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new("adaptive_pool=info,adaptive_pool_cli=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env must be loaded before clap reads env fallbacks
    let _ = dotenvy::dotenv();
    init_logging();

    let cli = Cli::parse();
    let output_format = output::OutputFormat::from_str(&cli.output);

    match cli.command {
        Commands::Run(args) => commands::run::run(args, output_format, cli.quiet).await,
        Commands::Cpu(args) => commands::cpu::run(args, output_format).await,
    }
}
