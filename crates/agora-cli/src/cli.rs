use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "agora",
    about = "Agora: local-first replicated forum store",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

impl Cli {
    /// Log level used when `RUST_LOG` is unset.
    pub fn default_log_level(&self) -> &'static str {
        match (&self.command, self.verbose) {
            (_, true) => "debug",
            (Command::Serve(_), false) => "info",
            _ => "warn",
        }
    }
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the effective configuration
    Config(ConfigArgs),
    /// Run a node with its background workers and the HTTP API
    Serve(ServeArgs),
    /// Replicate random traffic between in-process nodes and check convergence
    Simulate(SimulateArgs),
}

#[derive(Args)]
pub struct ConfigArgs {
    /// TOML configuration file
    #[arg(long)]
    pub path: Option<PathBuf>,
}

#[derive(Args)]
pub struct ServeArgs {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Address of the HTTP API, overriding the configuration
    #[arg(long)]
    pub bind: Option<SocketAddr>,
    /// Directory of the durable entity log, overriding the configuration
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct SimulateArgs {
    #[arg(long, default_value = "3")]
    pub nodes: usize,
    #[arg(long, default_value = "50")]
    pub ops: usize,
    /// Probability of dropping each publish delivery
    #[arg(long, default_value = "0.3")]
    pub loss: f64,
    #[arg(long, default_value = "7")]
    pub seed: u64,
    /// Anti-entropy rounds before giving up
    #[arg(long, default_value = "5")]
    pub rounds: usize,
}
