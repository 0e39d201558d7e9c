//! # CLI Interface
//!
//! Defines the command-line argument structure for `ledger-simnet` using
//! `clap` derive. Supports three subcommands: `execute`, `subscribe`, and
//! `version`.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// In-process ledger network simulator.
///
/// Spins up simulated consensus and mirror nodes behind the in-process
/// transport and drives the ledger client against them, with faults
/// injected at configurable rates.
#[derive(Parser, Debug)]
#[command(
    name = "ledger-simnet",
    about = "In-process ledger network simulator",
    version,
    propagate_version = true
)]
pub struct SimnetCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the simulator binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit signed transactions to a flaky consensus network.
    Execute(ExecuteArgs),
    /// Stream a topic from a mirror that drops the connection.
    Subscribe(SubscribeArgs),
    /// Print version information and exit.
    Version,
}

/// Flags shared by every simulation.
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Client configuration file (JSON). Defaults apply when omitted.
    #[arg(long, short = 'c', env = "LEDGER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, env = "LEDGER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Seed for fault injection. Random when omitted.
    #[arg(long, env = "LEDGER_SIM_SEED")]
    pub seed: Option<u64>,

    /// Print the Prometheus text exposition after the run.
    #[arg(long, env = "LEDGER_SIM_METRICS")]
    pub metrics: bool,
}

/// Arguments for the `execute` subcommand.
#[derive(Args, Debug)]
pub struct ExecuteArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Number of simulated consensus nodes.
    #[arg(long, short = 'n', env = "LEDGER_SIM_NODES", default_value_t = 6)]
    pub nodes: u64,

    /// Number of transactions to submit.
    #[arg(long, short = 'r', env = "LEDGER_SIM_REQUESTS", default_value_t = 20)]
    pub requests: usize,

    /// Transactions in flight at once.
    #[arg(long, env = "LEDGER_SIM_CONCURRENCY", default_value_t = 4)]
    pub concurrency: usize,

    /// Probability that a node drops a call at the transport level.
    #[arg(long, env = "LEDGER_SIM_FAILURE_RATE", default_value_t = 0.2, value_parser = parse_rate)]
    pub failure_rate: f64,

    /// Probability that a node answers BUSY.
    #[arg(long, env = "LEDGER_SIM_BUSY_RATE", default_value_t = 0.1, value_parser = parse_rate)]
    pub busy_rate: f64,

    /// Upper bound on simulated per-call latency.
    #[arg(long, env = "LEDGER_SIM_LATENCY_MS", default_value_t = 20)]
    pub latency_ms: u64,

    /// Overrides the configured attempt budget.
    #[arg(long, env = "LEDGER_MAX_ATTEMPTS")]
    pub max_attempts: Option<u32>,
}

/// Arguments for the `subscribe` subcommand.
#[derive(Args, Debug)]
pub struct SubscribeArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Topic to stream, as shard.realm.num.
    #[arg(long, env = "LEDGER_SIM_TOPIC", default_value = "0.0.1001")]
    pub topic: String,

    /// Logical messages in the topic log.
    #[arg(long, short = 'm', env = "LEDGER_SIM_MESSAGES", default_value_t = 12)]
    pub messages: u64,

    /// Every n-th message is split into chunks. Zero disables chunking.
    #[arg(long, env = "LEDGER_SIM_CHUNK_EVERY", default_value_t = 4)]
    pub chunk_every: u64,

    /// Chunks per chunked message.
    #[arg(long, env = "LEDGER_SIM_CHUNKS", default_value_t = 3)]
    pub chunks: u32,

    /// Stream items served before the mirror drops the connection.
    #[arg(long, env = "LEDGER_SIM_BREAK_AFTER", default_value_t = 5)]
    pub break_after: usize,

    /// How many times the mirror drops the connection.
    #[arg(long, env = "LEDGER_SIM_BREAKS", default_value_t = 2)]
    pub breaks: u32,

    /// Stream items to deliver in total. Zero streams the whole log.
    #[arg(long, env = "LEDGER_SIM_LIMIT", default_value_t = 0)]
    pub limit: u64,

    /// Delay between stream items.
    #[arg(long, env = "LEDGER_SIM_INTERVAL_MS", default_value_t = 50)]
    pub interval_ms: u64,

    /// Give up if the subscription has not finished after this long.
    #[arg(long, env = "LEDGER_SIM_TIMEOUT_SECS", default_value_t = 60)]
    pub timeout_secs: u64,
}

/// Accepts a probability in `[0, 1]`.
fn parse_rate(raw: &str) -> Result<f64, String> {
    let rate: f64 = raw.parse().map_err(|e| format!("not a number: {e}"))?;
    if (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("{rate} is not between 0 and 1"))
    }
}
