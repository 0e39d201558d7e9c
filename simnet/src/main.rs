// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Ledger Network Simulator
//!
//! Entry point for the `ledger-simnet` binary. Parses CLI arguments,
//! initializes logging and metrics, builds a simulated network behind the
//! in-process transport, and drives the ledger client against it.
//!
//! The binary supports three subcommands:
//!
//! - `execute`   : submit signed transactions to flaky consensus nodes
//! - `subscribe` : stream a chunked topic from a mirror that drops out
//! - `version`   : print build version information

mod cli;
mod logging;
mod metrics;
mod sim;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use rand::Rng;
use tokio::signal;
use tokio::sync::mpsc;

use ledger_client::config::SUBMIT_TRANSACTION_METHOD;
use ledger_client::network::LedgerId;
use ledger_client::signing::{Ed25519Signer, Signer};
use ledger_client::subscription::Timestamp;
use ledger_client::transaction::SubmitTransaction;
use ledger_client::transport::{LocalTransport, Transport};
use ledger_client::{
    AccountId, Client, ClientConfig, Endpoint, ErrorKind, SubscriptionError,
    SubscriptionHandlers, TopicId, TopicMessage, TopicQuery,
};

use cli::{Commands, CommonArgs, SimnetCli};
use metrics::SimMetrics;
use sim::{Faults, SimMirror, SimNode, TopicLog};

const DEFAULT_LOG_FILTER: &str = "ledger_simnet=info,ledger_client=info";

/// Account number of the first simulated node; the rest follow on.
const FIRST_NODE_ACCOUNT: u64 = 3;

const MIRROR_NAME: &str = "mirror";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = SimnetCli::parse();

    match cli.command {
        Commands::Execute(args) => run_execute(args).await,
        Commands::Subscribe(args) => run_subscribe(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Loads the client configuration named on the command line, or defaults.
fn load_config(common: &CommonArgs) -> Result<ClientConfig> {
    match &common.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("failed to load client config from {}", path.display())),
        None => Ok(ClientConfig::default()),
    }
}

/// Submits signed transactions to a flaky in-process network and reports
/// how each one ended.
async fn run_execute(args: cli::ExecuteArgs) -> Result<()> {
    logging::init_logging(DEFAULT_LOG_FILTER, args.common.log_format);
    anyhow::ensure!(args.nodes > 0, "at least one node is required");
    anyhow::ensure!(args.concurrency > 0, "concurrency must be at least 1");

    let metrics = SimMetrics::new().context("failed to register metrics")?;
    let mut config = load_config(&args.common)?;
    if let Some(max_attempts) = args.max_attempts {
        config.max_attempts = max_attempts;
    }

    // --- Simulated network ---
    let transport = Arc::new(LocalTransport::new());
    let mut rng = sim::rng(args.common.seed);
    let faults = Faults {
        failure_rate: args.failure_rate,
        busy_rate: args.busy_rate,
        max_latency: Duration::from_millis(args.latency_ms),
    };
    config.network.clear();
    for i in 0..args.nodes {
        let name = format!("node-{i}");
        let endpoint = Endpoint::in_process(name.clone());
        let node = SimNode::new(name, faults, rng.gen(), metrics.clone());
        transport.register(&endpoint, Arc::new(node));
        config
            .network
            .insert(endpoint, AccountId::from_num(FIRST_NODE_ACCOUNT + i));
    }

    tracing::info!(
        nodes = args.nodes,
        requests = args.requests,
        failure_rate = args.failure_rate,
        busy_rate = args.busy_rate,
        method = SUBMIT_TRANSACTION_METHOD,
        "starting execute simulation"
    );

    // --- Client ---
    let client = Client::builder(config)
        .ledger(LedgerId::Local)
        .transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .build()
        .context("failed to build client")?;
    let signer: Arc<dyn Signer> = Arc::new(Ed25519Signer::generate());

    // --- Submissions ---
    let started = Instant::now();
    let mut outcomes = futures::stream::iter(0..args.requests)
        .map(|i| {
            let client = client.clone();
            let signer = Arc::clone(&signer);
            let metrics = metrics.clone();
            async move {
                let tx = SubmitTransaction::new(format!("simulated transfer #{i}").into_bytes())
                    .sign_with(signer);
                metrics.requests_total.inc();
                let begun = Instant::now();
                let result = client.execute(&tx).await;
                metrics
                    .request_latency_seconds
                    .observe(begun.elapsed().as_secs_f64());
                (i, result)
            }
        })
        .buffer_unordered(args.concurrency);

    let mut succeeded = 0usize;
    while let Some((i, result)) = outcomes.next().await {
        match result {
            Ok(executed) => {
                succeeded += 1;
                metrics.attempts_total.inc_by(u64::from(executed.attempts));
                metrics.request_outcomes_total.with_label_values(&["ok"]).inc();
                tracing::info!(
                    request = i,
                    node = %executed.node,
                    attempts = executed.attempts,
                    elapsed_ms = executed.elapsed.as_millis() as u64,
                    hash = %&executed.value.transaction_hash[..16],
                    "transaction accepted"
                );
            }
            Err(e) => {
                metrics
                    .request_outcomes_total
                    .with_label_values(&[outcome_label(e.kind())])
                    .inc();
                tracing::warn!(request = i, error = %e, "transaction failed");
            }
        }
    }

    client.close().await;

    println!("Execute simulation finished.");
    println!("  Nodes       : {}", args.nodes);
    println!("  Requests    : {}", args.requests);
    println!("  Succeeded   : {}", succeeded);
    println!("  Failed      : {}", args.requests - succeeded);
    println!("  Wall time   : {:.2?}", started.elapsed());
    println!(
        "  Channels    : {} opened, {} closed",
        transport.opened_channels(),
        transport.closed_channels()
    );

    if args.common.metrics {
        println!();
        print!("{}", metrics.encode().context("failed to encode metrics")?);
    }
    Ok(())
}

/// Streams a chunked topic from a mirror that drops the connection, and
/// prints every reassembled message.
async fn run_subscribe(args: cli::SubscribeArgs) -> Result<()> {
    logging::init_logging(DEFAULT_LOG_FILTER, args.common.log_format);

    let metrics = SimMetrics::new().context("failed to register metrics")?;
    let topic: TopicId = args
        .topic
        .parse()
        .with_context(|| format!("invalid topic id `{}`", args.topic))?;
    let mut config = load_config(&args.common)?;

    // --- Simulated mirror ---
    let log = TopicLog {
        topic,
        messages: args.messages,
        chunk_every: args.chunk_every,
        chunks: args.chunks,
    }
    .generate(Timestamp::now());
    let stream_items = log.len();
    let transport = Arc::new(LocalTransport::new());
    let mirror_endpoint = Endpoint::in_process(MIRROR_NAME);
    transport.register(
        &mirror_endpoint,
        Arc::new(SimMirror::new(
            log,
            args.break_after,
            args.breaks,
            Duration::from_millis(args.interval_ms),
            metrics.clone(),
        )),
    );
    config.mirror_network = vec![mirror_endpoint.to_string()];

    tracing::info!(
        topic = %topic,
        messages = args.messages,
        stream_items,
        break_after = args.break_after,
        breaks = args.breaks,
        "starting subscribe simulation"
    );

    // --- Client ---
    let client = Client::builder(config)
        .ledger(LedgerId::Local)
        .transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .build()
        .context("failed to build client")?;

    // --- Subscription ---
    let (events, mut rx) = mpsc::unbounded_channel();
    let on_error = events.clone();
    let on_complete = events.clone();
    let handlers = SubscriptionHandlers::new(move |message| {
        let _ = events.send(Event::Message(message));
    })
    .on_error(move |err| {
        let _ = on_error.send(Event::Failed(err));
    })
    .on_complete(move || {
        let _ = on_complete.send(Event::Completed);
    });

    let query = TopicQuery::new(topic).with_limit(args.limit);
    let handle = client.subscribe(query, handlers).context("failed to subscribe")?;

    let deadline = tokio::time::sleep(Duration::from_secs(args.timeout_secs));
    tokio::pin!(deadline);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut received = 0u64;
    let result = loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(Event::Message(message)) => {
                    received += 1;
                    metrics.messages_received_total.inc();
                    print_message(&message);
                }
                Some(Event::Completed) => break Ok(()),
                Some(Event::Failed(err)) => {
                    break Err(anyhow::Error::new(err).context("subscription failed"))
                }
                None => {
                    break Err(anyhow::anyhow!("subscription ended without a terminal event"))
                }
            },
            _ = &mut deadline => {
                break Err(anyhow::anyhow!(
                    "subscription did not finish within {}s",
                    args.timeout_secs
                ));
            }
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received, unsubscribing");
                break Ok(());
            }
        }
    };

    handle.unsubscribe();
    client.close().await;

    println!();
    println!("Subscribe simulation finished.");
    println!("  Topic       : {}", topic);
    println!("  Messages    : {} received of {}", received, args.messages);
    println!("  Stream items: {}", stream_items);
    println!("  Breaks      : {}", metrics.stream_breaks_total.get());

    if args.common.metrics {
        println!();
        print!("{}", metrics.encode().context("failed to encode metrics")?);
    }
    result
}

/// What the subscription callbacks hand to the driver loop.
enum Event {
    Message(TopicMessage),
    Completed,
    Failed(SubscriptionError),
}

fn print_message(message: &TopicMessage) {
    println!(
        "#{:<4} {}  chunks={}  {}",
        message.sequence_number,
        message.consensus_timestamp,
        message.chunks,
        String::from_utf8_lossy(&message.contents)
    );
}

/// Label for a failed request in the outcome counter.
fn outcome_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::TransportFailure => "transport_failure",
        ErrorKind::TransientLedgerRejection => "transient_rejection",
        ErrorKind::StaleNodeIdentity => "stale_node_identity",
        ErrorKind::TerminalLedgerRejection => "terminal_rejection",
        ErrorKind::ExhaustedRetries => "exhausted_retries",
        ErrorKind::Timeout => "timeout",
        ErrorKind::InvalidInput => "invalid_input",
        ErrorKind::Codec => "codec",
        ErrorKind::Closed => "closed",
    }
}

/// Prints version information to stdout.
fn print_version() {
    println!("ledger-simnet {}", env!("CARGO_PKG_VERSION"));
    println!("rustc         {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. If a handler cannot be
/// installed, that signal is never reported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
