//! Workload generator for exercising the outbox queues against a flaky
//! simulated backend.
//!
//! `run` issues persisted writes through a `Network` whose transport fails,
//! throttles and drops connectivity at seeded rates, reconnects after a short
//! delay, and prints a JSON summary including an ordering check. `inspect`
//! dumps the persisted request log of a data directory.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::time;

use outbox::{
    keys, AlwaysLeader, Election, FileLockElection, FileRequestLog, MemoryRequestLog, MemoryStore,
    Network, Payload, QueueConfig, Request, RequestError, RequestLog, RequestOptions, Response,
    Store, StoreUpdate, Transport,
};

/// Command name used for every generated write.
const WORKLOAD_COMMAND: &str = "WorkloadWrite";

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "outbox-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
    Inspect(InspectArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Number of persisted writes to issue.
    #[arg(long, default_value_t = 100)]
    requests: usize,

    /// Percent of dispatches answered with a retryable server failure.
    #[arg(long, default_value_t = 10)]
    fail_pct: u8,

    /// Percent of dispatches that fail to fetch (connectivity loss).
    #[arg(long, default_value_t = 5)]
    offline_pct: u8,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Directory holding the request log and leader lock.
    #[arg(long, default_value = ".tmp/outbox")]
    data_dir: PathBuf,

    /// Keep the request log in memory instead of under --data-dir.
    #[arg(long, default_value_t = false)]
    in_memory: bool,

    /// Simulated latency of each dispatch.
    #[arg(long, default_value = "1ms")]
    latency: humantime::Duration,

    /// Delay before the simulated client reconnects after going offline.
    #[arg(long, default_value = "20ms")]
    reconnect_after: humantime::Duration,

    /// Give up waiting for the queue after this long.
    #[arg(long, default_value = "60s")]
    timeout: humantime::Duration,

    /// Also write the JSON summary to this path.
    #[arg(long)]
    out: Option<PathBuf>,
}

/// CLI options for dumping a persisted request log.
#[derive(Parser, Debug, Clone)]
struct InspectArgs {
    #[arg(long, default_value = ".tmp/outbox")]
    data_dir: PathBuf,
}

/// Result of one workload run.
#[derive(serde::Serialize, Debug)]
struct Summary {
    seed: u64,
    requests: usize,
    completed: u64,
    failed: u64,
    dispatches: u64,
    retries: u64,
    pauses: u64,
    offline_events: u64,
    final_log_len: usize,
    in_order: bool,
    elapsed_ms: u64,
}

/// Transport answering from a seeded random script.
struct SimulatedTransport {
    /// Tag of the current run; leftovers from earlier runs are not recorded.
    run: u64,
    rng: Mutex<SmallRng>,
    fail_pct: u8,
    offline_pct: u8,
    latency: Duration,
    offline_events: AtomicU64,
    /// Sequence numbers of successful dispatches, in completion order.
    completed: Mutex<Vec<u64>>,
}

impl SimulatedTransport {
    fn new(seed: u64, fail_pct: u8, offline_pct: u8, latency: Duration) -> Self {
        Self {
            run: seed,
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
            fail_pct,
            offline_pct,
            latency,
            offline_events: AtomicU64::new(0),
            completed: Mutex::new(Vec::new()),
        }
    }

    fn roll(&self) -> u32 {
        self.rng.lock().expect("rng lock").gen_range(0..100)
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn dispatch(&self, request: &Request) -> Result<Response, RequestError> {
        if !self.latency.is_zero() {
            time::sleep(self.latency).await;
        }
        let roll = self.roll();
        let offline = u32::from(self.offline_pct);
        if roll < offline {
            self.offline_events.fetch_add(1, Ordering::Relaxed);
            return Err(RequestError::Offline);
        }
        if roll < offline + u32::from(self.fail_pct) {
            return Err(if roll % 2 == 0 {
                RequestError::Throttled
            } else {
                RequestError::ServiceInterrupted { status: 502 }
            });
        }
        let seq = request.payload.get("seq").and_then(|v| v.as_u64()).unwrap_or_default();
        if request.payload.get("run").and_then(|v| v.as_u64()) == Some(self.run) {
            self.completed.lock().expect("completed lock").push(seq);
        }
        Ok(Response::with_updates(vec![StoreUpdate::set(
            "workload_last_seq",
            json!(seq),
        )]))
    }
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,outbox=warn".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
        Command::Inspect(args) => inspect(args).await,
    }
}

/// Drive the queues and print a summary.
async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.fail_pct <= 100, "--fail-pct must be <= 100");
    anyhow::ensure!(args.offline_pct <= 100, "--offline-pct must be <= 100");
    anyhow::ensure!(
        u16::from(args.fail_pct) + u16::from(args.offline_pct) < 100,
        "--fail-pct plus --offline-pct must leave room for successes"
    );

    // Use a random seed when the user provides zero.
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let cfg = QueueConfig::from_env().context("load queue config")?;

    let (log, election): (Arc<dyn RequestLog>, Arc<dyn Election>) = if args.in_memory {
        (Arc::new(MemoryRequestLog::new()), Arc::new(AlwaysLeader))
    } else {
        let log = FileRequestLog::open_dir(&args.data_dir)
            .with_context(|| format!("open request log in {}", args.data_dir.display()))?;
        let election = FileLockElection::new(&args.data_dir)?;
        (Arc::new(log), Arc::new(election))
    };

    let transport = Arc::new(SimulatedTransport::new(
        seed,
        args.fail_pct,
        args.offline_pct,
        args.latency.into(),
    ));
    let store = Arc::new(MemoryStore::new());
    // Updates are only reconciled for an identified session.
    store
        .update(vec![StoreUpdate::set(keys::SESSION, json!({ "accountID": 1 }))])
        .await?;

    let start = time::Instant::now();
    let network = Network::new(cfg, transport.clone(), store.clone(), log.clone(), election);
    let handle = network.start().await;
    if !network.leadership().is_leader() {
        tracing::warn!(
            data_dir = %args.data_dir.display(),
            "another process leads this data directory; writes will wait for it"
        );
    }

    // Reconnect shortly after every simulated connectivity loss.
    let reconnect_after: Duration = args.reconnect_after.into();
    let reconnector = {
        let network = network.clone();
        let mut offline_rx = network.connectivity().subscribe();
        tokio::spawn(async move {
            while offline_rx.changed().await.is_ok() {
                let offline = *offline_rx.borrow_and_update();
                if offline {
                    time::sleep(reconnect_after).await;
                    network.set_is_offline(false, "simulated reconnect").await;
                }
            }
        })
    };

    let mut handles = Vec::with_capacity(args.requests);
    for seq in 0..args.requests {
        let mut payload = Payload::new();
        payload.insert("run".to_string(), json!(seed));
        payload.insert("seq".to_string(), json!(seq));
        handles.push(
            network
                .write(WORKLOAD_COMMAND, payload, RequestOptions::default())
                .await
                .context("queue workload write")?,
        );
    }

    let timeout: Duration = args.timeout.into();
    let mut completed = 0u64;
    let mut failed = 0u64;
    let waited = time::timeout(timeout, async {
        for request in handles {
            let id = request.id();
            match request.wait().await {
                Ok(_) => completed += 1,
                // The leading process dispatches it.
                Err(RequestError::Deferred) => {}
                Err(err) => {
                    tracing::warn!(request = %id, error = %err, "workload write failed");
                    failed += 1;
                }
            }
        }
        network.sequential_queue().wait_for_idle().await;
    })
    .await;
    if waited.is_err() {
        tracing::warn!(timeout_ms = timeout.as_millis() as u64, "timed out waiting for the queue to drain");
    }

    reconnector.abort();
    handle.shutdown();

    let order = transport.completed.lock().expect("completed lock").clone();
    let stats = network.sequential_queue().stats();
    let summary = Summary {
        seed,
        requests: args.requests,
        completed,
        failed,
        dispatches: stats.dispatched,
        retries: stats.retries,
        pauses: stats.pauses,
        offline_events: transport.offline_events.load(Ordering::Relaxed),
        final_log_len: log.len().await.context("read final log length")?,
        in_order: order.windows(2).all(|w| w[0] < w[1]),
        elapsed_ms: start.elapsed().as_millis() as u64,
    };

    let data = serde_json::to_vec_pretty(&summary).context("serialize summary")?;
    if let Some(path) = &args.out {
        write_output(path, &data)?;
        eprintln!("wrote summary: {}", path.display());
    }
    println!("{}", String::from_utf8_lossy(&data));
    anyhow::ensure!(summary.in_order, "persisted requests completed out of order");
    Ok(())
}

/// Print the persisted request log as JSON.
async fn inspect(args: InspectArgs) -> anyhow::Result<()> {
    let log = FileRequestLog::open_dir(&args.data_dir)
        .with_context(|| format!("open request log in {}", args.data_dir.display()))?;
    let requests = log.read_all().await?;
    let data = serde_json::to_string_pretty(&requests).context("serialize request log")?;
    println!("{data}");
    Ok(())
}

fn write_output(path: &PathBuf, data: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
