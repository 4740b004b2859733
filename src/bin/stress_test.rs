//! Stress test for the lock manager.
//!
//! Run examples:
//! # 1000 acquire/release cycles over 10 tasks
//! cargo run --bin stress_test -- -n 1000 -t 10
//!
//! # Heavier contention: 20 tasks fighting over 4 locks
//! cargo run --bin stress_test -- -n 5000 -t 20 --num-locks 4 -v

use anyhow::{bail, Result};
use clap::Parser;
use lockd::{wire, LockRequest, LockResponse, LockStatus};
use std::fs;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Parser, Clone)]
#[command(version, about = "Stress test tool for the distributed lock manager", long_about = None)]
struct Cli {
    /// Number of acquire/release cycles to run
    #[arg(short = 'n', long, default_value = "1000")]
    num_requests: usize,

    /// Number of concurrent tasks
    #[arg(short = 't', long, default_value = "10")]
    num_tasks: usize,

    /// Number of distinct lock ids the tasks contend on
    #[arg(long, default_value = "16")]
    num_locks: usize,

    /// Server configuration file
    #[arg(short = 's', long, default_value = "servers.conf")]
    server_config: String,

    /// Lease requested per acquire (milliseconds)
    #[arg(long, default_value = "5000")]
    lease_ms: i64,

    /// How long to sit on a lock before releasing it (milliseconds)
    #[arg(long, default_value = "0")]
    hold_ms: u64,

    /// Delay between cycles per task (milliseconds)
    #[arg(short = 'd', long, default_value = "0")]
    delay_ms: u64,

    /// Per-request timeout (seconds)
    #[arg(long, default_value = "10")]
    request_timeout: u64,

    /// Enable verbose output
    #[arg(short = 'v', long)]
    verbose: bool,
}

// ============================================================================
// STATISTICS TRACKING
// ============================================================================

#[derive(Debug)]
struct TestStatistics {
    total_requests: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
    already_locked: AtomicUsize,
    not_leader: AtomicUsize,
    timeouts: AtomicUsize,
    quorum_failed: AtomicUsize,
    connection_errors: AtomicUsize,
    other_errors: AtomicUsize,

    total_response_time_ms: AtomicU64,
    min_response_time_ms: AtomicU64,
    max_response_time_ms: AtomicU64,
    response_times: Mutex<Vec<u64>>,

    start_time: Instant,
}

impl TestStatistics {
    fn new() -> Self {
        Self {
            total_requests: AtomicUsize::new(0),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            already_locked: AtomicUsize::new(0),
            not_leader: AtomicUsize::new(0),
            timeouts: AtomicUsize::new(0),
            quorum_failed: AtomicUsize::new(0),
            connection_errors: AtomicUsize::new(0),
            other_errors: AtomicUsize::new(0),
            total_response_time_ms: AtomicU64::new(0),
            min_response_time_ms: AtomicU64::new(u64::MAX),
            max_response_time_ms: AtomicU64::new(0),
            response_times: Mutex::new(Vec::new()),
            start_time: Instant::now(),
        }
    }

    async fn record_latency(&self, elapsed_ms: u64) {
        self.total_response_time_ms
            .fetch_add(elapsed_ms, Ordering::Relaxed);
        self.min_response_time_ms
            .fetch_min(elapsed_ms, Ordering::Relaxed);
        self.max_response_time_ms
            .fetch_max(elapsed_ms, Ordering::Relaxed);
        self.response_times.lock().await.push(elapsed_ms);
    }

    fn record_status(&self, status: LockStatus) {
        match status {
            LockStatus::Ok => {}
            LockStatus::AlreadyLocked => {
                self.already_locked.fetch_add(1, Ordering::Relaxed);
            }
            LockStatus::NotLeader => {
                self.not_leader.fetch_add(1, Ordering::Relaxed);
            }
            LockStatus::Timeout => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            LockStatus::QuorumFailed => {
                self.quorum_failed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.other_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn print_summary(&self) {
        let elapsed = self.start_time.elapsed();
        let total = self.total_requests.load(Ordering::Relaxed);
        let acquired = self.acquired.load(Ordering::Relaxed);

        let mut times = self.response_times.lock().await;
        times.sort_unstable();
        let percentile = |p: f64| -> u64 {
            if times.is_empty() {
                return 0;
            }
            let idx = ((times.len() as f64 * p).ceil() as usize).saturating_sub(1);
            times[idx.min(times.len() - 1)]
        };

        println!("\n========== RESULTS ==========");
        println!("Elapsed:          {:.2}s", elapsed.as_secs_f64());
        println!("Requests:         {}", total);
        println!(
            "Throughput:       {:.1} req/s",
            total as f64 / elapsed.as_secs_f64().max(0.001)
        );
        println!("Acquired:         {}", acquired);
        println!("Released:         {}", self.released.load(Ordering::Relaxed));
        println!(
            "Already locked:   {}",
            self.already_locked.load(Ordering::Relaxed)
        );
        println!("Not leader:       {}", self.not_leader.load(Ordering::Relaxed));
        println!("Timeouts:         {}", self.timeouts.load(Ordering::Relaxed));
        println!(
            "Quorum failed:    {}",
            self.quorum_failed.load(Ordering::Relaxed)
        );
        println!(
            "Connection errors:{}",
            self.connection_errors.load(Ordering::Relaxed)
        );
        println!(
            "Other errors:     {}",
            self.other_errors.load(Ordering::Relaxed)
        );

        if !times.is_empty() {
            let avg = self.total_response_time_ms.load(Ordering::Relaxed) / times.len() as u64;
            println!("\nLatency (ms):");
            println!(
                "  min/avg/max:    {}/{}/{}",
                self.min_response_time_ms.load(Ordering::Relaxed),
                avg,
                self.max_response_time_ms.load(Ordering::Relaxed)
            );
            println!("  p50:            {}", percentile(0.50));
            println!("  p95:            {}", percentile(0.95));
            println!("  p99:            {}", percentile(0.99));
        }
    }
}

// ============================================================================
// WORKLOAD
// ============================================================================

/// One acquire/hold/release cycle. The server walk retargets on NotLeader,
/// so leader failover shows up as redirects rather than failures.
async fn run_cycle(
    cli: &Cli,
    servers: &[String],
    stats: &TestStatistics,
    task_id: usize,
    cycle: usize,
) {
    let lock_id = format!("stress-lock-{}", cycle % cli.num_locks);
    let client_id = format!("stress-client-{}", task_id);
    let deadline = Duration::from_secs(cli.request_timeout);

    let acquire = LockRequest::Acquire {
        lock_id: lock_id.clone(),
        client_id: client_id.clone(),
        timeout_ms: cli.lease_ms,
    };

    stats.total_requests.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let response = call_leader(servers, &acquire, deadline, stats).await;
    stats.record_latency(started.elapsed().as_millis() as u64).await;

    let Some(response) = response else {
        return;
    };
    stats.record_status(response.status);

    if response.status != LockStatus::Ok {
        if cli.verbose {
            println!(
                "[task {}] {} -> {:?} (holder: {:?})",
                task_id, lock_id, response.status, response.holder
            );
        }
        return;
    }

    stats.acquired.fetch_add(1, Ordering::Relaxed);
    let token = response.fencing_token.unwrap_or(0);
    if cli.verbose {
        println!("[task {}] acquired {} (token {})", task_id, lock_id, token);
    }

    if cli.hold_ms > 0 {
        tokio::time::sleep(Duration::from_millis(cli.hold_ms)).await;
    }

    let release = LockRequest::Release {
        lock_id,
        client_id,
        fencing_token: token,
    };
    stats.total_requests.fetch_add(1, Ordering::Relaxed);
    if let Some(response) = call_leader(servers, &release, deadline, stats).await {
        if response.status == LockStatus::Ok {
            stats.released.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.record_status(response.status);
        }
    }
}

/// Try every server once, following NotLeader redirects; count a cycle as a
/// connection error only if nobody answered at all.
async fn call_leader(
    servers: &[String],
    request: &LockRequest,
    deadline: Duration,
    stats: &TestStatistics,
) -> Option<LockResponse> {
    let mut last_not_leader = None;
    for addr in servers {
        match wire::call::<_, LockResponse>(addr, request, deadline).await {
            Ok(response) if response.status == LockStatus::NotLeader => {
                stats.not_leader.fetch_add(1, Ordering::Relaxed);
                last_not_leader = Some(response);
            }
            Ok(response) => return Some(response),
            Err(_) => {}
        }
    }
    if last_not_leader.is_none() {
        stats.connection_errors.fetch_add(1, Ordering::Relaxed);
    }
    last_not_leader
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let content = fs::read_to_string(&cli.server_config)?;
    let servers: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if servers.is_empty() {
        bail!("No servers found in '{}'", cli.server_config);
    }

    println!("========== STRESS TEST ==========");
    println!("Servers:   {:?}", servers);
    println!("Requests:  {}", cli.num_requests);
    println!("Tasks:     {}", cli.num_tasks);
    println!("Locks:     {}", cli.num_locks);

    let stats = Arc::new(TestStatistics::new());
    let cycles_per_task = cli.num_requests / cli.num_tasks.max(1);

    let mut handles = Vec::new();
    for task_id in 0..cli.num_tasks {
        let cli = cli.clone();
        let servers = servers.clone();
        let stats = Arc::clone(&stats);
        handles.push(tokio::spawn(async move {
            for cycle in 0..cycles_per_task {
                run_cycle(&cli, &servers, &stats, task_id, cycle).await;
                if cli.delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(cli.delay_ms)).await;
                }
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    stats.print_summary().await;
    Ok(())
}
