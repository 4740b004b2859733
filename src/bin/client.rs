use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use lockd::{wire, LockRequest, LockResponse, LockStatus};
use std::fs;
use std::time::Duration;

const SERVER_CONFIG_FILE: &str = "servers.conf";
const MAX_ATTEMPTS: usize = 10;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(version, about = "Lock manager client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire a named lock and print its fencing token
    Acquire {
        #[arg(short, long)]
        lock: String,

        #[arg(short, long)]
        client: String,

        /// Requested lease in milliseconds (0 = server default)
        #[arg(short, long, default_value = "0")]
        timeout_ms: i64,
    },
    /// Release a held lock
    Release {
        #[arg(short, long)]
        lock: String,

        #[arg(short, long)]
        client: String,

        /// Fencing token printed by acquire
        #[arg(short = 'f', long)]
        token: u64,
    },
    /// Push out the lease of a held lock
    Extend {
        #[arg(short, long)]
        lock: String,

        #[arg(short, long)]
        client: String,

        #[arg(short = 'f', long)]
        token: u64,

        #[arg(short, long, default_value = "0")]
        timeout_ms: i64,
    },
    /// Show who holds a lock
    Check {
        #[arg(short, long)]
        lock: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let request = match cli.command {
        Commands::Acquire {
            lock,
            client,
            timeout_ms,
        } => LockRequest::Acquire {
            lock_id: lock,
            client_id: client,
            timeout_ms,
        },
        Commands::Release {
            lock,
            client,
            token,
        } => LockRequest::Release {
            lock_id: lock,
            client_id: client,
            fencing_token: token,
        },
        Commands::Extend {
            lock,
            client,
            token,
            timeout_ms,
        } => LockRequest::Extend {
            lock_id: lock,
            client_id: client,
            fencing_token: token,
            timeout_ms,
        },
        Commands::Check { lock } => LockRequest::Check { lock_id: lock },
    };

    let servers = load_servers()?;
    println!(
        "Loaded {} servers from '{}'",
        servers.len(),
        SERVER_CONFIG_FILE
    );

    let response = send_to_leader(&servers, &request).await?;
    print_response(&response);
    Ok(())
}

/// Reads server addresses from the config file
fn load_servers() -> Result<Vec<String>> {
    let content = fs::read_to_string(SERVER_CONFIG_FILE)?;
    let servers: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if servers.is_empty() {
        bail!("No servers found in '{}'", SERVER_CONFIG_FILE);
    }
    Ok(servers)
}

/// Walk the server list until one of them answers as the leader. Followers
/// answer NotLeader with a hint; we just move on to the next candidate.
async fn send_to_leader(servers: &[String], request: &LockRequest) -> Result<LockResponse> {
    for attempt in 1..=MAX_ATTEMPTS {
        println!("\nAttempt {} of {}", attempt, MAX_ATTEMPTS);

        for addr in servers {
            println!("  Trying {}...", addr);
            match wire::call::<_, LockResponse>(addr, request, REQUEST_TIMEOUT).await {
                Ok(response) if response.status == LockStatus::NotLeader => {
                    match &response.message {
                        Some(leader) => println!("  {} is not the leader (leader: {})", addr, leader),
                        None => println!("  {} is not the leader (no leader known)", addr),
                    }
                }
                Ok(response) => {
                    println!("  Answered by {}", addr);
                    return Ok(response);
                }
                Err(e) => println!("  Connection failed: {}", e),
            }
        }

        println!("No leader reachable. Waiting 2 seconds before retry...");
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    bail!("No leader answered after {} attempts", MAX_ATTEMPTS);
}

fn print_response(response: &LockResponse) {
    match response.status {
        LockStatus::Ok => {
            println!("OK");
            if let Some(token) = response.fencing_token {
                println!("  fencing_token: {}", token);
            }
            if let Some(expires_at) = response.expires_at {
                println!("  expires_at:    {}", expires_at);
            }
            if let Some(holder) = &response.holder {
                println!("  holder:        {}", holder);
            }
        }
        status => {
            println!("{:?}", status);
            if let Some(holder) = &response.holder {
                println!("  held by: {}", holder);
            }
            if let Some(message) = &response.message {
                println!("  {}", message);
            }
        }
    }
}
