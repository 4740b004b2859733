//! Client-facing lock service. Validates requests, pre-assigns fencing
//! tokens via the Raft node, redirects to the leader, and coordinates the
//! cross-region quorum when peer regions are configured.

use crate::config::NodeConfig;
use crate::raft::{run_raft_listener, Proposal, RaftNode};
use crate::store::{ApplyOutcome, LockStore};
use crate::wire;
use crate::{
    now_millis, LockRequest, LockResponse, LockStatus, RegionDecision, RegionMessage, RegionVote,
    RAFT_PORT_OFFSET, REGION_PORT_OFFSET,
};
use anyhow::Result;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};

/// Longest id accepted for a lock or client.
const MAX_ID_LEN: usize = 512;

/// How long a remembered cross-region Propose stays valid while waiting for
/// the origin's Confirm.
const REGION_GRANT_TTL: Duration = Duration::from_secs(10);

/// A Propose this region voted YES on, kept until the origin confirms or
/// aborts. Confirm messages only carry (lock_id, token), so the holder data
/// lives here in the meantime.
struct RemoteGrant {
    client_id: String,
    origin_region: String,
    fencing_token: u64,
    expires_at: u64,
    recorded: Instant,
}

pub struct LockService {
    pub config: NodeConfig,
    raft: Arc<RaftNode>,
    store: Arc<RwLock<LockStore>>,
    remote_grants: Mutex<HashMap<String, RemoteGrant>>,
}

impl LockService {
    pub fn new(config: NodeConfig, raft: Arc<RaftNode>, store: Arc<RwLock<LockStore>>) -> Self {
        Self {
            config,
            raft,
            store,
            remote_grants: Mutex::new(HashMap::new()),
        }
    }

    pub async fn handle(&self, request: LockRequest) -> LockResponse {
        match request {
            LockRequest::Acquire {
                lock_id,
                client_id,
                timeout_ms,
            } => self.acquire(lock_id, client_id, timeout_ms).await,
            LockRequest::Release {
                lock_id,
                client_id,
                fencing_token,
            } => self.release(lock_id, client_id, fencing_token).await,
            LockRequest::Extend {
                lock_id,
                client_id,
                fencing_token,
                timeout_ms,
            } => {
                self.extend(lock_id, client_id, fencing_token, timeout_ms)
                    .await
            }
            LockRequest::Check { lock_id } => self.check(lock_id).await,
        }
    }

    fn validate_ids(&self, lock_id: &str, client_id: &str) -> Option<LockResponse> {
        if lock_id.is_empty() || lock_id.len() > MAX_ID_LEN {
            return Some(LockResponse::error("invalid lock_id"));
        }
        if client_id.is_empty() || client_id.len() > MAX_ID_LEN {
            return Some(LockResponse::error("invalid client_id"));
        }
        None
    }

    async fn not_leader(&self) -> LockResponse {
        LockResponse::not_leader(self.raft.leader_hint().await)
    }

    fn outcome_to_response(&self, outcome: ApplyOutcome) -> LockResponse {
        match outcome {
            ApplyOutcome::Ok {
                fencing_token,
                expires_at,
            } => LockResponse::granted(fencing_token, expires_at),
            ApplyOutcome::AlreadyLocked { holder } => LockResponse {
                status: LockStatus::AlreadyLocked,
                fencing_token: None,
                expires_at: Some(holder.expires_at),
                holder: Some(holder.holder_client_id),
                message: None,
            },
            ApplyOutcome::NotFound => LockResponse::status(LockStatus::NotFound),
            ApplyOutcome::InvalidToken => LockResponse::status(LockStatus::InvalidToken),
            ApplyOutcome::Expired => LockResponse::status(LockStatus::Expired),
        }
    }

    /// Propose and wait out the commit, mapping the three proposal-level
    /// failures: not leader at propose time, handle dropped (entry was
    /// overwritten by a later leader), and deadline passed before commit.
    async fn propose_and_wait(&self, proposal: Proposal, deadline_ms: u64) -> LockResponse {
        let proposed = match self.raft.propose(proposal).await {
            Ok(proposed) => proposed,
            Err(e) => {
                debug!("[{}] Proposal refused: {}", self.config.node_id, e);
                return self.not_leader().await;
            }
        };

        match tokio::time::timeout(Duration::from_millis(deadline_ms), proposed.rx).await {
            Ok(Ok(outcome)) => self.outcome_to_response(outcome),
            Ok(Err(_)) => {
                // Sender dropped: the appended entry never committed as
                // proposed. Retryable against the new leader.
                self.not_leader().await
            }
            Err(_) => {
                debug!(
                    "[{}] Proposal at index {} not committed in {} ms",
                    self.config.node_id, proposed.index, deadline_ms
                );
                LockResponse::status(LockStatus::Timeout)
            }
        }
    }

    pub async fn acquire(
        &self,
        lock_id: String,
        client_id: String,
        timeout_ms: i64,
    ) -> LockResponse {
        if let Some(reject) = self.validate_ids(&lock_id, &client_id) {
            return reject;
        }
        if !self.raft.is_leader().await {
            return self.not_leader().await;
        }

        let ttl_ms = self.config.clamp_timeout(timeout_ms);
        let response = self
            .propose_and_wait(
                Proposal::Acquire {
                    lock_id: lock_id.clone(),
                    client_id: client_id.clone(),
                    ttl_ms,
                },
                ttl_ms,
            )
            .await;

        if response.status != LockStatus::Ok || self.config.region_peers.is_empty() {
            return response;
        }

        // Locally granted; now the strict majority of regional leaders has to
        // agree before the client may rely on it.
        let fencing_token = response.fencing_token.unwrap_or(0);
        let expires_at = response.expires_at.unwrap_or(0);
        if self
            .cross_region_quorum(&lock_id, &client_id, fencing_token, expires_at)
            .await
        {
            response
        } else {
            warn!(
                "[{}] Cross-region quorum failed for '{}', releasing",
                self.config.node_id, lock_id
            );
            let compensation = self
                .propose_and_wait(
                    Proposal::Release {
                        lock_id: lock_id.clone(),
                        fencing_token,
                    },
                    self.config.lease.default_timeout_ms,
                )
                .await;
            if compensation.status != LockStatus::Ok {
                error!(
                    "[{}] Compensating release of '{}' returned {:?}",
                    self.config.node_id, lock_id, compensation.status
                );
            }
            LockResponse::status(LockStatus::QuorumFailed)
        }
    }

    pub async fn release(
        &self,
        lock_id: String,
        client_id: String,
        fencing_token: u64,
    ) -> LockResponse {
        if let Some(reject) = self.validate_ids(&lock_id, &client_id) {
            return reject;
        }
        if !self.raft.is_leader().await {
            return self.not_leader().await;
        }

        let response = self
            .propose_and_wait(
                Proposal::Release {
                    lock_id: lock_id.clone(),
                    fencing_token,
                },
                self.config.lease.default_timeout_ms,
            )
            .await;

        // The lock is already freed locally; peers only need to drop their
        // advisory copies, and a lost message just means they expire instead.
        if response.status == LockStatus::Ok {
            self.spawn_region_fanout(lock_id, fencing_token, RegionDecision::Abort);
        }
        response
    }

    pub async fn extend(
        &self,
        lock_id: String,
        client_id: String,
        fencing_token: u64,
        timeout_ms: i64,
    ) -> LockResponse {
        if let Some(reject) = self.validate_ids(&lock_id, &client_id) {
            return reject;
        }
        if !self.raft.is_leader().await {
            return self.not_leader().await;
        }

        let ttl_ms = self.config.clamp_timeout(timeout_ms);
        self.propose_and_wait(
            Proposal::Extend {
                lock_id,
                fencing_token,
                ttl_ms,
            },
            ttl_ms,
        )
        .await
    }

    /// Leader-local read. May trail entries committed elsewhere in the group
    /// but not yet applied here; callers retry or use acquire for the
    /// authoritative answer.
    pub async fn check(&self, lock_id: String) -> LockResponse {
        if lock_id.is_empty() || lock_id.len() > MAX_ID_LEN {
            return LockResponse::error("invalid lock_id");
        }
        if !self.raft.is_leader().await {
            return self.not_leader().await;
        }

        let store = self.store.read().await;
        match store.check(&lock_id, now_millis()) {
            Some(lock) => LockResponse {
                status: LockStatus::Ok,
                fencing_token: Some(lock.fencing_token),
                expires_at: Some(lock.expires_at),
                holder: Some(lock.holder_client_id.clone()),
                message: None,
            },
            None => LockResponse::status(LockStatus::NotFound),
        }
    }

    // --- Cross-region protocol, proposer side ---

    /// Two-phase exchange with the other regional leaders. YES votes from a
    /// strict majority (self included) confirm the acquisition; anything
    /// less aborts it.
    async fn cross_region_quorum(
        &self,
        lock_id: &str,
        client_id: &str,
        fencing_token: u64,
        expires_at: u64,
    ) -> bool {
        let total = self.config.region_peers.len() + 1;
        let needed = total / 2 + 1;

        let propose = RegionMessage::Propose {
            lock_id: lock_id.to_string(),
            client_id: client_id.to_string(),
            origin_region: self.config.region_id.clone(),
            fencing_token,
            expires_at,
        };

        let mut tasks = Vec::new();
        for peer in &self.config.region_peers {
            let addr = peer.addr.clone();
            let region = peer.region_id.clone();
            let message = propose.clone();
            let deadline = self.config.rpc_timeout();
            tasks.push(tokio::spawn(async move {
                let resp = wire::call::<_, RegionMessage>(&addr, &message, deadline).await;
                (region, resp)
            }));
        }

        let mut yes_votes = 1; // the local region
        for task in tasks {
            match task.await {
                Ok((region, Ok(RegionMessage::Vote { vote, known_holder }))) => match vote {
                    RegionVote::Yes => {
                        yes_votes += 1;
                        debug!(
                            "[{}] Region {} voted YES for '{}' ({}/{})",
                            self.config.node_id, region, lock_id, yes_votes, needed
                        );
                    }
                    RegionVote::No | RegionVote::Conflict => {
                        info!(
                            "[{}] Region {} voted {:?} for '{}' (holder: {:?})",
                            self.config.node_id, region, vote, lock_id, known_holder
                        );
                    }
                },
                Ok((region, Ok(_))) => {
                    debug!(
                        "[{}] Unexpected cross-region reply from {}",
                        self.config.node_id, region
                    );
                }
                Ok((region, Err(e))) => {
                    debug!(
                        "[{}] Cross-region propose to {} failed: {}",
                        self.config.node_id, region, e
                    );
                }
                Err(e) => warn!("[{}] Region task join error: {}", self.config.node_id, e),
            }
        }

        let reached = yes_votes >= needed;
        let decision = if reached {
            RegionDecision::Commit
        } else {
            RegionDecision::Abort
        };
        self.spawn_region_fanout(lock_id.to_string(), fencing_token, decision);
        reached
    }

    /// Best-effort second phase: peers that miss it fall back to expiry.
    fn spawn_region_fanout(&self, lock_id: String, fencing_token: u64, decision: RegionDecision) {
        for peer in &self.config.region_peers {
            let addr = peer.addr.clone();
            let message = RegionMessage::Confirm {
                lock_id: lock_id.clone(),
                fencing_token,
                decision,
            };
            let deadline = self.config.rpc_timeout();
            tokio::spawn(async move {
                if let Err(e) = wire::call::<_, RegionMessage>(&addr, &message, deadline).await {
                    debug!("Cross-region confirm to {} failed: {}", addr, e);
                }
            });
        }
    }

    // --- Cross-region protocol, votee side ---

    pub async fn handle_region(&self, message: RegionMessage) -> RegionMessage {
        match message {
            RegionMessage::Propose {
                lock_id,
                client_id,
                origin_region,
                fencing_token,
                expires_at,
            } => {
                self.region_propose(lock_id, client_id, origin_region, fencing_token, expires_at)
                    .await
            }
            RegionMessage::Confirm {
                lock_id,
                fencing_token,
                decision,
            } => {
                self.region_confirm(lock_id, fencing_token, decision).await;
                RegionMessage::Ack
            }
            RegionMessage::Vote { .. } | RegionMessage::Ack => RegionMessage::Ack,
        }
    }

    async fn region_propose(
        &self,
        lock_id: String,
        client_id: String,
        origin_region: String,
        fencing_token: u64,
        expires_at: u64,
    ) -> RegionMessage {
        // Only the regional leader can later record the acquisition.
        if !self.raft.is_leader().await {
            return RegionMessage::Vote {
                vote: RegionVote::No,
                known_holder: None,
            };
        }

        let now = now_millis();
        let holder = {
            let store = self.store.read().await;
            store.check(&lock_id, now).cloned()
        };

        match holder {
            Some(lock)
                if lock.holder_client_id != client_id || lock.region_id != origin_region =>
            {
                info!(
                    "[{}] CONFLICT vote for '{}': held by {} ({})",
                    self.config.node_id, lock_id, lock.holder_client_id, lock.region_id
                );
                RegionMessage::Vote {
                    vote: RegionVote::Conflict,
                    known_holder: Some(lock.holder_client_id),
                }
            }
            _ => {
                let mut grants = self.remote_grants.lock().await;
                grants.retain(|_, g| g.recorded.elapsed() < REGION_GRANT_TTL);
                grants.insert(
                    lock_id,
                    RemoteGrant {
                        client_id,
                        origin_region,
                        fencing_token,
                        expires_at,
                        recorded: Instant::now(),
                    },
                );
                RegionMessage::Vote {
                    vote: RegionVote::Yes,
                    known_holder: None,
                }
            }
        }
    }

    async fn region_confirm(&self, lock_id: String, fencing_token: u64, decision: RegionDecision) {
        match decision {
            RegionDecision::Commit => {
                let grant = {
                    let mut grants = self.remote_grants.lock().await;
                    let matches = grants
                        .get(&lock_id)
                        .map(|g| {
                            g.fencing_token == fencing_token
                                && g.recorded.elapsed() < REGION_GRANT_TTL
                        })
                        .unwrap_or(false);
                    if matches {
                        grants.remove(&lock_id)
                    } else {
                        None
                    }
                };
                let Some(grant) = grant else {
                    debug!(
                        "[{}] Commit for '{}' without a matching grant, ignoring",
                        self.config.node_id, lock_id
                    );
                    return;
                };

                let response = self
                    .propose_and_wait(
                        Proposal::AcquireAdvisory {
                            lock_id: lock_id.clone(),
                            client_id: grant.client_id,
                            origin_region: grant.origin_region,
                            fencing_token: grant.fencing_token,
                            expires_at: grant.expires_at,
                        },
                        self.config.lease.default_timeout_ms,
                    )
                    .await;
                if response.status != LockStatus::Ok {
                    warn!(
                        "[{}] Recording advisory lock '{}' returned {:?}",
                        self.config.node_id, lock_id, response.status
                    );
                }
            }
            RegionDecision::Abort => {
                {
                    let mut grants = self.remote_grants.lock().await;
                    grants.remove(&lock_id);
                }
                // Drop the advisory copy if the acquisition was recorded.
                let recorded = {
                    let store = self.store.read().await;
                    store
                        .check(&lock_id, now_millis())
                        .map(|l| l.fencing_token == fencing_token)
                        .unwrap_or(false)
                };
                if recorded && self.raft.is_leader().await {
                    let response = self
                        .propose_and_wait(
                            Proposal::Release {
                                lock_id: lock_id.clone(),
                                fencing_token,
                            },
                            self.config.lease.default_timeout_ms,
                        )
                        .await;
                    if response.status != LockStatus::Ok {
                        debug!(
                            "[{}] Dropping advisory lock '{}' returned {:?}",
                            self.config.node_id, lock_id, response.status
                        );
                    }
                }
            }
        }
    }
}

// --- Node assembly ---

/// Everything one running node owns. Binds the client, Raft, and region
/// listeners on `port`, `port + 1000`, and `port + 2000`.
pub struct NodeHandle {
    pub raft: Arc<RaftNode>,
    pub store: Arc<RwLock<LockStore>>,
    pub service: Arc<LockService>,
    pub client_addr: String,
    pub raft_addr: String,
    pub region_addr: String,
}

pub async fn start_node(config: NodeConfig, port: u16) -> Result<NodeHandle> {
    let client_addr = format!("127.0.0.1:{}", port);
    let raft_addr = format!("127.0.0.1:{}", port + RAFT_PORT_OFFSET);
    let region_addr = format!("127.0.0.1:{}", port + REGION_PORT_OFFSET);

    let store = Arc::new(RwLock::new(LockStore::new(config.region_id.clone())));
    let raft = Arc::new(RaftNode::new(config.clone(), Arc::clone(&store)));
    let service = Arc::new(LockService::new(
        config.clone(),
        Arc::clone(&raft),
        Arc::clone(&store),
    ));

    let raft_listener = TcpListener::bind(&raft_addr).await?;
    let client_listener = TcpListener::bind(&client_addr).await?;
    let region_listener = TcpListener::bind(&region_addr).await?;

    tokio::spawn(run_raft_listener(Arc::clone(&raft), raft_listener));
    tokio::spawn(run_client_listener(Arc::clone(&service), client_listener));
    tokio::spawn(run_region_listener(Arc::clone(&service), region_listener));
    Arc::clone(&raft).start().await;

    info!(
        "[{}] Node up: clients on {}, raft on {}, regions on {}",
        config.node_id, client_addr, raft_addr, region_addr
    );

    Ok(NodeHandle {
        raft,
        store,
        service,
        client_addr,
        raft_addr,
        region_addr,
    })
}

pub async fn run_client_listener(service: Arc<LockService>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("Client connected from {}", addr);
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    if let Err(e) = handle_client_connection(stream, service).await {
                        debug!("Client connection error: {}", e);
                    }
                });
            }
            Err(e) => error!("Failed to accept client connection: {}", e),
        }
    }
}

async fn handle_client_connection(mut stream: TcpStream, service: Arc<LockService>) -> Result<()> {
    let request: LockRequest = wire::read_frame(&mut stream).await?;
    let response = service.handle(request).await;
    wire::write_frame(&mut stream, &response).await?;
    Ok(())
}

pub async fn run_region_listener(service: Arc<LockService>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    if let Err(e) = handle_region_connection(stream, service).await {
                        debug!("Region connection error: {}", e);
                    }
                });
            }
            Err(e) => error!("Failed to accept region connection: {}", e),
        }
    }
}

async fn handle_region_connection(mut stream: TcpStream, service: Arc<LockService>) -> Result<()> {
    let request: RegionMessage = wire::read_frame(&mut stream).await?;
    let response = service.handle_region(request).await;
    wire::write_frame(&mut stream, &response).await?;
    Ok(())
}
