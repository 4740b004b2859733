use crate::config::NodeConfig;
use crate::store::{ApplyOutcome, LockStore};
use crate::wire;
use crate::{now_millis, LockCommand, LogEntry, RaftMessage, RaftPersistentState, ServerRole};
use anyhow::{bail, Result};
use log::{debug, error, info, warn};
use rand::Rng;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::sleep;

/// Cap on entries shipped in one AppendEntries call; large backlogs are
/// drained over successive rounds.
const MAX_ENTRIES_PER_RPC: usize = 8;

/// A client command waiting to be proposed by the leader. Token and lease
/// assignment happen inside `propose`, under the Raft state lock, so that
/// proposals serialized by the log receive distinct, increasing tokens.
#[derive(Debug, Clone)]
pub enum Proposal {
    Acquire {
        lock_id: String,
        client_id: String,
        ttl_ms: u64,
    },
    /// Record of a lock granted by another region, carried through the local
    /// log so every node in this region sees it. Token and lease come from
    /// the origin region untouched.
    AcquireAdvisory {
        lock_id: String,
        client_id: String,
        origin_region: String,
        fencing_token: u64,
        expires_at: u64,
    },
    Release {
        lock_id: String,
        fencing_token: u64,
    },
    Extend {
        lock_id: String,
        fencing_token: u64,
        ttl_ms: u64,
    },
}

/// Handle returned by `propose`: resolved with the applier's outcome once the
/// entry commits. If the entry is overwritten by a later leader the sender is
/// dropped and the receiver sees a recv error; the front-end reports that as
/// a retryable NOT_LEADER.
pub struct ProposedEntry {
    pub index: u64,
    pub term: u64,
    pub fencing_token: u64,
    pub expires_at: u64,
    pub rx: oneshot::Receiver<ApplyOutcome>,
}

struct PendingProposal {
    term: u64,
    tx: oneshot::Sender<ApplyOutcome>,
}

pub struct RaftState {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub role: ServerRole,
    pub leader_id: Option<String>,
    pub last_heartbeat: Instant,

    /// The replicated log, 1-indexed; position 0 holds a term-0 sentinel so
    /// that log position equals entry index.
    pub log: Vec<LogEntry>,
    pub commit_index: u64,
    pub last_applied: u64,

    // Leader-only volatile state.
    pub next_index: HashMap<String, u64>,
    pub match_index: HashMap<String, u64>,

    /// Outstanding proposal handles keyed by log index.
    pending: HashMap<u64, PendingProposal>,
    /// Node-wide monotonic fencing counter; never decreases.
    token_counter: u64,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            role: ServerRole::Follower,
            leader_id: None,
            last_heartbeat: Instant::now(),
            log: vec![LogEntry {
                term: 0,
                index: 0,
                command: LockCommand::Noop,
            }],
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            pending: HashMap::new(),
            token_counter: 0,
        }
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.len() as u64 - 1
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        self.log.get(index as usize).map(|e| e.term)
    }

    fn persistent(&self) -> RaftPersistentState {
        RaftPersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            log: self.log.clone(),
        }
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RaftNode {
    pub config: NodeConfig,
    pub state: Arc<Mutex<RaftState>>,
    store: Arc<RwLock<LockStore>>,
    shutdown: AtomicBool,
}

impl RaftNode {
    pub fn new(config: NodeConfig, store: Arc<RwLock<LockStore>>) -> Self {
        let node = Self {
            config,
            state: Arc::new(Mutex::new(RaftState::new())),
            store,
            shutdown: AtomicBool::new(false),
        };

        if let Some(persisted) = node.load_state_from_disk() {
            if let Ok(mut state) = node.state.try_lock() {
                info!(
                    "[{}] Loaded persisted state: term={}, voted_for={:?}, {} log entries",
                    node.config.node_id,
                    persisted.current_term,
                    persisted.voted_for,
                    persisted.log.len()
                );
                state.current_term = persisted.current_term;
                state.voted_for = persisted.voted_for;
                if !persisted.log.is_empty() {
                    state.log = persisted.log;
                }
                // The highest token ever issued is recoverable from the log,
                // so a restarted leader cannot hand one out twice.
                state.token_counter = state
                    .log
                    .iter()
                    .filter_map(|e| match &e.command {
                        LockCommand::Acquire { fencing_token, .. } => Some(*fencing_token),
                        _ => None,
                    })
                    .max()
                    .unwrap_or(0);
            }
        }

        node
    }

    pub fn store(&self) -> Arc<RwLock<LockStore>> {
        Arc::clone(&self.store)
    }

    /// Stop background loops and refuse further traffic. Used to take a node
    /// out of a cluster without tearing the process down.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn state_file_path(&self) -> PathBuf {
        PathBuf::from(format!("raft_state_{}.bin", self.config.node_id))
    }

    async fn persist_state_to_disk(&self) {
        let snapshot = {
            let state = self.state.lock().await;
            state.persistent()
        };
        let path = self.state_file_path();
        match bincode::serialize(&snapshot) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    error!(
                        "[{}] Failed to write state to {}: {}",
                        self.config.node_id,
                        path.display(),
                        e
                    );
                }
            }
            Err(e) => error!("[{}] Failed to serialize state: {}", self.config.node_id, e),
        }
    }

    fn load_state_from_disk(&self) -> Option<RaftPersistentState> {
        let path = self.state_file_path();
        match fs::read(&path) {
            Ok(bytes) => match bincode::deserialize(&bytes) {
                Ok(state) => Some(state),
                Err(e) => {
                    error!(
                        "[{}] Failed to deserialize state from {}: {}",
                        self.config.node_id,
                        path.display(),
                        e
                    );
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                error!(
                    "[{}] Failed to read state from {}: {}",
                    self.config.node_id,
                    path.display(),
                    e
                );
                None
            }
        }
    }

    /// Start the election timer and the heartbeat sender.
    pub async fn start(self: Arc<Self>) {
        let node_election = Arc::clone(&self);
        let node_heartbeat = Arc::clone(&self);

        tokio::spawn(async move {
            node_election.run_election_timer().await;
        });

        tokio::spawn(async move {
            node_heartbeat.run_heartbeat_sender().await;
        });
    }

    /// Randomized timeout in [E, 2E].
    fn random_election_timeout(&self) -> Duration {
        let base = self.config.election_timeout_ms;
        let timeout_ms = rand::thread_rng().gen_range(base..=base * 2);
        Duration::from_millis(timeout_ms)
    }

    async fn run_election_timer(&self) {
        loop {
            let timeout = self.random_election_timeout();
            sleep(timeout).await;
            if self.is_shutdown() {
                return;
            }

            let should_start_election = {
                let state = self.state.lock().await;
                state.role != ServerRole::Leader && state.last_heartbeat.elapsed() >= timeout
            };

            if should_start_election {
                info!(
                    "[{}] Election timeout, starting election",
                    self.config.node_id
                );
                self.start_election().await;
            }
        }
    }

    pub async fn start_election(&self) {
        let (term, last_log_index, last_log_term) = {
            let mut state = self.state.lock().await;
            state.role = ServerRole::Candidate;
            state.current_term += 1;
            state.voted_for = Some(self.config.node_id.clone());
            state.leader_id = None;
            state.last_heartbeat = Instant::now();
            info!(
                "[{}] Starting election for term {}",
                self.config.node_id, state.current_term
            );
            (
                state.current_term,
                state.last_log_index(),
                state.last_log_term(),
            )
        };

        self.persist_state_to_disk().await;

        // Request votes from every peer in parallel, each under the RPC
        // deadline so a dead peer cannot stall the round.
        let mut tasks = Vec::new();
        for peer in &self.config.peers {
            let peer = peer.clone();
            let request = RaftMessage::RequestVote {
                term,
                candidate_id: self.config.node_id.clone(),
                last_log_index,
                last_log_term,
            };
            let deadline = self.config.rpc_timeout();
            tasks.push(tokio::spawn(async move {
                wire::call::<_, RaftMessage>(&peer, &request, deadline).await
            }));
        }

        let majority = (self.config.peers.len() + 1) / 2 + 1;
        let mut votes_granted = 1; // self-vote

        for task in tasks {
            match task.await {
                Ok(Ok(RaftMessage::RequestVoteResponse {
                    term: resp_term,
                    vote_granted,
                    voter_id,
                })) => {
                    if resp_term > term {
                        let mut state = self.state.lock().await;
                        if resp_term > state.current_term {
                            state.current_term = resp_term;
                            state.role = ServerRole::Follower;
                            state.voted_for = None;
                        }
                        info!(
                            "[{}] Stepping down, saw higher term {}",
                            self.config.node_id, resp_term
                        );
                        drop(state);
                        self.persist_state_to_disk().await;
                        return;
                    }
                    if vote_granted {
                        votes_granted += 1;
                        debug!(
                            "[{}] Vote from {} ({}/{})",
                            self.config.node_id, voter_id, votes_granted, majority
                        );
                    }
                }
                Ok(Ok(_)) => debug!("[{}] Unexpected vote response", self.config.node_id),
                Ok(Err(e)) => debug!("[{}] Vote request failed: {}", self.config.node_id, e),
                Err(e) => debug!("[{}] Vote task join error: {}", self.config.node_id, e),
            }
        }

        if votes_granted >= majority {
            // Only claim leadership if nothing moved the term on while the
            // votes were in flight.
            let still_candidate = {
                let state = self.state.lock().await;
                state.role == ServerRole::Candidate && state.current_term == term
            };
            if still_candidate {
                self.become_leader().await;
            }
            return;
        }

        let mut state = self.state.lock().await;
        if state.role == ServerRole::Candidate && state.current_term == term {
            info!(
                "[{}] Election failed, returning to follower",
                self.config.node_id
            );
            state.role = ServerRole::Follower;
        }
    }

    /// Take leadership: reset per-peer progress and append the NOOP that
    /// lets entries from prior terms commit under the current-term rule.
    pub async fn become_leader(&self) {
        let (term, leader_commit) = {
            let mut state = self.state.lock().await;
            state.role = ServerRole::Leader;
            state.leader_id = Some(self.config.node_id.clone());

            let last_index = state.last_log_index();
            for peer in &self.config.peers {
                state.next_index.insert(peer.clone(), last_index + 1);
                state.match_index.insert(peer.clone(), 0);
            }

            let term = state.current_term;
            let noop_index = last_index + 1;
            state.log.push(LogEntry {
                term,
                index: noop_index,
                command: LockCommand::Noop,
            });
            state
                .match_index
                .insert(self.config.node_id.clone(), noop_index);
            info!("[{}] BECAME LEADER for term {}", self.config.node_id, term);

            self.try_commit(&mut state).await;
            (term, state.commit_index)
        };

        self.persist_state_to_disk().await;
        self.send_append_entries(term, leader_commit).await;
    }

    async fn run_heartbeat_sender(&self) {
        loop {
            sleep(Duration::from_millis(self.config.heartbeat_interval_ms)).await;
            if self.is_shutdown() {
                return;
            }

            let (is_leader, term, leader_commit) = {
                let state = self.state.lock().await;
                (
                    state.role == ServerRole::Leader,
                    state.current_term,
                    state.commit_index,
                )
            };

            if is_leader {
                self.send_append_entries(term, leader_commit).await;
            }
        }
    }

    /// Replicate to all peers: per-peer payload from next_index, sent in
    /// parallel tasks outside the state lock, responses folded back in.
    async fn send_append_entries(&self, term: u64, leader_commit: u64) {
        let leader_id = self.config.node_id.clone();
        let mut tasks = Vec::new();

        for peer in &self.config.peers {
            let (prev_log_index, prev_log_term, entries) = {
                let state = self.state.lock().await;
                let last_index = state.last_log_index();
                let next_index = *state.next_index.get(peer).unwrap_or(&(last_index + 1));
                let prev_index = next_index.saturating_sub(1);
                let prev_term = state.term_at(prev_index).unwrap_or(0);

                let mut entries = Vec::new();
                if next_index <= last_index {
                    let start = next_index as usize;
                    let end = (last_index as usize + 1).min(start + MAX_ENTRIES_PER_RPC);
                    entries.extend_from_slice(&state.log[start..end]);
                }
                (prev_index, prev_term, entries)
            };

            let entries_len = entries.len() as u64;
            let message = RaftMessage::AppendEntries {
                term,
                leader_id: leader_id.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            };
            let peer = peer.clone();
            let deadline = self.config.rpc_timeout();
            tasks.push(tokio::spawn(async move {
                let resp = wire::call::<_, RaftMessage>(&peer, &message, deadline).await;
                (peer, prev_log_index, entries_len, resp)
            }));
        }

        for task in tasks {
            let (peer, prev_index, entries_len, result) = match task.await {
                Ok(tuple) => tuple,
                Err(e) => {
                    warn!(
                        "[{}] Replication task join error: {}",
                        self.config.node_id, e
                    );
                    continue;
                }
            };
            match result {
                Ok(RaftMessage::AppendEntriesResponse {
                    term: resp_term,
                    follower_id: _,
                    success,
                    last_log_index,
                }) => {
                    self.handle_append_response(
                        &peer,
                        term,
                        resp_term,
                        success,
                        // What we know the follower now matches; its own last
                        // index may still include an unmatched stale suffix.
                        prev_index + entries_len,
                        last_log_index,
                    )
                    .await;
                }
                Ok(_) => debug!("[{}] Unexpected replication response", self.config.node_id),
                Err(e) => debug!(
                    "[{}] AppendEntries to {} failed: {}",
                    self.config.node_id, peer, e
                ),
            }
        }
    }

    async fn handle_append_response(
        &self,
        peer: &str,
        sent_term: u64,
        resp_term: u64,
        success: bool,
        matched_index: u64,
        follower_last_index: u64,
    ) {
        let mut state = self.state.lock().await;

        if resp_term > state.current_term {
            info!(
                "[{}] Stepping down, follower {} is at term {}",
                self.config.node_id, peer, resp_term
            );
            state.current_term = resp_term;
            state.role = ServerRole::Follower;
            state.voted_for = None;
            state.leader_id = None;
            drop(state);
            self.persist_state_to_disk().await;
            return;
        }
        if state.role != ServerRole::Leader || state.current_term != sent_term {
            return;
        }

        if success {
            let new_match = matched_index.min(state.last_log_index());
            let cur_match = state.match_index.get(peer).copied().unwrap_or(0);
            if new_match > cur_match {
                state.match_index.insert(peer.to_string(), new_match);
            }
            let desired_next = new_match + 1;
            let cur_next = state.next_index.get(peer).copied().unwrap_or(1);
            if desired_next > cur_next {
                state.next_index.insert(peer.to_string(), desired_next);
            }
            self.try_commit(&mut state).await;
        } else {
            // Follower rejected the consistency check; back next_index off to
            // just past its last index, never past 1, never forward.
            let suggested = follower_last_index.saturating_add(1).max(1);
            let cur_next = state.next_index.get(peer).copied().unwrap_or(1);
            if suggested < cur_next {
                debug!(
                    "[{}] Backing off next_index[{}] {} -> {}",
                    self.config.node_id, peer, cur_next, suggested
                );
                state.next_index.insert(peer.to_string(), suggested);
            } else if cur_next > 1 {
                state.next_index.insert(peer.to_string(), cur_next - 1);
            }
        }
    }

    /// Advance commit_index to the highest current-term index replicated on a
    /// majority, then apply everything newly committed. Entries from earlier
    /// terms ride along; they are never counted directly.
    async fn try_commit(&self, state: &mut RaftState) {
        let last_index = state.last_log_index();
        let majority = (self.config.peers.len() + 1) / 2 + 1;

        for n in (state.commit_index + 1)..=last_index {
            let replicas = 1 + self
                .config
                .peers
                .iter()
                .filter(|p| state.match_index.get(*p).copied().unwrap_or(0) >= n)
                .count();
            if replicas >= majority && state.term_at(n) == Some(state.current_term) {
                state.commit_index = n;
                debug!(
                    "[{}] Advanced commit_index to {}",
                    self.config.node_id, state.commit_index
                );
            }
        }

        self.apply_committed(state).await;
    }

    /// The state machine applier: runs every committed-but-unapplied entry
    /// against the lock store, in log order, exactly once, and resolves any
    /// proposal handle waiting on that index.
    async fn apply_committed(&self, state: &mut RaftState) {
        while state.last_applied < state.commit_index {
            let index = state.last_applied + 1;
            let Some(entry) = state.log.get(index as usize).cloned() else {
                error!(
                    "[{}] commit_index {} beyond log end, refusing to apply",
                    self.config.node_id, state.commit_index
                );
                return;
            };

            let now = now_millis();
            let outcome = match &entry.command {
                LockCommand::Noop => ApplyOutcome::Ok {
                    fencing_token: 0,
                    expires_at: 0,
                },
                LockCommand::Acquire {
                    lock_id,
                    client_id,
                    region_id,
                    fencing_token,
                    expires_at,
                } => {
                    let mut store = self.store.write().await;
                    store.acquire_with_token(
                        lock_id,
                        client_id,
                        region_id,
                        *fencing_token,
                        *expires_at,
                        now,
                    )
                }
                LockCommand::Release {
                    lock_id,
                    fencing_token,
                } => {
                    let mut store = self.store.write().await;
                    store.release_by_token(lock_id, *fencing_token, now)
                }
                LockCommand::Extend {
                    lock_id,
                    fencing_token,
                    expires_at,
                } => {
                    let mut store = self.store.write().await;
                    store.extend_by_token(lock_id, *fencing_token, *expires_at, now)
                }
            };

            state.last_applied = index;
            debug!(
                "[{}] Applied index {} ({:?})",
                self.config.node_id, index, outcome
            );

            if let Some(pending) = state.pending.remove(&index) {
                if pending.term == entry.term {
                    let _ = pending.tx.send(outcome);
                }
                // Term mismatch: a later leader overwrote the proposed entry.
                // Dropping the sender surfaces as NOT_LEADER at the front-end.
            }
        }
    }

    /// Leader-only: assign token/lease, append to the local log, and kick off
    /// replication. Returns a handle resolved when the entry is applied.
    pub async fn propose(&self, proposal: Proposal) -> Result<ProposedEntry> {
        if self.is_shutdown() {
            bail!("node is shut down");
        }

        let (term, leader_commit, proposed) = {
            let mut state = self.state.lock().await;
            if state.role != ServerRole::Leader {
                bail!("not the leader");
            }

            let now = now_millis();
            let (command, fencing_token, expires_at) = match proposal {
                Proposal::Acquire {
                    lock_id,
                    client_id,
                    ttl_ms,
                } => {
                    let floor = {
                        let store = self.store.read().await;
                        store.token_floor(&lock_id)
                    };
                    let token = floor.max(state.token_counter) + 1;
                    state.token_counter = token;
                    let expires_at = now + ttl_ms;
                    (
                        LockCommand::Acquire {
                            lock_id,
                            client_id,
                            region_id: self.config.region_id.clone(),
                            fencing_token: token,
                            expires_at,
                        },
                        token,
                        expires_at,
                    )
                }
                Proposal::AcquireAdvisory {
                    lock_id,
                    client_id,
                    origin_region,
                    fencing_token,
                    expires_at,
                } => (
                    LockCommand::Acquire {
                        lock_id,
                        client_id,
                        region_id: origin_region,
                        fencing_token,
                        expires_at,
                    },
                    fencing_token,
                    expires_at,
                ),
                Proposal::Release {
                    lock_id,
                    fencing_token,
                } => (
                    LockCommand::Release {
                        lock_id,
                        fencing_token,
                    },
                    fencing_token,
                    0,
                ),
                Proposal::Extend {
                    lock_id,
                    fencing_token,
                    ttl_ms,
                } => {
                    let expires_at = now + ttl_ms;
                    (
                        LockCommand::Extend {
                            lock_id,
                            fencing_token,
                            expires_at,
                        },
                        fencing_token,
                        expires_at,
                    )
                }
            };

            let term = state.current_term;
            let index = state.last_log_index() + 1;
            state.log.push(LogEntry {
                term,
                index,
                command,
            });

            let (tx, rx) = oneshot::channel();
            state.pending.insert(index, PendingProposal { term, tx });
            state.match_index.insert(self.config.node_id.clone(), index);

            // A single-node group commits on append.
            self.try_commit(&mut state).await;

            (
                term,
                state.commit_index,
                ProposedEntry {
                    index,
                    term,
                    fencing_token,
                    expires_at,
                    rx,
                },
            )
        };

        self.persist_state_to_disk().await;
        self.send_append_entries(term, leader_commit).await;
        Ok(proposed)
    }

    pub async fn is_leader(&self) -> bool {
        let state = self.state.lock().await;
        state.role == ServerRole::Leader
    }

    /// Best-known leader id, for redirecting clients.
    pub async fn leader_hint(&self) -> Option<String> {
        let state = self.state.lock().await;
        state.leader_id.clone()
    }

    /// Handle one inbound Raft message, returning the response to send back.
    pub async fn handle_raft_message(&self, message: RaftMessage) -> Option<RaftMessage> {
        if self.is_shutdown() {
            return None;
        }

        let mut state = self.state.lock().await;
        let mut changed = false;

        // Any message from a higher term demotes us first.
        match &message {
            RaftMessage::RequestVote { term, .. } | RaftMessage::AppendEntries { term, .. } => {
                if *term > state.current_term {
                    info!(
                        "[{}] Saw higher term {}, stepping down",
                        self.config.node_id, term
                    );
                    state.current_term = *term;
                    state.role = ServerRole::Follower;
                    state.voted_for = None;
                    state.leader_id = None;
                    changed = true;
                }
            }
            _ => {}
        }

        let response = match message {
            RaftMessage::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => {
                let mut vote_granted = false;

                if term >= state.current_term {
                    let can_vote = state.voted_for.is_none()
                        || state.voted_for.as_deref() == Some(candidate_id.as_str());
                    let log_up_to_date = last_log_term > state.last_log_term()
                        || (last_log_term == state.last_log_term()
                            && last_log_index >= state.last_log_index());

                    if can_vote && log_up_to_date {
                        state.voted_for = Some(candidate_id.clone());
                        state.last_heartbeat = Instant::now();
                        vote_granted = true;
                        changed = true;
                        info!(
                            "[{}] Granted vote to {} for term {}",
                            self.config.node_id, candidate_id, term
                        );
                    } else {
                        debug!(
                            "[{}] Denied vote to {} (voted_for={:?}, log_ok={})",
                            self.config.node_id, candidate_id, state.voted_for, log_up_to_date
                        );
                    }
                }

                Some(RaftMessage::RequestVoteResponse {
                    term: state.current_term,
                    vote_granted,
                    voter_id: self.config.node_id.clone(),
                })
            }

            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                let mut success = false;

                if term >= state.current_term {
                    state.role = ServerRole::Follower;
                    state.leader_id = Some(leader_id.clone());
                    state.last_heartbeat = Instant::now();

                    let prev_matches = state.term_at(prev_log_index) == Some(prev_log_term);
                    if !prev_matches {
                        debug!(
                            "[{}] Rejecting AppendEntries: no match at index {} (term {:?} != {})",
                            self.config.node_id,
                            prev_log_index,
                            state.term_at(prev_log_index),
                            prev_log_term
                        );
                    } else {
                        success = true;
                        let last_new_index = prev_log_index + entries.len() as u64;

                        for entry in entries {
                            let pos = entry.index as usize;
                            if pos < state.log.len() {
                                if state.log[pos].term != entry.term {
                                    // Conflict: drop the suffix and any handles
                                    // waiting on overwritten indexes.
                                    state.log.truncate(pos);
                                    state.pending.retain(|&i, _| i < entry.index);
                                    state.log.push(entry);
                                    changed = true;
                                }
                            } else {
                                state.log.push(entry);
                                changed = true;
                            }
                        }

                        let new_commit = leader_commit.min(last_new_index);
                        if new_commit > state.commit_index {
                            state.commit_index = new_commit;
                            self.apply_committed(&mut state).await;
                        }
                    }
                }

                Some(RaftMessage::AppendEntriesResponse {
                    term: state.current_term,
                    follower_id: self.config.node_id.clone(),
                    success,
                    last_log_index: state.last_log_index(),
                })
            }

            // Responses are consumed by the sender tasks.
            RaftMessage::RequestVoteResponse { .. } | RaftMessage::AppendEntriesResponse { .. } => {
                None
            }
        };

        drop(state);
        if changed {
            self.persist_state_to_disk().await;
        }
        response
    }
}

/// Accept loop for the Raft surface: one framed request, one framed response
/// per connection, each on its own task.
pub async fn run_raft_listener(node: Arc<RaftNode>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let node = Arc::clone(&node);
                tokio::spawn(async move {
                    if let Err(e) = handle_raft_connection(stream, node).await {
                        debug!("Raft connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept Raft connection: {}", e);
            }
        }
    }
}

async fn handle_raft_connection(mut stream: TcpStream, node: Arc<RaftNode>) -> Result<()> {
    let message: RaftMessage = wire::read_frame(&mut stream).await?;
    if let Some(response) = node.handle_raft_message(message).await {
        wire::write_frame(&mut stream, &response).await?;
    }
    Ok(())
}
