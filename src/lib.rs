use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod raft;
pub mod service;
pub mod store;
pub mod wire;

/// Raft traffic runs on the client port + 1000.
pub const RAFT_PORT_OFFSET: u16 = 1000;
/// Cross-region traffic runs on the client port + 2000.
pub const REGION_PORT_OFFSET: u16 = 2000;

/// Current wall time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// --- CLIENT PROTOCOL ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Ok,
    AlreadyLocked,
    NotFound,
    InvalidToken,
    Expired,
    QuorumFailed,
    NotLeader,
    Timeout,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum LockRequest {
    Acquire {
        lock_id: String,
        client_id: String,
        timeout_ms: i64,
    },
    Release {
        lock_id: String,
        client_id: String,
        fencing_token: u64,
    },
    Extend {
        lock_id: String,
        client_id: String,
        fencing_token: u64,
        timeout_ms: i64,
    },
    Check {
        lock_id: String,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LockResponse {
    pub status: LockStatus,
    pub fencing_token: Option<u64>,
    pub expires_at: Option<u64>,
    pub holder: Option<String>,
    pub message: Option<String>,
}

impl LockResponse {
    pub fn status(status: LockStatus) -> Self {
        Self {
            status,
            fencing_token: None,
            expires_at: None,
            holder: None,
            message: None,
        }
    }

    pub fn granted(fencing_token: u64, expires_at: u64) -> Self {
        Self {
            status: LockStatus::Ok,
            fencing_token: Some(fencing_token),
            expires_at: Some(expires_at),
            holder: None,
            message: None,
        }
    }

    pub fn not_leader(leader_hint: Option<String>) -> Self {
        Self {
            status: LockStatus::NotLeader,
            fencing_token: None,
            expires_at: None,
            holder: None,
            message: leader_hint,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: LockStatus::Error,
            fencing_token: None,
            expires_at: None,
            holder: None,
            message: Some(message.into()),
        }
    }
}

// --- RAFT LOG ---

/// Command carried by a replicated log entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum LockCommand {
    Noop,
    Acquire {
        lock_id: String,
        client_id: String,
        region_id: String,
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
        expires_at: u64,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: LockCommand,
}

/// State that survives a restart: term, vote, and the log itself.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RaftPersistentState {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub log: Vec<LogEntry>,
}

// --- RAFT MESSAGE TYPES ---

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum RaftMessage {
    RequestVote {
        term: u64,
        candidate_id: String,
        last_log_index: u64,
        last_log_term: u64,
    },
    RequestVoteResponse {
        term: u64,
        vote_granted: bool,
        voter_id: String,
    },
    AppendEntries {
        term: u64,
        leader_id: String,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendEntriesResponse {
        term: u64,
        follower_id: String,
        success: bool,
        /// Follower's last log index, used as a replication progress and
        /// conflict backtracking hint.
        last_log_index: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerRole {
    Follower,
    Candidate,
    Leader,
}

// --- CROSS-REGION MESSAGE TYPES ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionVote {
    Yes,
    No,
    Conflict,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionDecision {
    Commit,
    Abort,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum RegionMessage {
    Propose {
        lock_id: String,
        client_id: String,
        origin_region: String,
        fencing_token: u64,
        expires_at: u64,
    },
    Vote {
        vote: RegionVote,
        known_holder: Option<String>,
    },
    Confirm {
        lock_id: String,
        fencing_token: u64,
        decision: RegionDecision,
    },
    Ack,
}
