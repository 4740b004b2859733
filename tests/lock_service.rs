use anyhow::Result;
use lockd::config::NodeConfig;
use lockd::service::{start_node, NodeHandle};
use lockd::{now_millis, wire, LockRequest, LockResponse, LockStatus};
use std::time::Duration;

/// One single-node region: elects itself immediately and commits on append.
async fn start_single(node_id: &str, port: u16) -> Result<NodeHandle> {
    let _ = tokio::fs::remove_file(format!("raft_state_{}.bin", node_id)).await;
    let config = NodeConfig {
        node_id: node_id.to_string(),
        election_timeout_ms: 2_000,
        heartbeat_interval_ms: 100,
        ..NodeConfig::default()
    };
    let handle = start_node(config, port).await?;
    handle.raft.start_election().await;
    assert!(handle.raft.is_leader().await);
    Ok(handle)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn acquire_check_release_roundtrip() -> Result<()> {
    let node = start_single("svc1", 24001).await?;

    let before = now_millis();
    let response = node
        .service
        .acquire("orders/42".into(), "api-1".into(), 30_000)
        .await;
    assert_eq!(response.status, LockStatus::Ok);
    let token = response.fencing_token.expect("token on success");
    let expires_at = response.expires_at.expect("lease on success");
    assert!(expires_at >= before + 30_000);

    let response = node.service.check("orders/42".into()).await;
    assert_eq!(response.status, LockStatus::Ok);
    assert_eq!(response.holder.as_deref(), Some("api-1"));
    assert_eq!(response.fencing_token, Some(token));

    let response = node
        .service
        .release("orders/42".into(), "api-1".into(), token)
        .await;
    assert_eq!(response.status, LockStatus::Ok);

    let response = node.service.check("orders/42".into()).await;
    assert_eq!(response.status, LockStatus::NotFound);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn contention_and_fencing() -> Result<()> {
    let node = start_single("svc2", 24011).await?;

    let first = node
        .service
        .acquire("orders/7".into(), "api-1".into(), 30_000)
        .await;
    assert_eq!(first.status, LockStatus::Ok);
    let first_token = first.fencing_token.unwrap();

    // Second client is refused and told who holds it.
    let contended = node
        .service
        .acquire("orders/7".into(), "api-2".into(), 30_000)
        .await;
    assert_eq!(contended.status, LockStatus::AlreadyLocked);
    assert_eq!(contended.holder.as_deref(), Some("api-1"));

    let released = node
        .service
        .release("orders/7".into(), "api-1".into(), first_token)
        .await;
    assert_eq!(released.status, LockStatus::Ok);

    let second = node
        .service
        .acquire("orders/7".into(), "api-2".into(), 30_000)
        .await;
    assert_eq!(second.status, LockStatus::Ok);
    let second_token = second.fencing_token.unwrap();
    assert!(second_token > first_token, "tokens must keep increasing");

    // The original client's token is now stale.
    let stale = node
        .service
        .release("orders/7".into(), "api-1".into(), first_token)
        .await;
    assert_eq!(stale.status, LockStatus::InvalidToken);

    let response = node
        .service
        .release("orders/7".into(), "api-2".into(), second_token)
        .await;
    assert_eq!(response.status, LockStatus::Ok);

    Ok(())
}

/// A retry by the holder itself succeeds with a fresh, larger token and a
/// renewed lease. This is the fixed policy for lost acquire replies.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retry_by_holder_renews() -> Result<()> {
    let node = start_single("svc3", 24021).await?;

    let first = node
        .service
        .acquire("orders/9".into(), "api-3".into(), 30_000)
        .await;
    assert_eq!(first.status, LockStatus::Ok);

    let retry = node
        .service
        .acquire("orders/9".into(), "api-3".into(), 30_000)
        .await;
    assert_eq!(retry.status, LockStatus::Ok);
    assert!(retry.fencing_token.unwrap() > first.fencing_token.unwrap());

    // Only one holder observable throughout.
    let response = node.service.check("orders/9".into()).await;
    assert_eq!(response.holder.as_deref(), Some("api-3"));

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn extend_moves_the_lease() -> Result<()> {
    let node = start_single("svc4", 24031).await?;

    let acquired = node
        .service
        .acquire("orders/11".into(), "api-4".into(), 5_000)
        .await;
    assert_eq!(acquired.status, LockStatus::Ok);
    let token = acquired.fencing_token.unwrap();
    let lease = acquired.expires_at.unwrap();

    let extended = node
        .service
        .extend("orders/11".into(), "api-4".into(), token, 60_000)
        .await;
    assert_eq!(extended.status, LockStatus::Ok);
    assert!(extended.expires_at.unwrap() > lease);

    let wrong = node
        .service
        .extend("orders/11".into(), "api-4".into(), token + 1, 60_000)
        .await;
    assert_eq!(wrong.status, LockStatus::InvalidToken);

    node.service
        .release("orders/11".into(), "api-4".into(), token)
        .await;
    let gone = node
        .service
        .extend("orders/11".into(), "api-4".into(), token, 60_000)
        .await;
    assert_eq!(gone.status, LockStatus::NotFound);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejects_bad_ids() -> Result<()> {
    let node = start_single("svc5", 24041).await?;

    let response = node.service.acquire("".into(), "api-5".into(), 30_000).await;
    assert_eq!(response.status, LockStatus::Error);

    let response = node
        .service
        .acquire("orders/13".into(), "".into(), 30_000)
        .await;
    assert_eq!(response.status, LockStatus::Error);

    let oversized = "x".repeat(513);
    let response = node.service.acquire(oversized, "api-5".into(), 30_000).await;
    assert_eq!(response.status, LockStatus::Error);

    let response = node.service.check("".into()).await;
    assert_eq!(response.status, LockStatus::Error);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lease_clamping() -> Result<()> {
    let node = start_single("svc6", 24051).await?;

    // Zero means "server default" (30s).
    let now = now_millis();
    let response = node
        .service
        .acquire("leases/default".into(), "api-6".into(), 0)
        .await;
    let lease = response.expires_at.unwrap() - now;
    assert!((29_000..=31_000).contains(&lease), "lease was {}", lease);

    // Tiny requests are raised to the floor.
    let now = now_millis();
    let response = node
        .service
        .acquire("leases/floor".into(), "api-6".into(), 50)
        .await;
    let lease = response.expires_at.unwrap() - now;
    assert!((900..=1_500).contains(&lease), "lease was {}", lease);

    // Huge requests are cut to the ceiling.
    let now = now_millis();
    let response = node
        .service
        .acquire("leases/ceiling".into(), "api-6".into(), 86_400_000)
        .await;
    let lease = response.expires_at.unwrap() - now;
    assert!(lease <= 301_000, "lease was {}", lease);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tokens_strictly_increase_across_cycles() -> Result<()> {
    let node = start_single("svc7", 24061).await?;

    let mut last_token = 0;
    for cycle in 0..5 {
        let response = node
            .service
            .acquire("cycles/lock".into(), "api-7".into(), 30_000)
            .await;
        assert_eq!(response.status, LockStatus::Ok, "cycle {}", cycle);
        let token = response.fencing_token.unwrap();
        assert!(token > last_token, "token {} after {}", token, last_token);
        last_token = token;

        let response = node
            .service
            .release("cycles/lock".into(), "api-7".into(), token)
            .await;
        assert_eq!(response.status, LockStatus::Ok);
    }

    Ok(())
}

/// A proposal that cannot reach a majority times out, and retries after
/// TIMEOUT never let two clients both observe OK: once the stalled entries
/// finally commit, exactly one holder remains.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeout_retries_never_split_the_lock() -> Result<()> {
    for id in ["to1", "to2", "to3"] {
        let _ = tokio::fs::remove_file(format!("raft_state_{}.bin", id)).await;
    }

    let ports = [24101u16, 24102, 24103];
    let raft_addrs: Vec<String> = ports
        .iter()
        .map(|p| format!("127.0.0.1:{}", p + 1000))
        .collect();
    let peers_of = |i: usize| -> Vec<String> {
        raft_addrs
            .iter()
            .enumerate()
            .filter_map(|(j, a)| if j != i { Some(a.clone()) } else { None })
            .collect()
    };
    let config_of = |i: usize, id: &str| NodeConfig {
        node_id: id.to_string(),
        peers: peers_of(i),
        election_timeout_ms: 2_000,
        heartbeat_interval_ms: 100,
        ..NodeConfig::default()
    };

    // Only the leader is up; its peers are configured but unreachable, so
    // the first acquire appends an entry that cannot commit and runs out its
    // deadline.
    let leader = start_node(config_of(0, "to1"), ports[0]).await?;
    leader.raft.become_leader().await;

    let response = leader
        .service
        .acquire("contested/slot".into(), "client-a".into(), 2_000)
        .await;
    assert_eq!(response.status, LockStatus::Timeout);
    assert_eq!(response.fencing_token, None, "a timed-out client learns no token");

    // The peers come back. The stalled first entry will now commit late,
    // after its client already gave up; its lease is stale on arrival.
    let _n2 = start_node(config_of(1, "to2"), ports[1]).await?;
    let _n3 = start_node(config_of(2, "to3"), ports[2]).await?;

    // The retry rides the same log behind the stalled entry and carries a
    // fresh token, so the late commit of the first attempt is harmless.
    let retry = leader
        .service
        .acquire("contested/slot".into(), "client-a".into(), 2_000)
        .await;
    assert_eq!(retry.status, LockStatus::Ok);
    assert!(retry.fencing_token.unwrap() >= 2, "retry uses a fresh token");

    // A second client after the TIMEOUT/retry sequence: it must not also
    // observe OK for the same lock.
    let competing = leader
        .service
        .acquire("contested/slot".into(), "client-b".into(), 2_000)
        .await;
    assert_eq!(competing.status, LockStatus::AlreadyLocked);
    assert_eq!(competing.holder.as_deref(), Some("client-a"));

    let response = leader.service.check("contested/slot".into()).await;
    assert_eq!(response.status, LockStatus::Ok);
    assert_eq!(response.holder.as_deref(), Some("client-a"));
    assert_eq!(response.fencing_token, retry.fencing_token);

    Ok(())
}

/// The same flow over the actual client surface.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wire_protocol_roundtrip() -> Result<()> {
    let node = start_single("svc8", 24071).await?;
    let deadline = Duration::from_secs(5);

    let response: LockResponse = wire::call(
        &node.client_addr,
        &LockRequest::Acquire {
            lock_id: "wire/lock".into(),
            client_id: "api-8".into(),
            timeout_ms: 30_000,
        },
        deadline,
    )
    .await?;
    assert_eq!(response.status, LockStatus::Ok);
    let token = response.fencing_token.unwrap();

    let response: LockResponse = wire::call(
        &node.client_addr,
        &LockRequest::Check {
            lock_id: "wire/lock".into(),
        },
        deadline,
    )
    .await?;
    assert_eq!(response.status, LockStatus::Ok);
    assert_eq!(response.holder.as_deref(), Some("api-8"));

    let response: LockResponse = wire::call(
        &node.client_addr,
        &LockRequest::Release {
            lock_id: "wire/lock".into(),
            client_id: "api-8".into(),
            fencing_token: token,
        },
        deadline,
    )
    .await?;
    assert_eq!(response.status, LockStatus::Ok);

    Ok(())
}
