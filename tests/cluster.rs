//! End-to-end cluster tests: real engines over loopback TCP.

use std::time::{Duration, Instant};

use conclave::raft::{CommitWait, Engine, NullState, Options, Role, TopologyWait};
use conclave::storage::Memory;
use conclave::Result;

fn options() -> Options {
    Options {
        election_timeout: Duration::from_millis(1000),
        heartbeat_interval: Duration::from_millis(50),
        peer_timeout: Duration::from_secs(2),
    }
}

fn node() -> Engine {
    Engine::new("127.0.0.1:0", Box::new(Memory::new()), Box::new(NullState::new()), options())
        .expect("engine start failed")
}

/// Polls a predicate against a status until it holds or the deadline
/// passes.
fn wait_until(engine: &Engine, what: &str, predicate: impl Fn(&conclave::raft::Status) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = engine.status().expect("status failed");
        if predicate(&status) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}: {status:?}");
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn single_node_bootstrap_and_replication() -> Result<()> {
    let a = node();
    a.bootstrap()?;
    a.wait_for_state(Role::Leader, Duration::from_secs(10))?;

    let mut last = 0;
    for command in [b"one".as_slice(), b"two", b"three"] {
        let proposal = a.put(command.to_vec())?;
        last = proposal.wait_timeout(Duration::from_secs(10))?;
    }
    a.wait_for_commit_index(CommitWait::AtLeast, last, Duration::from_secs(10))?;

    let status = a.status()?;
    assert_eq!(status.role, Role::Leader);
    assert_eq!(status.term, 1);
    assert_eq!(status.leader, Some("A".to_string()));
    assert_eq!(status.commit_index, last);
    assert_eq!(status.applied_index, last);
    Ok(())
}

#[test]
fn second_node_joins_catches_up_and_is_promoted() -> Result<()> {
    let a = node();
    a.bootstrap()?;
    a.wait_for_state(Role::Leader, Duration::from_secs(10))?;
    let put = a.put(b"before-join".to_vec())?;
    put.wait_timeout(Duration::from_secs(10))?;

    // The new node starts passive; the leader adds it as a promotable and
    // catches it up (via snapshot, since the leader truncates its log up
    // to the quorum-acknowledged index).
    let b = node();
    assert_eq!(b.role()?, Role::Passive);
    let change = a.add_to_cluster(b.url())?;
    change.wait_timeout(Duration::from_secs(10))?;
    a.wait_for_topology(TopologyWait::Contains, "B", Duration::from_secs(10))?;

    b.wait_for_state(Role::Follower, Duration::from_secs(10))?;
    b.wait_for_commit_index(CommitWait::AtLeast, change.index, Duration::from_secs(10))?;

    // Fully caught up, the promotable becomes a voter automatically.
    wait_until(&a, "B to become a voter", |status| {
        status.topology.voters.contains_key("B")
    });
    wait_until(&b, "B to learn of its promotion", |status| {
        status.topology.voters.contains_key("B")
    });

    // With two voters, writes require both: this put only commits if the
    // follower acknowledges it.
    let proposal = a.put(b"after-join".to_vec())?;
    let index = proposal.wait_timeout(Duration::from_secs(10))?;
    b.wait_for_commit_index(CommitWait::AtLeast, index, Duration::from_secs(10))?;
    assert_eq!(b.status()?.leader, Some("A".to_string()));
    Ok(())
}

#[test]
fn removed_node_returns_to_passive() -> Result<()> {
    let a = node();
    a.bootstrap()?;
    a.wait_for_state(Role::Leader, Duration::from_secs(10))?;

    let b = node();
    a.add_to_cluster(b.url())?.wait_timeout(Duration::from_secs(10))?;
    b.wait_for_state(Role::Follower, Duration::from_secs(10))?;
    wait_until(&a, "B to become a voter", |status| {
        status.topology.voters.contains_key("B")
    });

    // Removing B commits a topology entry; B transitions to passive when
    // it applies it. The promotion change may still be in flight (only one
    // topology change at a time), so retry until the slot frees up.
    let removal = loop {
        match a.remove_from_cluster("B") {
            Ok(proposal) => break proposal,
            Err(conclave::Error::InvalidInput(_)) => {
                std::thread::sleep(Duration::from_millis(25))
            }
            Err(e) => return Err(e),
        }
    };
    removal.wait_timeout(Duration::from_secs(10))?;
    a.wait_for_topology(TopologyWait::Removed, "B", Duration::from_secs(10))?;
    b.wait_for_state(Role::Passive, Duration::from_secs(10))?;
    assert_eq!(b.status()?.topology.id, None);

    // The cluster keeps working without B.
    let proposal = a.put(b"after-removal".to_vec())?;
    proposal.wait_timeout(Duration::from_secs(10))?;
    Ok(())
}

#[test]
fn leadership_transfers_on_step_down() -> Result<()> {
    let a = node();
    a.bootstrap()?;
    a.wait_for_state(Role::Leader, Duration::from_secs(10))?;

    let b = node();
    a.add_to_cluster(b.url())?.wait_timeout(Duration::from_secs(10))?;
    wait_until(&a, "B to become a voter", |status| {
        status.topology.voters.contains_key("B")
    });
    // B must know it is a voter before it can campaign.
    wait_until(&b, "B to learn of its promotion", |status| {
        status.topology.voters.contains_key("B")
    });

    let term_before = a.term()?;
    a.step_down()?;
    b.wait_for_state(Role::Leader, Duration::from_secs(10))?;
    a.wait_for_state(Role::Follower, Duration::from_secs(10))?;

    // Election safety: the new leadership lives in a strictly higher term,
    // and the old leader has adopted it.
    let status = b.status()?;
    assert!(status.term > term_before);
    assert_eq!(status.leader, Some("B".to_string()));
    assert_eq!(a.term()?, status.term);

    // The new leader replicates to the old one.
    let proposal = b.put(b"new-leader".to_vec())?;
    let index = proposal.wait_timeout(Duration::from_secs(10))?;
    a.wait_for_commit_index(CommitWait::AtLeast, index, Duration::from_secs(10))?;
    Ok(())
}
