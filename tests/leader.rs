//! Drives a real leader engine from a scripted follower over TCP.

use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use conclave::encoding::Value as _;
use conclave::raft::{
    ClusterTopology, Engine, EntryFlags, Message, NullState, Options, Role,
};
use conclave::storage::Memory;
use conclave::Result;

fn options(election_timeout: Duration) -> Options {
    Options {
        election_timeout,
        heartbeat_interval: Duration::from_millis(50),
        peer_timeout: Duration::from_secs(2),
    }
}

fn send(stream: &TcpStream, message: &Message) {
    message.encode_into(stream).expect("send failed");
}

fn recv(stream: &TcpStream) -> Message {
    Message::maybe_decode_from(stream).expect("recv failed").expect("connection closed")
}

/// Accepts the leader's ambassador connection and performs the initial
/// handshake for an empty follower: negotiation, then snapshot
/// installation. Returns the connection and our acknowledged index.
fn handshake(listener: &TcpListener) -> (TcpStream, u64) {
    let (stream, _) = listener.accept().expect("accept failed");
    stream.set_read_timeout(Some(Duration::from_secs(5))).expect("timeout failed");

    let Message::Negotiate(probe) = recv(&stream) else { panic!("expected negotiation") };
    assert_eq!(probe.leader, "A");
    send(
        &stream,
        &Message::NegotiateResponse(conclave::raft::NegotiateResponse {
            status: conclave::raft::NegotiationStatus::Acceptable,
            current_term: probe.term,
            last_log_index: 0,
            message: String::new(),
        }),
    );

    let Message::InstallSnapshot(header) = recv(&stream) else { panic!("expected snapshot") };
    loop {
        match recv(&stream) {
            Message::SnapshotRoot(_) => {}
            Message::SnapshotDone => break,
            message => panic!("unexpected message {message:?}"),
        }
    }
    send(
        &stream,
        &Message::InstallSnapshotResponse {
            done: true,
            current_term: header.term,
            last_log_index: header.last_included_index,
        },
    );
    (stream, header.last_included_index)
}

#[test]
fn replicates_to_a_scripted_follower() -> Result<()> {
    let a = Engine::new(
        "127.0.0.1:0",
        Box::new(Memory::new()),
        Box::new(NullState::new()),
        options(Duration::from_secs(2)),
    )?;
    a.bootstrap()?;
    a.wait_for_state(Role::Leader, Duration::from_secs(10))?;
    a.put(b"x".to_vec())?.wait_timeout(Duration::from_secs(10))?;

    // Register a scripted follower and join as its ambassador dials us.
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let url = listener.local_addr()?.to_string();
    let change = a.add_to_cluster(&url)?;
    change.wait_timeout(Duration::from_secs(10))?;

    // The leader probes with its last entry: noop (1), command (2),
    // topology (3), all in its own term.
    let (stream, mut acked) = handshake(&listener);
    assert_eq!(acked, 3);

    // Keep acknowledging appends. The leader must promote us to voter once
    // caught up (a topology entry naming "B" a voter), and a proposal must
    // then commit under the two-voter quorum.
    let proposal = a.put(b"y".to_vec())?;
    let mut promoted = false;
    let mut saw_proposal = false;
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline && !(promoted && saw_proposal) {
        let Message::AppendEntries(batch) = recv(&stream) else { panic!("expected append") };
        assert_eq!(batch.prev_log_index, acked, "append out of order");
        for entry in &batch.entries {
            if entry.flags == EntryFlags::Topology {
                let topology = ClusterTopology::decode(&entry.command)?;
                if topology.voters.contains_key("B") {
                    promoted = true;
                }
            }
            if entry.index == proposal.index {
                saw_proposal = true;
            }
        }
        acked += batch.entries.len() as u64;
        send(
            &stream,
            &Message::AppendEntriesResponse {
                current_term: batch.term,
                last_log_index: acked,
                success: true,
            },
        );
    }
    assert!(promoted, "follower was never promoted");
    assert!(saw_proposal, "proposal was never replicated");
    assert_eq!(proposal.wait_timeout(Duration::from_secs(10))?, proposal.index);

    let status = a.status()?;
    assert_eq!(status.topology.voters.len(), 2);
    assert!(status.progress.get("B").copied().unwrap_or(0) >= proposal.index);
    Ok(())
}

#[test]
fn steps_down_without_quorum_contact() -> Result<()> {
    let a = Engine::new(
        "127.0.0.1:0",
        Box::new(Memory::new()),
        Box::new(NullState::new()),
        options(Duration::from_millis(800)),
    )?;
    a.bootstrap()?;
    a.wait_for_state(Role::Leader, Duration::from_secs(10))?;

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let url = listener.local_addr()?.to_string();
    a.add_to_cluster(&url)?.wait_timeout(Duration::from_secs(10))?;
    let (stream, mut acked) = handshake(&listener);

    // Acknowledge until promoted to voter.
    let deadline = Instant::now() + Duration::from_secs(10);
    'promotion: while Instant::now() < deadline {
        let Message::AppendEntries(batch) = recv(&stream) else { panic!("expected append") };
        let mut promoted = false;
        for entry in &batch.entries {
            if entry.flags == EntryFlags::Topology {
                let topology = ClusterTopology::decode(&entry.command)?;
                promoted = topology.voters.contains_key("B");
            }
        }
        acked += batch.entries.len() as u64;
        send(
            &stream,
            &Message::AppendEntriesResponse {
                current_term: batch.term,
                last_log_index: acked,
                success: true,
            },
        );
        if promoted {
            break 'promotion;
        }
    }

    // Go silent. With only one of two voters heard from, the leader must
    // raise a vote of no confidence: pending proposals fail and the node
    // falls back to candidate.
    drop(stream);
    let proposal = a.put(b"doomed".to_vec())?;
    assert!(proposal.wait_timeout(Duration::from_secs(10)).is_err());
    a.wait_for_state(Role::Candidate, Duration::from_secs(10))?;
    Ok(())
}
