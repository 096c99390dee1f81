//! The consensus engine: lets a cluster of database nodes agree on an
//! ordered, durable command log and elect a single leader responsible for
//! proposing new entries.
//!
//! The protocol follows the Raft family of consensus algorithms (see Diego
//! Ongaro's paper at <https://raft.github.io/raft.pdf>): time is divided
//! into monotonically increasing terms, each with at most one leader, and a
//! command is committed once a majority of voters have durably stored it.
//! Committed commands are applied to a local state machine in index order
//! on every node.
//!
//! ROLES AND STATES
//! ================
//!
//! A node is always in exactly one of five states:
//!
//! * Passive: not part of any cluster (no topology). The initial state of a
//!   freshly started node, and the state a node returns to when it is
//!   removed from the cluster topology. No election clock runs.
//!
//! * Follower: connected to (or waiting for) a leader, replicating its log.
//!   An election clock runs, reset by every message from the leader; if it
//!   expires, the node becomes a candidate.
//!
//! * Candidate: campaigning for leadership, soliciting votes from the
//!   voting members. Wins with a majority, or reverts to follower when it
//!   observes a higher term or a valid leader.
//!
//! * LeaderElect: won an election, but the new term has no committed entry
//!   yet. The leader appends a noop entry to its log on election and is
//!   promoted to Leader once that entry commits, which guarantees all
//!   entries from prior terms are committed too (Raft paper 5.4.2).
//!
//! * Leader: replicates entries to the cluster, computes the quorum commit
//!   index, and drives topology changes.
//!
//! Every role runs on its own dedicated thread and owns its resources
//! (connections, per-peer ambassador threads). Role transitions go through
//! a single entry point guarded by the engine's write lock, which also
//! serializes all mutations of persistent state (term, vote, log, and
//! topology); replaced roles are torn down on a background thread so the
//! transition itself never blocks on network I/O.
//!
//! REPLICATION
//! ===========
//!
//! The leader keeps one ambassador per peer. An ambassador maintains a
//! persistent connection to its peer, first negotiating the last log
//! position both sides agree on (a binary search over the divergent range,
//! converging in O(log n) round trips), then sending a snapshot if the peer
//! is behind the leader's truncated log prefix, and finally streaming
//! append batches. Empty appends double as heartbeats.
//!
//! Cluster membership is itself replicated through the log: a topology
//! change is proposed as a flagged log entry and commits under the same
//! quorum rule as any command. New nodes join as promotables, replicating
//! without voting, and are automatically promoted to voters once caught
//! up. Non-voting members replicate indefinitely without joining quorums.

mod candidate;
mod engine;
mod follower;
mod leader;
pub mod log;
mod message;
mod snapshot;
mod state;
mod topology;

pub use engine::{CommitWait, Engine, Options, Proposal, Role, Status, TopologyWait};
pub use log::{Entry, EntryFlags, LogStore};
pub use message::{
    AppendEntries, Message, Negotiate, NegotiateResponse, NegotiationStatus, RequestVote,
    SnapshotHeader,
};
pub use snapshot::RootObject;
pub use state::{NullState, StateMachine};
pub use topology::{ClusterTopology, MemberKind, MembershipChange, NodeTag};

/// A leader term. Starts at 1, 0 indicates no term.
pub type Term = u64;

/// A log entry index. Starts at 1, 0 indicates no entry.
pub type Index = u64;

/// The base election timeout. Each wait is randomized in [1x, 2x) of this,
/// to avoid election ties.
pub const ELECTION_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(1000);

/// The interval between ambassador heartbeats (empty appends).
pub const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_millis(150);

/// The peer response read timeout. Failing it does not by itself change
/// node state, it only marks the peer unresponsive for quorum counting.
pub const PEER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// The maximum number of entries in a single append message.
pub const MAX_APPEND_ENTRIES: usize = 100;

/// The number of snapshot roots between keep-alive responses during
/// installation, so the sender's read timeout does not fire mid-transfer.
pub const SNAPSHOT_KEEPALIVE_INTERVAL: usize = 16;
