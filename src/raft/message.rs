use serde_derive::{Deserialize, Serialize};

use super::log::Entry;
use super::snapshot::RootObject;
use super::topology::{ClusterTopology, NodeTag};
use super::{Index, Term};

/// A message passed between peers. Messages are self-describing structured
/// records, bincode-framed over a persistent connection per peer pair: the
/// leader's ambassador dials the follower and drives negotiation, snapshot
/// transfer and append streaming on one connection; candidates open
/// short-lived connections for vote requests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Opens (or re-enters) log-length negotiation: the leader asserts the
    /// term it has at a log position, the follower compares.
    Negotiate(Negotiate),
    /// The follower's negotiation answer.
    NegotiateResponse(NegotiateResponse),
    /// Starts a snapshot transfer. Followed by zero or more SnapshotRoot
    /// frames and a final SnapshotDone.
    InstallSnapshot(SnapshotHeader),
    /// One snapshot root object.
    SnapshotRoot(RootObject),
    /// Ends a snapshot transfer.
    SnapshotDone,
    /// The follower's snapshot progress. Non-final responses are
    /// keep-alives during long installations.
    InstallSnapshotResponse { done: bool, current_term: Term, last_log_index: Index },
    /// Replicates a batch of entries. An empty batch is a heartbeat.
    AppendEntries(AppendEntries),
    /// The follower's append acknowledgement.
    AppendEntriesResponse { current_term: Term, last_log_index: Index, success: bool },
    /// A candidate's vote solicitation.
    RequestVote(RequestVote),
    /// The voter's answer.
    RequestVoteResponse { term: Term, granted: bool, message: String },
}

impl crate::encoding::Value for Message {}

/// A log-length negotiation probe from the leader: "my log has term
/// `prev_log_term` at `prev_log_index`; does yours agree?".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Negotiate {
    /// The leader's term.
    pub term: Term,
    /// The leader's node tag.
    pub leader: NodeTag,
    /// The log position being probed.
    pub prev_log_index: Index,
    /// The leader's term at that position.
    pub prev_log_term: Term,
}

/// The follower's negotiation state for one probe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NegotiationStatus {
    /// The leader's term is stale; the follower will not negotiate.
    Rejected,
    /// Negotiation is over: the logs agree at the index reported in the
    /// response's `last_log_index`.
    Acceptable,
    /// The logs disagree; the follower is binary-searching the divergent
    /// range and reports its own term at the midpoint. The leader answers
    /// with a new probe at that midpoint.
    Negotiation {
        min_index: Index,
        max_index: Index,
        midpoint_index: Index,
        midpoint_term: Term,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NegotiateResponse {
    pub status: NegotiationStatus,
    /// The follower's current term.
    pub current_term: Term,
    /// For Acceptable: the highest index where both logs agree. Otherwise
    /// the follower's last log index.
    pub last_log_index: Index,
    /// A human-readable explanation, for logs.
    pub message: String,
}

/// A snapshot transfer header. The snapshot always carries the sender's
/// authoritative topology, applied by the receiver after installation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    /// The leader's term.
    pub term: Term,
    /// The index the snapshot state corresponds to.
    pub last_included_index: Index,
    /// The term at that index.
    pub last_included_term: Term,
    /// The authoritative cluster topology.
    pub topology: ClusterTopology,
    /// True if there is nothing to install: the receiver instead verifies
    /// that its own log has reached `last_included_index`.
    pub empty: bool,
}

/// A replication batch from the leader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntries {
    /// The leader's term.
    pub term: Term,
    /// The index immediately preceding the batch (the negotiated match
    /// point for the first batch of a connection).
    pub prev_log_index: Index,
    /// The leader's commit index.
    pub leader_commit: Index,
    /// The highest index every peer has acknowledged: the follower may
    /// truncate its log prefix up to this point (bounded by its own commit
    /// index).
    pub truncate_log_before: Index,
    /// Instructs the follower to start an election immediately, for
    /// planned leadership transfer.
    pub force_elections: bool,
    /// The entries. Empty for heartbeats.
    pub entries: Vec<Entry>,
}

/// A candidate's vote solicitation for a new term.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVote {
    /// The candidate's campaign term.
    pub term: Term,
    /// The candidate's node tag.
    pub candidate: NodeTag,
    /// The candidate's last log index.
    pub last_log_index: Index,
    /// The candidate's last log term.
    pub last_log_term: Term,
}
