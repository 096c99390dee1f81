use std::collections::BTreeMap;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, error, info};
use rand::Rng as _;
use serde_derive::{Deserialize, Serialize};

use super::candidate::Candidate;
use super::follower::Follower;
use super::leader::Leader;
use super::log::{EntryFlags, LogStore};
use super::message::{Message, Negotiate, NegotiateResponse, NegotiationStatus, RequestVote};
use super::state::StateMachine;
use super::topology::{ClusterTopology, MembershipChange, NodeTag};
use super::{Index, Term};
use crate::encoding::Value as _;
use crate::error::{Error, Result};
use crate::{errdata, errinput, storage};

/// Engine tunables.
#[derive(Clone, Debug)]
pub struct Options {
    /// The base election timeout. Waits are randomized in [1x, 2x).
    pub election_timeout: Duration,
    /// The interval between ambassador heartbeats.
    pub heartbeat_interval: Duration,
    /// The peer response read timeout.
    pub peer_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            election_timeout: super::ELECTION_TIMEOUT,
            heartbeat_interval: super::HEARTBEAT_INTERVAL,
            peer_timeout: super::PEER_TIMEOUT,
        }
    }
}

/// A node role (state). LeaderElect is the transient sub-state of having
/// won an election: it becomes Leader once an entry of the new leader's own
/// term has committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Passive,
    Candidate,
    Follower,
    LeaderElect,
    Leader,
}

/// A point-in-time engine status report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The local node's tag, if it is a cluster member.
    pub tag: Option<NodeTag>,
    /// The local node's role.
    pub role: Role,
    /// The current term.
    pub term: Term,
    /// The known leader, if any.
    pub leader: Option<NodeTag>,
    /// The last log index.
    pub last_index: Index,
    /// The commit index.
    pub commit_index: Index,
    /// The state machine's applied index.
    pub applied_index: Index,
    /// The cluster topology.
    pub topology: ClusterTopology,
    /// Per-peer replicated indexes, as tracked by the leader's ambassadors.
    /// Empty on non-leaders.
    pub progress: BTreeMap<NodeTag, Index>,
}

/// A commit index wait mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitWait {
    /// Wait until the commit index differs from the given value.
    AnyChange,
    /// Wait until the commit index is at or above the given value.
    AtLeast,
}

/// A topology wait mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopologyWait {
    /// Wait until the given node is a cluster member.
    Contains,
    /// Wait until the given node is no longer a cluster member.
    Removed,
}

/// A pending proposal: resolves with the committed index once the entry is
/// committed, or with an error if leadership is lost first.
#[derive(Debug)]
pub struct Proposal {
    /// The log index the proposal was appended at.
    pub index: Index,
    rx: crossbeam::channel::Receiver<Result<Index>>,
}

impl Proposal {
    pub(super) fn new(index: Index, rx: crossbeam::channel::Receiver<Result<Index>>) -> Self {
        Self { index, rx }
    }

    /// Blocks until the proposal commits or fails.
    pub fn wait(&self) -> Result<Index> {
        Ok(self.rx.recv()??)
    }

    /// Like wait(), but gives up after the given duration.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Index> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                Err(Error::IO(format!("proposal {} timed out", self.index)))
            }
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => Err(Error::Abort),
        }
    }
}

/// A handle to a running role thread, used to dispose of it.
pub(super) struct RoleHandle {
    pub(super) shutdown: Arc<AtomicBool>,
    pub(super) thread: Option<std::thread::JoinHandle<()>>,
}

impl RoleHandle {
    /// Signals the role thread to stop and joins it, unless invoked from
    /// that very thread.
    pub(super) fn dispose(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

/// The active role object, owned by the engine. Replacing it triggers
/// teardown of the previous role's threads and connections on a background
/// thread, so the role switch itself is not blocked on network I/O.
pub(super) enum ActiveRole {
    Follower(RoleHandle),
    Candidate(RoleHandle),
    Leader(Arc<Leader>),
}

impl ActiveRole {
    fn dispose(self, reason: &str) {
        match self {
            ActiveRole::Follower(handle) | ActiveRole::Candidate(handle) => handle.dispose(),
            ActiveRole::Leader(leader) => leader.dispose(reason),
        }
    }
}

/// The engine state guarded by the write lock. Every mutation of persistent
/// state (term, vote, log, topology) and every role transition happens
/// while holding this lock, which is what prevents a stale role object from
/// corrupting state after it has been superseded.
pub(super) struct Inner {
    /// The persistent log store.
    pub(super) log: LogStore,
    /// The replicated state machine.
    pub(super) state: Box<dyn StateMachine>,
    /// The current role.
    pub(super) role: Role,
    /// The active role object, if a role thread is running.
    pub(super) active: Option<ActiveRole>,
    /// The known leader in the current term, if any.
    pub(super) leader: Option<NodeTag>,
}

/// The election clock: a deadline armed while the node is a follower,
/// re-armed by every leader message, and disarmed for roles that manage
/// their own timing. Expiry triggers a candidate transition.
struct Timer {
    deadline: Mutex<Option<Instant>>,
    cv: Condvar,
}

/// State shared between the engine handle and its role threads. Roles hold
/// an Arc back to this rather than any duplicated mutable state.
pub(super) struct Shared {
    /// The local node's advertised URL, also used to find the node's own
    /// tag in received topologies.
    pub(super) url: String,
    /// Engine tunables.
    pub(super) opts: Options,
    /// The engine state, guarded by the write lock.
    pub(super) inner: Mutex<Inner>,
    /// Signaled on role, commit, and topology changes, for observation
    /// barriers.
    pub(super) changed: Condvar,
    /// The election clock.
    timer: Timer,
    /// Set once, when the engine shuts down.
    pub(super) shutdown: AtomicBool,
}

impl Shared {
    /// Acquires the engine write lock.
    pub(super) fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        Ok(self.inner.lock()?)
    }

    /// Returns true once the engine is shutting down.
    pub(super) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// The single role transition entry point. If an expected term is
    /// given, fails with a concurrency error when it no longer matches the
    /// current term (a stale role object racing a term bump). The previous
    /// role's resources are disposed of asynchronously. A Passive
    /// transition also clears the topology: the node was ejected from the
    /// cluster.
    pub(super) fn set_new_state(
        &self,
        inner: &mut Inner,
        role: Role,
        active: Option<ActiveRole>,
        expected_term: Option<Term>,
        reason: &str,
    ) -> Result<()> {
        if let Some(term) = expected_term {
            if term != inner.log.term() {
                return Err(Error::Concurrency(format!(
                    "term moved from {term} to {} during a role transition",
                    inner.log.term()
                )));
            }
        }
        info!("entering {role:?} in term {}: {reason}", inner.log.term());
        if let Some(old) = inner.active.take() {
            let reason = reason.to_string();
            std::thread::spawn(move || old.dispose(&reason));
        }
        inner.role = role;
        inner.active = active;
        match role {
            Role::Passive => {
                inner.leader = None;
                inner.log.set_topology(ClusterTopology::empty())?;
                self.suspend_timer();
            }
            Role::Follower => self.defer_timer(),
            Role::Candidate | Role::LeaderElect | Role::Leader => self.suspend_timer(),
        }
        self.changed.notify_all();
        Ok(())
    }

    /// Starts a candidate, campaigning for leadership. Refuses if the node
    /// has no topology or is not a voter.
    pub(super) fn switch_to_candidate(
        self: &Arc<Self>,
        inner: &mut Inner,
        reason: &str,
        forced: bool,
    ) -> Result<()> {
        let topology = inner.log.topology();
        if topology.id.is_none() {
            return Err(errinput!("not a cluster member"));
        }
        let Some(tag) = topology.tag_of_url(&self.url) else {
            return Err(errinput!("node url {} is not in the topology", self.url));
        };
        if !topology.is_voter(tag) {
            return Err(errinput!("only voters can campaign"));
        }
        inner.leader = None;
        let handle = Candidate::spawn(self.clone(), forced);
        self.set_new_state(inner, Role::Candidate, Some(ActiveRole::Candidate(handle)), None, reason)
    }

    /// Starts a leader for the given term, entering LeaderElect. The term
    /// must still be current.
    pub(super) fn switch_to_leader(
        self: &Arc<Self>,
        inner: &mut Inner,
        term: Term,
        reason: &str,
    ) -> Result<()> {
        if term != inner.log.term() {
            return Err(Error::Concurrency(format!(
                "can't lead term {term}, current term is {}",
                inner.log.term()
            )));
        }
        let leader = Leader::spawn(self.clone(), inner, term)?;
        self.set_new_state(
            inner,
            Role::LeaderElect,
            Some(ActiveRole::Leader(leader)),
            Some(term),
            reason,
        )?;
        inner.leader = inner.log.topology().tag_of_url(&self.url).cloned();
        Ok(())
    }

    /// Adopts a term discovered from a message if it is higher than the
    /// current one, demoting any leader or candidate role. Returns whether
    /// the term advanced. The term leads all roles: whatever a node is
    /// doing, a higher term overrides it.
    pub(super) fn note_higher_term(
        &self,
        inner: &mut Inner,
        term: Term,
        reason: &str,
    ) -> Result<bool> {
        if !inner.log.found_higher_term(term)? {
            return Ok(false);
        }
        self.demote_to_follower(inner, reason)?;
        Ok(true)
    }

    /// Demotes an active leader or candidate to a leaderless follower,
    /// restarting the election clock.
    pub(super) fn demote_to_follower(&self, inner: &mut Inner, reason: &str) -> Result<()> {
        inner.leader = None;
        match inner.role {
            Role::Candidate | Role::LeaderElect | Role::Leader => {
                self.set_new_state(inner, Role::Follower, None, None, reason)
            }
            Role::Follower | Role::Passive => {
                self.defer_timer();
                Ok(())
            }
        }
    }

    /// Applies any committed but unapplied entries to the state machine,
    /// strictly in index order.
    pub(super) fn apply_committed(inner: &mut Inner) -> Result<()> {
        let applied = inner.state.applied_index();
        let (commit, _) = inner.log.commit_index();
        if applied >= commit {
            return Ok(());
        }
        let Inner { ref mut log, ref mut state, .. } = *inner;
        let mut scan = log.scan(applied + 1..=commit);
        while let Some(entry) = scan.next().transpose()? {
            debug!("applying entry {}@{}", entry.index, entry.term);
            state.apply(&entry)?;
        }
        Ok(())
    }

    /// Handles an inbound leader connection: adopts the leader (and its
    /// term, if higher) and hands the connection to a new follower role.
    /// Stale terms are rejected without mutating anything, as is a claimed
    /// leader for our own term while we are leader (there can't be two).
    fn accept_leader(self: &Arc<Self>, stream: TcpStream, hello: Negotiate) -> Result<()> {
        let mut inner = self.lock()?;
        let term = inner.log.term();
        let we_lead = matches!(inner.role, Role::Leader | Role::LeaderElect);
        if hello.term < term || (hello.term == term && we_lead) {
            let (last_index, _) = inner.log.last_index();
            drop(inner);
            debug!("rejecting leader {} with stale term {}", hello.leader, hello.term);
            let response = Message::NegotiateResponse(NegotiateResponse {
                status: NegotiationStatus::Rejected,
                current_term: term,
                last_log_index: last_index,
                message: format!("term {} is not current", hello.term),
            });
            response.encode_into(&stream)?;
            return Ok(());
        }
        inner.log.found_higher_term(hello.term)?;
        inner.leader = Some(hello.leader.clone());
        let handle = Follower::spawn(self.clone(), stream, hello);
        self.set_new_state(
            &mut inner,
            Role::Follower,
            Some(ActiveRole::Follower(handle)),
            None,
            "accepted a leader connection",
        )
    }

    /// Handles a vote solicitation. Grants at most one vote per term, only
    /// to voters whose log is at least as up-to-date as ours, and persists
    /// the vote before responding.
    pub(super) fn process_vote_request(self: &Arc<Self>, rv: RequestVote) -> Result<Message> {
        let mut inner = self.lock()?;
        let current = inner.log.term();
        let reject = |term: Term, message: &str| Message::RequestVoteResponse {
            term,
            granted: false,
            message: message.to_string(),
        };

        let topology = inner.log.topology();
        let Some(tag) = topology.tag_of_url(&self.url).cloned() else {
            return Ok(reject(current, "not a cluster member"));
        };
        if !inner.log.topology().is_voter(&tag) {
            return Ok(reject(current, "not a voter"));
        }
        if !inner.log.topology().is_voter(&rv.candidate) {
            return Ok(reject(current, "candidate is not a voter"));
        }
        if rv.term < current {
            return Ok(reject(current, "campaign term is stale"));
        }
        if rv.term == current {
            // Re-grant an identical request (a lost response), but never
            // vote twice in a term.
            return Ok(Message::RequestVoteResponse {
                term: current,
                granted: inner.log.vote() == Some(&rv.candidate),
                message: "already voted in this term".to_string(),
            });
        }

        // The campaign term is higher than ours, so adopt it whatever the
        // vote outcome.
        let (last_index, last_term) = inner.log.last_index();
        let up_to_date = rv.last_log_term > last_term
            || (rv.last_log_term == last_term && rv.last_log_index >= last_index);
        if !up_to_date {
            self.note_higher_term(&mut inner, rv.term, "vote solicited in a higher term")?;
            return Ok(reject(rv.term, "candidate log is behind"));
        }
        inner.log.cast_vote_in_term(rv.term, Some(rv.candidate.clone()))?;
        info!("voting for {} in term {}", rv.candidate, rv.term);
        self.demote_to_follower(&mut inner, "granted a vote in a higher term")?;
        Ok(Message::RequestVoteResponse {
            term: rv.term,
            granted: true,
            message: String::new(),
        })
    }

    /// Re-arms the election clock with a randomized timeout.
    pub(super) fn defer_timer(&self) {
        let base = self.opts.election_timeout.as_millis() as u64;
        let timeout = Duration::from_millis(rand::thread_rng().gen_range(base..2 * base));
        if let Ok(mut deadline) = self.timer.deadline.lock() {
            *deadline = Some(Instant::now() + timeout);
            self.timer.cv.notify_all();
        }
    }

    /// Disarms the election clock.
    fn suspend_timer(&self) {
        if let Ok(mut deadline) = self.timer.deadline.lock() {
            *deadline = None;
            self.timer.cv.notify_all();
        }
    }

    /// Called when the election clock expires: a follower that has not
    /// heard from a leader becomes a candidate.
    fn election_elapsed(self: &Arc<Self>) {
        let Ok(mut inner) = self.lock() else { return };
        if self.is_shutdown() || inner.role != Role::Follower {
            return;
        }
        if let Err(e) = self.switch_to_candidate(&mut inner, "election timeout", false) {
            // E.g. a non-voter: keep waiting for a leader instead.
            debug!("not campaigning: {e}");
            self.defer_timer();
        }
    }
}

/// The election clock thread.
fn run_timer(shared: Arc<Shared>) {
    loop {
        if shared.is_shutdown() {
            return;
        }
        let Ok(deadline) = shared.timer.deadline.lock() else { return };
        let now = Instant::now();
        match *deadline {
            // Disarmed: wake up periodically to check for shutdown.
            None => {
                let _ = shared.timer.cv.wait_timeout(deadline, Duration::from_millis(200));
            }
            Some(at) if at > now => {
                let _ = shared.timer.cv.wait_timeout(deadline, at - now);
            }
            Some(_) => {
                let mut deadline = deadline;
                *deadline = None;
                drop(deadline);
                shared.election_elapsed();
            }
        }
    }
}

/// The listener thread: accepts peer connections and hands each to its own
/// handler thread.
fn run_listener(shared: Arc<Shared>, listener: TcpListener) {
    for stream in listener.incoming() {
        if shared.is_shutdown() {
            return;
        }
        match stream {
            Ok(stream) => {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
                    if let Err(e) = handle_connection(shared, stream) {
                        debug!("connection from {peer} ended: {e}");
                    }
                });
            }
            Err(e) => error!("accepting a connection failed: {e}"),
        }
    }
}

/// Serves one inbound connection. Vote requests are answered in place; a
/// negotiation message promotes the connection to a follower role, which
/// takes ownership of the socket.
fn handle_connection(shared: Arc<Shared>, stream: TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(shared.opts.peer_timeout))?;
    loop {
        let Some(message) = Message::maybe_decode_from(&stream)? else { return Ok(()) };
        match message {
            Message::RequestVote(rv) => {
                let response = shared.process_vote_request(rv)?;
                response.encode_into(&stream)?;
            }
            Message::Negotiate(hello) => return shared.accept_leader(stream, hello),
            message => return Err(errdata!("unexpected message {message:?}")),
        }
    }
}

/// The consensus engine for one node. Owns the persistent log store, the
/// current role, the election clock, and the peer listener. Dropping the
/// engine shuts it down, cascading into the active role.
pub struct Engine {
    shared: Arc<Shared>,
    listener: Option<std::thread::JoinHandle<()>>,
    timer: Option<std::thread::JoinHandle<()>>,
}

impl Engine {
    /// Starts an engine listening on the given URL. A node with a persisted
    /// topology starts as a follower awaiting a leader; a node without one
    /// starts passive, until it is bootstrapped or added to a cluster. If
    /// the URL has port 0, an ephemeral port is chosen and advertised.
    pub fn new(
        url: &str,
        engine: Box<dyn storage::Engine>,
        state: Box<dyn StateMachine>,
        opts: Options,
    ) -> Result<Self> {
        let addr = url
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::InvalidInput(format!("can't resolve {url}")))?;
        let listener = TcpListener::bind(addr)?;
        let url =
            if addr.port() == 0 { listener.local_addr()?.to_string() } else { url.to_string() };

        let log = LogStore::new(engine)?;
        let role = if log.topology().id.is_some() { Role::Follower } else { Role::Passive };
        info!("node {url} starting as {role:?} in term {}", log.term());

        let shared = Arc::new(Shared {
            url,
            opts,
            inner: Mutex::new(Inner { log, state, role, active: None, leader: None }),
            changed: Condvar::new(),
            timer: Timer { deadline: Mutex::new(None), cv: Condvar::new() },
            shutdown: AtomicBool::new(false),
        });

        // Catch the state machine up with the committed log, in case it
        // lagged the commit marker at the last shutdown.
        Shared::apply_committed(&mut *shared.lock()?)?;
        if role == Role::Follower {
            shared.defer_timer();
        }

        let listener_thread = {
            let shared = shared.clone();
            std::thread::spawn(move || run_listener(shared, listener))
        };
        let timer_thread = {
            let shared = shared.clone();
            std::thread::spawn(move || run_timer(shared))
        };
        Ok(Self { shared, listener: Some(listener_thread), timer: Some(timer_thread) })
    }

    /// Returns the node's advertised URL.
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Returns the node's current role.
    pub fn role(&self) -> Result<Role> {
        Ok(self.shared.lock()?.role)
    }

    /// Returns the node's current term.
    pub fn term(&self) -> Result<Term> {
        Ok(self.shared.lock()?.log.term())
    }

    /// Returns a status report.
    pub fn status(&self) -> Result<Status> {
        let inner = self.shared.lock()?;
        let progress = match &inner.active {
            Some(ActiveRole::Leader(leader)) => leader.progress(),
            _ => BTreeMap::new(),
        };
        Ok(Status {
            tag: inner.log.topology().tag_of_url(&self.shared.url).cloned(),
            role: inner.role,
            term: inner.log.term(),
            leader: inner.leader.clone(),
            last_index: inner.log.last_index().0,
            commit_index: inner.log.commit_index().0,
            applied_index: inner.state.applied_index(),
            topology: inner.log.topology().clone(),
            progress,
        })
    }

    /// Bootstraps a single-node cluster: assigns this node the tag "A",
    /// persists a fresh topology containing only it, and immediately
    /// becomes leader. The only path from Passive to Leader without an
    /// election. Fails if the node already belongs to a cluster.
    pub fn bootstrap(&self) -> Result<()> {
        let mut inner = self.shared.lock()?;
        if inner.role != Role::Passive {
            return Err(errinput!("node is already a cluster member"));
        }
        if inner.log.last_index().0 > 0 {
            return Err(errinput!("node has existing log entries"));
        }
        let tag = "A".to_string();
        inner.log.set_topology(ClusterTopology::bootstrap(tag.clone(), self.shared.url.clone()))?;
        let term = inner.log.term() + 1;
        inner.log.cast_vote_in_term(term, Some(tag))?;
        self.shared.switch_to_leader(&mut inner, term, "bootstrap")
    }

    /// Proposes a command for the replicated log. Returns a proposal that
    /// resolves with the committed index. Fails with a not-leader error if
    /// the local node has no active leader role.
    pub fn put(&self, command: Vec<u8>) -> Result<Proposal> {
        let mut inner = self.shared.lock()?;
        let leader = match (inner.role, &inner.active) {
            (Role::Leader | Role::LeaderElect, Some(ActiveRole::Leader(leader))) => leader.clone(),
            _ => return Err(Error::NotLeader),
        };
        leader.propose(&mut inner, command, EntryFlags::StateMachineCommand)
    }

    /// Adds the node at the given URL to the cluster as a promotable
    /// member, assigning it the next node tag. It is promoted to voter
    /// automatically once it has caught up. Leader only.
    pub fn add_to_cluster(&self, url: &str) -> Result<Proposal> {
        let mut inner = self.shared.lock()?;
        let leader = Self::active_leader(&inner)?;
        if inner.log.topology().members().any(|(_, u, _)| u == url) {
            return Err(errinput!("node {url} is already a cluster member"));
        }
        let tag = inner.log.topology().next_tag();
        leader.try_modify_topology(
            &mut inner,
            &tag,
            Some(url.to_string()),
            MembershipChange::Promotable,
        )
    }

    /// Removes the given node from the cluster. Leader only; the leader
    /// cannot remove itself (step down first).
    pub fn remove_from_cluster(&self, tag: &str) -> Result<Proposal> {
        let mut inner = self.shared.lock()?;
        let leader = Self::active_leader(&inner)?;
        if inner.log.topology().tag_of_url(&self.shared.url).map(|t| t.as_str()) == Some(tag) {
            return Err(errinput!("can't remove the current leader, step down first"));
        }
        leader.try_modify_topology(&mut inner, tag, None, MembershipChange::Remove)
    }

    /// Hands leadership to the most caught-up voter by flagging it to force
    /// an election. Leader only.
    pub fn step_down(&self) -> Result<()> {
        let mut inner = self.shared.lock()?;
        let leader = Self::active_leader(&inner)?;
        leader.step_down(&mut inner)
    }

    fn active_leader(inner: &Inner) -> Result<Arc<Leader>> {
        match (inner.role, &inner.active) {
            (Role::Leader, Some(ActiveRole::Leader(leader))) => Ok(leader.clone()),
            _ => Err(Error::NotLeader),
        }
    }

    /// Blocks until the node reaches the given role.
    pub fn wait_for_state(&self, role: Role, timeout: Duration) -> Result<()> {
        self.wait_for(timeout, |inner| inner.role == role)
    }

    /// Blocks until the commit index satisfies the given wait mode.
    pub fn wait_for_commit_index(
        &self,
        wait: CommitWait,
        index: Index,
        timeout: Duration,
    ) -> Result<()> {
        self.wait_for(timeout, |inner| {
            let (commit, _) = inner.log.commit_index();
            match wait {
                CommitWait::AnyChange => commit != index,
                CommitWait::AtLeast => commit >= index,
            }
        })
    }

    /// Blocks until the topology satisfies the given wait mode for the
    /// given node tag.
    pub fn wait_for_topology(
        &self,
        wait: TopologyWait,
        tag: &str,
        timeout: Duration,
    ) -> Result<()> {
        self.wait_for(timeout, |inner| {
            let contains = inner.log.topology().contains(tag);
            match wait {
                TopologyWait::Contains => contains,
                TopologyWait::Removed => !contains,
            }
        })
    }

    fn wait_for(&self, timeout: Duration, predicate: impl Fn(&Inner) -> bool) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.lock()?;
        loop {
            if predicate(&inner) {
                return Ok(());
            }
            if self.shared.is_shutdown() {
                return Err(Error::Abort);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::IO("timed out waiting for convergence".to_string()));
            }
            let (guard, _) = self.shared.changed.wait_timeout(inner, deadline - now)?;
            inner = guard;
        }
    }

    /// Shuts the engine down: disposes the active role (joining its
    /// threads), stops the listener and election clock, and fails pending
    /// proposals. Idempotent.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("node {} shutting down", self.shared.url);
        let active = self.shared.lock()?.active.take();
        if let Some(active) = active {
            active.dispose("engine shut down");
        }
        self.shared.changed.notify_all();
        if let Ok(mut deadline) = self.shared.timer.deadline.lock() {
            *deadline = None;
            self.shared.timer.cv.notify_all();
        }
        // Unblock the listener's accept loop.
        if let Ok(addr) = self.shared.url.parse() {
            let _ = TcpStream::connect_timeout(&addr, Duration::from_millis(100));
        }
        if let Some(thread) = self.listener.take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.timer.take() {
            let _ = thread.join();
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("engine shutdown failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::super::state::tests::TestState;
    use super::*;
    use crate::storage::Memory;

    fn setup() -> Engine {
        Engine::new(
            "127.0.0.1:0",
            Box::new(Memory::new()),
            Box::new(TestState::new()),
            Options {
                election_timeout: Duration::from_millis(200),
                heartbeat_interval: Duration::from_millis(50),
                peer_timeout: Duration::from_millis(500),
            },
        )
        .expect("engine start failed")
    }

    #[test]
    fn starts_passive_without_topology() -> Result<()> {
        let engine = setup();
        assert_eq!(engine.role()?, Role::Passive);
        assert_eq!(engine.term()?, 0);
        assert_eq!(engine.put(b"x".to_vec()).unwrap_err(), Error::NotLeader);
        Ok(())
    }

    #[test]
    fn bootstrap_becomes_leader_without_election() -> Result<()> {
        let engine = setup();
        engine.bootstrap()?;
        engine.wait_for_state(Role::Leader, Duration::from_secs(5))?;

        let status = engine.status()?;
        assert_eq!(status.tag, Some("A".to_string()));
        assert_eq!(status.term, 1);
        assert_eq!(status.leader, Some("A".to_string()));
        // The leader's own-term noop entry has committed.
        assert_eq!(status.commit_index, 1);

        // Bootstrapping twice fails.
        assert!(matches!(engine.bootstrap(), Err(Error::InvalidInput(_))));
        Ok(())
    }

    #[test]
    fn put_commits_on_a_single_node() -> Result<()> {
        let engine = setup();
        engine.bootstrap()?;
        engine.wait_for_state(Role::Leader, Duration::from_secs(5))?;

        let proposal = engine.put(b"a=1".to_vec())?;
        assert_eq!(proposal.index, 2);
        assert_eq!(proposal.wait_timeout(Duration::from_secs(5))?, 2);
        engine.wait_for_commit_index(CommitWait::AtLeast, 2, Duration::from_secs(5))?;
        assert_eq!(engine.status()?.applied_index, 2);
        Ok(())
    }

    #[test]
    fn set_new_state_guards_against_stale_terms() -> Result<()> {
        let engine = setup();
        engine.bootstrap()?;
        engine.wait_for_state(Role::Leader, Duration::from_secs(5))?;

        let shared = engine.shared.clone();
        let mut inner = shared.lock()?;
        let err = shared
            .set_new_state(&mut inner, Role::Follower, None, Some(99), "stale transition")
            .unwrap_err();
        assert!(matches!(err, Error::Concurrency(_)));
        Ok(())
    }

    #[test]
    fn vote_requests_follow_the_rules() -> Result<()> {
        let engine = setup();
        engine.bootstrap()?;
        engine.wait_for_state(Role::Leader, Duration::from_secs(5))?;

        // Votes are only exchanged between voters: "A" is the only member.
        let response = engine.shared.process_vote_request(RequestVote {
            term: 5,
            candidate: "B".to_string(),
            last_log_index: 10,
            last_log_term: 5,
        })?;
        let Message::RequestVoteResponse { granted, .. } = response else {
            panic!("unexpected response")
        };
        assert!(!granted);
        Ok(())
    }
}
