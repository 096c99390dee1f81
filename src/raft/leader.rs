use std::collections::{BTreeMap, HashMap};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, error, info};

use super::engine::{Inner, Proposal, Role, Shared};
use super::log::EntryFlags;
use super::message::{AppendEntries, Message, Negotiate, NegotiationStatus, SnapshotHeader};
use super::topology::{MembershipChange, NodeTag};
use super::{Index, Term, MAX_APPEND_ENTRIES};
use crate::encoding::Value as _;
use crate::errdata;
use crate::errinput;
use crate::error::{Error, Result};

/// The leader role. Replicates the log to every peer through a dedicated
/// ambassador, computes the quorum commit index, resolves pending
/// proposals in commit order, and drives topology changes.
///
/// The leader's event loop blocks on a wait-set of signals (a new entry
/// was proposed, an ambassador reported progress, shutdown) with a timeout
/// equal to the election interval, so it re-checks leadership viability
/// even when nothing happens.
pub(super) struct Leader {
    /// The term this leader was elected in. Never changes; a later term
    /// means this role is done.
    term: Term,
    /// The leader's own node tag.
    tag: NodeTag,
    /// Handle back to the engine.
    shared: Arc<Shared>,
    /// Set when the role is disposed.
    shutdown: Arc<AtomicBool>,
    /// Wakes the event loop on disposal.
    shutdown_tx: crossbeam::channel::Sender<()>,
    /// Wakes the event loop when an entry is proposed.
    new_entry_tx: crossbeam::channel::Sender<()>,
    /// Cloned into every ambassador so they can wake the event loop on
    /// replication progress.
    progress_tx: crossbeam::channel::Sender<()>,
    /// The event loop thread.
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    /// Mutable leader state. Lock order: the engine write lock, if needed,
    /// is always acquired before this one.
    inner: Mutex<LeaderInner>,
}

struct LeaderInner {
    /// One ambassador per peer, across all three membership sets.
    ambassadors: HashMap<NodeTag, Ambassador>,
    /// Peers removed from the topology, mapped to the index of the entry
    /// that removed them. Their ambassadors keep running until the peer
    /// has stored that entry (or a snapshot past it) and can eject itself.
    retiring: HashMap<NodeTag, Index>,
    /// Pending proposals by log index, resolved in commit order.
    pending: BTreeMap<Index, crossbeam::channel::Sender<Result<Index>>>,
    /// The single in-flight topology change slot: the log index of the
    /// pending topology entry, if any.
    topology_change: Option<Index>,
    /// The recorded step-down reason, once leadership is lost.
    stepdown: Option<String>,
    /// The index of this leader's own noop entry; committing it promotes
    /// LeaderElect to Leader.
    noop_index: Index,
    /// When the leader started, as the initial contact time for peers.
    started: Instant,
}

impl Leader {
    /// Appends the new leader's noop entry, spawns ambassadors for every
    /// peer in the topology, and starts the event loop. Called with the
    /// engine write lock held.
    pub(super) fn spawn(shared: Arc<Shared>, inner: &mut Inner, term: Term) -> Result<Arc<Leader>> {
        let topology = inner.log.topology().clone();
        let Some(tag) = topology.tag_of_url(&shared.url).cloned() else {
            return Err(errdata!("own url {} is not in the topology", shared.url));
        };
        let noop_index = inner.log.append(Vec::new(), EntryFlags::Noop)?;

        let (shutdown_tx, shutdown_rx) = crossbeam::channel::bounded(1);
        let (new_entry_tx, new_entry_rx) = crossbeam::channel::unbounded();
        let (progress_tx, progress_rx) = crossbeam::channel::unbounded();

        let leader = Arc::new(Leader {
            term,
            tag: tag.clone(),
            shared: shared.clone(),
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            new_entry_tx,
            progress_tx: progress_tx.clone(),
            thread: Mutex::new(None),
            inner: Mutex::new(LeaderInner {
                ambassadors: HashMap::new(),
                retiring: HashMap::new(),
                pending: BTreeMap::new(),
                topology_change: None,
                stepdown: None,
                noop_index,
                started: Instant::now(),
            }),
        });

        {
            let mut linner = leader.inner.lock()?;
            for (peer, url, _) in topology.members() {
                if *peer == tag {
                    continue;
                }
                linner.ambassadors.insert(
                    peer.clone(),
                    Ambassador::spawn(
                        shared.clone(),
                        term,
                        tag.clone(),
                        peer.clone(),
                        url.clone(),
                        progress_tx.clone(),
                    ),
                );
            }
        }

        let thread = {
            let leader = leader.clone();
            std::thread::spawn(move || leader.run(new_entry_rx, progress_rx, shutdown_rx))
        };
        *leader.thread.lock()? = Some(thread);
        Ok(leader)
    }

    /// The leader event loop.
    fn run(
        &self,
        new_entry_rx: crossbeam::channel::Receiver<()>,
        progress_rx: crossbeam::channel::Receiver<()>,
        shutdown_rx: crossbeam::channel::Receiver<()>,
    ) {
        loop {
            match self.tick() {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    error!("leader tick failed: {e}");
                    if let Ok(mut inner) = self.shared.lock() {
                        let _ = self
                            .shared
                            .demote_to_follower(&mut inner, "leader failed, restarting the role");
                    }
                    return;
                }
            }
            crossbeam::select! {
                recv(new_entry_rx) -> _ => {},
                recv(progress_rx) -> _ => {},
                recv(shutdown_rx) -> _ => return,
                default(self.shared.opts.election_timeout) => {},
            }
            // Coalesce signal bursts into one pass.
            while new_entry_rx.try_recv().is_ok() {}
            while progress_rx.try_recv().is_ok() {}
        }
    }

    /// One pass of the event loop: commit and apply what a quorum has
    /// acknowledged, advance promotables, truncate the log prefix, and
    /// verify we still have the confidence of a majority. Returns false
    /// when the role is done.
    fn tick(&self) -> Result<bool> {
        let mut inner = self.shared.lock()?;
        if self.shutdown.load(Ordering::SeqCst) || self.shared.is_shutdown() {
            return Ok(false);
        }
        if inner.log.term() != self.term
            || !matches!(inner.role, Role::Leader | Role::LeaderElect)
        {
            return Ok(false);
        }
        if !self.maybe_commit(&mut inner)? {
            return Ok(false);
        }
        self.maybe_promote(&mut inner)?;
        self.maybe_truncate(&mut inner)?;
        self.maybe_retire()?;
        self.check_confidence(&mut inner)
    }

    /// Advances the commit index to the maximum index a quorum of voters
    /// has acknowledged, if it grew and the entry there belongs to the
    /// leader's own term: entries from prior terms are never committed by
    /// quorum counting alone, they commit as a side effect (Raft paper
    /// figure 8). Applies newly committed entries, resolves pending
    /// proposals, promotes LeaderElect, and completes topology changes.
    /// Returns false if the committed topology ejected this node.
    fn maybe_commit(&self, inner: &mut Inner) -> Result<bool> {
        let topology = inner.log.topology().clone();
        let majority = topology.voter_majority();

        let mut indexes = Vec::new();
        if topology.is_voter(&self.tag) {
            indexes.push(inner.log.last_index().0);
        }
        {
            let linner = self.inner.lock()?;
            for (tag, ambassador) in &linner.ambassadors {
                if topology.is_voter(tag) {
                    indexes.push(ambassador.match_index.load(Ordering::SeqCst));
                }
            }
        }

        let Some(quorum_index) = max_index_on_quorum(&indexes, majority) else {
            return Ok(true);
        };
        let (commit_index, _) = inner.log.commit_index();
        if quorum_index <= commit_index {
            return Ok(true);
        }
        match inner.log.term_for(quorum_index)? {
            Some(term) if term == self.term => {}
            Some(_) => return Ok(true), // prior-term entry, not directly committable
            None => return Err(errdata!("quorum index {quorum_index} not in the log")),
        }

        let committed = inner.log.commit(quorum_index)?;
        debug!("committed through {committed} in term {}", self.term);
        Shared::apply_committed(inner)?;

        let mut refresh = false;
        {
            let mut linner = self.inner.lock()?;
            let resolved: Vec<Index> = linner.pending.range(..=committed).map(|(i, _)| *i).collect();
            for index in resolved {
                if let Some(tx) = linner.pending.remove(&index) {
                    let _ = tx.send(Ok(index));
                }
            }
            if inner.role == Role::LeaderElect && committed >= linner.noop_index {
                info!("own-term entry committed, leadership is complete");
                inner.role = Role::Leader;
            }
            if let Some(index) = linner.topology_change {
                if committed >= index {
                    linner.topology_change = None;
                    refresh = true;
                }
            }
        }
        self.shared.changed.notify_all();

        if refresh && !self.refresh_ambassadors(inner, committed)? {
            self.shared.set_new_state(
                inner,
                Role::Passive,
                None,
                None,
                "removed from the cluster topology",
            )?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Promotes a promotable peer to voter once its log has fully caught
    /// up with the leader's.
    fn maybe_promote(&self, inner: &mut Inner) -> Result<()> {
        let topology = inner.log.topology().clone();
        let (last_index, _) = inner.log.last_index();
        let caught_up = {
            let linner = self.inner.lock()?;
            if linner.topology_change.is_some() || linner.stepdown.is_some() {
                return Ok(());
            }
            topology.promotables.keys().find_map(|tag| {
                let ambassador = linner.ambassadors.get(tag)?;
                (ambassador.match_index.load(Ordering::SeqCst) >= last_index)
                    .then(|| tag.clone())
            })
        };
        if let Some(tag) = caught_up {
            info!("promotable {tag} has caught up, promoting to voter");
            self.try_modify_topology(inner, &tag, None, MembershipChange::Voter)?;
        }
        Ok(())
    }

    /// Truncates the log prefix up to the lowest index acknowledged across
    /// all peers (voters, promotables and non-voters alike): the leader
    /// must not discard entries some peer has not stored yet. Bounded by
    /// the commit index. Retiring peers don't hold truncation back: if
    /// their entries go away they are ejected via snapshot instead.
    fn maybe_truncate(&self, inner: &mut Inner) -> Result<()> {
        let lowest = {
            let linner = self.inner.lock()?;
            let LeaderInner { ambassadors, retiring, .. } = &*linner;
            ambassadors
                .iter()
                .filter(|(tag, _)| !retiring.contains_key(*tag))
                .map(|(_, a)| a.match_index.load(Ordering::SeqCst))
                .min()
        };
        let (commit_index, _) = inner.log.commit_index();
        let upto = lowest.map_or(commit_index, |lowest| std::cmp::min(lowest, commit_index));
        inner.log.truncate_before(upto)?;
        Ok(())
    }

    /// Disposes of ambassadors for removed peers once the peer has stored
    /// the entry (or a snapshot) that removed it and ejected itself.
    fn maybe_retire(&self) -> Result<()> {
        let mut linner = self.inner.lock()?;
        let LeaderInner { ambassadors, retiring, .. } = &mut *linner;
        let ready: Vec<NodeTag> = retiring
            .iter()
            .filter(|(tag, index)| {
                ambassadors
                    .get(*tag)
                    .map_or(true, |a| a.match_index.load(Ordering::SeqCst) >= **index)
            })
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in ready {
            debug!("retiring ambassador for removed peer {tag}");
            retiring.remove(&tag);
            if let Some(ambassador) = ambassadors.remove(&tag) {
                std::thread::spawn(move || ambassador.dispose());
            }
        }
        Ok(())
    }

    /// The leadership maintenance check: counts the voters heard from
    /// within the last election timeout (including ourselves). With fewer
    /// than a majority, raises a vote of no confidence: fails all pending
    /// proposals and falls back to candidate. This bounds how long a
    /// partitioned leader keeps believing it leads.
    fn check_confidence(&self, inner: &mut Inner) -> Result<bool> {
        let topology = inner.log.topology().clone();
        let majority = topology.voter_majority();
        let now = Instant::now();

        let mut heard = 0;
        {
            let linner = self.inner.lock()?;
            if topology.is_voter(&self.tag) {
                heard += 1;
            }
            for (tag, ambassador) in &linner.ambassadors {
                if !topology.is_voter(tag) {
                    continue;
                }
                let contact =
                    ambassador.last_contact.lock().map(|c| (*c).unwrap_or(linner.started))?;
                if now.duration_since(contact) < self.shared.opts.election_timeout {
                    heard += 1;
                }
            }
        }
        if heard >= majority {
            return Ok(true);
        }

        let reason = "vote of no confidence: lost contact with a majority of voters";
        info!("{reason}");
        self.fail_pending(reason);
        if let Err(e) = self.shared.switch_to_candidate(inner, reason, true) {
            error!("step-down to candidate failed: {e}");
            self.shared.demote_to_follower(inner, reason)?;
        }
        Ok(false)
    }

    /// Proposes a command: appends it to the log under the leader's term,
    /// registers a completion handle keyed by the index, and signals the
    /// replication loop and ambassadors.
    pub(super) fn propose(
        &self,
        inner: &mut Inner,
        command: Vec<u8>,
        flags: EntryFlags,
    ) -> Result<Proposal> {
        {
            let linner = self.inner.lock()?;
            if let Some(reason) = &linner.stepdown {
                return Err(Error::LostLeadership(reason.clone()));
            }
        }
        let index = inner.log.append(command, flags)?;
        let (tx, rx) = crossbeam::channel::bounded(1);
        {
            let mut linner = self.inner.lock()?;
            linner.pending.insert(index, tx);
            for ambassador in linner.ambassadors.values() {
                let _ = ambassador.wake_tx.try_send(());
            }
        }
        let _ = self.new_entry_tx.send(());
        Ok(Proposal::new(index, rx))
    }

    /// Proposes a topology change: computes the new topology by moving the
    /// node to the requested membership set (or out of the cluster),
    /// persists it, and replicates it as a topology-flagged entry that
    /// commits under the normal quorum rule. Only one change may be in
    /// flight at a time; ambassadors are refreshed when it commits.
    pub(super) fn try_modify_topology(
        &self,
        inner: &mut Inner,
        tag: &str,
        url: Option<String>,
        change: MembershipChange,
    ) -> Result<Proposal> {
        {
            let linner = self.inner.lock()?;
            if linner.topology_change.is_some() {
                return Err(errinput!("a topology change is already in flight"));
            }
        }
        let topology = inner.log.topology().modify(tag, url, change)?;
        let payload = topology.encode()?;
        let proposal = self.propose(inner, payload, EntryFlags::Topology)?;
        inner.log.set_topology(topology)?;
        self.inner.lock()?.topology_change = Some(proposal.index);
        self.shared.changed.notify_all();
        Ok(proposal)
    }

    /// Reconciles the ambassadors with the topology committed at the given
    /// index: unchanged peers keep their ambassador and in-flight state,
    /// removed peers' ambassadors enter retirement (they replicate until
    /// the peer learns of its removal), added peers get fresh ones.
    /// Returns false if this node itself is no longer a member.
    fn refresh_ambassadors(&self, inner: &mut Inner, committed: Index) -> Result<bool> {
        let topology = inner.log.topology().clone();
        if !topology.contains(&self.tag) {
            return Ok(false);
        }
        let mut linner = self.inner.lock()?;
        let old = std::mem::take(&mut linner.ambassadors);
        for (tag, ambassador) in old {
            match topology.url(&tag) {
                Some(url) if *url == ambassador.url => {
                    linner.retiring.remove(&tag);
                    linner.ambassadors.insert(tag, ambassador);
                }
                Some(_) => {
                    // Re-added under a different URL: replace outright.
                    debug!("disposing ambassador for relocated peer {tag}");
                    std::thread::spawn(move || ambassador.dispose());
                }
                None => {
                    linner.retiring.entry(tag.clone()).or_insert(committed);
                    linner.ambassadors.insert(tag, ambassador);
                }
            }
        }
        for (tag, url, _) in topology.members() {
            if *tag == self.tag || linner.ambassadors.contains_key(tag) {
                continue;
            }
            debug!("starting ambassador for {tag} at {url}");
            linner.ambassadors.insert(
                tag.clone(),
                Ambassador::spawn(
                    self.shared.clone(),
                    self.term,
                    self.tag.clone(),
                    tag.clone(),
                    url.clone(),
                    self.progress_tx.clone(),
                ),
            );
        }
        Ok(true)
    }

    /// Hands leadership over: flags the most caught-up voter (by match
    /// index, tie-broken by most recent contact) to force an election, and
    /// releases any operations waiting on new entries.
    pub(super) fn step_down(&self, inner: &mut Inner) -> Result<()> {
        let topology = inner.log.topology().clone();
        let linner = self.inner.lock()?;
        let mut best: Option<(NodeTag, (Index, Option<Instant>))> = None;
        for (tag, ambassador) in &linner.ambassadors {
            if !topology.is_voter(tag) {
                continue;
            }
            let contact = ambassador.last_contact.lock().map(|c| *c)?;
            let key = (ambassador.match_index.load(Ordering::SeqCst), contact);
            if best.as_ref().map_or(true, |(_, k)| key > *k) {
                best = Some((tag.clone(), key));
            }
        }
        let Some((target, _)) = best else {
            return Err(errinput!("no voter to transfer leadership to"));
        };
        info!("stepping down, transferring leadership to {target}");
        if let Some(ambassador) = linner.ambassadors.get(&target) {
            ambassador.force_elections.store(true, Ordering::SeqCst);
            let _ = ambassador.wake_tx.try_send(());
        }
        drop(linner);
        let _ = self.new_entry_tx.send(());
        Ok(())
    }

    /// Returns the per-peer replicated indexes.
    pub(super) fn progress(&self) -> BTreeMap<NodeTag, Index> {
        let Ok(linner) = self.inner.lock() else { return BTreeMap::new() };
        linner
            .ambassadors
            .iter()
            .map(|(tag, a)| (tag.clone(), a.match_index.load(Ordering::SeqCst)))
            .collect()
    }

    /// Fails all pending proposals with the recorded step-down reason.
    fn fail_pending(&self, reason: &str) {
        let Ok(mut linner) = self.inner.lock() else { return };
        linner.stepdown.get_or_insert_with(|| reason.to_string());
        let error = if self.shared.is_shutdown() {
            Error::Abort
        } else {
            Error::LostLeadership(linner.stepdown.clone().unwrap_or_else(|| reason.to_string()))
        };
        for (_, tx) in std::mem::take(&mut linner.pending) {
            let _ = tx.send(Err(error.clone()));
        }
    }

    /// Tears the role down: stops the event loop and all ambassadors,
    /// joining their threads (unless called from one of them), and fails
    /// all pending proposals.
    pub(super) fn dispose(&self, reason: &str) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.try_send(());
        let thread = self.thread.lock().ok().and_then(|mut t| t.take());
        if let Some(thread) = thread {
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
        let ambassadors: Vec<Ambassador> = match self.inner.lock() {
            Ok(mut linner) => linner.ambassadors.drain().map(|(_, a)| a).collect(),
            Err(_) => Vec::new(),
        };
        for ambassador in ambassadors {
            ambassador.dispose();
        }
        self.fail_pending(reason);
    }

}

/// Computes the quorum commit candidate: builds a histogram of
/// acknowledged indexes, walks it in descending order accumulating counts,
/// and returns the first index whose running total reaches the majority.
fn max_index_on_quorum(indexes: &[Index], majority: usize) -> Option<Index> {
    let mut histogram = BTreeMap::new();
    for index in indexes {
        *histogram.entry(*index).or_insert(0usize) += 1;
    }
    let mut count = 0;
    for (index, n) in histogram.iter().rev() {
        count += n;
        if count >= majority {
            return Some(*index);
        }
    }
    None
}

/// A per-peer replication agent. Maintains a persistent connection to its
/// peer: negotiates the match point, installs a snapshot when the peer is
/// behind the leader's truncated prefix, then streams append batches,
/// sending empty ones as heartbeats. Tracks the peer's acknowledged index
/// and last contact time for quorum counting and liveness.
struct Ambassador {
    url: String,
    /// The highest index known replicated to the peer.
    match_index: Arc<AtomicU64>,
    /// When the peer last responded.
    last_contact: Arc<Mutex<Option<Instant>>>,
    /// Set to make the next append carry the force-elections flag, for
    /// leadership transfer.
    force_elections: Arc<AtomicBool>,
    /// Wakes the replication loop when new entries are available.
    wake_tx: crossbeam::channel::Sender<()>,
    shutdown: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Ambassador {
    fn spawn(
        shared: Arc<Shared>,
        term: Term,
        leader_tag: NodeTag,
        tag: NodeTag,
        url: String,
        progress_tx: crossbeam::channel::Sender<()>,
    ) -> Ambassador {
        let match_index = Arc::new(AtomicU64::new(0));
        let last_contact = Arc::new(Mutex::new(None));
        let force_elections = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (wake_tx, wake_rx) = crossbeam::channel::bounded(1);

        let thread = {
            let run = AmbassadorRun {
                shared,
                term,
                leader_tag,
                tag,
                url: url.clone(),
                match_index: match_index.clone(),
                last_contact: last_contact.clone(),
                force_elections: force_elections.clone(),
                shutdown: shutdown.clone(),
                wake_rx,
                progress_tx,
            };
            std::thread::spawn(move || run.run())
        };
        Ambassador {
            url,
            match_index,
            last_contact,
            force_elections,
            wake_tx,
            shutdown,
            thread: Some(thread),
        }
    }

    /// Signals the replication thread to stop and joins it, unless invoked
    /// from that very thread.
    fn dispose(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.wake_tx.try_send(());
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

/// The state owned by an ambassador's replication thread.
struct AmbassadorRun {
    shared: Arc<Shared>,
    term: Term,
    leader_tag: NodeTag,
    tag: NodeTag,
    url: String,
    match_index: Arc<AtomicU64>,
    last_contact: Arc<Mutex<Option<Instant>>>,
    force_elections: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    wake_rx: crossbeam::channel::Receiver<()>,
    progress_tx: crossbeam::channel::Sender<()>,
}

impl AmbassadorRun {
    fn run(&self) {
        while !self.done() {
            match self.replicate() {
                Ok(()) => return,
                Err(Error::LostLeadership(reason)) => {
                    debug!("ambassador for {} stopping: {reason}", self.tag);
                    return;
                }
                Err(e) => debug!("replication to {} failed: {e}", self.tag),
            }
            // Back off before reconnecting.
            let _ = self.wake_rx.recv_timeout(self.shared.opts.heartbeat_interval);
        }
    }

    fn done(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) || self.shared.is_shutdown()
    }

    /// One connection lifetime: dial, negotiate, send the (possibly empty)
    /// snapshot, then stream appends until the connection or the role dies.
    fn replicate(&self) -> Result<()> {
        let addr = self
            .url
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::IO(format!("can't resolve {}", self.url)))?;
        let stream = TcpStream::connect_timeout(&addr, self.shared.opts.peer_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.shared.opts.peer_timeout))?;

        let mut match_index = self.negotiate(&stream)?;
        match_index = self.send_snapshot(&stream, match_index)?;
        self.record_progress(match_index);

        loop {
            if self.done() {
                return Ok(());
            }

            // Build the next batch under the engine lock.
            let (batch, last_index) = {
                let mut inner = self.shared.lock()?;
                self.ensure_leading(&inner)?;
                let (truncated_index, _) = inner.log.truncated_index();
                if match_index < truncated_index {
                    // The peer fell behind the truncated prefix; refresh it
                    // with a snapshot on the live connection.
                    drop(inner);
                    match_index = self.send_snapshot(&stream, match_index)?;
                    self.record_progress(match_index);
                    continue;
                }
                let entries = inner
                    .log
                    .scan(match_index + 1..)
                    .take(MAX_APPEND_ENTRIES)
                    .collect::<Result<Vec<_>>>()?;
                let batch = AppendEntries {
                    term: self.term,
                    prev_log_index: match_index,
                    leader_commit: inner.log.commit_index().0,
                    truncate_log_before: inner.log.truncated_index().0,
                    force_elections: self.force_elections.swap(false, Ordering::SeqCst),
                    entries,
                };
                (batch, inner.log.last_index().0)
            };

            let sent = batch.entries.len() as u64;
            Message::AppendEntries(batch).encode_into(&stream)?;
            match read_message(&stream)? {
                Message::AppendEntriesResponse { current_term, success, .. } => {
                    if current_term > self.term {
                        let mut inner = self.shared.lock()?;
                        self.shared.note_higher_term(
                            &mut inner,
                            current_term,
                            "peer reported a higher term",
                        )?;
                        return Err(Error::LostLeadership("observed a higher term".to_string()));
                    }
                    if !success {
                        // Renegotiate the match point on a fresh connection.
                        return Err(Error::IO(format!("append rejected by {}", self.tag)));
                    }
                    match_index += sent;
                    self.record_progress(match_index);
                }
                message => return Err(errdata!("unexpected message {message:?}")),
            }

            // If the peer is caught up, wait for new entries or the next
            // heartbeat.
            if match_index >= last_index {
                let _ = self.wake_rx.recv_timeout(self.shared.opts.heartbeat_interval);
            }
        }
    }

    /// Drives log-length negotiation: probes with our last entry, then
    /// keeps answering the follower's binary-search midpoints with our
    /// term at each, until the follower reports the highest agreed index.
    fn negotiate(&self, stream: &TcpStream) -> Result<Index> {
        let (mut probe_index, mut probe_term) = {
            let inner = self.shared.lock()?;
            self.ensure_leading(&inner)?;
            inner.log.last_index()
        };
        loop {
            let probe = Message::Negotiate(Negotiate {
                term: self.term,
                leader: self.leader_tag.clone(),
                prev_log_index: probe_index,
                prev_log_term: probe_term,
            });
            probe.encode_into(stream)?;
            let response = match read_message(stream)? {
                Message::NegotiateResponse(response) => response,
                message => return Err(errdata!("unexpected message {message:?}")),
            };
            if response.current_term > self.term {
                let mut inner = self.shared.lock()?;
                self.shared.note_higher_term(
                    &mut inner,
                    response.current_term,
                    "negotiation revealed a higher term",
                )?;
                return Err(Error::LostLeadership("observed a higher term".to_string()));
            }
            match response.status {
                NegotiationStatus::Rejected => {
                    return Err(Error::IO(format!(
                        "negotiation rejected by {}: {}",
                        self.tag, response.message
                    )));
                }
                NegotiationStatus::Acceptable => {
                    debug!("negotiated match at {} with {}", response.last_log_index, self.tag);
                    return Ok(response.last_log_index);
                }
                NegotiationStatus::Negotiation { midpoint_index, .. } => {
                    let mut inner = self.shared.lock()?;
                    self.ensure_leading(&inner)?;
                    probe_index = midpoint_index;
                    probe_term = inner.log.term_for(midpoint_index)?.unwrap_or(0);
                }
            }
        }
    }

    /// Sends a snapshot. If the peer's match point is at or above our
    /// truncated prefix there is nothing to install, and an empty header
    /// just asserts the truncation point and the authoritative topology.
    /// Otherwise the full state machine is streamed as root objects.
    /// Returns the peer's new match index.
    fn send_snapshot(&self, stream: &TcpStream, match_index: Index) -> Result<Index> {
        let (header, roots) = {
            let mut inner = self.shared.lock()?;
            self.ensure_leading(&inner)?;
            let (truncated_index, truncated_term) = inner.log.truncated_index();
            let topology = inner.log.topology().clone();
            if match_index >= truncated_index {
                let header = SnapshotHeader {
                    term: self.term,
                    last_included_index: truncated_index,
                    last_included_term: truncated_term,
                    topology,
                    empty: true,
                };
                (header, Vec::new())
            } else {
                let index = inner.state.applied_index();
                let Some(term) = inner.log.term_for(index)? else {
                    return Err(errdata!("no term known for applied index {index}"));
                };
                let header = SnapshotHeader {
                    term: self.term,
                    last_included_index: index,
                    last_included_term: term,
                    topology,
                    empty: false,
                };
                (header, inner.state.snapshot()?)
            }
        };

        let empty = header.empty;
        let last_included = header.last_included_index;
        if !empty {
            info!("sending snapshot at index {last_included} to {}", self.tag);
        }
        Message::InstallSnapshot(header).encode_into(stream)?;
        for root in roots {
            Message::SnapshotRoot(root).encode_into(stream)?;
        }
        Message::SnapshotDone.encode_into(stream)?;

        // Wait for completion; non-final responses are keep-alives.
        loop {
            match read_message(stream)? {
                Message::InstallSnapshotResponse { done, current_term, .. } => {
                    if current_term > self.term {
                        let mut inner = self.shared.lock()?;
                        self.shared.note_higher_term(
                            &mut inner,
                            current_term,
                            "snapshot response revealed a higher term",
                        )?;
                        return Err(Error::LostLeadership("observed a higher term".to_string()));
                    }
                    if done {
                        return Ok(std::cmp::max(match_index, last_included));
                    }
                }
                message => return Err(errdata!("unexpected message {message:?}")),
            }
        }
    }

    /// Fails with a leadership-loss error if the engine has moved past
    /// this leader's term or role.
    fn ensure_leading(&self, inner: &Inner) -> Result<()> {
        if inner.log.term() == self.term
            && matches!(inner.role, Role::Leader | Role::LeaderElect)
        {
            Ok(())
        } else {
            Err(Error::LostLeadership("superseded by a newer role".to_string()))
        }
    }

    fn record_progress(&self, match_index: Index) {
        self.match_index.store(match_index, Ordering::SeqCst);
        if let Ok(mut contact) = self.last_contact.lock() {
            *contact = Some(Instant::now());
        }
        let _ = self.progress_tx.send(());
    }
}

/// Reads the next message from a peer connection, treating a closed
/// connection as an error.
fn read_message(stream: &TcpStream) -> Result<Message> {
    Message::maybe_decode_from(stream)?
        .ok_or_else(|| Error::IO("connection closed by peer".to_string()))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn quorum_histogram_walks_descending() {
        // 3 voters: two peers at 5 plus the leader's own last index.
        assert_eq!(max_index_on_quorum(&[5, 5, 5], 2), Some(5));
        // A straggler holds the quorum index down.
        assert_eq!(max_index_on_quorum(&[5, 3, 5], 2), Some(5));
        assert_eq!(max_index_on_quorum(&[5, 3, 2], 2), Some(3));
        // Majority not reachable.
        assert_eq!(max_index_on_quorum(&[0, 0, 0], 1), Some(0));
        assert_eq!(max_index_on_quorum(&[], 1), None);
        // Five voters.
        assert_eq!(max_index_on_quorum(&[9, 7, 7, 3, 1], 3), Some(7));
    }
}
