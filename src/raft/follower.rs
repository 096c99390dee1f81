use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};

use super::engine::{ActiveRole, Role, RoleHandle, Shared};
use super::log::LogStore;
use super::message::{
    AppendEntries, Message, Negotiate, NegotiateResponse, NegotiationStatus, SnapshotHeader,
};
use super::{Index, Term, SNAPSHOT_KEEPALIVE_INTERVAL};
use crate::encoding::Value as _;
use crate::errdata;
use crate::error::{Error, Result};

/// The follower role. Owns the connection from the leader's ambassador and
/// runs its receive loop on a dedicated thread: first negotiating the last
/// matching log position, then installing the (possibly empty) snapshot,
/// then appending entry batches, advancing the commit index and truncating
/// the log prefix as instructed.
///
/// Every inbound message re-arms the election clock. Any connection fault,
/// including a read timeout, ends the role; the engine then waits out the
/// election clock and retries via the normal election cycle.
pub(super) struct Follower;

impl Follower {
    /// Takes ownership of an accepted leader connection and starts the
    /// receive loop.
    pub(super) fn spawn(shared: Arc<Shared>, stream: TcpStream, hello: Negotiate) -> RoleHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread = {
            let shutdown = shutdown.clone();
            std::thread::spawn(move || run(shared, shutdown, stream, hello))
        };
        RoleHandle { shutdown, thread: Some(thread) }
    }
}

fn run(shared: Arc<Shared>, shutdown: Arc<AtomicBool>, stream: TcpStream, hello: Negotiate) {
    let leader = hello.leader.clone();
    match serve(&shared, &shutdown, &stream, hello) {
        Ok(()) => debug!("follower connection to {leader} ended"),
        Err(e) => debug!("follower connection to {leader} failed: {e}"),
    }
    if shutdown.load(Ordering::SeqCst) || shared.is_shutdown() {
        // Disposed by a role transition, which owns the election clock.
        return;
    }
    // The connection died on its own: clear the active role and restart
    // the election clock, so the engine retries via an election.
    if let Ok(mut inner) = shared.lock() {
        if let Some(ActiveRole::Follower(handle)) = &inner.active {
            if Arc::ptr_eq(&handle.shutdown, &shutdown) {
                inner.active = None;
                shared.defer_timer();
            }
        }
    }
}

fn serve(
    shared: &Arc<Shared>,
    shutdown: &Arc<AtomicBool>,
    stream: &TcpStream,
    hello: Negotiate,
) -> Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(shared.opts.peer_timeout))?;

    // Negotiate the last matching log position.
    let mut negotiation = None;
    let mut probe = hello;
    let agreed = loop {
        shared.defer_timer();
        let (outcome, current_term, last_index) = {
            let mut inner = shared.lock()?;
            let outcome = negotiate_step(
                &mut inner.log,
                &mut negotiation,
                probe.prev_log_index,
                probe.prev_log_term,
            )?;
            (outcome, inner.log.term(), inner.log.last_index().0)
        };
        let (status, reported_index, agreed) = match outcome {
            NegotiationStatus::Acceptable => {
                // Acceptable reports the agreed index as last_log_index.
                let agreed = match &negotiation {
                    Some(range) => range.best,
                    None => probe.prev_log_index.min(last_index),
                };
                (NegotiationStatus::Acceptable, agreed, Some(agreed))
            }
            status => (status, last_index, None),
        };
        let response = Message::NegotiateResponse(NegotiateResponse {
            status,
            current_term,
            last_log_index: reported_index,
            message: String::new(),
        });
        response.encode_into(stream)?;
        if let Some(agreed) = agreed {
            break agreed;
        }
        probe = match read_message(stream)? {
            Message::Negotiate(probe) => probe,
            message => return Err(errdata!("unexpected message {message:?}")),
        };
    };
    debug!("negotiated log match at index {agreed}");

    // The leader unconditionally sends a snapshot next, possibly empty.
    match read_message(stream)? {
        Message::InstallSnapshot(header) => {
            if !install_snapshot(shared, stream, header)? {
                return Ok(());
            }
        }
        message => return Err(errdata!("unexpected message {message:?}")),
    }

    // Steady state: append batches, commit, truncate.
    loop {
        if shutdown.load(Ordering::SeqCst) || shared.is_shutdown() {
            return Ok(());
        }
        let message = read_message(stream)?;
        shared.defer_timer();
        match message {
            Message::AppendEntries(batch) => {
                if !process_append(shared, stream, batch)? {
                    return Ok(());
                }
            }
            // The peer fell behind the leader's truncated prefix at some
            // point; the leader refreshes it mid-stream.
            Message::InstallSnapshot(header) => {
                if !install_snapshot(shared, stream, header)? {
                    return Ok(());
                }
            }
            message => return Err(errdata!("unexpected message {message:?}")),
        }
    }
}

/// The follower's binary-search state across negotiation rounds.
#[derive(Debug, PartialEq)]
struct NegotiationRange {
    min: Index,
    max: Index,
    /// The highest index known to agree so far. The truncated prefix is
    /// committed state every legitimate leader shares, so it starts there.
    best: Index,
}

/// One negotiation round. The leader asserts the term it has at an index;
/// we either accept (terms match at the probe, or there is nothing left to
/// compare) or narrow the divergent range and report our own term at its
/// midpoint, for the leader to assert against next.
fn negotiate_step(
    log: &mut LogStore,
    range: &mut Option<NegotiationRange>,
    prev_index: Index,
    prev_term: Term,
) -> Result<NegotiationStatus> {
    if let Some(range) = range {
        // The leader answered our midpoint probe.
        if log.has(prev_index, prev_term)? {
            range.best = prev_index;
            range.min = prev_index + 1;
        } else {
            range.max = prev_index.saturating_sub(1);
        }
        if range.min > range.max || range.max == 0 {
            return Ok(NegotiationStatus::Acceptable);
        }
        return Ok(midpoint(log, range.min, range.max)?);
    }

    // First probe.
    let (last_index, _) = log.last_index();
    let (truncated_index, _) = log.truncated_index();
    if last_index == 0 {
        // Nothing stored at all: ask for everything from the start.
        return Ok(NegotiationStatus::Acceptable);
    }
    if prev_index <= last_index && log.has(prev_index, prev_term)? {
        return Ok(NegotiationStatus::Acceptable);
    }

    let min = truncated_index + 1;
    let max = std::cmp::min(last_index, prev_index);
    if max < min {
        // No retained entries overlap the probe; agree at the truncation
        // marker and let the leader replay or snapshot from there.
        *range = Some(NegotiationRange { min, max: min, best: truncated_index });
        return Ok(NegotiationStatus::Acceptable);
    }
    *range = Some(NegotiationRange { min, max, best: truncated_index });
    midpoint(log, min, max)
}

fn midpoint(log: &mut LogStore, min: Index, max: Index) -> Result<NegotiationStatus> {
    let midpoint_index = min + (max - min) / 2;
    let midpoint_term = log.term_for(midpoint_index)?.unwrap_or(0);
    Ok(NegotiationStatus::Negotiation { min_index: min, max_index: max, midpoint_index, midpoint_term })
}

/// Installs a snapshot stream. An empty snapshot only verifies that our
/// log has reached the claimed index (a contradiction means inconsistent
/// state and is fatal) and applies the authoritative topology. A full one
/// rebuilds every streamed root object, resets the log to the snapshot
/// point, and applies the topology. Keep-alive responses are sent during
/// long installations. Returns false if the topology ejected this node.
fn install_snapshot(
    shared: &Arc<Shared>,
    stream: &TcpStream,
    header: SnapshotHeader,
) -> Result<bool> {
    if !header.empty {
        info!("installing snapshot at index {}", header.last_included_index);
        let mut roots = 0;
        loop {
            shared.defer_timer();
            match read_message(stream)? {
                Message::SnapshotRoot(root) => {
                    debug!("installing snapshot root {}", root.name());
                    shared.lock()?.state.install_root(root)?;
                    roots += 1;
                    if roots % SNAPSHOT_KEEPALIVE_INTERVAL == 0 {
                        let keepalive = {
                            let inner = shared.lock()?;
                            Message::InstallSnapshotResponse {
                                done: false,
                                current_term: inner.log.term(),
                                last_log_index: inner.log.last_index().0,
                            }
                        };
                        keepalive.encode_into(stream)?;
                    }
                }
                Message::SnapshotDone => break,
                message => return Err(errdata!("unexpected message {message:?}")),
            }
        }
    } else {
        match read_message(stream)? {
            Message::SnapshotDone => {}
            message => return Err(errdata!("unexpected message {message:?}")),
        }
    }

    let mut inner = shared.lock()?;
    if header.empty {
        // Nothing to install: our log must already cover the claimed index.
        let (last_index, _) = inner.log.last_index();
        if last_index < header.last_included_index {
            return Err(errdata!(
                "snapshot claims index {} but the log ends at {last_index}",
                header.last_included_index
            ));
        }
        inner.log.set_topology(header.topology.clone())?;
    } else {
        inner.log.install_snapshot(
            header.last_included_index,
            header.last_included_term,
            header.topology.clone(),
        )?;
        inner.state.snapshot_installed(header.last_included_index)?;
    }
    let response = Message::InstallSnapshotResponse {
        done: true,
        current_term: inner.log.term(),
        last_log_index: inner.log.last_index().0,
    };
    let member = header.topology.tag_of_url(&shared.url).is_some();
    if !member {
        shared.set_new_state(
            &mut inner,
            Role::Passive,
            None,
            None,
            "not a member of the snapshot topology",
        )?;
    }
    shared.changed.notify_all();
    drop(inner);
    response.encode_into(stream)?;
    Ok(member)
}

/// Processes one append batch: appends the entries, applies any embedded
/// topology immediately (leaving the cluster if we are no longer in it),
/// advances the commit index to min(local last index, leader commit) if it
/// grew, applies newly committed entries, and truncates the log prefix as
/// instructed. Acknowledges with our term and last index. Returns false if
/// the role ended (ejected from the cluster or told to force elections).
fn process_append(
    shared: &Arc<Shared>,
    stream: &TcpStream,
    batch: AppendEntries,
) -> Result<bool> {
    let mut inner = shared.lock()?;

    // A stale leader is rejected without mutating anything.
    if batch.term < inner.log.term() {
        let response = Message::AppendEntriesResponse {
            current_term: inner.log.term(),
            last_log_index: inner.log.last_index().0,
            success: false,
        };
        drop(inner);
        response.encode_into(stream)?;
        return Ok(true);
    }
    inner.log.found_higher_term(batch.term)?;

    let topology = match inner.log.append_entries(batch.entries) {
        Ok(topology) => topology,
        Err(e) => {
            // A gap or conflict we can't resolve is fatal to the
            // connection; tell the leader before tearing it down.
            let response = Message::AppendEntriesResponse {
                current_term: inner.log.term(),
                last_log_index: inner.log.last_index().0,
                success: false,
            };
            drop(inner);
            response.encode_into(stream)?;
            return Err(e);
        }
    };

    let mut ejected = false;
    if let Some(topology) = topology {
        ejected = topology.tag_of_url(&shared.url).is_none();
        inner.log.set_topology(topology)?;
    }

    let (last_index, _) = inner.log.last_index();
    let new_commit = std::cmp::min(last_index, batch.leader_commit);
    if new_commit > inner.log.commit_index().0 {
        inner.log.commit(new_commit)?;
        Shared::apply_committed(&mut inner)?;
    }
    inner.log.truncate_before(batch.truncate_log_before)?;
    shared.changed.notify_all();

    let response = Message::AppendEntriesResponse {
        current_term: inner.log.term(),
        last_log_index: inner.log.last_index().0,
        success: true,
    };

    if ejected {
        shared.set_new_state(
            &mut inner,
            Role::Passive,
            None,
            None,
            "removed from the cluster topology",
        )?;
        drop(inner);
        response.encode_into(stream)?;
        return Ok(false);
    }
    drop(inner);
    response.encode_into(stream)?;

    if batch.force_elections {
        info!("leader requested elections, campaigning");
        let mut inner = shared.lock()?;
        shared.switch_to_candidate(&mut inner, "planned leadership transfer", true)?;
        return Ok(false);
    }
    Ok(true)
}

/// Reads the next message from the leader connection, treating a closed
/// connection as an error.
fn read_message(stream: &TcpStream) -> Result<Message> {
    Message::maybe_decode_from(stream)?
        .ok_or_else(|| Error::IO("connection closed by peer".to_string()))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::super::log::{Entry, EntryFlags};
    use super::*;
    use crate::storage::Memory;

    fn log_with_terms(terms: &[Term]) -> LogStore {
        let mut log = LogStore::new(Box::new(Memory::new())).expect("log init failed");
        let entries = terms
            .iter()
            .enumerate()
            .map(|(i, &term)| Entry {
                index: i as Index + 1,
                term,
                command: vec![i as u8],
                flags: EntryFlags::StateMachineCommand,
            })
            .collect();
        log.append_entries(entries).expect("append failed");
        log
    }

    /// Drives a full negotiation between a leader log and a follower log,
    /// returning the agreed index and the number of rounds.
    fn negotiate_logs(leader: &mut LogStore, follower: &mut LogStore) -> (Index, usize) {
        let (mut probe_index, mut probe_term) = leader.last_index();
        let mut range = None;
        let mut rounds = 0;
        loop {
            rounds += 1;
            let outcome =
                negotiate_step(follower, &mut range, probe_index, probe_term).expect("step failed");
            match outcome {
                NegotiationStatus::Acceptable => {
                    let agreed = match &range {
                        Some(range) => range.best,
                        None => probe_index.min(follower.last_index().0),
                    };
                    return (agreed, rounds);
                }
                NegotiationStatus::Negotiation { midpoint_index, .. } => {
                    probe_index = midpoint_index;
                    probe_term = leader.term_for(midpoint_index).expect("term failed").unwrap_or(0);
                }
                NegotiationStatus::Rejected => panic!("unexpected rejection"),
            }
        }
    }

    #[test]
    fn empty_follower_asks_for_everything() {
        let mut leader = log_with_terms(&[1, 1, 2]);
        let mut follower = LogStore::new(Box::new(Memory::new())).expect("log init failed");
        let (agreed, rounds) = negotiate_logs(&mut leader, &mut follower);
        assert_eq!(agreed, 0);
        assert_eq!(rounds, 1);
    }

    #[test]
    fn identical_logs_accept_immediately() {
        let mut leader = log_with_terms(&[1, 1, 2, 2]);
        let mut follower = log_with_terms(&[1, 1, 2, 2]);
        let (agreed, rounds) = negotiate_logs(&mut leader, &mut follower);
        assert_eq!(agreed, 4);
        assert_eq!(rounds, 1);
    }

    #[test]
    fn lagging_follower_accepts_at_its_end() {
        let mut leader = log_with_terms(&[1, 1, 2, 2, 2, 3]);
        let mut follower = log_with_terms(&[1, 1, 2]);
        let (agreed, _) = negotiate_logs(&mut leader, &mut follower);
        assert_eq!(agreed, 3);
    }

    #[test]
    fn negotiation_converges_on_the_common_prefix() {
        // Logs agree through index 5 and diverge after.
        let mut leader = log_with_terms(&[1, 1, 1, 2, 2, 3, 3, 3, 3, 3]);
        let mut follower = log_with_terms(&[1, 1, 1, 2, 2, 2, 2, 2]);
        let (agreed, rounds) = negotiate_logs(&mut leader, &mut follower);
        assert_eq!(agreed, 5);
        // Binary search over [1, 8]: at most ceil(log2(8)) + 2 probes
        // including the initial one.
        assert!(rounds <= 5, "took {rounds} rounds");
    }

    #[test]
    fn negotiation_handles_total_divergence() {
        let mut leader = log_with_terms(&[2, 2, 2, 2]);
        let mut follower = log_with_terms(&[1, 1, 1, 1]);
        let (agreed, _) = negotiate_logs(&mut leader, &mut follower);
        assert_eq!(agreed, 0);
    }

    #[test]
    fn negotiation_convergence_is_logarithmic() {
        // 1024 entries, diverging at a handful of points; each negotiation
        // must stay within ceil(log2(range)) + 2 rounds.
        for divergence in [1usize, 13, 512, 1000, 1023] {
            let leader_terms: Vec<Term> =
                (0..1024).map(|i| if i < divergence { 1 } else { 3 }).collect();
            let follower_terms: Vec<Term> =
                (0..1024).map(|i| if i < divergence { 1 } else { 2 }).collect();
            let mut leader = log_with_terms(&leader_terms);
            let mut follower = log_with_terms(&follower_terms);
            let (agreed, rounds) = negotiate_logs(&mut leader, &mut follower);
            assert_eq!(agreed, divergence as Index);
            assert!(rounds <= 12, "divergence {divergence} took {rounds} rounds");
        }
    }

    #[test]
    fn negotiation_starts_above_the_truncated_prefix() {
        let mut leader = log_with_terms(&[1, 1, 1, 2, 2, 2]);
        let mut follower = log_with_terms(&[1, 1, 1, 2, 3, 3]);
        follower.commit(3).expect("commit failed");
        follower.truncate_before(2).expect("truncate failed");
        let (agreed, _) = negotiate_logs(&mut leader, &mut follower);
        assert_eq!(agreed, 4);
    }
}
