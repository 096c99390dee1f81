use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use rand::Rng as _;

use super::engine::{Role, RoleHandle, Shared};
use super::message::{Message, RequestVote};
use super::topology::NodeTag;
use super::Term;
use crate::encoding::Value as _;
use crate::errdata;
use crate::error::{Error, Result};

/// The candidate role: campaigns to become leader. Each round bumps the
/// term by one, votes for itself, and solicits votes from all other voters
/// over short-lived connections. A majority wins the election; a higher
/// term observed anywhere reverts to follower; anything else retries after
/// a fresh randomized timeout, to break ties with concurrent candidates.
pub(super) struct Candidate;

enum Outcome {
    /// Won the election and switched to leader.
    Won,
    /// The role is over: a higher term, a valid leader, or disposal.
    Lost,
    /// No majority this round; retry after a randomized wait.
    Retry,
}

impl Candidate {
    /// Starts campaigning. A forced campaign (leadership transfer, vote of
    /// no confidence) starts immediately; an ordinary one first waits a
    /// random fraction of the election timeout to de-synchronize
    /// candidates that timed out together.
    pub(super) fn spawn(shared: Arc<Shared>, forced: bool) -> RoleHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread = {
            let shutdown = shutdown.clone();
            std::thread::spawn(move || run(shared, shutdown, forced))
        };
        RoleHandle { shutdown, thread: Some(thread) }
    }
}

fn run(shared: Arc<Shared>, shutdown: Arc<AtomicBool>, forced: bool) {
    if !forced {
        let jitter = random_timeout(shared.opts.election_timeout / 2);
        if !wait(&shared, &shutdown, jitter) {
            return;
        }
    }
    loop {
        match campaign(&shared, &shutdown) {
            Ok(Outcome::Won | Outcome::Lost) => return,
            Ok(Outcome::Retry) => {}
            Err(e) => {
                debug!("campaign round failed: {e}");
                return;
            }
        }
        if !wait(&shared, &shutdown, random_timeout(shared.opts.election_timeout)) {
            return;
        }
    }
}

/// Runs one campaign round. Returns whether to keep campaigning.
fn campaign(shared: &Arc<Shared>, shutdown: &Arc<AtomicBool>) -> Result<Outcome> {
    let (term, tag, last_log_index, last_log_term, voters, majority) = {
        let mut inner = shared.lock()?;
        if inner.role != Role::Candidate {
            return Ok(Outcome::Lost);
        }
        let topology = inner.log.topology().clone();
        let Some(tag) = topology.tag_of_url(&shared.url).cloned() else {
            // Ejected from the cluster while campaigning.
            shared.set_new_state(
                &mut inner,
                Role::Passive,
                None,
                None,
                "no longer in the cluster topology",
            )?;
            return Ok(Outcome::Lost);
        };
        if !topology.is_voter(&tag) {
            shared.demote_to_follower(&mut inner, "no longer a voter")?;
            return Ok(Outcome::Lost);
        }
        let term = inner.log.term() + 1;
        inner.log.cast_vote_in_term(term, Some(tag.clone()))?;
        let (last_log_index, last_log_term) = inner.log.last_index();
        let voters: Vec<(NodeTag, String)> = topology
            .voters
            .iter()
            .filter(|(voter, _)| **voter != tag)
            .map(|(voter, url)| (voter.clone(), url.clone()))
            .collect();
        (term, tag, last_log_index, last_log_term, voters, topology.voter_majority())
    };
    info!("campaigning for leadership in term {term}");

    // Solicit the other voters concurrently; we implicitly vote for
    // ourselves.
    let (tx, rx) = crossbeam::channel::unbounded();
    for (voter, url) in voters {
        let tx = tx.clone();
        let request = RequestVote {
            term,
            candidate: tag.clone(),
            last_log_index,
            last_log_term,
        };
        let timeout = shared.opts.peer_timeout;
        std::thread::spawn(move || {
            let result = solicit(&url, request, timeout);
            let _ = tx.send((voter, result));
        });
    }
    drop(tx);

    let mut granted = 1;
    let deadline = Instant::now() + shared.opts.election_timeout;
    while granted < majority {
        if shutdown.load(Ordering::SeqCst) || shared.is_shutdown() {
            return Ok(Outcome::Lost);
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        match rx.recv_timeout(deadline - now) {
            Ok((voter, Ok((response_term, true)))) if response_term == term => {
                debug!("vote granted by {voter} in term {term}");
                granted += 1;
            }
            Ok((voter, Ok((response_term, vote)))) => {
                if response_term > term {
                    let mut inner = shared.lock()?;
                    shared.note_higher_term(
                        &mut inner,
                        response_term,
                        "vote response revealed a higher term",
                    )?;
                    return Ok(Outcome::Lost);
                }
                debug!("vote from {voter}: granted={vote} term={response_term}");
            }
            Ok((voter, Err(e))) => debug!("soliciting {voter} failed: {e}"),
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => break,
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    if granted < majority {
        debug!("election for term {term} fell short: {granted} of {majority} votes");
        return Ok(Outcome::Retry);
    }

    let mut inner = shared.lock()?;
    if shutdown.load(Ordering::SeqCst) || inner.role != Role::Candidate {
        return Ok(Outcome::Lost);
    }
    match shared.switch_to_leader(&mut inner, term, "won the election") {
        Ok(()) => Ok(Outcome::Won),
        // The term moved while we were counting votes; the election is void.
        Err(Error::Concurrency(_)) => Ok(Outcome::Lost),
        Err(e) => Err(e),
    }
}

/// Requests a vote from one peer over a short-lived connection.
fn solicit(url: &str, request: RequestVote, timeout: Duration) -> Result<(Term, bool)> {
    let addr = url
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::IO(format!("can't resolve {url}")))?;
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeout))?;
    Message::RequestVote(request).encode_into(&stream)?;
    match Message::maybe_decode_from(&stream)? {
        Some(Message::RequestVoteResponse { term, granted, .. }) => Ok((term, granted)),
        Some(message) => Err(errdata!("unexpected message {message:?}")),
        None => Err(Error::IO("connection closed by peer".to_string())),
    }
}

/// Sleeps in small increments so disposal is observed promptly. Returns
/// false if the role was disposed meanwhile.
fn wait(shared: &Arc<Shared>, shutdown: &Arc<AtomicBool>, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if shutdown.load(Ordering::SeqCst) || shared.is_shutdown() {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    !(shutdown.load(Ordering::SeqCst) || shared.is_shutdown())
}

fn random_timeout(base: Duration) -> Duration {
    let base = base.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(base..2 * base))
}
