use serde_derive::{Deserialize, Serialize};

use super::topology::{ClusterTopology, NodeTag};
use super::{Index, Term};
use crate::encoding::{bincode, Value as _};
use crate::errdata;
use crate::error::{Error, Result};
use crate::storage;

/// A log entry flag, describing how the entry payload is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryFlags {
    /// Not a valid entry. Never stored; used to reject malformed input.
    Invalid,
    /// An opaque state machine command.
    StateMachineCommand,
    /// A serialized cluster topology, applied by the consensus layer.
    Topology,
    /// An empty entry appended by a new leader to commit prior terms.
    Noop,
}

/// A log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index. Dense, starting at 1.
    pub index: Index,
    /// The term in which the entry was proposed.
    pub term: Term,
    /// The opaque command payload. Empty for noops.
    pub command: Vec<u8>,
    /// How the payload is interpreted.
    pub flags: EntryFlags,
}

impl crate::encoding::Value for Entry {}

/// A storage key. Entry keys are encoded as a tag byte followed by the
/// big-endian index, so the physical key order matches the log order. The
/// remaining keys are small persistent state cells.
#[derive(Clone, Debug, PartialEq)]
pub enum Key {
    /// A log entry, keyed by index.
    Entry(Index),
    /// The current term and vote (if any).
    TermVote,
    /// The last committed index and term.
    CommitIndex,
    /// The last truncated index and term. Entries at or below this point
    /// are not retained.
    TruncatedIndex,
    /// The serialized cluster topology.
    Topology,
}

impl Key {
    const ENTRY: u8 = 0x00;
    const TERM_VOTE: u8 = 0x01;
    const COMMIT_INDEX: u8 = 0x02;
    const TRUNCATED_INDEX: u8 = 0x03;
    const TOPOLOGY: u8 = 0x04;

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Key::Entry(index) => {
                let mut key = Vec::with_capacity(9);
                key.push(Self::ENTRY);
                key.extend(index.to_be_bytes());
                key
            }
            Key::TermVote => vec![Self::TERM_VOTE],
            Key::CommitIndex => vec![Self::COMMIT_INDEX],
            Key::TruncatedIndex => vec![Self::TRUNCATED_INDEX],
            Key::Topology => vec![Self::TOPOLOGY],
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [Self::ENTRY, rest @ ..] if rest.len() == 8 => {
                Ok(Key::Entry(Index::from_be_bytes(rest.try_into().expect("checked length"))))
            }
            [Self::TERM_VOTE] => Ok(Key::TermVote),
            [Self::COMMIT_INDEX] => Ok(Key::CommitIndex),
            [Self::TRUNCATED_INDEX] => Ok(Key::TruncatedIndex),
            [Self::TOPOLOGY] => Ok(Key::Topology),
            bytes => Err(errdata!("invalid storage key {bytes:x?}")),
        }
    }
}

/// The persistent log store: a durable ordered table of log entries keyed by
/// index, plus small state cells for the current term and vote, the commit
/// marker, the truncation marker, and the cluster topology.
///
/// Invariants:
///
/// * Entry indexes are contiguous, starting right above the truncation
///   marker (no index gaps).
/// * Entry terms never decrease from the previous entry.
/// * The current term never decreases, and at most one vote is cast per
///   term.
/// * Entries at or below the commit index are immutable: they are never
///   replaced or removed, except by prefix truncation which only discards
///   them after recording the truncation marker.
/// * If two logs contain an entry with the same index and term, all
///   preceding entries are identical (the log matching property).
///
/// All mutations happen under the engine's write lock, which doubles as the
/// role transition lock.
pub struct LogStore {
    /// The underlying storage engine. A trait object, to allow runtime
    /// selection of the engine without propagating generics through the
    /// consensus code.
    engine: Box<dyn storage::Engine>,
    /// The current term.
    term: Term,
    /// The vote cast in the current term, if any.
    vote: Option<NodeTag>,
    /// The index of the last stored entry.
    last_index: Index,
    /// The term of the last stored entry.
    last_term: Term,
    /// The index of the last committed entry.
    commit_index: Index,
    /// The term of the last committed entry.
    commit_term: Term,
    /// The index of the last truncated entry.
    truncated_index: Index,
    /// The term of the last truncated entry.
    truncated_term: Term,
    /// The current cluster topology.
    topology: ClusterTopology,
}

impl LogStore {
    /// Opens the log store, recovering persistent state from the engine.
    pub fn new(mut engine: Box<dyn storage::Engine>) -> Result<Self> {
        let (term, vote) = engine
            .get(&Key::TermVote.encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or((0, None));
        let (commit_index, commit_term) = engine
            .get(&Key::CommitIndex.encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or((0, 0));
        let (truncated_index, truncated_term) = engine
            .get(&Key::TruncatedIndex.encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or((0, 0));
        let topology = engine
            .get(&Key::Topology.encode())?
            .map(|v| ClusterTopology::decode(&v))
            .transpose()?
            .unwrap_or_else(ClusterTopology::empty);
        let (last_index, last_term) = engine
            .scan_dyn((
                std::ops::Bound::Included(Key::Entry(0).encode()),
                std::ops::Bound::Included(Key::Entry(Index::MAX).encode()),
            ))
            .last()
            .transpose()?
            .map(|(_, v)| Entry::decode(&v))
            .transpose()?
            .map(|e| (e.index, e.term))
            .unwrap_or((truncated_index, truncated_term));
        Ok(Self {
            engine,
            term,
            vote,
            last_index,
            last_term,
            commit_index,
            commit_term,
            truncated_index,
            truncated_term,
            topology,
        })
    }

    /// Returns the current term (0 if none).
    pub fn term(&self) -> Term {
        self.term
    }

    /// Returns the vote cast in the current term, if any.
    pub fn vote(&self) -> Option<&NodeTag> {
        self.vote.as_ref()
    }

    /// Returns the last log index and term.
    pub fn last_index(&self) -> (Index, Term) {
        (self.last_index, self.last_term)
    }

    /// Returns the commit index and term.
    pub fn commit_index(&self) -> (Index, Term) {
        (self.commit_index, self.commit_term)
    }

    /// Returns the truncation marker index and term.
    pub fn truncated_index(&self) -> (Index, Term) {
        (self.truncated_index, self.truncated_term)
    }

    /// Returns the current cluster topology.
    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    /// Persists the given topology.
    pub fn set_topology(&mut self, topology: ClusterTopology) -> Result<()> {
        self.engine.set(&Key::Topology.encode(), topology.encode()?)?;
        self.engine.flush()?;
        self.topology = topology;
        Ok(())
    }

    /// Casts a vote in the given term, persisting the term and vote
    /// atomically. Votes only move forward: fails with a concurrency error
    /// if the term is not beyond the current term.
    pub fn cast_vote_in_term(&mut self, term: Term, vote: Option<NodeTag>) -> Result<()> {
        if term <= self.term {
            return Err(Error::Concurrency(format!(
                "can't vote in term {term}, already at term {}",
                self.term
            )));
        }
        self.store_term_vote(term, vote)
    }

    /// Adopts a higher term discovered from a message, resetting the vote.
    /// Returns true if the term advanced, false if it was not higher.
    pub fn found_higher_term(&mut self, term: Term) -> Result<bool> {
        if term <= self.term {
            return Ok(false);
        }
        self.store_term_vote(term, None)?;
        Ok(true)
    }

    fn store_term_vote(&mut self, term: Term, vote: Option<NodeTag>) -> Result<()> {
        self.engine.set(&Key::TermVote.encode(), bincode::serialize(&(term, &vote))?)?;
        self.engine.flush()?;
        self.term = term;
        self.vote = vote;
        Ok(())
    }

    /// Appends a command to the log under the current term and flushes it
    /// to disk, returning its index. Only called by the active leader,
    /// under the engine's write lock.
    pub fn append(&mut self, command: Vec<u8>, flags: EntryFlags) -> Result<Index> {
        if self.term == 0 {
            return Err(errdata!("can't append entry in term 0"));
        }
        if flags == EntryFlags::Invalid {
            return Err(Error::InvalidInput("can't append invalid entry".to_string()));
        }
        let entry = Entry { index: self.last_index + 1, term: self.term, command, flags };
        self.engine.set(&Key::Entry(entry.index).encode(), entry.encode()?)?;
        self.engine.flush()?;
        self.last_index = entry.index;
        self.last_term = entry.term;
        Ok(entry.index)
    }

    /// Bulk-appends entries received from a leader and flushes them to
    /// disk. Idempotent: entries already present with a matching term are
    /// skipped. On a term mismatch at an existing index, that entry and
    /// everything after it is deleted before the new entries are inserted
    /// (the divergence cut). Fails with an ordering error if there is a gap
    /// between the last known index and the first entry.
    ///
    /// Returns the most recent topology carried by the entries, if any, so
    /// the caller can apply it immediately.
    pub fn append_entries(&mut self, entries: Vec<Entry>) -> Result<Option<ClusterTopology>> {
        let Some(first) = entries.first() else {
            return Ok(None); // empty input is a noop (heartbeat)
        };

        if first.index == 0 || first.term == 0 {
            return Err(errdata!("entry has index or term 0"));
        }
        if !entries.windows(2).all(|w| w[0].index + 1 == w[1].index) {
            return Err(errdata!("entries are not contiguous"));
        }
        if !entries.windows(2).all(|w| w[0].term <= w[1].term) {
            return Err(errdata!("entries have term regression"));
        }
        if entries.iter().any(|e| e.flags == EntryFlags::Invalid) {
            return Err(errdata!("entries contain an invalid entry"));
        }
        if first.index > self.last_index + 1 {
            return Err(errdata!(
                "gap between last index {} and first entry {}",
                self.last_index,
                first.index
            ));
        }

        let mut topology = None;
        for entry in &entries {
            if entry.flags == EntryFlags::Topology {
                topology = Some(ClusterTopology::decode(&entry.command)?);
            }
        }

        // Skip entries that are already in the log with the same term, and
        // find the first conflict, if any.
        let mut entries = entries.as_slice();
        while let Some(entry) = entries.first() {
            if entry.index <= self.truncated_index {
                // Already truncated, necessarily committed with this term.
                entries = &entries[1..];
                continue;
            }
            match self.get(entry.index)? {
                Some(existing) if existing.term == entry.term => entries = &entries[1..],
                Some(existing) => {
                    // Divergence: delete the conflicting entry and all
                    // entries after it. Committed entries are immutable.
                    if entry.index <= self.commit_index {
                        return Err(errdata!(
                            "term conflict {} -> {} below commit index {}",
                            existing.term,
                            entry.term,
                            self.commit_index
                        ));
                    }
                    for index in entry.index..=self.last_index {
                        self.engine.delete(&Key::Entry(index).encode())?;
                    }
                    let (last_index, last_term) = match self.get(entry.index - 1)? {
                        Some(base) => (base.index, base.term),
                        None => (self.truncated_index, self.truncated_term),
                    };
                    self.last_index = last_index;
                    self.last_term = last_term;
                    break;
                }
                None => break,
            }
        }

        let Some(last) = entries.last() else {
            self.engine.flush()?;
            return Ok(topology); // everything already present
        };

        for entry in entries {
            self.engine.set(&Key::Entry(entry.index).encode(), entry.encode()?)?;
        }
        self.engine.flush()?;
        self.last_index = last.index;
        self.last_term = last.term;
        Ok(topology)
    }

    /// Advances the commit marker to the given index, which must exist in
    /// the log. Does nothing if the index is at or below the current commit
    /// index (the commit index never regresses). Returns the commit index.
    pub fn commit(&mut self, index: Index) -> Result<Index> {
        if index <= self.commit_index {
            return Ok(self.commit_index);
        }
        let Some(entry) = self.get(index)? else {
            return Err(errdata!("commit index {index} does not exist"));
        };
        self.engine.set(&Key::CommitIndex.encode(), bincode::serialize(&(index, entry.term))?)?;
        // The commit marker doesn't need to be flushed: entries are flushed,
        // and the commit index can be recovered from a log quorum.
        self.commit_index = index;
        self.commit_term = entry.term;
        Ok(index)
    }

    /// Truncates the log prefix: deletes entries with an index at or below
    /// min(upto, commit index) and advances the truncation marker. Never
    /// truncates past the commit point. Returns the truncation index.
    pub fn truncate_before(&mut self, upto: Index) -> Result<Index> {
        let upto = std::cmp::min(upto, self.commit_index);
        if upto <= self.truncated_index {
            return Ok(self.truncated_index);
        }
        let Some(term) = self.term_for(upto)? else {
            return Err(errdata!("truncation index {upto} has no known term"));
        };
        for index in self.truncated_index + 1..=upto {
            self.engine.delete(&Key::Entry(index).encode())?;
        }
        self.engine.set(&Key::TruncatedIndex.encode(), bincode::serialize(&(upto, term))?)?;
        self.engine.flush()?;
        self.truncated_index = upto;
        self.truncated_term = term;
        Ok(upto)
    }

    /// Returns the term of the entry at the given index, or None if the
    /// index is outside all known ranges (below the truncated prefix, or
    /// beyond the end of the log). Boundary indexes that are no longer
    /// retained are resolved via the commit and truncation markers.
    pub fn term_for(&mut self, index: Index) -> Result<Option<Term>> {
        if index == 0 {
            return Ok(None);
        }
        if let Some(entry) = self.get(index)? {
            return Ok(Some(entry.term));
        }
        if index == self.truncated_index {
            return Ok(Some(self.truncated_term));
        }
        if index == self.commit_index {
            return Ok(Some(self.commit_term));
        }
        Ok(None)
    }

    /// Checks if the log agrees with the given index and term, consulting
    /// the boundary markers for truncated indexes.
    pub fn has(&mut self, index: Index, term: Term) -> Result<bool> {
        Ok(self.term_for(index)? == Some(term))
    }

    /// Fetches an entry at an index, or None if it does not exist.
    pub fn get(&mut self, index: Index) -> Result<Option<Entry>> {
        self.engine.get(&Key::Entry(index).encode())?.map(|v| Entry::decode(&v)).transpose()
    }

    /// Returns an iterator over log entries in the given index range.
    pub fn scan(&mut self, range: impl std::ops::RangeBounds<Index>) -> Iterator {
        use std::ops::Bound;
        let from = match range.start_bound() {
            Bound::Excluded(&index) => Bound::Excluded(Key::Entry(index).encode()),
            Bound::Included(&index) => Bound::Included(Key::Entry(index).encode()),
            Bound::Unbounded => Bound::Included(Key::Entry(0).encode()),
        };
        let to = match range.end_bound() {
            Bound::Excluded(&index) => Bound::Excluded(Key::Entry(index).encode()),
            Bound::Included(&index) => Bound::Included(Key::Entry(index).encode()),
            Bound::Unbounded => Bound::Included(Key::Entry(Index::MAX).encode()),
        };
        Iterator::new(self.engine.scan_dyn((from, to)))
    }

    /// Resets the log to the state described by an installed snapshot: all
    /// entries are discarded and the markers move to the snapshot point.
    /// The snapshot topology is persisted as the authoritative topology.
    pub fn install_snapshot(
        &mut self,
        index: Index,
        term: Term,
        topology: ClusterTopology,
    ) -> Result<()> {
        if index < self.commit_index {
            return Err(errdata!(
                "snapshot index {index} below commit index {}",
                self.commit_index
            ));
        }
        for i in self.truncated_index + 1..=self.last_index {
            self.engine.delete(&Key::Entry(i).encode())?;
        }
        self.engine.set(&Key::CommitIndex.encode(), bincode::serialize(&(index, term))?)?;
        self.engine.set(&Key::TruncatedIndex.encode(), bincode::serialize(&(index, term))?)?;
        self.engine.set(&Key::Topology.encode(), topology.encode()?)?;
        self.engine.flush()?;
        self.commit_index = index;
        self.commit_term = term;
        self.truncated_index = index;
        self.truncated_term = term;
        self.last_index = index;
        self.last_term = term;
        self.topology = topology;
        Ok(())
    }

    /// Returns storage engine status.
    pub fn status(&mut self) -> Result<storage::Status> {
        self.engine.status()
    }
}

/// A log entry iterator.
pub struct Iterator<'a> {
    inner: Box<dyn storage::ScanIterator + 'a>,
}

impl<'a> Iterator<'a> {
    fn new(inner: Box<dyn storage::ScanIterator + 'a>) -> Self {
        Self { inner }
    }
}

impl std::iter::Iterator for Iterator<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|r| r.and_then(|(_, v)| Entry::decode(&v)))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::storage::Memory;

    fn setup() -> LogStore {
        LogStore::new(Box::new(Memory::new())).expect("log init failed")
    }

    fn entry(index: Index, term: Term, command: &[u8]) -> Entry {
        Entry { index, term, command: command.to_vec(), flags: EntryFlags::StateMachineCommand }
    }

    fn all_entries(log: &mut LogStore) -> Vec<Entry> {
        log.scan(..).collect::<Result<Vec<_>>>().expect("scan failed")
    }

    #[test]
    fn key_order_matches_index_order() {
        let a = Key::Entry(1).encode();
        let b = Key::Entry(255).encode();
        let c = Key::Entry(256).encode();
        assert!(a < b && b < c);
        assert_eq!(Key::decode(&c).unwrap(), Key::Entry(256));
    }

    #[test]
    fn append_assigns_dense_indexes() -> Result<()> {
        let mut log = setup();
        log.cast_vote_in_term(1, None)?;
        assert_eq!(log.append(vec![0x01], EntryFlags::StateMachineCommand)?, 1);
        assert_eq!(log.append(vec![], EntryFlags::Noop)?, 2);
        assert_eq!(log.last_index(), (2, 1));

        // Appending in term 0 or with invalid flags fails.
        let mut empty = setup();
        assert!(empty.append(vec![], EntryFlags::Noop).is_err());
        assert!(log.append(vec![], EntryFlags::Invalid).is_err());
        Ok(())
    }

    #[test]
    fn votes_only_move_forward() -> Result<()> {
        let mut log = setup();
        log.cast_vote_in_term(2, Some("A".to_string()))?;
        assert_eq!(log.term(), 2);
        assert_eq!(log.vote(), Some(&"A".to_string()));

        // Same or lower terms are concurrency errors.
        assert!(matches!(
            log.cast_vote_in_term(2, Some("B".to_string())),
            Err(Error::Concurrency(_))
        ));
        assert!(matches!(log.cast_vote_in_term(1, None), Err(Error::Concurrency(_))));

        // A higher term resets the vote.
        assert!(log.found_higher_term(3)?);
        assert_eq!(log.term(), 3);
        assert_eq!(log.vote(), None);
        assert!(!log.found_higher_term(3)?);
        Ok(())
    }

    #[test]
    fn append_entries_is_idempotent() -> Result<()> {
        let mut log = setup();
        let entries = vec![entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 2, b"c")];
        log.append_entries(entries.clone())?;
        log.append_entries(entries.clone())?;
        assert_eq!(all_entries(&mut log), entries);
        assert_eq!(log.last_index(), (3, 2));
        Ok(())
    }

    #[test]
    fn append_entries_cuts_divergence() -> Result<()> {
        let mut log = setup();
        log.append_entries(vec![entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 2, b"c")])?;

        // A term mismatch at index 3 deletes it and everything after, then
        // inserts the new entry.
        log.append_entries(vec![entry(2, 1, b"b"), entry(3, 3, b"x")])?;
        assert_eq!(
            all_entries(&mut log),
            vec![entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 3, b"x")]
        );
        assert_eq!(log.last_index(), (3, 3));
        Ok(())
    }

    #[test]
    fn append_entries_rejects_gaps() -> Result<()> {
        let mut log = setup();
        log.append_entries(vec![entry(1, 1, b"a")])?;
        assert!(matches!(
            log.append_entries(vec![entry(3, 1, b"c")]),
            Err(Error::InvalidData(_))
        ));
        assert_eq!(log.last_index(), (1, 1));
        Ok(())
    }

    #[test]
    fn append_entries_protects_committed_entries() -> Result<()> {
        let mut log = setup();
        log.append_entries(vec![entry(1, 1, b"a"), entry(2, 1, b"b")])?;
        log.commit(2)?;
        assert!(log.append_entries(vec![entry(2, 2, b"x")]).is_err());
        assert_eq!(all_entries(&mut log), vec![entry(1, 1, b"a"), entry(2, 1, b"b")]);
        Ok(())
    }

    #[test]
    fn append_entries_surfaces_topology() -> Result<()> {
        let mut log = setup();
        let topology = ClusterTopology::bootstrap("A".to_string(), "localhost:9705".to_string());
        let payload = topology.encode()?;
        let result = log.append_entries(vec![
            entry(1, 1, b"a"),
            Entry { index: 2, term: 1, command: payload, flags: EntryFlags::Topology },
        ])?;
        assert_eq!(result, Some(topology));
        Ok(())
    }

    #[test]
    fn commit_is_monotonic() -> Result<()> {
        let mut log = setup();
        log.append_entries(vec![entry(1, 1, b"a"), entry(2, 1, b"b")])?;
        assert_eq!(log.commit(2)?, 2);
        assert_eq!(log.commit(1)?, 2); // no regression
        assert!(log.commit(3).is_err()); // must exist
        assert_eq!(log.commit_index(), (2, 1));
        Ok(())
    }

    #[test]
    fn truncate_is_bounded_by_commit() -> Result<()> {
        let mut log = setup();
        log.append_entries(vec![entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 2, b"c")])?;
        log.commit(2)?;

        // Truncation is capped at the commit index.
        assert_eq!(log.truncate_before(3)?, 2);
        assert_eq!(log.truncated_index(), (2, 1));
        assert_eq!(all_entries(&mut log), vec![entry(3, 2, b"c")]);

        // Idempotent for indexes at or below the marker.
        assert_eq!(log.truncate_before(1)?, 2);
        Ok(())
    }

    #[test]
    fn term_for_falls_back_to_markers() -> Result<()> {
        let mut log = setup();
        log.append_entries(vec![entry(1, 1, b"a"), entry(2, 2, b"b"), entry(3, 2, b"c")])?;
        log.commit(3)?;
        log.truncate_before(2)?;

        assert_eq!(log.term_for(0)?, None);
        assert_eq!(log.term_for(1)?, None); // below truncation, not retained
        assert_eq!(log.term_for(2)?, Some(2)); // truncation marker
        assert_eq!(log.term_for(3)?, Some(2)); // retained entry
        assert_eq!(log.term_for(4)?, None); // beyond the log
        assert!(log.has(3, 2)?);
        assert!(!log.has(3, 1)?);
        Ok(())
    }

    #[test]
    fn recovers_state_from_engine() -> Result<()> {
        let mut log = setup();
        log.cast_vote_in_term(2, Some("B".to_string()))?;
        log.append(b"a".to_vec(), EntryFlags::StateMachineCommand)?;
        log.append(b"b".to_vec(), EntryFlags::StateMachineCommand)?;
        log.commit(1)?;
        let topology = ClusterTopology::bootstrap("A".to_string(), "localhost:9705".to_string());
        log.set_topology(topology.clone())?;

        // Reload from the same engine.
        let engine = std::mem::replace(&mut log.engine, Box::new(Memory::new()));
        let mut log = LogStore::new(engine)?;
        assert_eq!(log.term(), 2);
        assert_eq!(log.vote(), Some(&"B".to_string()));
        assert_eq!(log.last_index(), (2, 2));
        assert_eq!(log.commit_index(), (1, 2));
        assert_eq!(log.topology(), &topology);
        assert_eq!(all_entries(&mut log).len(), 2);
        Ok(())
    }

    #[test]
    fn install_snapshot_resets_the_log() -> Result<()> {
        let mut log = setup();
        log.append_entries(vec![entry(1, 1, b"a"), entry(2, 1, b"b")])?;
        log.commit(1)?;

        let topology = ClusterTopology::bootstrap("A".to_string(), "localhost:9705".to_string());
        log.install_snapshot(8, 3, topology.clone())?;
        assert_eq!(log.last_index(), (8, 3));
        assert_eq!(log.commit_index(), (8, 3));
        assert_eq!(log.truncated_index(), (8, 3));
        assert_eq!(log.topology(), &topology);
        assert_eq!(all_entries(&mut log), Vec::<Entry>::new());

        // New entries continue right after the snapshot point.
        log.cast_vote_in_term(4, None)?;
        assert_eq!(log.append(b"x".to_vec(), EntryFlags::StateMachineCommand)?, 9);
        Ok(())
    }
}
