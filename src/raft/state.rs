use super::log::Entry;
use super::snapshot::RootObject;
use super::Index;
use crate::error::Result;

/// The replicated state machine driven by the consensus engine. The engine
/// does not care what the state machine is: it applies opaque committed
/// commands sequentially, in index order, exactly once.
///
/// Commands must be deterministic, since they are applied independently on
/// every node and any divergence would go undetected.
pub trait StateMachine: Send {
    /// Returns the index of the last applied entry. The engine resumes
    /// application from the next index, so this must reflect the durable
    /// state of the machine.
    fn applied_index(&self) -> Index;

    /// Applies a committed entry. Called for every entry, including noop
    /// and topology entries, so the applied index advances densely; the
    /// machine should treat those as empty commands.
    fn apply(&mut self, entry: &Entry) -> Result<()>;

    /// Exports the machine's full state as named root objects for a
    /// snapshot transfer.
    fn snapshot(&self) -> Result<Vec<RootObject>>;

    /// Installs one snapshot root object, deleting any existing object of
    /// the same name and rebuilding it from the given contents.
    fn install_root(&mut self, root: RootObject) -> Result<()>;

    /// Completes a snapshot installation: the machine's state now
    /// corresponds to the given applied index.
    fn snapshot_installed(&mut self, index: Index) -> Result<()>;
}

/// A state machine that discards all commands, for nodes that only need
/// the replicated log itself.
pub struct NullState {
    applied_index: Index,
}

impl NullState {
    pub fn new() -> Self {
        Self { applied_index: 0 }
    }
}

impl Default for NullState {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for NullState {
    fn applied_index(&self) -> Index {
        self.applied_index
    }

    fn apply(&mut self, entry: &Entry) -> Result<()> {
        self.applied_index = entry.index;
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<RootObject>> {
        Ok(Vec::new())
    }

    fn install_root(&mut self, _root: RootObject) -> Result<()> {
        Ok(())
    }

    fn snapshot_installed(&mut self, index: Index) -> Result<()> {
        self.applied_index = index;
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use std::collections::BTreeMap;

    use super::super::log::EntryFlags;
    use super::*;
    use crate::errdata;

    /// A test state machine: an ordered map of key/value pairs, mutated by
    /// `key=value` commands, exported as a single tree root.
    pub struct TestState {
        applied_index: Index,
        data: BTreeMap<Vec<u8>, Vec<u8>>,
    }

    impl TestState {
        pub fn new() -> Self {
            Self { applied_index: 0, data: BTreeMap::new() }
        }

        pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
            self.data.get(key)
        }
    }

    impl StateMachine for TestState {
        fn applied_index(&self) -> Index {
            self.applied_index
        }

        fn apply(&mut self, entry: &Entry) -> Result<()> {
            assert_eq!(entry.index, self.applied_index + 1, "entry applied out of order");
            if entry.flags == EntryFlags::StateMachineCommand {
                let mut parts = entry.command.splitn(2, |&b| b == b'=');
                let key = parts.next().expect("empty command").to_vec();
                let value = parts.next().unwrap_or_default().to_vec();
                self.data.insert(key, value);
            }
            self.applied_index = entry.index;
            Ok(())
        }

        fn snapshot(&self) -> Result<Vec<RootObject>> {
            Ok(vec![RootObject::Tree {
                name: "data".to_string(),
                entries: self.data.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            }])
        }

        fn install_root(&mut self, root: RootObject) -> Result<()> {
            match root {
                RootObject::Tree { name, entries } if name == "data" => {
                    self.data = entries.into_iter().collect();
                    Ok(())
                }
                root => Err(errdata!("unknown snapshot root {}", root.name())),
            }
        }

        fn snapshot_installed(&mut self, index: Index) -> Result<()> {
            self.applied_index = index;
            Ok(())
        }
    }

    #[test]
    fn applies_commands_in_order() -> Result<()> {
        let mut state = TestState::new();
        state.apply(&Entry {
            index: 1,
            term: 1,
            command: b"a=1".to_vec(),
            flags: EntryFlags::StateMachineCommand,
        })?;
        state.apply(&Entry { index: 2, term: 1, command: vec![], flags: EntryFlags::Noop })?;
        assert_eq!(state.applied_index(), 2);
        assert_eq!(state.get(b"a"), Some(&b"1".to_vec()));
        Ok(())
    }

    #[test]
    fn snapshot_round_trip_replaces_state() -> Result<()> {
        let mut state = TestState::new();
        state.apply(&Entry {
            index: 1,
            term: 1,
            command: b"a=1".to_vec(),
            flags: EntryFlags::StateMachineCommand,
        })?;
        let roots = state.snapshot()?;

        let mut other = TestState::new();
        other.apply(&Entry {
            index: 1,
            term: 1,
            command: b"stale=1".to_vec(),
            flags: EntryFlags::StateMachineCommand,
        })?;
        for root in roots {
            other.install_root(root)?;
        }
        other.snapshot_installed(1)?;
        assert_eq!(other.applied_index(), 1);
        assert_eq!(other.get(b"a"), Some(&b"1".to_vec()));
        assert_eq!(other.get(b"stale"), None);
        Ok(())
    }
}
