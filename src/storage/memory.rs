use std::collections::btree_map::Range;
use std::collections::BTreeMap;

use super::{Engine, Status};
use crate::error::Result;

/// An in-memory key/value storage engine using the Rust standard library
/// B-tree implementation. Data is not persisted. Used for tests and for
/// nodes that can afford to be caught up via snapshot after a restart.
pub struct Memory {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Memory {
    /// Creates a new Memory engine.
    pub fn new() -> Self {
        Self { data: BTreeMap::new() }
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for Memory {
    type ScanIterator<'a> = ScanIterator<'a>;

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_> {
        ScanIterator { inner: self.data.range(range) }
    }

    fn scan_dyn(
        &mut self,
        range: (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>),
    ) -> Box<dyn super::ScanIterator + '_> {
        Box::new(self.scan(range))
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.data.insert(key.to_vec(), value);
        Ok(())
    }

    fn status(&mut self) -> Result<Status> {
        Ok(Status {
            name: "memory".to_string(),
            keys: self.data.len() as u64,
            size: self.data.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum(),
            disk_size: 0,
        })
    }
}

pub struct ScanIterator<'a> {
    inner: Range<'a, Vec<u8>, Vec<u8>>,
}

impl<'a> ScanIterator<'a> {
    /// Also used by the File engine, which wraps the same B-tree.
    pub(super) fn new(inner: Range<'a, Vec<u8>, Vec<u8>>) -> Self {
        Self { inner }
    }

    fn map(item: (&Vec<u8>, &Vec<u8>)) -> <Self as Iterator>::Item {
        let (key, value) = item;
        Ok((key.clone(), value.clone()))
    }
}

impl Iterator for ScanIterator<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(Self::map)
    }
}

impl DoubleEndedIterator for ScanIterator<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(Self::map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crud() -> Result<()> {
        let mut engine = Memory::new();
        assert_eq!(engine.get(b"a")?, None);

        engine.set(b"a", vec![1])?;
        engine.set(b"b", vec![2])?;
        assert_eq!(engine.get(b"a")?, Some(vec![1]));

        engine.delete(b"a")?;
        assert_eq!(engine.get(b"a")?, None);
        assert_eq!(engine.get(b"b")?, Some(vec![2]));
        Ok(())
    }

    #[test]
    fn scan_order() -> Result<()> {
        let mut engine = Memory::new();
        engine.set(&[0, 0, 0, 2], vec![2])?;
        engine.set(&[0, 0, 0, 1], vec![1])?;
        engine.set(&[0, 0, 1, 0], vec![3])?;

        let keys: Vec<_> = engine
            .scan(vec![0, 0, 0, 0]..vec![0, 0, 1, 0])
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![vec![0, 0, 0, 1], vec![0, 0, 0, 2]]);
        Ok(())
    }
}
