use std::collections::BTreeMap;
use std::io::{Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

use fs4::FileExt as _;

use super::{Engine, Status};
use crate::encoding::bincode;
use crate::error::Result;

/// A simple durable key/value engine. Keeps the full dataset in memory and
/// rewrites the file on every flush, holding an exclusive lock on the file
/// for the lifetime of the engine. Consensus logs are kept small by
/// truncation, so the rewrite cost stays bounded.
pub struct File {
    path: PathBuf,
    file: std::fs::File,
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    dirty: bool,
}

impl File {
    /// Opens or creates the file at the given path, taking out an exclusive
    /// lock and loading any existing dataset.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.try_lock_exclusive()?;

        let data = if file.metadata()?.len() > 0 {
            file.seek(SeekFrom::Start(0))?;
            bincode::deserialize_from(&mut file)?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path: path.to_path_buf(), file, data, dirty: false })
    }
}

impl Engine for File {
    type ScanIterator<'a> = super::memory::ScanIterator<'a>;

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.data.remove(key);
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        bincode::serialize_into(&mut self.file, &self.data)?;
        self.file.flush()?;
        self.file.sync_all()?;
        self.dirty = false;
        Ok(())
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_> {
        super::memory::ScanIterator::new(self.data.range(range))
    }

    fn scan_dyn(
        &mut self,
        range: (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>),
    ) -> Box<dyn super::ScanIterator + '_> {
        Box::new(self.scan(range))
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.data.insert(key.to_vec(), value);
        self.dirty = true;
        Ok(())
    }

    fn status(&mut self) -> Result<Status> {
        Ok(Status {
            name: "file".to_string(),
            keys: self.data.len() as u64,
            size: self.data.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum(),
            disk_size: std::fs::metadata(&self.path)?.len(),
        })
    }
}
