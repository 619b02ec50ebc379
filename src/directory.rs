//! In-memory directory rebuilt from the inode log.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::String;
use alloc::vec::Vec;

use crate::structs::InodeRecord;

/// The active record of a file, plus what mount learned from its chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub file_id: u32,
    pub name: String,
    pub created_at: u32,
    pub first_block: u32,
    pub last_block: u32,
    pub size: u64,
    /// The chain could not be walked completely at mount.
    pub corrupt: bool,
}

impl DirEntry {
    pub fn from_record(record: &InodeRecord) -> Self {
        Self {
            file_id: record.file_id,
            name: record.name.clone(),
            created_at: record.created_at,
            first_block: record.first_block,
            last_block: record.last_block,
            size: 0,
            corrupt: false,
        }
    }
}

/// Result of folding every inode record found on the device.
#[derive(Debug, Default)]
pub(crate) struct Folded {
    pub directory: Directory,
    pub highest_file_id: u32,
    pub latest_time: u32,
    /// More than one active record claimed the same name.
    pub duplicates: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Directory {
    entries: BTreeMap<String, DirEntry>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the directory from log records in append order.
    ///
    /// A file is active when it has a creation record and no tombstone with
    /// the same id. Should two active files share a name, the one appended
    /// last wins.
    pub(crate) fn fold<'a, I>(records: I) -> Folded
    where
        I: IntoIterator<Item = &'a InodeRecord>,
    {
        let mut folded = Folded::default();
        let mut created: BTreeMap<u32, &InodeRecord> = BTreeMap::new();
        let mut deleted: BTreeSet<u32> = BTreeSet::new();
        let mut order: Vec<u32> = Vec::new();

        for record in records {
            folded.highest_file_id = folded.highest_file_id.max(record.file_id);
            folded.latest_time = folded.latest_time.max(record.created_at);
            if record.deleted {
                folded.latest_time = folded.latest_time.max(record.deleted_at);
                deleted.insert(record.file_id);
            } else if created.insert(record.file_id, record).is_none() {
                order.push(record.file_id);
            }
        }

        for file_id in order {
            if deleted.contains(&file_id) {
                continue;
            }
            let Some(record) = created.get(&file_id) else { continue };
            let entry = DirEntry::from_record(record);
            if let Some(previous) = folded.directory.entries.insert(entry.name.clone(), entry) {
                log::warn!("duplicate active name {:?} (file {})", previous.name, previous.file_id);
                folded.duplicates.push(previous.name);
            }
        }
        folded
    }

    pub fn lookup(&self, name: &str) -> Option<&DirEntry> {
        self.entries.get(name)
    }

    pub(crate) fn lookup_mut(&mut self, name: &str) -> Option<&mut DirEntry> {
        self.entries.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub(crate) fn insert(&mut self, entry: DirEntry) {
        self.entries.insert(entry.name.clone(), entry);
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<DirEntry> {
        self.entries.remove(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.values()
    }

    pub(crate) fn entries_mut(&mut self) -> impl Iterator<Item = &mut DirEntry> {
        self.entries.values_mut()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Iterator over the names of active files, taken from a directory snapshot.
///
/// Changes made after the listing started are not reflected.
#[derive(Debug, Clone)]
pub struct Listing {
    names: Vec<String>,
    position: usize,
}

impl Listing {
    pub(crate) fn new(directory: &Directory) -> Self {
        Self {
            names: directory.names().map(String::from).collect(),
            position: 0,
        }
    }

    /// Starts over from the first name of the same snapshot.
    pub fn restart(&mut self) {
        self.position = 0;
    }
}

impl Iterator for Listing {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let name = self.names.get(self.position)?.clone();
        self.position += 1;
        Some(name)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.names.len() - self.position;
        (left, Some(left))
    }
}
