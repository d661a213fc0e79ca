//! Maildir access for the POP3 side
//!
//! POP3 reads only `<mbox>/new`. Each session takes a [`MailList`]
//! snapshot of that directory; files that appear afterwards are simply
//! not part of the session. Message numbers (`nid`) are session-local,
//! dense from 1, and assigned by descending change time so that two
//! back-to-back sessions over the same files agree on numbering.
//!
//! Deletions persist through a per-user side file next to the Maildir
//! subdirectories: one UID per line, unioned and atomically rewritten
//! when a session commits at QUIT.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

/// One message file in `<mbox>/new`.
#[derive(Debug, Clone)]
pub struct MailEntry {
    /// The base filename; Maildir guarantees uniqueness, POP3 uses it
    /// as the UIDL value.
    pub uid: String,
    pub size: u64,
    pub ctime: DateTime<Utc>,
    pub path: PathBuf,
    /// 1-based session-local message number.
    pub nid: usize,
}

/// List the regular files under `new_dir` with size and change time.
///
/// No recursion, no dot-stuffing; subdirectories and anything whose
/// name is not valid UTF-8 are skipped.
///
/// # Errors
///
/// Returns an error if the directory cannot be read or a file cannot
/// be stat'ed.
pub fn scan_new(new_dir: &Path) -> std::io::Result<Vec<MailEntry>> {
    let mut entries = Vec::new();
    for dirent in std::fs::read_dir(new_dir)? {
        let dirent = dirent?;
        let meta = dirent.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let Ok(uid) = dirent.file_name().into_string() else {
            continue;
        };
        let ctime = meta.modified().map(DateTime::<Utc>::from)?;
        entries.push(MailEntry {
            uid,
            size: meta.len(),
            ctime,
            path: dirent.path(),
            nid: 0,
        });
    }
    Ok(entries)
}

/// Transactional snapshot of a mailbox for one POP3 session.
///
/// Owns the original entry vector so [`MailList::reset`] can rebuild
/// the live view without touching the filesystem.
#[derive(Debug)]
pub struct MailList {
    entries: Vec<MailEntry>,
    live: HashMap<usize, usize>,
    deleted: HashSet<String>,
}

impl MailList {
    /// Build a snapshot: sort by descending ctime (ties broken by
    /// ascending uid, so numbering is deterministic), assign nids
    /// 1..=N, index by nid.
    #[must_use]
    pub fn new(mut entries: Vec<MailEntry>) -> Self {
        entries.sort_by(|a, b| b.ctime.cmp(&a.ctime).then_with(|| a.uid.cmp(&b.uid)));
        for (i, entry) in entries.iter_mut().enumerate() {
            entry.nid = i + 1;
        }
        let live = entries.iter().map(|e| (e.nid, e.nid - 1)).collect();
        Self {
            entries,
            live,
            deleted: HashSet::new(),
        }
    }

    /// The live entry with this nid, if it exists and is not deleted.
    #[must_use]
    pub fn get(&self, nid: usize) -> Option<&MailEntry> {
        self.live.get(&nid).map(|&i| &self.entries[i])
    }

    /// Live entries in nid order.
    pub fn get_all(&self) -> impl Iterator<Item = &MailEntry> {
        self.entries.iter().filter(|e| self.live.contains_key(&e.nid))
    }

    /// Mark a message deleted; returns false when the nid is unknown
    /// or already deleted.
    pub fn delete(&mut self, nid: usize) -> bool {
        match self.live.remove(&nid) {
            Some(i) => {
                self.deleted.insert(self.entries[i].uid.clone());
                true
            }
            None => false,
        }
    }

    /// `(count, total_size)` over live entries.
    #[must_use]
    pub fn stat(&self) -> (usize, u64) {
        let mut count = 0;
        let mut size = 0;
        for entry in self.get_all() {
            count += 1;
            size += entry.size;
        }
        (count, size)
    }

    /// Discard session deletions and restore the full snapshot.
    pub fn reset(&mut self) {
        self.live = self.entries.iter().map(|e| (e.nid, e.nid - 1)).collect();
        self.deleted.clear();
    }

    /// UIDs deleted in this session.
    #[must_use]
    pub fn deleted_uids(&self) -> &HashSet<String> {
        &self.deleted
    }
}

/// Read a deleted-items file into a set. A missing file is an empty set.
///
/// # Errors
///
/// Returns an error on any read failure other than the file not
/// existing.
pub fn read_deleted_file(path: &Path) -> std::io::Result<HashSet<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text
            .lines()
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
        Err(e) => Err(e),
    }
}

/// Atomically replace a deleted-items file with `uids`, one per line.
///
/// Written to a temporary file in the same directory and renamed into
/// place; readers never observe a partial file.
///
/// # Errors
///
/// Returns an error if the temporary file cannot be created, written,
/// or renamed.
pub fn write_deleted_file(path: &Path, uids: &HashSet<String>) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    for uid in uids {
        writeln!(tmp, "{uid}")?;
    }
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
