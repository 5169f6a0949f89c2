//! Entry tables and their LRU lists.
//!
//! Checkpoints and log segments share one entry shape and live in separate
//! ordered tables keyed by log sequence. Each table is paired with an
//! intrusive LRU list threaded through the entries by sequence number: the
//! head is the eviction candidate, the tail the most recently used. Entries
//! that are idle with no open descriptor and no pending delete are kept out
//! of the list entirely.

use plexfs_common::LogSeq;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;

pub(crate) type EntryTable = BTreeMap<LogSeq, Entry>;

/// One registered checkpoint or log segment.
pub(crate) struct Entry {
    pub log_seq: LogSeq,
    /// Inclusive upper bound for log segments; equals `log_seq` for
    /// checkpoints.
    pub log_end_seq: LogSeq,
    pub file_name: PathBuf,
    /// Worker this file is pinned to; never changes after registration.
    pub thread_idx: usize,
    pub file: Option<File>,
    /// In-flight reads referencing this entry.
    pub use_count: u32,
    pub access_time: i64,
    /// Set by the pruner; the entry no longer binds new reads and is
    /// physically removed once idle.
    pub pending_delete: bool,
    lru_prev: Option<LogSeq>,
    lru_next: Option<LogSeq>,
    in_lru: bool,
}

impl Entry {
    pub fn new(log_seq: LogSeq, log_end_seq: LogSeq, file_name: PathBuf, thread_idx: usize) -> Self {
        Self {
            log_seq,
            log_end_seq,
            file_name,
            thread_idx,
            file: None,
            use_count: 0,
            access_time: 0,
            pending_delete: false,
            lru_prev: None,
            lru_next: None,
            in_lru: false,
        }
    }

    /// In use for pruning purposes: has readers or an open descriptor.
    pub fn in_use(&self) -> bool {
        self.use_count > 0 || self.file.is_some()
    }
}

/// Doubly-linked LRU order over the entries of one table.
#[derive(Default)]
pub(crate) struct LruList {
    head: Option<LogSeq>,
    tail: Option<LogSeq>,
}

impl LruList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Option<LogSeq> {
        self.head
    }

    pub fn unlink(&mut self, table: &mut EntryTable, seq: LogSeq) {
        let (prev, next) = {
            let entry = table.get_mut(&seq).expect("lru entry");
            if !entry.in_lru {
                return;
            }
            entry.in_lru = false;
            (entry.lru_prev.take(), entry.lru_next.take())
        };
        match prev {
            Some(p) => table.get_mut(&p).expect("lru prev").lru_next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => table.get_mut(&n).expect("lru next").lru_prev = prev,
            None => self.tail = prev,
        }
    }

    /// Insert at the most-recently-used end.
    pub fn push_back(&mut self, table: &mut EntryTable, seq: LogSeq) {
        let old_tail = self.tail.replace(seq);
        {
            let entry = table.get_mut(&seq).expect("lru entry");
            debug_assert!(!entry.in_lru);
            entry.in_lru = true;
            entry.lru_prev = old_tail;
            entry.lru_next = None;
        }
        match old_tail {
            Some(t) => table.get_mut(&t).expect("lru tail").lru_next = Some(seq),
            None => self.head = Some(seq),
        }
    }

    /// Insert at the eviction end.
    pub fn push_front(&mut self, table: &mut EntryTable, seq: LogSeq) {
        let old_head = self.head.replace(seq);
        {
            let entry = table.get_mut(&seq).expect("lru entry");
            debug_assert!(!entry.in_lru);
            entry.in_lru = true;
            entry.lru_next = old_head;
            entry.lru_prev = None;
        }
        match old_head {
            Some(h) => table.get_mut(&h).expect("lru head").lru_prev = Some(seq),
            None => self.tail = Some(seq),
        }
    }
}

/// Re-place `seq` in the LRU after any state change.
///
/// Idle entries with no descriptor leave the list; marked-for-delete ones go
/// to the eviction end so the next expirer pass disposes of them; everything
/// else counts as recently used.
pub(crate) fn update_lru(table: &mut EntryTable, lru: &mut LruList, seq: LogSeq, now: i64) {
    lru.unlink(table, seq);
    let entry = table.get_mut(&seq).expect("lru entry");
    entry.access_time = now;
    let idle_closed = entry.use_count == 0 && entry.file.is_none();
    let pending = entry.pending_delete;
    if idle_closed {
        if pending {
            lru.push_front(table, seq);
        }
    } else {
        lru.push_back(table, seq);
    }
}

/// Walk the eviction end, closing descriptors of entries idle past
/// `expire_time` and erasing the ones marked for deletion. Returns how many
/// marked entries were erased.
pub(crate) fn expire_lru(
    table: &mut EntryTable,
    lru: &mut LruList,
    expire_time: i64,
    close_list: &mut Vec<File>,
    delete_list: &mut Vec<PathBuf>,
) -> usize {
    let mut erased = 0;
    while let Some(seq) = lru.head() {
        {
            let entry = table.get(&seq).expect("lru head");
            let expired =
                entry.use_count == 0 && (entry.access_time < expire_time || entry.file.is_none());
            if !expired {
                break;
            }
        }
        lru.unlink(table, seq);
        let entry = table.get_mut(&seq).expect("lru head");
        if let Some(file) = entry.file.take() {
            close_list.push(file);
        }
        if entry.pending_delete {
            let entry = table.remove(&seq).expect("lru head");
            delete_list.push(entry.file_name);
            erased += 1;
        }
    }
    erased
}

/// True when the eviction candidate has been idle past `expire_time`.
pub(crate) fn has_expired(table: &EntryTable, lru: &LruList, expire_time: i64) -> bool {
    lru.head()
        .and_then(|seq| table.get(&seq))
        .is_some_and(|entry| entry.access_time < expire_time)
}
