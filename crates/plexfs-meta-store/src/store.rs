//! The metadata read store: request routing, worker pool, retention.
//!
//! One mutex guards all store state. Workers release it around every `open`,
//! `read`, `close`, and `unlink` so disk latency never blocks request
//! submission. Completions flow through a done queue the event-loop thread
//! drains via [`MetaDataStore::tick`].

use crate::entry::{expire_lru, has_expired, update_lru, Entry, EntryTable, LruList};
use crate::op::ReadMetaData;
use parking_lot::{Condvar, Mutex, MutexGuard};
use plexfs_common::{errno, Error, LogSeq, Properties, Result};
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error};

const MIN_READ_SIZE: usize = 64 << 10;
const DEFAULT_MAX_READ_SIZE: usize = 2 << 20;
const MIN_INACTIVE_TIME: i64 = 10;
const DEFAULT_MAX_INACTIVE_TIME: i64 = 60;
const DEFAULT_MAX_CHECKPOINTS: usize = 16;

struct WorkerSlot {
    queue: VecDeque<ReadMetaData>,
    cond: Arc<Condvar>,
    /// Pending wakeup; a notify sent while the worker is not waiting would
    /// otherwise be lost.
    wake: bool,
}

struct State {
    checkpoints: EntryTable,
    log_segments: EntryTable,
    checkpoints_lru: LruList,
    log_segments_lru: LruList,
    /// Smallest checkpoint sequence still kept; monotonic nondecreasing.
    min_log_seq: LogSeq,
    prune_logs: bool,
    pending_delete_count: usize,
    max_read_size: usize,
    max_inactive_time: i64,
    max_checkpoints_to_keep: usize,
    cur_thread_idx: usize,
    worker_count: usize,
    pending_count: usize,
    open_count: u64,
    stop: bool,
    now: i64,
    workers: Vec<WorkerSlot>,
    join_handles: Vec<thread::JoinHandle<()>>,
    done_queue: VecDeque<ReadMetaData>,
}

impl State {
    fn table_mut(&mut self, checkpoint: bool) -> (&mut EntryTable, &mut LruList) {
        if checkpoint {
            (&mut self.checkpoints, &mut self.checkpoints_lru)
        } else {
            (&mut self.log_segments, &mut self.log_segments_lru)
        }
    }

    fn running(&self) -> bool {
        !self.workers.is_empty() && !self.stop
    }

    fn notify_worker(&mut self, idx: usize) {
        let worker = &mut self.workers[idx];
        worker.wake = true;
        worker.cond.notify_one();
    }
}

struct Shared {
    state: Mutex<State>,
    done_count: AtomicU64,
    last_tick: AtomicI64,
}

/// Store statistics, for monitoring and tests.
#[derive(Clone, Debug)]
pub struct StoreStats {
    pub checkpoint_count: usize,
    pub log_segment_count: usize,
    pub pending_delete_count: usize,
    pub min_log_seq: LogSeq,
    pub open_file_count: usize,
    /// Cumulative number of `open` calls performed by workers.
    pub open_count: u64,
    pub pending_count: usize,
}

/// Concurrent read store over registered checkpoints and log segments.
pub struct MetaDataStore {
    shared: Arc<Shared>,
}

impl MetaDataStore {
    /// `now` is the event-loop clock in seconds; the store never reads the
    /// system clock itself, it advances on every [`tick`].
    ///
    /// [`tick`]: MetaDataStore::tick
    pub fn new(now: i64) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    checkpoints: EntryTable::new(),
                    log_segments: EntryTable::new(),
                    checkpoints_lru: LruList::new(),
                    log_segments_lru: LruList::new(),
                    min_log_seq: -1,
                    prune_logs: false,
                    pending_delete_count: 0,
                    max_read_size: DEFAULT_MAX_READ_SIZE,
                    max_inactive_time: DEFAULT_MAX_INACTIVE_TIME,
                    max_checkpoints_to_keep: DEFAULT_MAX_CHECKPOINTS,
                    cur_thread_idx: 0,
                    worker_count: 1,
                    pending_count: 0,
                    open_count: 0,
                    stop: false,
                    now,
                    workers: Vec::new(),
                    join_handles: Vec::new(),
                    done_queue: VecDeque::new(),
                }),
                done_count: AtomicU64::new(0),
                last_tick: AtomicI64::new(now),
            }),
        }
    }

    /// Apply configuration under `prefix`. Recognized keys: `maxReadSize`,
    /// `maxInactiveTime`, `maxCheckpointsToKeepCount`, `threadCount` (the
    /// last only before [`start`]).
    ///
    /// [`start`]: MetaDataStore::start
    pub fn set_parameters(&self, prefix: &str, props: &Properties) {
        let mut s = self.shared.state.lock();
        let key = |name: &str| format!("{prefix}{name}");
        s.max_read_size = props
            .get_or(&key("maxReadSize"), s.max_read_size)
            .max(MIN_READ_SIZE);
        s.max_inactive_time = props
            .get_or(&key("maxInactiveTime"), s.max_inactive_time)
            .max(MIN_INACTIVE_TIME);
        s.max_checkpoints_to_keep = props
            .get_or(&key("maxCheckpointsToKeepCount"), s.max_checkpoints_to_keep)
            .max(1);
        if s.workers.is_empty() {
            s.worker_count = props.get_or(&key("threadCount"), s.worker_count).max(1);
        }
        // A lowered retention count should take effect without waiting for
        // traffic; worker 0 runs the pruner.
        if s.pending_count == 0 && s.running() {
            s.notify_worker(0);
        }
    }

    /// Register a checkpoint file. Duplicate sequences and malformed input
    /// are caller bugs and abort the process.
    pub fn register_checkpoint(&self, file_name: impl Into<PathBuf>, log_seq: LogSeq) {
        let file_name = file_name.into();
        let mut s = self.shared.state.lock();
        if file_name.as_os_str().is_empty() || log_seq < 0 || s.checkpoints.contains_key(&log_seq) {
            error!(
                sequence = log_seq,
                file = %file_name.display(),
                "invalid checkpoint"
            );
            panic!("invalid checkpoint registration attempt");
        }
        let idx = s.cur_thread_idx;
        s.checkpoints
            .insert(log_seq, Entry::new(log_seq, log_seq, file_name, idx));
        s.cur_thread_idx = (idx + 1) % s.worker_count;
        if s.pending_count == 0 && s.running() {
            s.notify_worker(0);
        }
    }

    /// Register a log segment covering `[start_seq, end_seq]`. Duplicate
    /// sequences and malformed input are caller bugs and abort the process.
    pub fn register_log_segment(
        &self,
        file_name: impl Into<PathBuf>,
        start_seq: LogSeq,
        end_seq: LogSeq,
    ) {
        let file_name = file_name.into();
        let mut s = self.shared.state.lock();
        if file_name.as_os_str().is_empty()
            || start_seq < 0
            || end_seq < start_seq
            || s.log_segments.contains_key(&start_seq)
        {
            error!(
                sequence = start_seq,
                end_sequence = end_seq,
                file = %file_name.display(),
                "invalid log segment"
            );
            panic!("invalid log segment registration attempt");
        }
        let obsolete = end_seq < s.min_log_seq;
        let wake = obsolete && !s.prune_logs && s.pending_count == 0 && s.running();
        if obsolete {
            s.prune_logs = true;
        }
        let idx = s.cur_thread_idx;
        s.log_segments
            .insert(start_seq, Entry::new(start_seq, end_seq, file_name, idx));
        s.cur_thread_idx = (idx + 1) % s.worker_count;
        if wake {
            s.notify_worker(0);
        }
    }

    /// Submit a read. Validation failures complete synchronously and return
    /// the op; otherwise the op is routed to the worker owning the target
    /// file and its completion arrives through [`tick`].
    ///
    /// [`tick`]: MetaDataStore::tick
    pub fn handle(&self, mut op: ReadMetaData) -> Option<ReadMetaData> {
        let mut s = self.shared.state.lock();
        if !s.running() {
            op.fail(errno::ENOENT, "shutdown");
            return Some(op);
        }
        let seq = if op.checkpoint_flag {
            if s.checkpoints.is_empty() {
                op.fail(errno::ENOENT, "no checkpoint exists");
                return Some(op);
            }
            if op.start_log_seq < 0 {
                let Some((&seq, _)) = s
                    .checkpoints
                    .iter()
                    .rev()
                    .find(|(_, e)| !e.pending_delete)
                else {
                    op.fail(errno::ENOENT, "no checkpoint exists");
                    return Some(op);
                };
                op.start_log_seq = seq;
                op.read_pos = 0;
                seq
            } else {
                match s.checkpoints.get(&op.start_log_seq) {
                    Some(e) if !e.pending_delete => e.log_seq,
                    _ => {
                        op.fail(errno::ENOENT, "no such checkpoint");
                        return Some(op);
                    }
                }
            }
        } else {
            if op.start_log_seq < 0 {
                op.fail(errno::EINVAL, "invalid log sequence");
                return Some(op);
            }
            if op.read_pos > 0 {
                match s.log_segments.get(&op.start_log_seq) {
                    Some(e) if !e.pending_delete => e.log_seq,
                    _ => {
                        op.fail(errno::EINVAL, "no such log sequence");
                        return Some(op);
                    }
                }
            } else {
                // Find the segment whose [start, end] range covers the
                // requested sequence.
                let target = op.start_log_seq;
                let entry = match s.log_segments.range(target..).next() {
                    Some((&k, e)) if k == target => Some(e),
                    _ => s.log_segments.range(..target).next_back().map(|(_, e)| e),
                };
                let Some(entry) = entry else {
                    op.fail(errno::ENOENT, "no such log segment");
                    return Some(op);
                };
                if entry.log_end_seq < target {
                    op.fail(errno::EFAULT, "missing log segment");
                    return Some(op);
                }
                if entry.pending_delete {
                    op.fail(errno::ENOENT, "no such log segment");
                    return Some(op);
                }
                op.start_log_seq = entry.log_seq;
                entry.log_seq
            }
        };
        let checkpoint = op.checkpoint_flag;
        let now = s.now;
        let (table, lru) = s.table_mut(checkpoint);
        let entry = table.get_mut(&seq).expect("resolved entry");
        entry.use_count += 1;
        let idx = entry.thread_idx;
        update_lru(table, lru, seq, now);
        assert!(idx < s.workers.len(), "entry thread index out of range");
        s.workers[idx].queue.push_back(op);
        s.pending_count += 1;
        s.notify_worker(idx);
        None
    }

    /// Start the worker pool. Errors when already started.
    pub fn start(&self) -> Result<()> {
        let mut s = self.shared.state.lock();
        if !s.workers.is_empty() {
            return Err(Error::InvalidState("store already started".into()));
        }
        s.stop = false;
        for idx in 0..s.worker_count {
            s.workers.push(WorkerSlot {
                queue: VecDeque::new(),
                cond: Arc::new(Condvar::new()),
                wake: false,
            });
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("meta-store-{idx}"))
                .spawn(move || worker_main(shared, idx))
                .expect("failed to spawn store worker");
            s.join_handles.push(handle);
        }
        Ok(())
    }

    /// Stop the workers, completing queued reads with `ECANCELED`, and join
    /// them.
    pub fn shutdown(&self) {
        let mut s = self.shared.state.lock();
        if s.stop || s.workers.is_empty() {
            return;
        }
        s.stop = true;
        for worker in &s.workers {
            worker.cond.notify_one();
        }
        let handles = std::mem::take(&mut s.join_handles);
        drop(s);
        for handle in handles {
            let _ = handle.join();
        }
        self.shared.state.lock().workers.clear();
    }

    /// Completion-reactor hook, called periodically from the event-loop
    /// thread. Advances the store clock, returns completed ops in FIFO
    /// order, and pokes worker 0 when idle LRU heads are past expiration.
    pub fn tick(&self, now: i64) -> Vec<ReadMetaData> {
        let shared = &self.shared;
        if shared.done_count.load(Ordering::Acquire) == 0
            && shared.last_tick.load(Ordering::Relaxed) == now
        {
            return Vec::new();
        }
        let mut s = shared.state.lock();
        s.now = now;
        shared.last_tick.store(now, Ordering::Relaxed);
        shared.done_count.store(0, Ordering::Release);
        let done: Vec<ReadMetaData> = s.done_queue.drain(..).collect();
        if s.pending_count == 0 && s.running() {
            let expire_time = now - s.max_inactive_time;
            if has_expired(&s.checkpoints, &s.checkpoints_lru, expire_time)
                || has_expired(&s.log_segments, &s.log_segments_lru, expire_time)
            {
                s.notify_worker(0);
            }
        }
        done
    }

    pub fn stats(&self) -> StoreStats {
        let s = self.shared.state.lock();
        let open_files = |t: &EntryTable| t.values().filter(|e| e.file.is_some()).count();
        StoreStats {
            checkpoint_count: s.checkpoints.len(),
            log_segment_count: s.log_segments.len(),
            pending_delete_count: s.pending_delete_count,
            min_log_seq: s.min_log_seq,
            open_file_count: open_files(&s.checkpoints) + open_files(&s.log_segments),
            open_count: s.open_count,
            pending_count: s.pending_count,
        }
    }
}

impl Drop for MetaDataStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_main(shared: Arc<Shared>, idx: usize) {
    let mut close_list: Vec<File> = Vec::with_capacity(32);
    let mut delete_list: Vec<PathBuf> = Vec::with_capacity(16);
    let mut s = shared.state.lock();
    loop {
        while !s.stop && s.workers[idx].queue.is_empty() && !s.workers[idx].wake {
            let cond = Arc::clone(&s.workers[idx].cond);
            cond.wait(&mut s);
        }
        s.workers[idx].wake = false;
        while let Some(mut op) = s.workers[idx].queue.pop_front() {
            if s.stop {
                op.fail(errno::ECANCELED, "canceled by shutdown");
            } else {
                process(&mut s, &mut op);
            }
            debug_assert!(s.pending_count > 0);
            s.pending_count -= 1;
            s.done_queue.push_back(op);
            shared.done_count.fetch_add(1, Ordering::Release);
        }
        gc(&mut s, &mut close_list, &mut delete_list);
        if !close_list.is_empty() || !delete_list.is_empty() {
            MutexGuard::unlocked(&mut s, || {
                close_list.clear();
                for path in delete_list.drain(..) {
                    if let Err(err) = fs::remove_file(&path) {
                        error!(file = %path.display(), %err, "delete failed");
                    }
                }
            });
        }
        if s.stop {
            break;
        }
    }
}

/// Execute one read on the worker owning the entry. The mutex is released
/// around the open and the read.
fn process(s: &mut MutexGuard<'_, State>, op: &mut ReadMetaData) {
    let checkpoint = op.checkpoint_flag;
    let seq = op.start_log_seq;
    let now = s.now;
    let max_read = s.max_read_size;
    let (table, lru) = s.table_mut(checkpoint);
    let Some(entry) = table.get(&seq) else {
        op.fail(errno::EFAULT, "internal error: no such entry");
        return;
    };
    assert!(entry.use_count > 0, "read of unreferenced entry");
    let path = entry.file_name.clone();
    update_lru(table, lru, seq, now);
    let mut file = table.get_mut(&seq).expect("entry").file.take();
    let had_file = file.is_some();
    let read_pos = op.read_pos;
    let len = op.read_size.min(max_read);

    MutexGuard::unlocked(s, || {
        if file.is_none() {
            match File::open(&path) {
                Ok(f) => file = Some(f),
                Err(err) => {
                    error!(file = %path.display(), %err, "open failed");
                    op.fail(errno::EIO, "failed to open file");
                }
            }
        }
        if let Some(f) = &file {
            read_into(f, read_pos, len, op, &path);
        }
    });

    let opened = !had_file && file.is_some();
    let (table, lru) = s.table_mut(checkpoint);
    let entry = table
        .get_mut(&seq)
        .expect("entry disappeared under an active reader");
    entry.file = file;
    debug_assert!(entry.use_count > 0);
    entry.use_count -= 1;
    update_lru(table, lru, seq, now);
    if opened {
        s.open_count += 1;
    }
}

fn read_into(file: &File, read_pos: u64, len: usize, op: &mut ReadMetaData, path: &std::path::Path) {
    let mut buf = vec![0u8; len];
    let mut filled = 0usize;
    while filled < len {
        match file.read_at(&mut buf[filled..], read_pos + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                error!(file = %path.display(), %err, "read failed");
                op.fail(errno::EIO, err.to_string());
                return;
            }
        }
    }
    buf.truncate(filled);
    debug!(file = %path.display(), pos = read_pos, len = filled, "read");
    op.data = buf;
}

/// Expiration and retention, run by every worker after draining its queue.
/// File-system work is only collected here; the caller performs it with the
/// mutex released.
fn gc(s: &mut State, close_list: &mut Vec<File>, delete_list: &mut Vec<PathBuf>) {
    let expire_time = s.now - s.max_inactive_time;
    let erased = expire_lru(
        &mut s.checkpoints,
        &mut s.checkpoints_lru,
        expire_time,
        close_list,
        delete_list,
    );
    debug_assert!(erased <= s.pending_delete_count);
    s.pending_delete_count = s.pending_delete_count.saturating_sub(erased);
    expire_lru(
        &mut s.log_segments,
        &mut s.log_segments_lru,
        expire_time,
        close_list,
        delete_list,
    );

    let prev_min = s.min_log_seq;
    let mut prune = s.checkpoints.len() as i64
        - s.max_checkpoints_to_keep as i64
        - s.pending_delete_count as i64;
    if prune > 0 {
        let victims: Vec<LogSeq> = s.checkpoints.keys().copied().collect();
        for seq in victims {
            if prune <= 0 {
                break;
            }
            prune -= 1;
            let entry = s.checkpoints.get_mut(&seq).expect("checkpoint");
            if s.min_log_seq < entry.log_seq {
                s.min_log_seq = entry.log_seq;
            }
            if entry.in_use() {
                if !entry.pending_delete {
                    entry.pending_delete = true;
                    s.pending_delete_count += 1;
                }
            } else {
                s.checkpoints_lru.unlink(&mut s.checkpoints, seq);
                let entry = s.checkpoints.remove(&seq).expect("checkpoint");
                delete_list.push(entry.file_name);
            }
        }
    }

    if s.prune_logs || prev_min < s.min_log_seq {
        s.prune_logs = false;
        // Resume the walk at the segment holding the previous floor, if it
        // is still present.
        let from = if s.log_segments.contains_key(&prev_min) {
            prev_min
        } else {
            LogSeq::MIN
        };
        let candidates: Vec<LogSeq> = s.log_segments.range(from..).map(|(&k, _)| k).collect();
        for seq in candidates {
            let entry = s.log_segments.get_mut(&seq).expect("log segment");
            if s.min_log_seq <= entry.log_end_seq {
                break;
            }
            if entry.in_use() {
                entry.pending_delete = true;
            } else {
                s.log_segments_lru.unlink(&mut s.log_segments, seq);
                let entry = s.log_segments.remove(&seq).expect("log segment");
                delete_list.push(entry.file_name);
            }
        }
    }
}
