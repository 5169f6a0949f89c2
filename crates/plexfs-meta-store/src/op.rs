//! Read request handed to the store.

use plexfs_common::LogSeq;

/// A single read against a checkpoint or log segment.
///
/// Filled in by the submitter, completed by a store worker. `status` is zero
/// on success or a negative errno; on success `data` holds the bytes read
/// (possibly fewer than `read_size` at end of file) and `start_log_seq` has
/// been rewritten to the sequence of the entry actually served.
#[derive(Debug)]
pub struct ReadMetaData {
    /// Checkpoint read when true, log-segment read otherwise.
    pub checkpoint_flag: bool,
    /// Requested sequence; negative selects the newest checkpoint.
    pub start_log_seq: LogSeq,
    /// Byte offset within the file.
    pub read_pos: u64,
    /// Requested byte count; capped by the store's `maxReadSize`.
    pub read_size: usize,
    pub data: Vec<u8>,
    pub status: i32,
    pub status_msg: String,
}

impl ReadMetaData {
    /// Read from a checkpoint; `start_log_seq < 0` selects the newest one.
    pub fn checkpoint(start_log_seq: LogSeq, read_pos: u64, read_size: usize) -> Self {
        Self {
            checkpoint_flag: true,
            start_log_seq,
            read_pos,
            read_size,
            data: Vec::new(),
            status: 0,
            status_msg: String::new(),
        }
    }

    /// Read from the log segment containing `start_log_seq`.
    pub fn log_segment(start_log_seq: LogSeq, read_pos: u64, read_size: usize) -> Self {
        Self {
            checkpoint_flag: false,
            ..Self::checkpoint(start_log_seq, read_pos, read_size)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }

    pub(crate) fn fail(&mut self, errno: i32, msg: impl Into<String>) {
        self.status = -errno;
        self.status_msg = msg.into();
    }
}
