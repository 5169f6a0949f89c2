//! Startup scan of the checkpoint and log directories.
//!
//! Checkpoints are named `chkpt.<decimal-seq>` next to a `latest` sentinel;
//! log segments are named `log.<decimal-seq>` next to a `last` sentinel. The
//! sentinels are hard links to the newest file of their kind and are skipped
//! by inode. A log segment's `[start, end]` sequence range comes from the
//! commit records inside the file, not from its name.

use crate::store::MetaDataStore;
use plexfs_common::{Error, LogSeq, Result};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::{DirEntryExt, FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

const CHECKPOINT_PREFIX: &str = "chkpt.";
const LOG_PREFIX: &str = "log.";
const CHECKPOINT_SENTINEL: &str = "latest";
const LOG_SENTINEL: &str = "last";
const TMP_SUFFIX: &str = ".tmp.";

/// Size of the head and tail windows scanned for commit records.
const HEADER_SCAN_SIZE: usize = 4 << 10;

/// Register every checkpoint and log segment found on disk.
///
/// `remove_tmp` deletes interrupted checkpoint writes (`.tmp.` names) instead
/// of just ignoring them. Malformed file names and segments without commit
/// records abort the load.
pub fn load(
    store: &MetaDataStore,
    checkpoint_dir: &Path,
    log_dir: &Path,
    remove_tmp: bool,
) -> Result<()> {
    let checkpoints = scan_dir(
        checkpoint_dir,
        CHECKPOINT_PREFIX,
        CHECKPOINT_SENTINEL,
        Some(TMP_SUFFIX),
        remove_tmp,
    )?;
    for (seq, path) in checkpoints {
        store.register_checkpoint(path, seq);
    }

    let segments = scan_dir(log_dir, LOG_PREFIX, LOG_SENTINEL, None, false)?;
    let mut by_start: BTreeMap<LogSeq, (PathBuf, LogSeq)> = BTreeMap::new();
    for (_, path) in segments {
        let (start, end) = read_log_segment_bounds(&path)?;
        if by_start.insert(start, (path.clone(), end)).is_some() {
            error!(file = %path.display(), sequence = start, "duplicate log segment sequence");
            return Err(Error::DuplicateLogSeq(start));
        }
    }
    for (start, (path, end)) in by_start {
        store.register_log_segment(path, start, end);
    }
    info!(
        checkpoint_dir = %checkpoint_dir.display(),
        log_dir = %log_dir.display(),
        "metadata directories loaded"
    );
    Ok(())
}

fn scan_dir(
    dir: &Path,
    prefix: &str,
    sentinel: &str,
    tmp_suffix: Option<&str>,
    remove_tmp: bool,
) -> Result<Vec<(LogSeq, PathBuf)>> {
    let sentinel_ino = fs::metadata(dir.join(sentinel))
        .map_err(|err| {
            error!(dir = %dir.display(), sentinel, %err, "missing sentinel");
            err
        })?
        .ino();
    let mut out = Vec::new();
    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        let name = dirent.file_name();
        let name = name.to_string_lossy();
        let Some(rest) = name.strip_prefix(prefix) else {
            continue;
        };
        if dirent.ino() == sentinel_ino {
            continue;
        }
        match rest.parse::<LogSeq>() {
            Ok(seq) if seq >= 0 => out.push((seq, dirent.path())),
            _ => {
                if tmp_suffix.is_some_and(|suffix| rest.contains(suffix)) {
                    debug!(
                        file = %name,
                        removing = remove_tmp,
                        "leftover temporary checkpoint"
                    );
                    if remove_tmp {
                        fs::remove_file(dirent.path())?;
                    }
                    continue;
                }
                error!(file = %name, "malformed file name");
                return Err(Error::MalformedFileName(name.into_owned()));
            }
        }
    }
    out.sort_unstable_by_key(|(seq, _)| *seq);
    Ok(out)
}

/// Extract a log segment's `[start, end]` sequence bounds from its first and
/// last commit records.
///
/// Commit records are lines of the form `c/<f1>/<f2>/<f3>/<seq>/<f5>/...`
/// with the sequence in hex as the fifth `/`-separated field. The head
/// window yields the start bound; the tail window, read from `size -
/// HEADER_SCAN_SIZE`, yields the end bound. A file shorter than the window
/// is served by the head buffer alone.
pub fn read_log_segment_bounds(path: &Path) -> Result<(LogSeq, LogSeq)> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();

    let head_len = HEADER_SCAN_SIZE.min(size as usize);
    let head = read_window(&file, 0, head_len)?;
    let Some(start) = first_commit_seq(&head) else {
        info!(file = %path.display(), "no initial commit record");
        return Err(Error::MissingCommitRecord(path.display().to_string()));
    };

    let tail_buf;
    let tail: &[u8] = if size as usize <= HEADER_SCAN_SIZE {
        &head
    } else {
        tail_buf = read_window(&file, size - HEADER_SCAN_SIZE as u64, HEADER_SCAN_SIZE)?;
        &tail_buf
    };
    let Some(end) = last_commit_seq(tail) else {
        info!(file = %path.display(), "no terminating commit record");
        return Err(Error::InvalidCommitRecord(path.display().to_string()));
    };
    Ok((start, end))
}

fn read_window(file: &File, pos: u64, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0usize;
    while filled < len {
        match file.read_at(&mut buf[filled..], pos + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Sequence of the first commit record in `buf`, if any.
fn first_commit_seq(buf: &[u8]) -> Option<LogSeq> {
    let idx = find(buf, b"\nc/")?;
    parse_commit_line(&buf[idx + 1..])
}

/// Sequence of the last complete commit record in `buf`, if any.
fn last_commit_seq(buf: &[u8]) -> Option<LogSeq> {
    let idx = rfind(buf, b"\nc/")?;
    parse_commit_line(&buf[idx + 1..])
}

/// Parse one commit line starting at the `c`. The line must carry at least
/// six `/` separators and terminate with a newline inside the buffer; the
/// sequence is the hex field between the fourth and fifth separator.
fn parse_commit_line(line: &[u8]) -> Option<LogSeq> {
    let mut slashes = 0;
    let mut seq_start = None;
    let mut seq_end = None;
    let mut terminated = false;
    for (i, &b) in line.iter().enumerate() {
        match b {
            b'\n' => {
                terminated = true;
                break;
            }
            b'/' => {
                slashes += 1;
                if slashes == 4 {
                    seq_start = Some(i + 1);
                } else if slashes == 5 {
                    seq_end = Some(i);
                }
            }
            _ => {}
        }
    }
    if !terminated || slashes < 6 {
        return None;
    }
    let field = std::str::from_utf8(&line[seq_start?..seq_end?]).ok()?;
    LogSeq::from_str_radix(field, 16).ok().filter(|&seq| seq >= 0)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn commit_line(seq: LogSeq) -> String {
        format!("c/0/0/0/{seq:x}/{}/0\n", seq & 0xff)
    }

    fn write_segment(dir: &Path, name: &str, seqs: &[LogSeq], pad: usize) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(b"version/1\n").unwrap();
        for (i, &seq) in seqs.iter().enumerate() {
            if i > 0 && pad > 0 {
                // Filler records between commits to grow past the scan
                // window.
                let filler = format!("a/{}\n", "x".repeat(64));
                for _ in 0..pad {
                    file.write_all(filler.as_bytes()).unwrap();
                }
            }
            file.write_all(commit_line(seq).as_bytes()).unwrap();
        }
        file.flush().unwrap();
        path
    }

    #[test]
    fn test_parse_commit_line() {
        assert_eq!(parse_commit_line(b"c/0/0/0/1f/3/0\n"), Some(0x1f));
        // too few fields
        assert_eq!(parse_commit_line(b"c/0/0/1f/3\n"), None);
        // no terminating newline
        assert_eq!(parse_commit_line(b"c/0/0/0/1f/3/0"), None);
        // not hex
        assert_eq!(parse_commit_line(b"c/0/0/0/zz/3/0\n"), None);
    }

    #[test]
    fn test_bounds_small_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_segment(dir.path(), "log.3", &[0x10, 0x11, 0x17], 0);
        assert_eq!(read_log_segment_bounds(&path).unwrap(), (0x10, 0x17));
    }

    #[test]
    fn test_bounds_single_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_segment(dir.path(), "log.4", &[0x21], 0);
        assert_eq!(read_log_segment_bounds(&path).unwrap(), (0x21, 0x21));
    }

    #[test]
    fn test_bounds_large_file() {
        let dir = tempfile::tempdir().unwrap();
        // enough filler that the first and last records live in different
        // scan windows
        let path = write_segment(dir.path(), "log.5", &[0x100, 0x180, 0x1ff], 40);
        assert_eq!(read_log_segment_bounds(&path).unwrap(), (0x100, 0x1ff));
    }

    #[test]
    fn test_bounds_missing_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.6");
        fs::write(&path, b"version/1\nnothing here\n").unwrap();
        assert!(matches!(
            read_log_segment_bounds(&path),
            Err(Error::MissingCommitRecord(_))
        ));
    }

    #[test]
    fn test_scan_dir_skips_sentinel_by_inode() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("chkpt.5"), b"five").unwrap();
        fs::write(dir.path().join("chkpt.9"), b"nine").unwrap();
        fs::hard_link(dir.path().join("chkpt.9"), dir.path().join("latest")).unwrap();
        // a hard link of the newest checkpoint under a chkpt. name must be
        // skipped as well
        fs::hard_link(dir.path().join("chkpt.9"), dir.path().join("chkpt.99")).unwrap();

        let mut found = scan_dir(
            dir.path(),
            CHECKPOINT_PREFIX,
            CHECKPOINT_SENTINEL,
            Some(TMP_SUFFIX),
            false,
        )
        .unwrap();
        found.sort();
        let seqs: Vec<LogSeq> = found.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, vec![5]);
    }

    #[test]
    fn test_scan_dir_removes_tmp() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("chkpt.5"), b"five").unwrap();
        fs::hard_link(dir.path().join("chkpt.5"), dir.path().join("latest")).unwrap();
        fs::write(dir.path().join("chkpt.6.tmp.123"), b"partial").unwrap();

        let found = scan_dir(
            dir.path(),
            CHECKPOINT_PREFIX,
            CHECKPOINT_SENTINEL,
            Some(TMP_SUFFIX),
            true,
        )
        .unwrap();
        assert!(found.is_empty());
        assert!(!dir.path().join("chkpt.6.tmp.123").exists());
    }

    #[test]
    fn test_scan_dir_rejects_malformed_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("chkpt.5"), b"five").unwrap();
        fs::hard_link(dir.path().join("chkpt.5"), dir.path().join("latest")).unwrap();
        fs::write(dir.path().join("chkpt.bogus"), b"?").unwrap();

        assert!(matches!(
            scan_dir(
                dir.path(),
                CHECKPOINT_PREFIX,
                CHECKPOINT_SENTINEL,
                Some(TMP_SUFFIX),
                false,
            ),
            Err(Error::MalformedFileName(_))
        ));
    }

    #[test]
    fn test_load_registers_checkpoints_and_segments() {
        let dir = tempfile::tempdir().unwrap();
        let cp_dir = dir.path().join("checkpoint");
        let log_dir = dir.path().join("log");
        fs::create_dir(&cp_dir).unwrap();
        fs::create_dir(&log_dir).unwrap();
        fs::write(cp_dir.join("chkpt.3"), b"cp3").unwrap();
        fs::write(cp_dir.join("chkpt.7"), b"cp7").unwrap();
        fs::write(cp_dir.join("latest"), b"chkpt.7\n").unwrap();
        write_segment(&log_dir, "log.1", &[0x1, 0x5], 0);
        write_segment(&log_dir, "log.2", &[0x6, 0x9], 0);
        fs::write(log_dir.join("last"), b"log.2\n").unwrap();

        let store = MetaDataStore::new(0);
        load(&store, &cp_dir, &log_dir, false).unwrap();
        let stats = store.stats();
        assert_eq!(stats.checkpoint_count, 2);
        assert_eq!(stats.log_segment_count, 2);
    }

    #[test]
    fn test_scan_dir_requires_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("chkpt.5"), b"five").unwrap();
        assert!(scan_dir(
            dir.path(),
            CHECKPOINT_PREFIX,
            CHECKPOINT_SENTINEL,
            Some(TMP_SUFFIX),
            false,
        )
        .is_err());
    }
}
