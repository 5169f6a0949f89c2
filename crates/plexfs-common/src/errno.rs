//! Wire error-code space shared by both ends of the metadata protocol.
//!
//! Operation statuses travel as negative integers in RPC headers. The POSIX
//! subset uses fixed Linux numbering so the same table serves both ends; the
//! file-system specific codes live above the POSIX range and have no host
//! equivalent.

pub const EPERM: i32 = 1;
pub const ENOENT: i32 = 2;
pub const EIO: i32 = 5;
pub const EAGAIN: i32 = 11;
pub const ENOMEM: i32 = 12;
pub const EACCES: i32 = 13;
pub const EFAULT: i32 = 14;
pub const EBUSY: i32 = 16;
pub const EEXIST: i32 = 17;
pub const EINVAL: i32 = 22;
pub const ENOSPC: i32 = 28;
pub const ETIMEDOUT: i32 = 110;
pub const EHOSTUNREACH: i32 = 113;
pub const ECANCELED: i32 = 125;

/// File-system specific codes, outside the POSIX range.
pub const EBADVERS: i32 = 1000;
pub const EBADCLUSTERKEY: i32 = 1001;
pub const ELEASEEXPIRED: i32 = 1002;

/// Translate a wire status code to the host errno value.
///
/// The listed POSIX codes map onto themselves on Linux; the extended codes
/// pass through unchanged so callers can match them by name. Unknown codes
/// pass through as well rather than being collapsed into `EINVAL`, so a newer
/// peer does not lose information when talking to an older one.
pub fn wire_to_host_errno(code: i32) -> i32 {
    match code {
        EPERM | ENOENT | EIO | EAGAIN | ENOMEM | EACCES | EFAULT | EBUSY | EEXIST | EINVAL
        | ENOSPC | ETIMEDOUT | EHOSTUNREACH | ECANCELED => code,
        EBADVERS | EBADCLUSTERKEY | ELEASEEXPIRED => code,
        other => other,
    }
}

/// Short human-readable name for an error code, for status messages and logs.
pub fn err_msg(code: i32) -> &'static str {
    match code {
        0 => "ok",
        EPERM => "operation not permitted",
        ENOENT => "no such entry",
        EIO => "I/O error",
        EAGAIN => "try again",
        ENOMEM => "out of memory",
        EACCES => "permission denied",
        EFAULT => "bad address",
        EBUSY => "resource busy",
        EEXIST => "entry exists",
        EINVAL => "invalid argument",
        ENOSPC => "no space left",
        ETIMEDOUT => "operation timed out",
        EHOSTUNREACH => "host unreachable",
        ECANCELED => "operation canceled",
        EBADVERS => "protocol version mismatch",
        EBADCLUSTERKEY => "cluster key mismatch",
        ELEASEEXPIRED => "lease expired",
        _ => "unknown error",
    }
}
