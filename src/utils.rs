//! Utility functions

use crate::config::RetryPolicy;
use crate::error::{is_transient_io, RecoveryPath, Result, VolError};
use regex::Regex;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use tracing::warn;

/// Format byte size in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Name of the marker file recording a completed binning pass
pub fn binned_marker_name(factor: usize) -> String {
    format!("binned_{}.txt", factor)
}

/// Numeric sequence embedded in a slice image file name.
///
/// The last run of digits in the stem is the sequence number, so a prefix
/// carrying its own digits does not reorder the stack
/// (`scan2_0012.png` -> 12). A run too long for `u64` keeps its 18 least
/// significant digits.
pub fn sequence_number(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let run = stem
        .rsplit(|c: char| !c.is_ascii_digit())
        .find(|part| !part.is_empty())?;
    if let Ok(n) = run.parse::<u64>() {
        return Some(n);
    }

    static LAST_RUN: OnceLock<Option<Regex>> = OnceLock::new();
    let re = LAST_RUN
        .get_or_init(|| Regex::new(r"(\d{1,18})\D*$").ok())
        .as_ref()?;
    re.captures(stem)?.get(1)?.as_str().parse().ok()
}

/// Open a file for reading without blocking concurrent readers or a writer.
pub fn open_shared_read(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        // FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE
        options.share_mode(0x1 | 0x2 | 0x4);
    }
    options.open(path)
}

/// Open a file read-write while still letting other readers and writers in.
pub fn open_shared_write(path: &Path, create: bool) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(create);
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        // Same sharing as open_shared_read so two writers do not collide
        options.share_mode(0x1 | 0x2 | 0x4);
    }
    options.open(path)
}

/// Run `op`, retrying busy-class failures with exponential back-off.
///
/// Any other error is returned immediately. After the last attempt the
/// transient error is surfaced as [`VolError::TransientIo`].
pub fn retry_transient<T, F>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let attempts = policy.max_attempts.max(1);
    let mut delay = policy.initial_delay();
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_transient_io(&err) && attempt < attempts => {
                warn!(
                    target_op = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient IO failure, backing off"
                );
                thread::sleep(delay);
                delay = (delay * 2).min(policy.max_delay());
                attempt += 1;
            }
            Err(err) if is_transient_io(&err) => {
                return Err(VolError::TransientIo {
                    source: err,
                    attempts: attempt,
                    recovery: RecoveryPath::MappingRetry,
                })
            }
            Err(err) => return Err(VolError::Io(err)),
        }
    }
}

/// Cooperative cancellation flag checked between coarse progress points
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Return [`VolError::Cancelled`] once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(VolError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Coarse progress callback, receives a fraction in `0.0..=1.0`
pub type ProgressFn<'a> = &'a (dyn Fn(f32) + Send + Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(134_217_728), "128.00 MB");
    }

    #[test]
    fn test_sequence_number() {
        assert_eq!(sequence_number(&PathBuf::from("slice_0012.png")), Some(12));
        assert_eq!(sequence_number(&PathBuf::from("/a/b/img7.tif")), Some(7));
        assert_eq!(sequence_number(&PathBuf::from("scan2_0012.png")), Some(12));
        assert_eq!(sequence_number(&PathBuf::from("scan2_0100.bmp")), Some(100));
        assert_eq!(sequence_number(&PathBuf::from("r3_slice_7_final.tif")), Some(7));
        assert_eq!(sequence_number(&PathBuf::from("nodigits.png")), None);
        assert_eq!(sequence_number(&PathBuf::from("2024010112000000000000_0042.png")), Some(42));
        // A 25-digit run overflows u64 and keeps its low 18 digits
        let long = PathBuf::from("img_1234567890123456789012345.png");
        assert_eq!(sequence_number(&long), Some(890_123_456_789_012_345));
    }

    #[test]
    fn test_binned_marker_name() {
        assert_eq!(binned_marker_name(2), "binned_2.txt");
    }

    #[test]
    fn test_retry_transient_recovers() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            loader_retry_delay_ms: 1,
        };
        let calls = Cell::new(0);
        let value = retry_transient(&policy, "test", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            } else {
                Ok(7)
            }
        })
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retry_transient_gives_up() {
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 1,
            loader_retry_delay_ms: 1,
        };
        let err = retry_transient::<(), _>(&policy, "test", || {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        })
        .unwrap_err();
        assert!(matches!(err, VolError::TransientIo { attempts: 2, .. }));
        assert_eq!(policy.initial_delay(), Duration::from_millis(1));
    }

    #[test]
    fn test_retry_does_not_retry_missing_file() {
        let policy = RetryPolicy::default();
        let calls = Cell::new(0);
        let err = retry_transient::<(), _>(&policy, "test", || {
            calls.set(calls.get() + 1);
            Err(io::Error::from(io::ErrorKind::NotFound))
        })
        .unwrap_err();
        assert!(matches!(err, VolError::Io(_)));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::new();
        assert!(flag.check().is_ok());
        flag.clone().cancel();
        assert!(matches!(flag.check(), Err(VolError::Cancelled)));
    }
}
