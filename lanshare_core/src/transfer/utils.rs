use crate::error::{Result, TransferError};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use tokio::fs::{File, OpenOptions};

use super::constants::MAX_FILENAME_LENGTH;
use super::{ProgressFn, TransferOptions};

/// Name used when a received file name has nothing usable left after sanitising
pub const FALLBACK_FILE_NAME: &str = "received_file";

const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Run one blocking transfer step under the caller's deadline and cancel token
pub async fn guarded<T, F>(opts: &TransferOptions, what: &'static str, step: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let bounded = async {
        match opts.io_timeout {
            Some(limit) => tokio::time::timeout(limit, step)
                .await
                .map_err(|_| TransferError::Timeout(limit, what))?,
            None => step.await,
        }
    };

    tokio::select! {
        biased;
        _ = opts.cancel.cancelled() => Err(TransferError::Cancelled),
        res = bounded => res,
    }
}

/// Invoke the progress callback. A panicking callback is logged and otherwise ignored.
pub fn report_progress(on_progress: Option<&ProgressFn>, bytes_done: u64, total_bytes: u64) {
    let Some(callback) = on_progress else {
        return;
    };
    if catch_unwind(AssertUnwindSafe(|| callback(bytes_done, total_bytes))).is_err() {
        tracing::warn!(
            "Progress callback panicked at {}/{} bytes, continuing transfer",
            bytes_done,
            total_bytes
        );
    }
}

/// Create (or truncate) the destination file, owner-only on Unix
pub async fn open_secure_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}

/// Reduce a peer-supplied name to a single safe path component.
/// Directory parts (either separator) are dropped, control characters removed,
/// and `.`/`..`/device names replaced with [`FALLBACK_FILE_NAME`].
pub fn sanitize_file_name(file_name: &str) -> String {
    let last = file_name.rsplit(['/', '\\']).next().unwrap_or_default();
    let clean: String = last.chars().filter(|c| !c.is_control()).collect();
    let trimmed = clean.trim();

    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return FALLBACK_FILE_NAME.to_string();
    }

    let stem = trimmed.split('.').next().unwrap_or_default();
    if RESERVED_NAMES.iter().any(|r| stem.eq_ignore_ascii_case(r)) {
        return FALLBACK_FILE_NAME.to_string();
    }

    truncate_name(trimmed, MAX_FILENAME_LENGTH)
}

/// Cut a name to `max` bytes on a char boundary, keeping a short extension
fn truncate_name(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }

    let ext = name
        .rfind('.')
        .filter(|&idx| idx > 0 && name.len() - idx < 20)
        .map(|idx| &name[idx..])
        .unwrap_or("");

    let mut cutoff = max - ext.len();
    while !name.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    format!("{}{}", &name[..cutoff], ext)
}
