// dbbackup/src/utils/retention.rs
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Outcome of one retention sweep over the artifact directory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub bytes_freed: u64,
}

/// Deletes local backup artifacts whose modification time is at least `max_age` old.
///
/// A missing root is not an error: nothing has been dumped yet.
pub fn cleanup_old_backups(root: &Path, max_age: Duration) -> io::Result<CleanupReport> {
    let mut report = CleanupReport::default();
    if !root.exists() {
        debug!(root = %root.display(), "Backup directory does not exist, nothing to clean");
        return Ok(report);
    }

    let now = SystemTime::now();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry.metadata().map_err(io::Error::other)?;
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or(Duration::ZERO);
        if age < max_age {
            continue;
        }

        let path = entry.path();
        info!(
            path = %path.display(),
            age_hours = age.as_secs_f64() / 3600.0,
            "Deleting old backup"
        );
        match fs::remove_file(path) {
            Ok(()) => {
                report.bytes_freed += metadata.len();
                report.removed.push(path.to_path_buf());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Backup vanished before it could be deleted");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(report)
}

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// `None` when the day count does not fit in a `Duration` of seconds.
pub fn retention_from_days(days: u64) -> Option<Duration> {
    days.checked_mul(SECS_PER_DAY).map(Duration::from_secs)
}
