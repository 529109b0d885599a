pub mod retention;

use std::path::{Path, PathBuf};
use which::which;

/// Install locations checked when a client tool is not on `PATH`.
const COMMON_BIN_DIRS: &[&str] = &["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin", "/bin"];

/// Finds a database client executable in the system PATH or the common install dirs.
///
/// Falls back to the bare name so the spawn error names the missing tool.
pub fn resolve_executable(bin_name: &str) -> PathBuf {
    if let Ok(path) = which(bin_name) {
        return path;
    }
    COMMON_BIN_DIRS
        .iter()
        .map(|dir| Path::new(dir).join(bin_name))
        .find(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(bin_name))
}
