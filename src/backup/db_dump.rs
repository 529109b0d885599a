// dbbackup/src/backup/db_dump.rs
use chrono::Local;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::errors::ExecutionError;
use crate::model::DatabaseType;
use crate::utils::resolve_executable;

/// An external dump utility plus the directory its artifacts land in.
#[derive(Debug, Clone)]
pub struct DumpTool {
    program: PathBuf,
    output_root: PathBuf,
}

impl DumpTool {
    pub fn new(program: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            output_root: output_root.into(),
        }
    }

    /// Locates `bin_name` on this machine.
    pub fn resolve(bin_name: &str, output_root: impl Into<PathBuf>) -> Self {
        Self::new(resolve_executable(bin_name), output_root)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// Fresh command for the tool. The child is killed if the future driving it is dropped.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// Creates `{root}/{type}/` and reserves a fresh, empty artifact file inside it.
    ///
    /// Names only resolve to the second, so a name already taken by another job
    /// gets a `-{n}` suffix instead of being shared.
    pub async fn artifact_path(
        &self,
        db_type: DatabaseType,
        host: &str,
        database: Option<&str>,
        ext: &str,
    ) -> Result<PathBuf, ExecutionError> {
        let dir = self.output_root.join(db_type.as_str());
        tokio::fs::create_dir_all(&dir).await?;
        let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let name = artifact_file_name(host, &timestamp, database, ext);

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let candidate = dir.join(numbered(&name, ext, attempt));
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
                .await
            {
                Ok(_) => return Ok(candidate),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ExecutionError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("no free artifact name for {} in {}", name, dir.display()),
        )))
    }
}

const MAX_NAME_ATTEMPTS: u32 = 1000;

/// `name` itself for attempt 0, `{stem}-{attempt}.{ext}` after that.
fn numbered(name: &str, ext: &str, attempt: u32) -> String {
    if attempt == 0 {
        return name.to_string();
    }
    let stem = name
        .strip_suffix(ext)
        .and_then(|s| s.strip_suffix('.'))
        .unwrap_or(name);
    format!("{}-{}.{}", stem, attempt, ext)
}

/// `{host}_{timestamp}[_{database}].{ext}` with path-hostile characters replaced.
pub fn artifact_file_name(host: &str, timestamp: &str, database: Option<&str>, ext: &str) -> String {
    let host = match sanitize_segment(host) {
        h if h.is_empty() => "unknown".to_string(),
        h => h,
    };
    let db_part = database
        .map(sanitize_segment)
        .filter(|d| !d.is_empty())
        .map(|d| format!("_{}", d))
        .unwrap_or_default();
    format!("{}_{}{}.{}", host, timestamp, db_part, ext)
}

fn sanitize_segment(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn combined_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(stdout).trim().to_string();
    let err = String::from_utf8_lossy(stderr);
    let err = err.trim();
    if !err.is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(err);
    }
    text
}

/// Runs a tool that writes its artifact itself, failing on a non-zero exit.
pub async fn run_tool(tool: &str, cmd: &mut Command) -> Result<(), ExecutionError> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    wait_for(tool, cmd).await
}

/// Runs a tool that dumps to stdout, streaming stdout into `target`.
pub async fn run_tool_to_file(
    tool: &str,
    cmd: &mut Command,
    target: &Path,
) -> Result<(), ExecutionError> {
    let file = tokio::fs::File::create(target).await?.into_std().await;
    cmd.stdout(Stdio::from(file)).stderr(Stdio::piped());
    wait_for(tool, cmd).await
}

// `Command::output` would re-pipe stdout, so spawn with the caller's stdio instead.
async fn wait_for(tool: &str, cmd: &mut Command) -> Result<(), ExecutionError> {
    debug!(tool, "Spawning dump tool");
    let child = cmd.spawn().map_err(|source| ExecutionError::Spawn {
        tool: tool.to_string(),
        source,
    })?;
    let output = child.wait_with_output().await?;

    if !output.status.success() {
        return Err(ExecutionError::ToolFailed {
            tool: tool.to_string(),
            status: output.status,
            output: combined_output(&output.stdout, &output.stderr),
        });
    }
    Ok(())
}
