/// Runtime launcher - runs submitted source on the host toolchain
///
/// Knows HOW to start a language runtime and capture its output. Knows
/// nothing about execution records, retries or deadlines: the caller bounds
/// the lifetime by dropping the returned future, which kills the process
/// group and removes any temporary workspace.

use coderun_common::tasks::CompilePayload;
use coderun_common::types::{Language, RunOutput};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use crate::config::LanguageConfigManager;
use crate::error::TaskError;

/// Temporary directory holding the source file for file-based runtimes.
/// Removed when dropped, on every exit path.
pub struct SourceWorkspace {
    dir: TempDir,
    file: PathBuf,
}

impl SourceWorkspace {
    pub fn create(execution_id: Uuid, file_name: &str, source_code: &str) -> std::io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("coderun-{}-", execution_id))
            .tempdir()?;
        let file = dir.path().join(file_name);
        std::fs::write(&file, source_code)?;
        Ok(Self { dir, file })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn file(&self) -> &Path {
        &self.file
    }
}

/// Kills the runtime's whole process group if the run is abandoned.
/// `go run` leaves the compiled program as a grandchild, which `kill_on_drop`
/// on the direct child alone would orphan.
struct ProcessGroupGuard {
    pgid: Option<i32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|pid| i32::try_from(pid).ok()),
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid.take() {
            // SAFETY: killpg only sends a signal; the group id came from a
            // child we spawned as its own group leader and have not reaped.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }
}

pub struct Runner {
    runtimes: LanguageConfigManager,
}

impl Runner {
    pub fn new(runtimes: LanguageConfigManager) -> Self {
        Self { runtimes }
    }

    /// Run the payload to completion and capture stdout, stderr and wall time.
    ///
    /// A non-zero exit is still a result, not an error.
    pub async fn run(&self, payload: &CompilePayload) -> Result<RunOutput, TaskError> {
        let language = payload.language;
        let launch_error = |reason: String| TaskError::SubprocessLaunch { language, reason };

        let runtime = self
            .runtimes
            .get_config(&language)
            .map_err(|e| launch_error(e.to_string()))?;

        let workspace = match &runtime.source_file {
            Some(file_name) => Some(
                SourceWorkspace::create(payload.execution_id, file_name, &payload.source_code)
                    .map_err(|e| launch_error(format!("failed to prepare workspace: {}", e)))?,
            ),
            None => None,
        };

        let args = runtime.render_args(
            &payload.source_code,
            workspace.as_ref().map(|w| w.file()),
        );

        let mut std_command = std::process::Command::new(&runtime.command);
        std_command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(workspace) = &workspace {
            std_command.current_dir(workspace.dir());
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_command.process_group(0);
        }
        let mut command = Command::from(std_command);
        command.kill_on_drop(true);

        let start = Instant::now();
        let child = command
            .spawn()
            .map_err(|e| launch_error(format!("{}: {}", runtime.command, e)))?;
        let mut group = ProcessGroupGuard::new(child.id());

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| launch_error(format!("failed to collect output: {}", e)))?;
        let elapsed = start.elapsed();
        group.disarm();

        debug!(
            execution_id = %payload.execution_id,
            exit_code = ?output.status.code(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Runtime exited"
        );

        Ok(RunOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            execution_time_ms: RunOutput::clamp_millis(elapsed),
        })
    }

    pub fn supports(&self, language: Language) -> bool {
        self.runtimes.get_config(&language).is_ok()
    }
}
