//! Subprocess execution with timeout, bounded capture, and admission control.

use crate::config::ExecDefaults;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Appended to a captured stream when it hit the capture bound
pub const TRUNCATION_MARKER: &[u8] = b"\n[output truncated]\n";

/// Read buffer size for draining child pipes
const READ_CHUNK_SIZE: usize = 8192;

/// Why an invocation produced no usable exit status
#[derive(Debug, Error)]
pub enum ExecError {
    /// Too many subprocesses running; the admission wait timed out
    #[error("execution slots exhausted, gave up after {0:?}")]
    Overloaded(Duration),

    /// The OS could not start the process (missing file, not executable,
    /// resource limits)
    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    /// The process exceeded its wall-clock timeout and was killed
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// I/O failure while capturing output or awaiting the process
    #[error("execution i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of one completed invocation. Immutable once produced; the
/// executor never interprets stdout/stderr content, it only reports the
/// exit status alongside the captured bytes.
#[derive(Debug)]
pub struct ExecutionResult {
    /// Exit status as reported by the OS
    pub status: ExitStatus,
    /// Captured standard output, at most `max_output_bytes`
    pub stdout: Vec<u8>,
    /// Captured standard error, at most `max_output_bytes`
    pub stderr: Vec<u8>,
    /// Whether stdout hit the capture bound
    pub stdout_truncated: bool,
    /// Whether stderr hit the capture bound
    pub stderr_truncated: bool,
    /// Wall-clock duration of the invocation
    pub duration: Duration,
}

impl ExecutionResult {
    /// Whether the invocation succeeded (exit code 0)
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code, if the process exited normally (None when killed by a
    /// signal)
    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    /// Captured stdout with the truncation marker appended when the
    /// capture bound was hit
    pub fn stdout_body(&self) -> Vec<u8> {
        with_marker(&self.stdout, self.stdout_truncated)
    }

    /// Captured stderr with the truncation marker appended when the
    /// capture bound was hit
    pub fn stderr_body(&self) -> Vec<u8> {
        with_marker(&self.stderr, self.stderr_truncated)
    }
}

fn with_marker(bytes: &[u8], truncated: bool) -> Vec<u8> {
    let mut out = bytes.to_vec();
    if truncated {
        out.extend_from_slice(TRUNCATION_MARKER);
    }
    out
}

/// Spawns route executables and supervises each invocation.
///
/// The executor spawns the target directly with an argv array; no shell is
/// ever involved, so the metadata argument reaches the child verbatim as a
/// single argument. A semaphore bounds how many subprocesses run at once:
/// requests past the bound wait up to `queue_timeout` for a slot and are
/// rejected with [`ExecError::Overloaded`] afterwards.
pub struct ProcessExecutor {
    timeout: Duration,
    kill_grace: Duration,
    max_output_bytes: usize,
    queue_timeout: Duration,
    slots: Semaphore,
}

impl ProcessExecutor {
    pub fn new(defaults: &ExecDefaults) -> Self {
        Self {
            timeout: defaults.timeout(),
            kill_grace: defaults.kill_grace(),
            max_output_bytes: defaults.max_output_bytes,
            queue_timeout: defaults.queue_timeout(),
            slots: Semaphore::new(defaults.max_concurrent_execs),
        }
    }

    /// Run one executable to completion.
    ///
    /// `argument`, when present, is passed as the single argv element after
    /// the program path. `timeout` overrides the executor default for this
    /// invocation (per-route setting).
    pub async fn execute(
        &self,
        executable: &Path,
        argument: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult, ExecError> {
        let timeout = timeout.unwrap_or(self.timeout);

        let _permit = match tokio::time::timeout(self.queue_timeout, self.slots.acquire()).await {
            Ok(Ok(permit)) => permit,
            // acquire() only fails when the semaphore is closed, which never
            // happens here; treat it like exhaustion anyway
            Ok(Err(_)) | Err(_) => return Err(ExecError::Overloaded(self.queue_timeout)),
        };

        let mut cmd = Command::new(executable);
        if let Some(arg) = argument {
            cmd.arg(arg);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // If the request task is dropped (client disconnect), the child
            // must not be left running
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(ExecError::Spawn)?;
        let pid = child.id().unwrap_or(0);
        debug!(executable = %executable.display(), pid, "Process spawned");

        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");

        let cap = self.max_output_bytes;
        let waited = tokio::time::timeout(timeout, async {
            // Capture both streams while waiting so the child can never
            // block on a full pipe
            tokio::join!(
                read_capped(stdout, cap),
                read_capped(stderr, cap),
                child.wait()
            )
        })
        .await;

        match waited {
            Ok((out, err, status)) => {
                let (stdout, stdout_truncated) = out?;
                let (stderr, stderr_truncated) = err?;
                let status = status?;
                let duration = start.elapsed();

                debug!(
                    executable = %executable.display(),
                    pid,
                    code = status.code(),
                    duration_ms = duration.as_millis() as u64,
                    stdout_bytes = stdout.len(),
                    stderr_bytes = stderr.len(),
                    "Process finished"
                );

                Ok(ExecutionResult {
                    status,
                    stdout,
                    stderr,
                    stdout_truncated,
                    stderr_truncated,
                    duration,
                })
            }
            Err(_) => {
                warn!(
                    executable = %executable.display(),
                    pid,
                    timeout_secs = timeout.as_secs(),
                    "Process timed out, terminating"
                );
                self.kill_with_grace(&mut child).await;
                Err(ExecError::Timeout(timeout))
            }
        }
    }

    /// Terminate a timed-out child: SIGTERM first, SIGKILL after the grace
    /// period
    async fn kill_with_grace(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(?status, "Process exited after termination signal");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for terminated process");
            }
            Err(_) => {
                warn!(
                    grace_secs = self.kill_grace.as_secs(),
                    "Grace period expired, killing process"
                );
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill process");
                }
            }
        }
    }
}

/// Read a stream to EOF, keeping at most `cap` bytes.
///
/// Bytes past the cap are drained and discarded rather than left in the
/// pipe, so a chatty child still runs to completion instead of blocking on
/// a full pipe until the timeout fires.
async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    cap: usize,
) -> std::io::Result<(Vec<u8>, bool)> {
    let mut captured = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    let mut truncated = false;

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if captured.len() < cap {
            let take = n.min(cap - captured.len());
            captured.extend_from_slice(&chunk[..take]);
            if take < n {
                truncated = true;
            }
        } else {
            truncated = true;
        }
    }

    Ok((captured, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecDefaults;
    use std::io::Write;
    use std::path::PathBuf;

    fn executor() -> ProcessExecutor {
        ProcessExecutor::new(&ExecDefaults::default())
    }

    #[cfg(unix)]
    fn write_script(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        write!(file, "{}", body).unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_spawn_failure_on_missing_executable() {
        let result = executor()
            .execute(Path::new("/nonexistent/binary"), None, None)
            .await;
        assert!(matches!(result, Err(ExecError::Spawn(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "ok", "printf 'ok\\n'\n");

        let result = executor().execute(&script, None, None).await.unwrap();
        assert!(result.success());
        assert_eq!(result.exit_code(), Some(0));
        assert_eq!(result.stdout, b"ok\n");
        assert!(result.stderr.is_empty());
        assert!(!result.stdout_truncated);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "fail", "printf 'boom' >&2\nexit 3\n");

        let result = executor().execute(&script, None, None).await.unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code(), Some(3));
        assert_eq!(result.stderr, b"boom");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_argument_arrives_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        // $# proves exactly one argument arrived; $1 proves it is verbatim
        let script = write_script(&dir, "echoarg", "printf '%s:%s' \"$#\" \"$1\"\n");

        let payload = r#"{"x-test":"a;touch /tmp/pwned;b"}"#;
        let result = executor()
            .execute(&script, Some(payload), None)
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, format!("1:{}", payload).as_bytes());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_is_capped_and_marked() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "chatty", "head -c 100000 /dev/zero | tr '\\0' 'x'\n");

        let mut defaults = ExecDefaults::default();
        defaults.max_output_bytes = 1000;
        let result = ProcessExecutor::new(&defaults)
            .execute(&script, None, None)
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(result.stdout.len(), 1000);
        assert!(result.stdout_truncated);
        assert!(result.stdout_body().ends_with(TRUNCATION_MARKER));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "hang", "sleep 60\n");

        let mut defaults = ExecDefaults::default();
        defaults.kill_grace_secs = 1;
        let start = Instant::now();
        let result = ProcessExecutor::new(&defaults)
            .execute(&script, None, Some(Duration::from_millis(200)))
            .await;

        assert!(matches!(result, Err(ExecError::Timeout(_))));
        // Well under the 60s the script would have slept
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_admission_rejects_when_slots_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "slow", "sleep 2\n");

        let mut defaults = ExecDefaults::default();
        defaults.max_concurrent_execs = 1;
        defaults.queue_timeout_secs = 0;
        let executor = std::sync::Arc::new(ProcessExecutor::new(&defaults));

        let first = {
            let executor = executor.clone();
            let script = script.clone();
            tokio::spawn(async move { executor.execute(&script, None, None).await })
        };

        // Give the first invocation time to claim the only slot
        tokio::time::sleep(Duration::from_millis(300)).await;

        let second = executor.execute(&script, None, None).await;
        assert!(matches!(second, Err(ExecError::Overloaded(_))));

        let first = first.await.unwrap().unwrap();
        assert!(first.success());
    }
}
