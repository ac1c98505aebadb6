//! Running one external process to completion
//!
//! Spawning never goes through a shell: the program and each argument are
//! handed to the OS as separate tokens. Output is collected into growing
//! buffers while the process runs. Exit, timeout and kill race each other
//! and the first one to fire decides the outcome.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::task::{TaskOutput, TaskSpec};
use crate::audit::{AuditEvent, AuditSink};
use crate::error::ExecError;
use crate::validator;

/// How long to keep reading output after the process has exited.
/// Bounded because a grandchild can inherit the pipes and keep them open.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Validate an invocation, auditing any rejection
pub(crate) fn validate_invocation(
    command: &str,
    args: &[String],
    audit: &dyn AuditSink,
) -> Result<(), ExecError> {
    validator::validate(command, args).map_err(|e| {
        audit.record(AuditEvent::InjectionAttempt {
            command: command.to_string(),
            args: args.to_vec(),
            reason: e.to_string(),
        });
        ExecError::InjectionRejected(e)
    })
}

enum Finish {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Killed,
}

/// Run `spec` to completion.
///
/// `on_spawn` is called with the pid once the process exists. Cancelling
/// `kill` terminates the process and resolves the task as `Cancelled`.
pub(crate) async fn run_process<F>(
    spec: &TaskSpec,
    kill: CancellationToken,
    audit: &dyn AuditSink,
    on_spawn: F,
) -> Result<TaskOutput, ExecError>
where
    F: FnOnce(Option<u32>),
{
    // Checked again here so nothing that changed after enqueue can slip through
    validate_invocation(&spec.command, &spec.args, audit)?;

    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.working_directory {
        cmd.current_dir(dir);
    }

    // A teardown can land between dispatch and here
    if kill.is_cancelled() {
        debug!(task_id = %spec.id, "Killed before spawn");
        return Err(ExecError::Cancelled);
    }

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|e| ExecError::SpawnFailed {
        command: spec.command.clone(),
        reason: e.to_string(),
    })?;

    let pid = child.id();
    audit.record(AuditEvent::ProcessSpawn {
        command: spec.command.clone(),
        pid,
    });
    debug!(task_id = %spec.id, command = %spec.command, ?pid, "Process spawned");
    on_spawn(pid);

    let stdout = Capture::start(child.stdout.take());
    let stderr = Capture::start(child.stderr.take());

    let timeout = spec.timeout;
    let deadline = async move {
        if timeout.is_zero() {
            std::future::pending::<()>().await
        } else {
            tokio::time::sleep(timeout).await
        }
    };

    let finish = tokio::select! {
        status = child.wait() => Finish::Exited(status),
        _ = deadline => Finish::TimedOut,
        _ = kill.cancelled() => Finish::Killed,
    };

    match finish {
        Finish::Exited(Ok(status)) => {
            let duration = started.elapsed();
            let (stdout, stderr) = tokio::join!(
                stdout.finish(OUTPUT_DRAIN_GRACE),
                stderr.finish(OUTPUT_DRAIN_GRACE)
            );

            match status.code() {
                Some(exit_code) => Ok(TaskOutput {
                    stdout,
                    stderr,
                    exit_code,
                    duration,
                }),
                None => Err(ExecError::Terminated {
                    signal: exit_signal(&status),
                }),
            }
        }
        Finish::Exited(Err(e)) => {
            stdout.abort();
            stderr.abort();
            Err(ExecError::SpawnFailed {
                command: spec.command.clone(),
                reason: format!("failed waiting for process: {e}"),
            })
        }
        Finish::TimedOut => {
            warn!(
                task_id = %spec.id,
                command = %spec.command,
                timeout_ms = timeout.as_millis() as u64,
                "Process timed out, killing"
            );
            audit.record(AuditEvent::timeout(&spec.command, timeout));
            if let Err(e) = child.kill().await {
                warn!(task_id = %spec.id, error = %e, "Failed to kill timed out process");
            }
            stdout.abort();
            stderr.abort();
            Err(ExecError::Timeout { timeout })
        }
        Finish::Killed => {
            if let Err(e) = child.kill().await {
                warn!(task_id = %spec.id, error = %e, "Failed to kill process");
            }
            stdout.abort();
            stderr.abort();
            Err(ExecError::Cancelled)
        }
    }
}

/// Output of one stream, appended to as it arrives
struct Capture {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl Capture {
    fn start<R>(stream: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let reader = stream.map(|s| tokio::spawn(read_into(s, Arc::clone(&buffer))));
        Self { buffer, reader }
    }

    /// Wait up to `grace` for the stream to close, then return what was read
    async fn finish(self, grace: Duration) -> String {
        if let Some(mut reader) = self.reader {
            if tokio::time::timeout(grace, &mut reader).await.is_err() {
                reader.abort();
                debug!("Output still open after process exit, keeping what was read");
            }
        }
        let bytes = std::mem::take(&mut *self.buffer.lock());
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn abort(self) {
        if let Some(reader) = self.reader {
            reader.abort();
        }
    }
}

async fn read_into<R>(mut reader: R, buffer: Arc<Mutex<Vec<u8>>>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buffer.lock().extend_from_slice(&chunk[..n]),
            Err(e) => {
                debug!(error = %e, "Output stream closed with error");
                break;
            }
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::audit::MemoryAuditSink;

    fn spec(command: &str, args: &[&str], timeout: Duration) -> TaskSpec {
        TaskSpec {
            id: Uuid::now_v7(),
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            working_directory: None,
            timeout,
        }
    }

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let audit = MemoryAuditSink::new();
        let output = run_process(
            &spec("echo", &["hello", "editor"], Duration::from_secs(5)),
            CancellationToken::new(),
            &audit,
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(output.stdout.trim(), "hello editor");
        assert_eq!(output.exit_code, 0);
        assert!(matches!(
            audit.events()[0],
            AuditEvent::ProcessSpawn { pid: Some(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let output = run_process(
            &spec("false", &[], Duration::ZERO),
            CancellationToken::new(),
            &crate::audit::TracingAuditSink,
            |_| {},
        )
        .await
        .unwrap();
        assert_eq!(output.exit_code, 1);
        assert!(!output.succeeded());
    }

    #[tokio::test]
    async fn test_rejects_before_spawning() {
        let audit = MemoryAuditSink::new();
        let mut spawned = false;
        let result = run_process(
            &spec("echo", &["$(whoami)"], Duration::ZERO),
            CancellationToken::new(),
            &audit,
            |_| spawned = true,
        )
        .await;

        assert!(matches!(result, Err(ExecError::InjectionRejected(_))));
        assert!(!spawned);
        assert!(matches!(
            audit.events()[0],
            AuditEvent::InjectionAttempt { .. }
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let result = run_process(
            &spec("stagehand-no-such-binary", &[], Duration::ZERO),
            CancellationToken::new(),
            &crate::audit::TracingAuditSink,
            |_| {},
        )
        .await;

        match result {
            Err(ExecError::SpawnFailed { command, .. }) => {
                assert_eq!(command, "stagehand-no-such-binary")
            }
            other => panic!("expected spawn failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let audit = MemoryAuditSink::new();
        let started = std::time::Instant::now();
        let result = run_process(
            &spec("sleep", &["30"], Duration::from_millis(200)),
            CancellationToken::new(),
            &audit,
            |_| {},
        )
        .await;

        let elapsed = started.elapsed();
        assert_eq!(
            result.unwrap_err(),
            ExecError::Timeout {
                timeout: Duration::from_millis(200)
            }
        );
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(5));
        assert!(audit
            .events()
            .iter()
            .any(|e| matches!(e, AuditEvent::ProcessTimeout { timeout_ms: 200, .. })));
    }

    #[tokio::test]
    async fn test_kill_token_cancels() {
        let kill = CancellationToken::new();
        let trigger = kill.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = run_process(
            &spec("sleep", &["30"], Duration::ZERO),
            kill,
            &crate::audit::TracingAuditSink,
            |_| {},
        )
        .await;
        assert_eq!(result.unwrap_err(), ExecError::Cancelled);
    }

    #[tokio::test]
    async fn test_cancelled_before_spawn_never_starts() {
        let audit = MemoryAuditSink::new();
        let kill = CancellationToken::new();
        kill.cancel();
        let mut spawned = false;

        let result = run_process(
            &spec("echo", &["late"], Duration::ZERO),
            kill,
            &audit,
            |_| spawned = true,
        )
        .await;

        assert_eq!(result.unwrap_err(), ExecError::Cancelled);
        assert!(!spawned);
        assert!(audit.events().is_empty());
    }

    #[tokio::test]
    async fn test_output_kept_when_background_child_holds_pipe() {
        let script = std::env::temp_dir().join(format!("stagehand-{}.sh", Uuid::now_v7()));
        std::fs::write(&script, "echo hello-from-editor\nsleep 5 &\n").unwrap();
        let script_path = script.to_string_lossy().into_owned();

        let started = std::time::Instant::now();
        let output = run_process(
            &spec("sh", &[script_path.as_str()], Duration::from_secs(10)),
            CancellationToken::new(),
            &crate::audit::TracingAuditSink,
            |_| {},
        )
        .await
        .unwrap();
        let elapsed = started.elapsed();
        let _ = std::fs::remove_file(&script);

        assert_eq!(output.stdout.trim(), "hello-from-editor");
        assert_eq!(output.exit_code, 0);
        // Run time stops at exit; the drain grace is not counted
        assert!(output.duration < Duration::from_secs(1));
        // Both streams wait out the grace together, not one after the other
        assert!(elapsed < OUTPUT_DRAIN_GRACE + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_working_directory() {
        let dir = std::env::temp_dir();
        let mut task = spec("pwd", &[], Duration::from_secs(5));
        task.working_directory = Some(dir.clone());

        let output = run_process(
            &task,
            CancellationToken::new(),
            &crate::audit::TracingAuditSink,
            |_| {},
        )
        .await
        .unwrap();

        let reported = std::path::PathBuf::from(output.stdout.trim());
        assert_eq!(
            reported.canonicalize().unwrap(),
            dir.canonicalize().unwrap()
        );
    }
}
