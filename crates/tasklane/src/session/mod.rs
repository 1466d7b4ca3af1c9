//! Process controller for script runs.
//!
//! A [`ScriptProcess`] owns everything one script execution touches: the
//! temporary script file, the private working directory, the interpreter
//! child process and the readers draining its output. Dropping it removes the
//! temporary files and kills the interpreter, so every exit path cleans up.
//!
//! # Example
//!
//! ```no_run
//! # use tasklane::session::{ActiveRuns, RunLimits, ScriptProcess, ScriptSpec};
//! # use tasklane::runner::progress::NoopProgress;
//! # use tasklane::RunId;
//! # use std::time::Duration;
//! # async fn example() -> tasklane::EngineResult<()> {
//! let run_id = RunId::new();
//! let stop = ActiveRuns::new().register(run_id).await;
//! let process = ScriptProcess::spawn(ScriptSpec::new(run_id, "echo hello"))?;
//! let outcome = process
//!     .run(RunLimits::with_deadline(Duration::from_secs(5)), &NoopProgress, &stop)
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod stop;

pub use stop::{ActiveRuns, StopHandle};

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{TempDir, TempPath};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_OUTPUT_POLL_INTERVAL_MS, DEFAULT_STOP_GRACE_MS};
use crate::error::{EngineError, EngineResult};
use crate::model::RunId;
use crate::runner::progress::ProgressSink;

/// Prepended to every POSIX script.
#[cfg(not(windows))]
const SCRIPT_PRELUDE: &str = "set -euo pipefail\ntrap 'exit 1' INT TERM\n";

#[cfg(not(windows))]
const SCRIPT_SUFFIX: &str = ".sh";
#[cfg(windows)]
const SCRIPT_SUFFIX: &str = ".bat";

/// Marker appended once when output exceeds the capture limit.
pub const TRUNCATION_MARKER: &str = "[output truncated]";

/// Bytes taken from a pipe per read.
const READ_CHUNK: usize = 8192;

/// How long output readers may keep draining after the interpreter exits.
const READER_DRAIN: Duration = Duration::from_secs(1);

/// Upper bound on waiting for a killed child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// What to execute for one script run.
#[derive(Clone, Debug)]
pub struct ScriptSpec {
    pub run_id: RunId,
    pub script: String,
    /// Interpreter override; `bash` (or `cmd`) when `None`.
    pub shell: Option<PathBuf>,
    pub max_output_bytes: usize,
}

impl ScriptSpec {
    pub fn new(run_id: RunId, script: impl Into<String>) -> Self {
        Self {
            run_id,
            script: script.into(),
            shell: None,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Timing limits for [`ScriptProcess::run`].
#[derive(Clone, Copy, Debug)]
pub struct RunLimits {
    pub deadline: Duration,
    pub poll_interval: Duration,
    pub stop_grace: Duration,
}

impl RunLimits {
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline,
            poll_interval: Duration::from_millis(DEFAULT_OUTPUT_POLL_INTERVAL_MS),
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
        }
    }
}

/// How a script process ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The interpreter exited on its own.
    Exited {
        /// `None` when the process was killed by a signal.
        code: Option<i32>,
        success: bool,
        output: String,
    },
    /// The deadline passed and the process tree was terminated.
    TimedOut { output: String },
    /// A stop was requested and the process tree was terminated.
    Stopped { output: String },
}

impl ProcessOutcome {
    pub fn output(&self) -> &str {
        match self {
            Self::Exited { output, .. } | Self::TimedOut { output } | Self::Stopped { output } => {
                output
            }
        }
    }
}

/// A spawned script interpreter and its temporary files.
#[derive(Debug)]
pub struct ScriptProcess {
    run_id: RunId,
    child: Child,
    pid: Option<u32>,
    output: Arc<Mutex<OutputBuffer>>,
    readers: Vec<JoinHandle<()>>,
    script_path: TempPath,
    workdir: TempDir,
}

impl ScriptProcess {
    /// Write the script to a temp file and start the interpreter on it.
    ///
    /// # Errors
    /// - `E_IO`: temp file, temp directory, or process creation failed
    pub fn spawn(spec: ScriptSpec) -> EngineResult<Self> {
        let script_path = write_script(&spec.script)?;
        let workdir = tempfile::Builder::new()
            .prefix("task_run_")
            .tempdir()
            .map_err(|err| EngineError::io("failed to create working directory", err))?;

        let mut command = interpreter_command(spec.shell.as_deref(), &script_path);
        command
            .current_dir(workdir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|err| EngineError::io("failed to start script interpreter", err))?;
        let pid = child.id();

        let output = Arc::new(Mutex::new(OutputBuffer::new(spec.max_output_bytes)));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Arc::clone(&output)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Arc::clone(&output)));
        }

        tracing::debug!(run_id = %spec.run_id, ?pid, script = %script_path.display(), "spawned script");
        Ok(Self {
            run_id: spec.run_id,
            child,
            pid,
            output,
            readers,
            script_path,
            workdir,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Path of the temporary script file; removed when the process value is dropped.
    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    /// Private working directory; removed when the process value is dropped.
    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    /// Drive the process to completion.
    ///
    /// Publishes captured output to `sink` every poll interval, enforces the
    /// deadline, and reacts to `stop`. Temporary files are removed when this
    /// returns.
    ///
    /// # Errors
    /// - `E_IO`: waiting on the child failed
    pub async fn run(
        mut self,
        limits: RunLimits,
        sink: &dyn ProgressSink,
        stop: &StopHandle,
    ) -> EngineResult<ProcessOutcome> {
        stop.attach_pid(self.pid);
        let ended = self.supervise(limits, sink, stop).await;
        let result = match ended {
            Ok(Ended::Exited(status)) if !stop.is_requested() => {
                self.drain_readers().await;
                Ok(ProcessOutcome::Exited {
                    code: status.code(),
                    success: status.success(),
                    output: self.output_snapshot().await,
                })
            }
            Ok(Ended::Exited(_) | Ended::Stopped) => {
                self.terminate(limits.stop_grace).await;
                self.drain_readers().await;
                Ok(ProcessOutcome::Stopped {
                    output: self.output_snapshot().await,
                })
            }
            Ok(Ended::TimedOut) => {
                self.terminate(limits.stop_grace).await;
                self.drain_readers().await;
                Ok(ProcessOutcome::TimedOut {
                    output: self.output_snapshot().await,
                })
            }
            Err(err) => {
                self.terminate(limits.stop_grace).await;
                Err(err)
            }
        };
        stop.detach_pid();
        result
    }

    async fn supervise(
        &mut self,
        limits: RunLimits,
        sink: &dyn ProgressSink,
        stop: &StopHandle,
    ) -> EngineResult<Ended> {
        let deadline = tokio::time::sleep(limits.deadline);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(limits.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                status = self.child.wait() => {
                    let status = status
                        .map_err(|err| EngineError::io("failed to wait for script", err))?;
                    return Ok(Ended::Exited(status));
                }
                () = &mut deadline => return Ok(Ended::TimedOut),
                () = stop.requested() => return Ok(Ended::Stopped),
                _ = ticker.tick() => {
                    let snapshot = self.output.lock().await.text.clone();
                    tracing::trace!(run_id = %self.run_id, bytes = snapshot.len(), "publishing output");
                    sink.on_output(&snapshot).await;
                }
            }
        }
    }

    /// Graceful termination of the whole process tree, forceful after `grace`.
    async fn terminate(&mut self, grace: Duration) {
        if let Some(pid) = self.pid {
            if let Err(err) = stop::terminate_tree(pid) {
                tracing::debug!(run_id = %self.run_id, pid, error = %err, "graceful terminate failed");
            }
            if tokio::time::timeout(grace, self.child.wait()).await.is_ok() {
                // The leader is gone; make sure nothing else in its group survives.
                let _ = stop::kill_tree(pid);
                return;
            }
            if let Err(err) = stop::kill_tree(pid) {
                tracing::debug!(run_id = %self.run_id, pid, error = %err, "forceful kill failed");
            }
        }
        let _ = self.child.start_kill();
        let _ = tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await;
    }

    async fn drain_readers(&mut self) {
        let cutoff = Instant::now() + READER_DRAIN;
        for mut reader in self.readers.drain(..) {
            if tokio::time::timeout_at(cutoff, &mut reader).await.is_err() {
                reader.abort();
            }
        }
    }

    async fn output_snapshot(&self) -> String {
        self.output.lock().await.text.clone()
    }
}

enum Ended {
    Exited(ExitStatus),
    TimedOut,
    Stopped,
}

fn write_script(script: &str) -> EngineResult<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix("task_")
        .suffix(SCRIPT_SUFFIX)
        .tempfile()
        .map_err(|err| EngineError::io("failed to create script file", err))?;

    #[cfg(not(windows))]
    let body = format!("{SCRIPT_PRELUDE}{script}\n");
    #[cfg(windows)]
    let body = script.to_string();

    file.write_all(body.as_bytes())
        .and_then(|()| file.flush())
        .map_err(|err| EngineError::io("failed to write script file", err))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o755))
            .map_err(|err| EngineError::io("failed to mark script executable", err))?;
    }

    Ok(file.into_temp_path())
}

#[cfg(not(windows))]
fn interpreter_command(shell: Option<&Path>, script: &Path) -> Command {
    let mut command = Command::new(shell.unwrap_or_else(|| Path::new("bash")));
    command.arg(script);
    command
}

#[cfg(windows)]
fn interpreter_command(shell: Option<&Path>, script: &Path) -> Command {
    let mut command = Command::new(shell.unwrap_or_else(|| Path::new("cmd")));
    command.arg("/C").arg(script);
    command
}

fn spawn_reader<R>(mut stream: R, output: Arc<Mutex<OutputBuffer>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; READ_CHUNK];
        let mut pending = Vec::with_capacity(READ_CHUNK);
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    pending.extend_from_slice(chunk.get(..n).unwrap_or_default());
                    let complete = pending.len() - incomplete_utf8_tail(&pending);
                    let ready: Vec<u8> = pending.drain(..complete).collect();
                    output.lock().await.push(&String::from_utf8_lossy(&ready));
                }
            }
        }
        if !pending.is_empty() {
            output.lock().await.push(&String::from_utf8_lossy(&pending));
        }
    })
}

/// Length of a multi-byte UTF-8 sequence cut off at the end of `bytes`.
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let Some(&byte) = bytes.get(bytes.len() - back) else {
            return 0;
        };
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

/// Combined stdout/stderr capture with a hard size cap.
#[derive(Debug)]
struct OutputBuffer {
    text: String,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &str) {
        if self.truncated {
            return;
        }
        if self.text.len() + chunk.len() > self.limit {
            self.truncated = true;
            let mut room = self.limit.saturating_sub(self.text.len());
            while !chunk.is_char_boundary(room) {
                room -= 1;
            }
            self.text.push_str(chunk.get(..room).unwrap_or_default());
            if !self.text.is_empty() && !self.text.ends_with('\n') {
                self.text.push('\n');
            }
            self.text.push_str(TRUNCATION_MARKER);
            self.text.push('\n');
            return;
        }
        self.text.push_str(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_truncates_once() {
        let mut buffer = OutputBuffer::new(10);
        buffer.push("12345\n");
        buffer.push("67890\n");
        buffer.push("more\n");
        assert_eq!(buffer.text, format!("12345\n6789\n{TRUNCATION_MARKER}\n"));
        assert!(buffer.truncated);
    }

    #[test]
    fn buffer_cuts_on_char_boundary() {
        let mut buffer = OutputBuffer::new(4);
        buffer.push("ab\u{e9}\u{e9}");
        assert_eq!(buffer.text, format!("ab\u{e9}\n{TRUNCATION_MARKER}\n"));
    }

    #[test]
    fn split_utf8_sequence_is_held_back() {
        let bytes = "a\u{20ac}".as_bytes();
        assert_eq!(incomplete_utf8_tail(bytes), 0);
        assert_eq!(incomplete_utf8_tail(&bytes[..2]), 1);
        assert_eq!(incomplete_utf8_tail(&bytes[..3]), 2);
        assert_eq!(incomplete_utf8_tail(b"plain"), 0);
    }

    #[tokio::test]
    async fn reader_publishes_partial_lines_and_stays_capped() {
        let output = Arc::new(Mutex::new(OutputBuffer::new(16)));
        let (mut writer, reader) = tokio::io::duplex(64);
        let handle = spawn_reader(reader, Arc::clone(&output));

        tokio::io::AsyncWriteExt::write_all(&mut writer, b"working...").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(output.lock().await.text, "working...");

        let flood = vec![b'x'; 4096];
        for _ in 0..16 {
            tokio::io::AsyncWriteExt::write_all(&mut writer, &flood).await.unwrap();
        }
        drop(writer);
        handle.await.unwrap();

        let buffer = output.lock().await;
        assert!(buffer.truncated);
        assert_eq!(buffer.text, format!("working...xxxxxx\n{TRUNCATION_MARKER}\n"));
    }

    #[test]
    fn buffer_keeps_output_under_limit() {
        let mut buffer = OutputBuffer::new(64);
        buffer.push("a\n");
        buffer.push("b\n");
        assert_eq!(buffer.text, "a\nb\n");
        assert!(!buffer.truncated);
    }

    #[cfg(unix)]
    #[test]
    fn script_file_has_prelude_and_is_executable() {
        use std::os::unix::fs::PermissionsExt;
        let path = write_script("echo hi").unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("set -euo pipefail\n"));
        assert!(body.contains("echo hi"));
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("task_") && name.ends_with(".sh"));

        let kept = path.to_path_buf();
        drop(path);
        assert!(!kept.exists());
    }

    #[test]
    fn outcome_output_accessor() {
        let outcome = ProcessOutcome::TimedOut {
            output: "partial".into(),
        };
        assert_eq!(outcome.output(), "partial");
    }
}
