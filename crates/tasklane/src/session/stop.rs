//! Stop handles and the registry of runs that can be stopped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};

use crate::error::{EngineError, EngineResult};
use crate::model::RunId;

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Per-run capability to terminate the live process or request.
///
/// The handle exists from dispatch until the run is terminal. A process id is
/// attached once the script interpreter has been spawned; HTTP runs never get
/// one and only observe the stop notification.
#[derive(Clone, Debug)]
pub struct StopHandle {
    run_id: RunId,
    inner: Arc<StopState>,
}

#[derive(Debug, Default)]
struct StopState {
    requested: AtomicBool,
    notify: Notify,
    /// Process group leader; zero when no process is attached.
    pid: AtomicU32,
}

impl StopHandle {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            inner: Arc::new(StopState::default()),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Resolves once a stop has been requested.
    pub async fn requested(&self) {
        if self.is_requested() {
            return;
        }
        self.inner.notify.notified().await;
    }

    pub(crate) fn attach_pid(&self, pid: Option<u32>) {
        self.inner.pid.store(pid.unwrap_or(0), Ordering::SeqCst);
    }

    pub(crate) fn detach_pid(&self) {
        self.inner.pid.store(0, Ordering::SeqCst);
    }

    fn attached_pid(&self) -> Option<u32> {
        match self.inner.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Ask the run to stop.
    ///
    /// When a process is attached it receives a graceful termination signal
    /// first and a forceful kill if that cannot be delivered. The run loop
    /// then finishes termination after its grace period.
    ///
    /// # Errors
    /// - `E_SIGNAL_FAILED`: neither signal could be delivered
    pub fn request_stop(&self) -> EngineResult<()> {
        self.inner.requested.store(true, Ordering::SeqCst);
        let result = match self.attached_pid() {
            Some(pid) => self.signal_tree(pid),
            None => Ok(()),
        };
        self.inner.notify.notify_one();
        result
    }

    fn signal_tree(&self, pid: u32) -> EngineResult<()> {
        match terminate_tree(pid) {
            Ok(()) => Ok(()),
            Err(graceful) => {
                tracing::debug!(run_id = %self.run_id, pid, error = %graceful, "graceful stop failed, killing");
                kill_tree(pid).map_err(|err| EngineError::signal_failed(self.run_id, err))
            }
        }
    }
}

/// Graceful termination of a process tree: SIGTERM to the group, or
/// `taskkill /T` on Windows.
#[cfg(unix)]
pub(crate) fn terminate_tree(pid: u32) -> std::io::Result<()> {
    signal_process_group(pid, Signal::SIGTERM)
}

/// Forceful termination of a process tree.
#[cfg(unix)]
pub(crate) fn kill_tree(pid: u32) -> std::io::Result<()> {
    signal_process_group(pid, Signal::SIGKILL)
}

#[cfg(unix)]
fn signal_process_group(pid: u32, signal: Signal) -> std::io::Result<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    match killpg(Pid::from_raw(raw), signal) {
        // ESRCH means the group is already gone
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(err) => Err(std::io::Error::from(err)),
    }
}

#[cfg(windows)]
pub(crate) fn terminate_tree(pid: u32) -> std::io::Result<()> {
    taskkill(pid, false)
}

#[cfg(windows)]
pub(crate) fn kill_tree(pid: u32) -> std::io::Result<()> {
    taskkill(pid, true)
}

#[cfg(windows)]
fn taskkill(pid: u32, force: bool) -> std::io::Result<()> {
    let mut command = std::process::Command::new("taskkill");
    if force {
        command.arg("/F");
    }
    let status = command
        .args(["/T", "/PID", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("taskkill exited with {status}")))
    }
}

/// Registry of stop handles for runs that have not reached a terminal state.
#[derive(Clone, Debug, Default)]
pub struct ActiveRuns {
    handles: Arc<RwLock<HashMap<RunId, StopHandle>>>,
}

impl ActiveRuns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a handle for `run_id`.
    pub async fn register(&self, run_id: RunId) -> StopHandle {
        let handle = StopHandle::new(run_id);
        self.handles.write().await.insert(run_id, handle.clone());
        handle
    }

    pub async fn get(&self, run_id: RunId) -> Option<StopHandle> {
        self.handles.read().await.get(&run_id).cloned()
    }

    pub async fn remove(&self, run_id: RunId) -> Option<StopHandle> {
        self.handles.write().await.remove(&run_id)
    }

    pub async fn handles(&self) -> Vec<StopHandle> {
        self.handles.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.handles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handles.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn stop_without_process_notifies_waiter() {
        let handle = StopHandle::new(RunId::new());
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.requested().await });

        handle.request_stop().unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(handle.is_requested());
    }

    #[tokio::test]
    async fn stop_requested_before_waiting_is_not_lost() {
        let handle = StopHandle::new(RunId::new());
        handle.request_stop().unwrap();
        tokio::time::timeout(Duration::from_millis(100), handle.requested())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn registry_tracks_handles() {
        let active = ActiveRuns::new();
        let run_id = RunId::new();
        let handle = active.register(run_id).await;
        assert_eq!(handle.run_id(), run_id);
        assert_eq!(active.len().await, 1);
        assert!(active.get(run_id).await.is_some());
        assert!(active.remove(run_id).await.is_some());
        assert!(active.is_empty().await);
    }

    #[cfg(unix)]
    #[test]
    fn signalling_missing_group_is_ok() {
        // Above the kernel pid limit, so no such group exists.
        assert!(terminate_tree(999_999_999).is_ok());
    }
}
