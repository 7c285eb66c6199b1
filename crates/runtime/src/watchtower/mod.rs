//! Sandboxed process execution registry
//!
//! Two entry points: a blocking foreground runner and a background runner
//! backed by a bounded registry. Every command passes the deny-list, path,
//! and environment validation first; a rejected command is reported inside
//! the result (`[watchtower] blocked: …`), never raised. Background
//! processes follow a SIGTERM → grace → SIGKILL termination ladder on
//! timeout or stop request.

mod validate;

pub use validate::{validate_command, validate_env, DENY_PATTERNS, SAFE_PATH};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::config::WatchtowerConfig;
use crate::types::{RunId, WatchtowerError};

/// Options for one execution.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub timeout: Option<Duration>,
    pub max_output: Option<usize>,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
}

/// Foreground execution result. Validation failures land here as
/// `exit_code = 1` with a block reason in stderr.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

/// Background process lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcStatus {
    Running,
    Done,
    Failed,
    Killed,
}

/// Registry entry snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRecord {
    pub run_id: RunId,
    pub command: String,
    pub pid: Option<u32>,
    pub start_time: DateTime<Utc>,
    pub status: ProcStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

#[derive(Debug)]
struct EntryState {
    record: EntryRecord,
    finished_at: Option<DateTime<Utc>>,
    kill_requested: bool,
}

/// Background spawn confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnInfo {
    pub run_id: RunId,
    pub pid: Option<u32>,
}

/// The watchtower: foreground/background runner plus the bounded registry.
pub struct ExecWatchtower {
    registry: DashMap<String, Arc<Mutex<EntryState>>>,
    config: WatchtowerConfig,
}

impl ExecWatchtower {
    pub fn new(config: WatchtowerConfig) -> Self {
        if let Err(err) = std::fs::create_dir_all(&config.workspace_root) {
            tracing::warn!(error = %err, root = %config.workspace_root, "workspace root unavailable");
        }
        Self {
            registry: DashMap::new(),
            config,
        }
    }

    fn blocked(reason: &WatchtowerError) -> ExecResult {
        ExecResult {
            stdout: String::new(),
            stderr: format!("[watchtower] blocked: {reason}"),
            exit_code: 1,
            timed_out: false,
        }
    }

    fn validate(&self, command: &str, opts: &ExecOptions) -> Result<(), WatchtowerError> {
        validate_command(command, &self.config.workspace_root)?;
        validate_env(&opts.env)?;
        if let Some(cwd) = &opts.cwd {
            if !cwd.starts_with(&self.config.workspace_root) {
                return Err(WatchtowerError::PathEscape(cwd.clone()));
            }
        }
        Ok(())
    }

    fn build_command(&self, command: &str, opts: &ExecOptions) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(command);
        cmd.current_dir(opts.cwd.as_deref().unwrap_or(&self.config.workspace_root));
        cmd.env_clear();
        cmd.env("PATH", SAFE_PATH);
        cmd.env("HOME", &self.config.workspace_root);
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run a command to completion (or timeout) and return its output.
    pub async fn exec_foreground(&self, command: &str, opts: ExecOptions) -> ExecResult {
        if let Err(reason) = self.validate(command, &opts) {
            tracing::debug!(command, %reason, "foreground command blocked");
            return Self::blocked(&reason);
        }

        let timeout = opts.timeout.unwrap_or(self.config.foreground_timeout);
        let max_output = opts.max_output.unwrap_or(self.config.max_output_bytes);

        let mut child = match self.build_command(command, &opts).spawn() {
            Ok(child) => child,
            Err(err) => {
                return ExecResult {
                    stdout: String::new(),
                    stderr: format!("[watchtower] spawn failed: {err}"),
                    exit_code: 1,
                    timed_out: false,
                }
            }
        };
        let pid = child.id();

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let run = async {
            let stdout = async {
                match stdout_pipe.as_mut() {
                    Some(pipe) => read_capped(pipe, max_output).await,
                    None => String::new(),
                }
            };
            let stderr = async {
                match stderr_pipe.as_mut() {
                    Some(pipe) => read_capped(pipe, max_output).await,
                    None => String::new(),
                }
            };
            let (stdout, stderr) = tokio::join!(stdout, stderr);
            let status = child.wait().await;
            (stdout, stderr, status)
        };

        match tokio::time::timeout(timeout, run).await {
            Ok((stdout, stderr, Ok(status))) => ExecResult {
                stdout,
                stderr,
                exit_code: status.code().unwrap_or(-1),
                timed_out: false,
            },
            Ok((stdout, stderr, Err(err))) => ExecResult {
                stdout,
                stderr: format!("{stderr}\n[watchtower] wait failed: {err}"),
                exit_code: -1,
                timed_out: false,
            },
            Err(_) => {
                self.terminate(pid).await;
                ExecResult {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: -1,
                    timed_out: true,
                }
            }
        }
    }

    /// Launch a command in the background. Enforces the registry cap by
    /// evicting the least recently started non-running entry; rejects when
    /// everything is still running.
    pub async fn exec_background(
        &self,
        command: &str,
        opts: ExecOptions,
    ) -> Result<SpawnInfo, WatchtowerError> {
        self.validate(command, &opts)?;
        self.make_room()?;

        let timeout = opts.timeout.unwrap_or(self.config.background_timeout);
        let max_output = opts.max_output.unwrap_or(self.config.max_output_bytes);

        let mut child = self
            .build_command(command, &opts)
            .spawn()
            .map_err(|err| WatchtowerError::SpawnFailed(err.to_string()))?;
        let pid = child.id();
        let run_id = RunId::new();

        let state = Arc::new(Mutex::new(EntryState {
            record: EntryRecord {
                run_id: run_id.clone(),
                command: command.to_string(),
                pid,
                start_time: Utc::now(),
                status: ProcStatus::Running,
                stdout: String::new(),
                stderr: String::new(),
                exit_code: None,
                timed_out: false,
            },
            finished_at: None,
            kill_requested: false,
        }));
        self.registry.insert(run_id.0.clone(), Arc::clone(&state));

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let grace = self.config.kill_grace;
        let monitor_state = Arc::clone(&state);

        tokio::spawn(async move {
            monitor_background(
                child,
                pid,
                stdout_pipe,
                stderr_pipe,
                monitor_state,
                timeout,
                grace,
                max_output,
            )
            .await;
        });

        tracing::debug!(run_id = %run_id, ?pid, command, "background process started");
        Ok(SpawnInfo { run_id, pid })
    }

    fn make_room(&self) -> Result<(), WatchtowerError> {
        if self.registry.len() < self.config.max_background {
            return Ok(());
        }
        let evictable = self
            .registry
            .iter()
            .filter(|entry| entry.value().lock().record.status != ProcStatus::Running)
            .min_by_key(|entry| entry.value().lock().record.start_time)
            .map(|entry| entry.key().clone());
        match evictable {
            Some(key) => {
                tracing::debug!(run_id = key, "evicting completed background entry");
                self.registry.remove(&key);
                Ok(())
            }
            None => Err(WatchtowerError::CapacityFull {
                capacity: self.config.max_background,
            }),
        }
    }

    /// Snapshot one entry.
    pub fn poll_process(&self, run_id: &RunId) -> Option<EntryRecord> {
        self.registry
            .get(&run_id.0)
            .map(|entry| entry.lock().record.clone())
    }

    /// Request termination. Idempotent: stopping a finished process is a
    /// no-op; an unknown run id is an error.
    pub async fn stop_process(&self, run_id: &RunId) -> Result<(), WatchtowerError> {
        let entry = self
            .registry
            .get(&run_id.0)
            .ok_or_else(|| WatchtowerError::NotFound(run_id.clone()))?;
        let state = Arc::clone(entry.value());
        drop(entry);

        let pid = {
            let mut guard = state.lock();
            if guard.record.status != ProcStatus::Running {
                return Ok(());
            }
            guard.kill_requested = true;
            guard.record.pid
        };

        send_sigterm(pid);
        let grace = self.config.kill_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let still_running = state.lock().record.status == ProcStatus::Running;
            if still_running {
                send_sigkill(pid);
            }
        });
        Ok(())
    }

    /// Snapshot the whole registry.
    pub fn list_processes(&self) -> Vec<EntryRecord> {
        let mut entries: Vec<EntryRecord> = self
            .registry
            .iter()
            .map(|entry| entry.value().lock().record.clone())
            .collect();
        entries.sort_by_key(|record| record.start_time);
        entries
    }

    /// Force-kill everything and empty the registry.
    pub fn clear_registry(&self) {
        for entry in self.registry.iter() {
            let guard = entry.value().lock();
            if guard.record.status == ProcStatus::Running {
                send_sigkill(guard.record.pid);
            }
        }
        self.registry.clear();
    }

    pub fn registry_len(&self) -> usize {
        self.registry.len()
    }

    /// Drop completed entries past the retention TTL.
    pub fn sweep_completed(&self) -> usize {
        let ttl = chrono::Duration::from_std(self.config.completed_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let cutoff = Utc::now() - ttl;
        let expired: Vec<String> = self
            .registry
            .iter()
            .filter(|entry| {
                let guard = entry.value().lock();
                guard.record.status != ProcStatus::Running
                    && guard.finished_at.is_some_and(|at| at < cutoff)
            })
            .map(|entry| entry.key().clone())
            .collect();
        let count = expired.len();
        for key in expired {
            self.registry.remove(&key);
        }
        count
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let watchtower = Arc::clone(self);
        let interval = watchtower.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                watchtower.sweep_completed();
            }
        })
    }

    async fn terminate(&self, pid: Option<u32>) {
        send_sigterm(pid);
        tokio::time::sleep(self.config.kill_grace).await;
        send_sigkill(pid);
    }
}

#[allow(clippy::too_many_arguments)]
async fn monitor_background(
    mut child: Child,
    pid: Option<u32>,
    mut stdout_pipe: Option<tokio::process::ChildStdout>,
    mut stderr_pipe: Option<tokio::process::ChildStderr>,
    state: Arc<Mutex<EntryState>>,
    timeout: Duration,
    grace: Duration,
    max_output: usize,
) {
    let stdout_state = Arc::clone(&state);
    let stderr_state = Arc::clone(&state);

    let stdout_task = tokio::spawn(async move {
        if let Some(pipe) = stdout_pipe.as_mut() {
            stream_capped(pipe, max_output, |chunk| {
                push_capped(&mut stdout_state.lock().record.stdout, chunk, max_output);
            })
            .await;
        }
    });
    let stderr_task = tokio::spawn(async move {
        if let Some(pipe) = stderr_pipe.as_mut() {
            stream_capped(pipe, max_output, |chunk| {
                push_capped(&mut stderr_state.lock().record.stderr, chunk, max_output);
            })
            .await;
        }
    });

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(result) => result,
        Err(_) => {
            state.lock().record.timed_out = true;
            send_sigterm(pid);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    send_sigkill(pid);
                    child.wait().await
                }
            }
        }
    };

    let _ = stdout_task.await;
    let _ = stderr_task.await;

    let mut guard = state.lock();
    let exit_code = status.as_ref().ok().and_then(|s| s.code());
    guard.record.exit_code = exit_code;
    guard.record.status = if guard.kill_requested {
        ProcStatus::Killed
    } else if guard.record.timed_out || exit_code != Some(0) {
        ProcStatus::Failed
    } else {
        ProcStatus::Done
    };
    guard.finished_at = Some(Utc::now());
    tracing::debug!(
        run_id = %guard.record.run_id,
        status = ?guard.record.status,
        ?exit_code,
        "background process finished"
    );
}

/// Read a stream to EOF, handing chunks to `sink`. Reading continues past
/// the cap so the child never blocks on a full pipe; the sink enforces the
/// buffer bound.
async fn stream_capped<R, F>(reader: &mut R, _cap: usize, mut sink: F)
where
    R: AsyncReadExt + Unpin,
    F: FnMut(&[u8]),
{
    let mut buf = [0u8; 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink(&buf[..n]),
        }
    }
}

/// Append to the front-loaded buffer: bytes beyond the cap are dropped.
fn push_capped(buffer: &mut String, chunk: &[u8], cap: usize) {
    if buffer.len() >= cap {
        return;
    }
    let take = (cap - buffer.len()).min(chunk.len());
    buffer.push_str(&String::from_utf8_lossy(&chunk[..take]));
}

/// Read a whole stream, keeping only the first `cap` bytes.
async fn read_capped<R: AsyncReadExt + Unpin>(reader: &mut R, cap: usize) -> String {
    let mut collected = String::new();
    stream_capped(reader, cap, |chunk| push_capped(&mut collected, chunk, cap)).await;
    collected
}

fn send_sigterm(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

fn send_sigkill(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watchtower() -> ExecWatchtower {
        ExecWatchtower::new(WatchtowerConfig::default())
    }

    async fn wait_for_completion(tower: &ExecWatchtower, run_id: &RunId) -> EntryRecord {
        for _ in 0..200 {
            let record = tower.poll_process(run_id).expect("entry missing");
            if record.status != ProcStatus::Running {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("background process never completed");
    }

    #[tokio::test]
    async fn foreground_echo_succeeds() {
        let tower = watchtower();
        let result = tower
            .exec_foreground("echo watchtower-check", ExecOptions::default())
            .await;
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("watchtower-check"));
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn dangerous_command_is_blocked_without_touching_the_registry() {
        let tower = watchtower();
        let result = tower.exec_foreground("rm -rf /", ExecOptions::default()).await;
        assert_eq!(result.exit_code, 1);
        assert!(result.stdout.is_empty());
        assert!(result.stderr.starts_with("[watchtower] blocked:"));
        assert_eq!(tower.registry_len(), 0);
    }

    #[tokio::test]
    async fn blocked_env_override_is_rejected() {
        let tower = watchtower();
        let mut opts = ExecOptions::default();
        opts.env
            .insert("LD_PRELOAD".to_string(), "/evil.so".to_string());
        let result = tower.exec_foreground("echo hi", opts).await;
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("blocked"));
    }

    #[tokio::test]
    async fn foreground_timeout_sets_the_flag() {
        let tower = watchtower();
        let opts = ExecOptions {
            timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let result = tower.exec_foreground("sleep 5", opts).await;
        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
    }

    #[tokio::test]
    async fn plain_loop_output_is_capped() {
        let tower = watchtower();
        let opts = ExecOptions {
            max_output: Some(32),
            ..Default::default()
        };
        let result = tower
            .exec_foreground("yes line | head -n 100", opts)
            .await;
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.len() <= 32);
    }

    #[tokio::test]
    async fn background_lifecycle_completes() {
        let tower = watchtower();
        let info = tower
            .exec_background("echo background-output", ExecOptions::default())
            .await
            .unwrap();
        let record = wait_for_completion(&tower, &info.run_id).await;
        assert_eq!(record.status, ProcStatus::Done);
        assert_eq!(record.exit_code, Some(0));
        assert!(record.stdout.contains("background-output"));
    }

    #[tokio::test]
    async fn failing_command_is_marked_failed() {
        let tower = watchtower();
        let info = tower
            .exec_background("exit 3", ExecOptions::default())
            .await
            .unwrap();
        let record = wait_for_completion(&tower, &info.run_id).await;
        assert_eq!(record.status, ProcStatus::Failed);
        assert_eq!(record.exit_code, Some(3));
    }

    #[tokio::test]
    async fn stop_process_marks_killed() {
        let tower = watchtower();
        let info = tower
            .exec_background("sleep 30", ExecOptions::default())
            .await
            .unwrap();
        tower.stop_process(&info.run_id).await.unwrap();
        let record = wait_for_completion(&tower, &info.run_id).await;
        assert_eq!(record.status, ProcStatus::Killed);

        // idempotent on a finished process
        tower.stop_process(&info.run_id).await.unwrap();
        // unknown id errors
        assert!(tower.stop_process(&RunId::new()).await.is_err());
    }

    #[tokio::test]
    async fn capacity_evicts_completed_then_rejects_running() {
        let tower = ExecWatchtower::new(WatchtowerConfig {
            max_background: 2,
            ..Default::default()
        });

        let first = tower
            .exec_background("echo one", ExecOptions::default())
            .await
            .unwrap();
        wait_for_completion(&tower, &first.run_id).await;

        let second = tower
            .exec_background("sleep 30", ExecOptions::default())
            .await
            .unwrap();
        // third submission evicts the completed first entry
        let third = tower
            .exec_background("sleep 30", ExecOptions::default())
            .await
            .unwrap();
        assert!(tower.poll_process(&first.run_id).is_none());
        assert_eq!(tower.registry_len(), 2);

        // now everything is running: reject
        let err = tower
            .exec_background("echo overflow", ExecOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WatchtowerError::CapacityFull { capacity: 2 }));

        tower.stop_process(&second.run_id).await.unwrap();
        tower.stop_process(&third.run_id).await.unwrap();
    }

    #[tokio::test]
    async fn clear_registry_empties_everything() {
        let tower = watchtower();
        tower
            .exec_background("sleep 30", ExecOptions::default())
            .await
            .unwrap();
        tower.clear_registry();
        assert_eq!(tower.registry_len(), 0);
    }

    #[test]
    fn push_capped_keeps_the_front() {
        let mut buffer = String::new();
        push_capped(&mut buffer, b"hello ", 8);
        push_capped(&mut buffer, b"world and more", 8);
        assert_eq!(buffer, "hello wo");
        push_capped(&mut buffer, b"ignored", 8);
        assert_eq!(buffer.len(), 8);
    }
}
