//! Supervision of external processes
//!
//! A [`ProcessSupervisor`] owns one [`ProcessTemplate`] (the descriptor the
//! command line is built from) and keeps a process running from it:
//!
//! - [`run`](ProcessSupervisor::run) launches the process and relaunches it
//!   with the *current* descriptor whenever it dies unexpectedly
//! - [`stop`](ProcessSupervisor::stop) sends SIGTERM, escalating to SIGKILL
//!   after the grace period
//! - [`restart`](ProcessSupervisor::restart) stops and relaunches in the
//!   background
//! - [`reconfigure`](ProcessSupervisor::reconfigure) changes the descriptor
//!   and restarts, but only if the change is real
//!
//! Every control operation holds one async mutex, so restarts never race.
//! Each launch loop is tagged with a generation; stopping bumps it, which
//! keeps a superseded loop from relaunching.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use crate::config::SupervisorConfig;

/// Builds the command line of a supervised process
pub trait ProcessTemplate: Send + 'static {
    /// Configuration change this template understands
    type Change: Copy + PartialEq + std::fmt::Debug + Send + 'static;

    /// Name used in logs and errors
    fn name(&self) -> &str;

    fn program(&self) -> PathBuf;

    fn args(&self) -> Vec<OsString>;

    /// Apply `change`, returning `true` if the descriptor changed
    fn apply(&mut self, change: Self::Change) -> bool;
}

/// Supervision tuning
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Exit codes that end supervision instead of relaunching
    pub clean_exit_codes: Vec<i32>,

    /// Pause before relaunching after an unexpected exit
    pub relaunch_delay: Duration,

    /// Time allowed between SIGTERM and SIGKILL
    pub stop_grace: Duration,
}

impl From<&SupervisorConfig> for SupervisorSettings {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            clean_exit_codes: config.clean_exit_codes.clone(),
            relaunch_delay: Duration::from_millis(config.relaunch_delay_ms),
            stop_grace: Duration::from_millis(config.stop_grace_ms),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Exit code listed as clean
    Normal(i32),
    /// Terminated by SIGINT, SIGTERM or SIGKILL
    Interrupted(i32),
    /// Any other exit code
    Error(i32),
    /// Killed by any other signal
    Crashed(i32),
}

impl ExitReason {
    fn classify(status: std::process::ExitStatus, clean_codes: &[i32]) -> Self {
        use std::os::unix::process::ExitStatusExt;

        if let Some(code) = status.code() {
            if clean_codes.contains(&code) {
                ExitReason::Normal(code)
            } else {
                ExitReason::Error(code)
            }
        } else {
            let signal = status.signal().unwrap_or_default();
            if [libc::SIGINT, libc::SIGTERM, libc::SIGKILL].contains(&signal) {
                ExitReason::Interrupted(signal)
            } else {
                ExitReason::Crashed(signal)
            }
        }
    }

    /// Whether supervision should end rather than relaunch
    pub fn is_clean(&self) -> bool {
        matches!(self, ExitReason::Normal(_) | ExitReason::Interrupted(_))
    }
}

/// Outcome of one supervision loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisionEnd {
    /// The process exited cleanly
    Exited(ExitReason),
    /// A stop or restart took over
    Superseded,
}

/// Error type for process supervision
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("{name} not found ({program})")]
    NotFound { name: String, program: String },

    #[error("{name} failed to start: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for {name}: {source}")]
    Wait {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal {name}: {errno}")]
    Signal { name: String, errno: nix::Error },

    /// The supervisor was shut down; no more launches
    #[error("{0} supervisor is shut down")]
    ShutDown(String),
}

#[derive(Debug)]
struct Running {
    pid: u32,
    exited: watch::Receiver<bool>,
}

#[derive(Debug, Default)]
struct RunState {
    generation: u64,
    running: Option<Running>,
    closed: bool,
}

struct Inner<T: ProcessTemplate> {
    template: parking_lot::Mutex<T>,
    state: parking_lot::Mutex<RunState>,
    control: tokio::sync::Mutex<()>,
    settings: SupervisorSettings,
    launches: AtomicU64,
    restarts: AtomicU64,
    failures: Option<mpsc::UnboundedSender<ProcessError>>,
}

/// Keeps one external process running from a mutable descriptor
pub struct ProcessSupervisor<T: ProcessTemplate> {
    inner: Arc<Inner<T>>,
}

impl<T: ProcessTemplate> Clone for ProcessSupervisor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ProcessTemplate> ProcessSupervisor<T> {
    pub fn new(template: T, settings: SupervisorSettings) -> Self {
        Self::build(template, settings, None)
    }

    /// Like [`new`](Self::new), but launch failures of background loops are
    /// sent to `failures` instead of only being logged
    pub fn with_failure_channel(
        template: T,
        settings: SupervisorSettings,
        failures: mpsc::UnboundedSender<ProcessError>,
    ) -> Self {
        Self::build(template, settings, Some(failures))
    }

    fn build(
        template: T,
        settings: SupervisorSettings,
        failures: Option<mpsc::UnboundedSender<ProcessError>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                template: parking_lot::Mutex::new(template),
                state: parking_lot::Mutex::new(RunState::default()),
                control: tokio::sync::Mutex::new(()),
                settings,
                launches: AtomicU64::new(0),
                restarts: AtomicU64::new(0),
                failures,
            }),
        }
    }

    pub fn name(&self) -> String {
        self.inner.template.lock().name().to_string()
    }

    /// Current command line arguments
    pub fn args(&self) -> Vec<OsString> {
        self.inner.template.lock().args()
    }

    /// Read the descriptor
    pub fn inspect<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.template.lock())
    }

    /// Number of processes launched so far
    pub fn launch_count(&self) -> u64 {
        self.inner.launches.load(Ordering::Relaxed)
    }

    /// Number of restarts issued so far
    pub fn restart_count(&self) -> u64 {
        self.inner.restarts.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running.is_some()
    }

    /// Launch and supervise until a clean exit or until superseded
    ///
    /// Blocks the calling task for the lifetime of the process.
    pub async fn run(&self) -> Result<SupervisionEnd, ProcessError> {
        let generation = self.inner.state.lock().generation;
        self.supervise(generation).await
    }

    /// [`run`](Self::run) on a background task
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let generation = self.inner.state.lock().generation;
        self.spawn_generation(generation)
    }

    fn spawn_generation(&self, generation: u64) -> tokio::task::JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            if let Err(e) = supervisor.supervise(generation).await {
                tracing::error!("{}", e);
                if let Some(failures) = &supervisor.inner.failures {
                    let _ = failures.send(e);
                }
            }
        })
    }

    async fn supervise(&self, generation: u64) -> Result<SupervisionEnd, ProcessError> {
        loop {
            let Some((mut child, pid, exited_tx)) = self.launch(generation)? else {
                return Ok(SupervisionEnd::Superseded);
            };

            let status = child.wait().await;

            {
                let mut state = self.inner.state.lock();
                if state.running.as_ref().is_some_and(|r| r.pid == pid) {
                    state.running = None;
                }
            }
            let _ = exited_tx.send(true);

            let name = self.name();
            let status = status.map_err(|source| ProcessError::Wait {
                name: name.clone(),
                source,
            })?;
            let reason = ExitReason::classify(status, &self.inner.settings.clean_exit_codes);

            if self.inner.state.lock().generation != generation {
                tracing::debug!("{} (pid {}) exited after stop: {:?}", name, pid, reason);
                return Ok(SupervisionEnd::Superseded);
            }

            if reason.is_clean() {
                tracing::info!("{} exited: {:?}", name, reason);
                return Ok(SupervisionEnd::Exited(reason));
            }

            let delay = self.inner.settings.relaunch_delay;
            tracing::warn!(
                "{} exited unexpectedly ({:?}), relaunching in {:?}",
                name,
                reason,
                delay
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Spawn a process for `generation`, unless it has been superseded
    #[allow(clippy::type_complexity)]
    fn launch(
        &self,
        generation: u64,
    ) -> Result<Option<(tokio::process::Child, u32, watch::Sender<bool>)>, ProcessError> {
        let mut state = self.inner.state.lock();
        if state.closed || state.generation != generation {
            return Ok(None);
        }

        let (name, program, args) = {
            let template = self.inner.template.lock();
            (template.name().to_string(), template.program(), template.args())
        };

        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::NotFound {
                    ProcessError::NotFound {
                        name: name.clone(),
                        program: program.display().to_string(),
                    }
                } else {
                    ProcessError::Spawn {
                        name: name.clone(),
                        source,
                    }
                }
            })?;

        let pid = child.id().unwrap_or_default();
        let (exited_tx, exited_rx) = watch::channel(false);
        state.running = Some(Running {
            pid,
            exited: exited_rx,
        });
        self.inner.launches.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Started {} (pid {})", name, pid);

        Ok(Some((child, pid, exited_tx)))
    }

    /// Terminate the running process, if any
    pub async fn stop(&self) -> Result<(), ProcessError> {
        let _guard = self.inner.control.lock().await;
        self.stop_locked().await
    }

    /// Stop and refuse any further launch
    pub async fn shutdown(&self) -> Result<(), ProcessError> {
        let _guard = self.inner.control.lock().await;
        self.inner.state.lock().closed = true;
        self.stop_locked().await
    }

    async fn stop_locked(&self) -> Result<(), ProcessError> {
        let running = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.running.take()
        };
        let Some(mut running) = running else {
            return Ok(());
        };

        let name = self.name();
        let pid = Pid::from_raw(running.pid as i32);
        tracing::info!("Stopping {} (pid {})", name, running.pid);
        self.signal(&name, pid, Signal::SIGTERM)?;

        let grace = self.inner.settings.stop_grace;
        if tokio::time::timeout(grace, wait_exited(&mut running.exited))
            .await
            .is_err()
        {
            tracing::warn!("{} did not terminate gracefully, forcing kill", name);
            self.signal(&name, pid, Signal::SIGKILL)?;
            let _ = tokio::time::timeout(grace, wait_exited(&mut running.exited)).await;
        }

        Ok(())
    }

    fn signal(&self, name: &str, pid: Pid, signal: Signal) -> Result<(), ProcessError> {
        match kill(pid, signal) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(errno) => Err(ProcessError::Signal {
                name: name.to_string(),
                errno,
            }),
        }
    }

    /// Stop the current process and relaunch in the background
    pub async fn restart(&self) -> Result<(), ProcessError> {
        let _guard = self.inner.control.lock().await;
        self.restart_locked().await
    }

    async fn restart_locked(&self) -> Result<(), ProcessError> {
        let name = self.name();
        if self.inner.state.lock().closed {
            return Err(ProcessError::ShutDown(name));
        }

        tracing::info!("Restarting {}...", name);
        self.stop_locked().await?;
        self.inner.restarts.fetch_add(1, Ordering::Relaxed);

        let generation = self.inner.state.lock().generation;
        self.spawn_generation(generation);
        Ok(())
    }

    /// Apply `change` and restart if the descriptor actually changed
    ///
    /// Returns whether a restart was issued.
    pub async fn reconfigure(&self, change: T::Change) -> Result<bool, ProcessError> {
        let _guard = self.inner.control.lock().await;

        let changed = self.inner.template.lock().apply(change);
        if !changed {
            tracing::debug!("{} already configured for {:?}", self.name(), change);
            return Ok(false);
        }

        self.restart_locked().await?;
        Ok(true)
    }
}

/// Resolves once the launch loop has reaped the process
async fn wait_exited(exited: &mut watch::Receiver<bool>) {
    let _ = exited.wait_for(|done| *done).await;
}
