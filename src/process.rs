//! Supervised, deadline-bound execution of a single plugin command.
//!
//! The child is spawned without arguments and with the plugin environment
//! layered over the agent's own. Its stdout is decoded line by line into
//! metrics while a blocking reaper thread waits for it with `wait4(2)`, which
//! also yields the child's exact CPU usage. The reaper first waits with
//! `WNOWAIT` and only reaps while holding the state lock, so `kill` can never
//! signal a pid that has already been recycled.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use crate::codec::{CodecError, TextCodec};
use crate::metric::Metric;

/// How long a killed child gets to be reaped before `run` gives up waiting
const REAP_GRACE: Duration = Duration::from_secs(1);
const SPAWN_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("{exe} is still running")]
    Busy { exe: String },
    #[error("spawn {exe} failed: {source}")]
    Spawn {
        exe: String,
        #[source]
        source: io::Error,
    },
    #[error("read output of {exe}: {source}")]
    Output {
        exe: String,
        #[source]
        source: CodecError,
    },
    #[error("wait for {exe}: {source}")]
    Wait {
        exe: String,
        #[source]
        source: io::Error,
    },
    #[error("{exe} exited with {status}")]
    Exit { exe: String, status: ExitStatus },
    #[error("execute {exe} timeout after {after:?}")]
    Timeout { exe: String, after: Duration },
}

impl ProcessError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Cost of the most recent run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTimes {
    pub user: Duration,
    pub system: Duration,
    pub wall: Duration,
}

#[derive(Debug, Default)]
struct ChildState {
    pid: Option<u32>,
    exited: bool,
    user: Duration,
    system: Duration,
}

/// One plugin command, run at most once at a time
pub struct Process {
    exe: PathBuf,
    env: Vec<(String, String)>,
    max_duration: Duration,
    state: Arc<Mutex<ChildState>>,
    reaper: Option<JoinHandle<io::Result<ExitStatus>>>,
    cost: Duration,
}

impl Process {
    pub fn new(exe: impl Into<PathBuf>, max_duration: Duration, env: Vec<(String, String)>) -> Self {
        Self {
            exe: exe.into(),
            env,
            max_duration,
            state: Arc::new(Mutex::new(ChildState::default())),
            reaper: None,
            cost: Duration::ZERO,
        }
    }

    fn display(&self) -> String {
        self.exe.display().to_string()
    }

    /// Run the command once and collect the metrics it printed.
    ///
    /// Exactly one outcome: the parsed metrics, the spawn/read/wait/exit error,
    /// or a timeout after which the child has been killed.
    pub async fn run(&mut self) -> Result<Vec<Metric>, ProcessError> {
        if self.is_alive() {
            return Err(ProcessError::Busy {
                exe: self.display(),
            });
        }

        let started = Instant::now();
        match tokio::time::timeout(self.max_duration, self.execute()).await {
            Ok(result) => {
                self.cost = started.elapsed();
                result
            }
            Err(_) => {
                self.cost = started.elapsed();
                self.kill();
                self.await_reaper().await;
                Err(ProcessError::Timeout {
                    exe: self.display(),
                    after: self.max_duration,
                })
            }
        }
    }

    async fn execute(&mut self) -> Result<Vec<Metric>, ProcessError> {
        let exe = self.display();
        let mut child = self.spawn().await?;

        let pid = child.id();
        *self.state.lock().unwrap() = ChildState {
            pid: Some(pid),
            ..ChildState::default()
        };
        let state = Arc::clone(&self.state);
        self.reaper = Some(tokio::task::spawn_blocking(move || reap(pid, &state)));
        debug!(exe = %exe, pid, "plugin process started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdout not captured"))
            .and_then(tokio::process::ChildStdout::from_std);
        let stdout = match stdout {
            Ok(stdout) => stdout,
            Err(e) => {
                self.kill();
                return Err(ProcessError::Output {
                    exe,
                    source: CodecError::Io(e),
                });
            }
        };

        let mut lines = FramedRead::new(stdout, TextCodec::new().skip_long_lines());
        let mut metrics = Vec::new();
        while let Some(line) = lines.next().await {
            match line {
                Ok(metric) => metrics.push(metric),
                Err(source) => {
                    self.kill();
                    return Err(ProcessError::Output { exe, source });
                }
            }
        }
        let rejected = lines.decoder().rejected();
        if rejected > 0 {
            warn!(exe = %exe, rejected, "plugin printed unusable lines");
        }

        let joined = match self.reaper.as_mut() {
            Some(handle) => handle.await,
            None => return Ok(metrics),
        };
        self.reaper = None;
        let status = joined
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            .and_then(|r| r)
            .map_err(|source| ProcessError::Wait {
                exe: exe.clone(),
                source,
            })?;

        if !status.success() {
            return Err(ProcessError::Exit { exe, status });
        }
        Ok(metrics)
    }

    async fn spawn(&self) -> Result<std::process::Child, ProcessError> {
        let mut attempt = 1;
        loop {
            let spawned = std::process::Command::new(&self.exe)
                .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn();
            match spawned {
                Ok(child) => return Ok(child),
                // The plugin file is still being written by someone else
                Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempt < SPAWN_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(source) => {
                    return Err(ProcessError::Spawn {
                        exe: self.display(),
                        source,
                    })
                }
            }
        }
    }

    async fn await_reaper(&mut self) {
        if let Some(handle) = self.reaper.take() {
            if tokio::time::timeout(REAP_GRACE, handle).await.is_err() {
                warn!(exe = %self.display(), "killed plugin process not reaped in time");
            }
        }
    }

    /// SIGKILL the child if it is still alive
    pub fn kill(&self) {
        let state = self.state.lock().unwrap();
        if let (Some(pid), false) = (state.pid, state.exited) {
            // SAFETY: plain syscall; the pid is still ours because it has not been reaped
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
            if rc != 0 {
                warn!(pid, error = %io::Error::last_os_error(), "failed to kill plugin process");
            }
        }
    }

    /// False if never started or already exited
    pub fn is_alive(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.pid.is_some() && !state.exited
    }

    /// CPU times are zero until the child has exited; wall time is the last run's cost
    pub fn times(&self) -> RunTimes {
        let state = self.state.lock().unwrap();
        let (user, system) = if state.exited {
            (state.user, state.system)
        } else {
            (Duration::ZERO, Duration::ZERO)
        };
        RunTimes {
            user,
            system,
            wall: self.cost,
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.kill();
    }
}

fn timeval(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// Wait for `pid` to exit, then reap it under the state lock and record its rusage.
fn reap(pid: u32, state: &Mutex<ChildState>) -> io::Result<ExitStatus> {
    loop {
        // SAFETY: siginfo_t is plain data; waitid only writes into it
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            state.lock().unwrap().exited = true;
            return Err(err);
        }
    }

    let mut guard = state.lock().unwrap();
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain data; wait4 only writes into it
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        let rc = unsafe { libc::wait4(pid as libc::pid_t, &mut status, 0, &mut usage) };
        if rc == pid as libc::pid_t {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            guard.exited = true;
            return Err(err);
        }
    }

    guard.exited = true;
    guard.user = timeval(usage.ru_utime);
    guard.system = timeval(usage.ru_stime);
    Ok(ExitStatus::from_raw(status))
}
