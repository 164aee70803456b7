//! Per-plugin run cadence.
//!
//! A [`Scheduler`] owns one [`Process`] and fires it every `interval`. A tick
//! that finds the previous child still alive is skipped, so a plugin never
//! has two runs in flight.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{plugin_key, Registry};
use crate::lifecycle::{Component, Lifecycle, TaskError};
use crate::mailbox::Mailbox;
use crate::metric::Metric;
use crate::plugin::PluginSpec;
use crate::process::{Process, RunTimes};

/// Group tagged on the synthetic cost metrics
pub const SYSTEM_GROUP: &str = "_system";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerState {
    Stopped = 0,
    Idle = 1,
    Running = 2,
    Stopping = 3,
}

impl SchedulerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Idle,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

struct Shared {
    spec: PluginSpec,
    exe: PathBuf,
    mailbox: Mailbox,
    registry: Arc<Registry>,
    state: AtomicU8,
}

impl Shared {
    fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: SchedulerState, to: SchedulerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn stats_enabled(&self) -> bool {
        self.registry
            .get_bool(&plugin_key(&self.spec.cluster, "stats", &self.spec.name))
            .unwrap_or(false)
    }
}

/// Runs one plugin on its interval until stopped
pub struct Scheduler {
    shared: Arc<Shared>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

impl Scheduler {
    /// `exe` is the resolved command path; `spec` is normalized here
    pub fn new(spec: PluginSpec, exe: impl Into<PathBuf>, mailbox: Mailbox, registry: Arc<Registry>) -> Self {
        Self {
            shared: Arc::new(Shared {
                spec: spec.normalized(),
                exe: exe.into(),
                mailbox,
                registry,
                state: AtomicU8::new(SchedulerState::Stopped as u8),
            }),
            lifecycle: Mutex::new(None),
        }
    }

    pub fn spec(&self) -> &PluginSpec {
        &self.shared.spec
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.state()
    }

    /// True from `launch` until `stop` begins
    pub fn is_started(&self) -> bool {
        matches!(self.state(), SchedulerState::Idle | SchedulerState::Running)
    }

    /// Begin ticking. Returns false if already started or still stopping.
    pub fn launch(&self) -> bool {
        if !self
            .shared
            .transition(SchedulerState::Stopped, SchedulerState::Idle)
        {
            return false;
        }

        let lifecycle = Lifecycle::new();
        let shared = Arc::clone(&self.shared);
        let token = lifecycle.token();
        lifecycle.spawn(format!("plugin {}", shared.spec.name), run_loop(shared, token));
        *self.lifecycle.lock().unwrap() = Some(lifecycle);

        info!(
            plugin = %self.shared.spec.name,
            interval = self.shared.spec.interval,
            max_duration = self.shared.spec.max_duration,
            "scheduler started"
        );
        true
    }

    /// Cancel the loop, kill any live child and wait for the task to exit
    pub async fn halt(&self) -> Result<(), TaskError> {
        let lifecycle = self.lifecycle.lock().unwrap().clone();
        let Some(lifecycle) = lifecycle else {
            return Ok(());
        };

        let previous = self
            .shared
            .state
            .swap(SchedulerState::Stopping as u8, Ordering::AcqRel);
        let result = lifecycle.stop().await;
        self.shared
            .state
            .store(SchedulerState::Stopped as u8, Ordering::Release);

        if SchedulerState::from_u8(previous) != SchedulerState::Stopped {
            info!(plugin = %self.shared.spec.name, "scheduler stopped");
        }
        result
    }
}

#[async_trait]
impl Component for Scheduler {
    fn name(&self) -> &str {
        &self.shared.spec.name
    }

    async fn start(&self) -> Result<(), TaskError> {
        self.launch();
        Ok(())
    }

    async fn stop(&self) -> Result<(), TaskError> {
        self.halt().await
    }
}

/// What one tick of the loop did
enum Fired {
    /// The previous child is still alive
    Skipped,
    Batch(Vec<Metric>),
    Cancelled,
}

async fn run_loop(shared: Arc<Shared>, token: CancellationToken) -> Result<(), TaskError> {
    let spec = &shared.spec;
    let mut process = Process::new(&shared.exe, spec.max_duration(), spec.env_pairs());
    let period = spec.interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match fire(&shared, &mut process, &token).await {
            Fired::Skipped => continue,
            Fired::Cancelled => break,
            Fired::Batch(batch) => {
                if !publish(&shared.mailbox, batch, &token).await {
                    break;
                }
                shared.transition(SchedulerState::Running, SchedulerState::Idle);
            }
        }
    }

    if process.is_alive() {
        process.kill();
    }
    debug!(plugin = %spec.name, "scheduler loop exited");
    Ok(())
}

/// Run the plugin once unless its previous child is still around
async fn fire(shared: &Shared, process: &mut Process, token: &CancellationToken) -> Fired {
    let spec = &shared.spec;
    if process.is_alive() {
        info!(plugin = %spec.name, "still running, skipping tick");
        return Fired::Skipped;
    }
    if !shared.transition(SchedulerState::Idle, SchedulerState::Running) {
        return Fired::Cancelled;
    }

    let outcome = tokio::select! {
        _ = token.cancelled() => None,
        result = process.run() => Some(result),
    };
    let Some(result) = outcome else {
        process.kill();
        return Fired::Cancelled;
    };

    let mut batch = match result {
        Ok(metrics) => {
            debug!(plugin = %spec.name, count = metrics.len(), "plugin run finished");
            metrics
        }
        Err(e) => {
            warn!(plugin = %spec.name, error = %e, "plugin run failed");
            Vec::new()
        }
    };
    if shared.stats_enabled() {
        batch.extend(cost_metrics(spec, process.times()));
    }
    Fired::Batch(batch)
}

/// Push the batch, giving up if cancelled while the mailbox is full
async fn publish(mailbox: &Mailbox, batch: Vec<Metric>, token: &CancellationToken) -> bool {
    for metric in batch {
        tokio::select! {
            _ = token.cancelled() => return false,
            pushed = mailbox.push(metric) => {
                if pushed.is_err() {
                    return false;
                }
            }
        }
    }
    true
}

/// `<group>.<name>._sys|._user|._total` in nanoseconds
fn cost_metrics(spec: &PluginSpec, times: RunTimes) -> Vec<Metric> {
    let name = |suffix: &str| format!("{}.{}.{}", spec.group, spec.name, suffix);
    vec![
        Metric::new(name("_sys"), SYSTEM_GROUP, "", None, times.system.as_nanos() as f64),
        Metric::new(name("_user"), SYSTEM_GROUP, "", None, times.user.as_nanos() as f64),
        Metric::new(name("_total"), SYSTEM_GROUP, "", None, times.wall.as_nanos() as f64),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;

    fn script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn plugin(name: &str, interval: i64, max_duration: i64) -> PluginSpec {
        PluginSpec {
            group: "sys".into(),
            interval,
            max_duration,
            enabled: true,
            ..PluginSpec::new("prod", name, format!("{}.sh", name))
        }
    }

    #[test]
    fn test_cost_metric_names() {
        let times = RunTimes {
            user: Duration::from_millis(3),
            system: Duration::from_millis(2),
            wall: Duration::from_millis(10),
        };
        let metrics = cost_metrics(&plugin("cpu", 1, 1), times);
        let names: Vec<_> = metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["sys.cpu._sys", "sys.cpu._user", "sys.cpu._total"]);
        assert!(metrics.iter().all(|m| m.group == SYSTEM_GROUP));
        assert_eq!(metrics[0].value, 2_000_000.0);
        assert_eq!(metrics[2].value, 10_000_000.0);
    }

    #[tokio::test]
    async fn test_launch_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let exe = script(&dir, "cpu.sh", "echo 'cpu;sys;1;1'");
        let scheduler = Scheduler::new(plugin("cpu", 60, 5), exe, Mailbox::new(8), Arc::new(Registry::new()));

        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(scheduler.launch());
        assert!(!scheduler.launch());
        assert!(scheduler.is_started());

        scheduler.halt().await.unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(!scheduler.is_started());
        // stopping twice is harmless
        scheduler.halt().await.unwrap();
    }

    #[tokio::test]
    async fn test_publishes_metrics_each_tick() {
        let dir = TempDir::new().unwrap();
        let exe = script(&dir, "cpu.sh", "echo 'cpu.load;sys;1;0.5'");
        let mailbox = Mailbox::new(16);
        let scheduler = Scheduler::new(plugin("cpu", 1, 1), exe, mailbox.clone(), Arc::new(Registry::new()));
        scheduler.launch();

        let first = tokio::time::timeout(Duration::from_secs(3), mailbox.pop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.name, "cpu.load");
        assert_eq!(first.value, 0.5);

        let second = tokio::time::timeout(Duration::from_secs(3), mailbox.pop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.name, "cpu.load");

        scheduler.halt().await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_metrics_when_enabled() {
        let dir = TempDir::new().unwrap();
        let exe = script(&dir, "disk.sh", "echo 'disk.free;sys;1;10'");
        let registry = Arc::new(Registry::new());
        let mut spec = plugin("disk", 1, 1);
        spec.stats = true;
        spec.store(&registry);

        let mailbox = Mailbox::new(16);
        let scheduler = Scheduler::new(spec, exe, mailbox.clone(), Arc::clone(&registry));
        scheduler.launch();

        let mut names = Vec::new();
        for _ in 0..4 {
            let m = tokio::time::timeout(Duration::from_secs(3), mailbox.pop())
                .await
                .unwrap()
                .unwrap();
            names.push(m.name);
        }
        scheduler.halt().await.unwrap();

        assert_eq!(
            names,
            ["disk.free", "sys.disk._sys", "sys.disk._user", "sys.disk._total"]
        );
    }

    #[tokio::test]
    async fn test_stop_kills_running_child() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("pid");
        let exe = script(
            &dir,
            "hang.sh",
            &format!("echo $$ > {}\nexec sleep 30", marker.display()),
        );
        let scheduler = Scheduler::new(plugin("hang", 1, 1), exe, Mailbox::new(4), Arc::new(Registry::new()));
        scheduler.launch();

        for _ in 0..100 {
            if marker.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(marker.exists());

        let started = std::time::Instant::now();
        scheduler.halt().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        let pid: i32 = std::fs::read_to_string(&marker).unwrap().trim().parse().unwrap();
        let mut gone = false;
        for _ in 0..50 {
            // SAFETY: signal 0 only probes for existence
            if unsafe { libc::kill(pid, 0) } != 0 {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "plugin child {} survived stop", pid);
    }

    #[tokio::test]
    async fn test_tick_skipped_while_child_alive() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("runs");
        let exe = script(
            &dir,
            "slow.sh",
            &format!("echo run >> {}\nexec sleep 30", marker.display()),
        );
        let scheduler = Scheduler::new(plugin("slow", 1, 1), &exe, Mailbox::new(4), Arc::new(Registry::new()));
        let shared = &scheduler.shared;
        shared.state.store(SchedulerState::Idle as u8, Ordering::Release);

        // leave the first child running past its tick
        let mut process = Process::new(&exe, Duration::from_secs(30), vec![]);
        let abandoned = tokio::time::timeout(Duration::from_millis(300), process.run()).await;
        assert!(abandoned.is_err());
        assert!(process.is_alive());

        let token = CancellationToken::new();
        for _ in 0..3 {
            assert!(matches!(
                fire(shared, &mut process, &token).await,
                Fired::Skipped
            ));
        }
        assert_eq!(shared.state(), SchedulerState::Idle);
        let runs = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(runs.lines().count(), 1);

        process.kill();
    }

    #[tokio::test]
    async fn test_stop_while_mailbox_full() {
        let dir = TempDir::new().unwrap();
        let exe = script(&dir, "many.sh", "for i in 1 2 3 4 5; do echo \"m$i;g;1;$i\"; done");
        let mailbox = Mailbox::new(1);
        let scheduler = Scheduler::new(plugin("many", 1, 1), exe, mailbox.clone(), Arc::new(Registry::new()));
        scheduler.launch();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(mailbox.len(), 1);

        let stopped = tokio::time::timeout(Duration::from_secs(2), scheduler.halt()).await;
        assert!(stopped.is_ok());
    }
}
