//! Keeps the live schedulers in line with the plugin roster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{plugin_key, AgentConfig, ConfigError, Registry};
use crate::lifecycle::{Component, Lifecycle, TaskError};
use crate::mailbox::Mailbox;
use crate::plugin::PluginSpec;
use crate::scheduler::Scheduler;

/// Plugin names acted on by one reconcile pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: Vec<String>,
    pub started: Vec<String>,
    pub stopped: Vec<String>,
}

impl ReconcileReport {
    /// True if the pass changed nothing
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.started.is_empty() && self.stopped.is_empty()
    }
}

struct Inner {
    config: Arc<AgentConfig>,
    registry: Arc<Registry>,
    mailbox: Mailbox,
    schedulers: Mutex<HashMap<String, Arc<Scheduler>>>,
    // serializes passes so the periodic loop and manual calls never interleave
    pass: tokio::sync::Mutex<()>,
}

impl Inner {
    async fn reconcile(&self) -> ReconcileReport {
        let _pass = self.pass.lock().await;
        let cluster = &self.config.cluster.name;
        let mut report = ReconcileReport::default();

        for name in self.registry.plugin_names(cluster) {
            let scheduler = match self.scheduler_for(&name) {
                Ok((scheduler, created)) => {
                    if created {
                        report.created.push(name.clone());
                    }
                    scheduler
                }
                Err(e) => {
                    warn!(plugin = %name, error = %e, "skipping plugin with incomplete definition");
                    continue;
                }
            };

            let enabled = match self.registry.get_bool(&plugin_key(cluster, "running", &name)) {
                Ok(enabled) => enabled,
                Err(e) => {
                    warn!(plugin = %name, error = %e, "cannot read running flag");
                    continue;
                }
            };

            if enabled {
                if !scheduler.is_started() && scheduler.launch() {
                    report.started.push(name);
                }
            } else if scheduler.is_started() {
                if let Err(e) = scheduler.halt().await {
                    warn!(plugin = %name, error = %e, "scheduler stopped with error");
                }
                report.stopped.push(name);
            }
        }

        if !report.is_noop() {
            info!(
                created = report.created.len(),
                started = report.started.len(),
                stopped = report.stopped.len(),
                "reconciled plugins"
            );
        }
        report
    }

    /// Existing scheduler for `name`, or a new one built from the stored spec
    fn scheduler_for(&self, name: &str) -> Result<(Arc<Scheduler>, bool), ConfigError> {
        let mut schedulers = self.schedulers.lock().unwrap();
        if let Some(existing) = schedulers.get(name) {
            return Ok((Arc::clone(existing), false));
        }

        let spec = PluginSpec::load(&self.registry, &self.config.cluster.name, name)?;
        let exe = self.config.dir.command_path(&spec.command);
        debug!(plugin = %name, exe = %exe.display(), "creating scheduler");
        let scheduler = Arc::new(Scheduler::new(
            spec,
            exe,
            self.mailbox.clone(),
            Arc::clone(&self.registry),
        ));
        schedulers.insert(name.to_string(), Arc::clone(&scheduler));
        Ok((scheduler, true))
    }

    fn all(&self) -> Vec<Arc<Scheduler>> {
        self.schedulers.lock().unwrap().values().cloned().collect()
    }
}

async fn reconcile_loop(inner: Arc<Inner>, period: Duration, token: CancellationToken) -> Result<(), TaskError> {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = inner.reconcile() => {}
        }
    }
}

/// Registry of per-plugin schedulers plus the periodic reconcile loop
pub struct SchedulerRegistry {
    inner: Arc<Inner>,
    lifecycle: Lifecycle,
    started: AtomicBool,
}

impl SchedulerRegistry {
    pub fn new(config: Arc<AgentConfig>, registry: Arc<Registry>, mailbox: Mailbox) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                mailbox,
                schedulers: Mutex::new(HashMap::new()),
                pass: tokio::sync::Mutex::new(()),
            }),
            lifecycle: Lifecycle::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Run one reconcile pass now
    pub async fn reconcile(&self) -> ReconcileReport {
        self.inner.reconcile().await
    }

    pub fn get(&self, name: &str) -> Option<Arc<Scheduler>> {
        self.inner.schedulers.lock().unwrap().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.schedulers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the reconcile loop, then stop every scheduler and wait for all of them
    pub async fn shutdown(&self) -> Result<(), TaskError> {
        let result = Component::stop(self).await;
        let schedulers = self.inner.all();
        for outcome in join_all(schedulers.iter().map(|s| s.halt())).await {
            if let Err(e) = outcome {
                warn!(error = %e, "scheduler stopped with error");
            }
        }
        info!(count = schedulers.len(), "all schedulers stopped");
        result
    }
}

#[async_trait]
impl Component for SchedulerRegistry {
    fn name(&self) -> &str {
        "scheduler-registry"
    }

    /// Start the loop that reconciles every `time.check` seconds
    async fn start(&self) -> Result<(), TaskError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let period = self.inner.config.time.check_interval();
        self.lifecycle.spawn(
            "reconcile",
            reconcile_loop(Arc::clone(&self.inner), period, self.lifecycle.token()),
        );
        info!(period = ?period, "reconcile loop started");
        Ok(())
    }

    /// Stop the reconcile loop. Started schedulers are told to stop without
    /// waiting for them; use [`SchedulerRegistry::shutdown`] to wait.
    async fn stop(&self) -> Result<(), TaskError> {
        let result = self.lifecycle.stop().await;
        for scheduler in self.inner.all() {
            if scheduler.is_started() {
                tokio::spawn(async move {
                    if let Err(e) = scheduler.halt().await {
                        warn!(error = %e, "scheduler stopped with error");
                    }
                });
            }
        }
        result
    }
}
