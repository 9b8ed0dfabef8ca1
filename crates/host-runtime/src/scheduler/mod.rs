//! # Periodic Task Scheduler
//!
//! One scheduler per host. Every registered task gets its own tokio interval
//! loop; all loops stop when the scheduler shuts down.
//!
//! A task that panics is logged and counted as a failure. Its loop keeps
//! ticking.
//!
//! Modules register through a [`ModuleTasks`] handle while they load. The
//! handle remembers the task names so the host can withdraw them when the
//! module fails to load or ends up without a registered bit.

use bit_contracts::{SchedulerError, SchedulerHandle, TaskFn};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Default)]
struct TaskStats {
    runs: AtomicU64,
    failures: AtomicU64,
    last_run: Mutex<Option<DateTime<Utc>>>,
}

struct TaskEntry {
    interval: Duration,
    stats: Arc<TaskStats>,
    cancel: CancellationToken,
    /// Taken by `shutdown`.
    join: Option<JoinHandle<()>>,
}

impl TaskEntry {
    fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }
}

struct SchedulerInner {
    tasks: Mutex<BTreeMap<String, TaskEntry>>,
    shutdown: CancellationToken,
}

/// Diagnostics view of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub name: String,
    pub interval_ms: u64,
    pub runs: u64,
    pub failures: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub active: bool,
}

/// Shared periodic-task scheduler. Cloning yields another handle.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    /// Does not need a runtime; tasks do, at registration time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                tasks: Mutex::new(BTreeMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Start running `task` every `interval`. The first run happens
    /// immediately.
    pub fn register(&self, name: &str, interval: Duration, task: TaskFn) -> Result<(), SchedulerError> {
        if interval.is_zero() {
            return Err(SchedulerError::ZeroInterval(name.to_string()));
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(SchedulerError::ShutDown);
        }

        let mut tasks = self.inner.tasks.lock();
        if tasks.contains_key(name) {
            return Err(SchedulerError::Duplicate(name.to_string()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SchedulerError::NoRuntime(name.to_string()))?;

        let stats = Arc::new(TaskStats::default());
        let cancel = self.inner.shutdown.child_token();
        let join = runtime.spawn(run_loop(
            name.to_string(),
            interval,
            task,
            Arc::clone(&stats),
            cancel.clone(),
        ));

        info!(task = %name, interval_ms = interval.as_millis() as u64, "Periodic task registered");
        tasks.insert(
            name.to_string(),
            TaskEntry {
                interval,
                stats,
                cancel,
                join: Some(join),
            },
        );
        Ok(())
    }

    /// Stop one task and forget it. A tick already in progress finishes.
    /// Returns `false` if no task has that name.
    pub fn cancel(&self, name: &str) -> bool {
        let Some(entry) = self.inner.tasks.lock().remove(name) else {
            return false;
        };
        entry.cancel.cancel();
        info!(task = %name, "Periodic task cancelled");
        true
    }

    /// Handle for one module's factories.
    pub fn module_tasks(&self) -> ModuleTasks {
        ModuleTasks {
            scheduler: self.clone(),
            names: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every registered task, sorted by name.
    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.inner
            .tasks
            .lock()
            .iter()
            .map(|(name, entry)| TaskInfo {
                name: name.clone(),
                interval_ms: entry.interval.as_millis() as u64,
                runs: entry.stats.runs.load(Ordering::Relaxed),
                failures: entry.stats.failures.load(Ordering::Relaxed),
                last_run: *entry.stats.last_run.lock(),
                active: entry.is_running(),
            })
            .collect()
    }

    /// Task loops still running.
    pub fn active_count(&self) -> usize {
        self.inner
            .tasks
            .lock()
            .values()
            .filter(|entry| entry.is_running())
            .count()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop every loop and wait for them to exit. A task that is mid-run
    /// finishes its current tick first.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let joins: Vec<(String, JoinHandle<()>)> = {
            let mut tasks = self.inner.tasks.lock();
            tasks
                .iter_mut()
                .filter_map(|(name, entry)| entry.join.take().map(|join| (name.clone(), join)))
                .collect()
        };

        for (name, join) in joins {
            if let Err(e) = join.await {
                error!(task = %name, error = %e, "Periodic task did not exit cleanly");
            }
        }
        info!("Task scheduler stopped");
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerHandle for TaskScheduler {
    fn register(&self, name: &str, interval: Duration, task: TaskFn) -> Result<(), SchedulerError> {
        TaskScheduler::register(self, name, interval, task)
    }
}

/// Scheduler handle scoped to one module.
#[derive(Clone)]
pub struct ModuleTasks {
    scheduler: TaskScheduler,
    names: Arc<Mutex<Vec<String>>>,
}

impl ModuleTasks {
    /// Tasks registered through this handle and not yet withdrawn.
    pub fn names(&self) -> Vec<String> {
        self.names.lock().clone()
    }

    /// Cancel every task registered through this handle. Returns how many
    /// were still scheduled.
    pub fn cancel_all(&self) -> usize {
        let names = std::mem::take(&mut *self.names.lock());
        names.iter().filter(|name| self.scheduler.cancel(name)).count()
    }
}

impl SchedulerHandle for ModuleTasks {
    fn register(&self, name: &str, interval: Duration, task: TaskFn) -> Result<(), SchedulerError> {
        self.scheduler.register(name, interval, task)?;
        self.names.lock().push(name.to_string());
        Ok(())
    }
}

async fn run_loop(
    name: String,
    period: Duration,
    task: TaskFn,
    stats: Arc<TaskStats>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let outcome = AssertUnwindSafe(async { task().await }).catch_unwind().await;
        stats.runs.fetch_add(1, Ordering::Relaxed);
        *stats.last_run.lock() = Some(Utc::now());

        if let Err(panic) = outcome {
            stats.failures.fetch_add(1, Ordering::Relaxed);
            error!(
                task = %name,
                error = %crate::loader::panic_message(&*panic),
                "Periodic task panicked"
            );
        }
    }

    debug!(task = %name, "Periodic task loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;

    fn counting(counter: Arc<AtomicU64>) -> TaskFn {
        Arc::new(move || -> BoxFuture<'static, ()> {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_runs_on_interval() {
        let scheduler = TaskScheduler::new();
        let counter = Arc::new(AtomicU64::new(0));
        scheduler
            .register("tick", Duration::from_secs(1), counting(counter.clone()))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);

        let info = &scheduler.tasks()[0];
        assert_eq!(info.name, "tick");
        assert_eq!(info.interval_ms, 1000);
        assert_eq!(info.runs, 4);
        assert!(info.last_run.is_some());
        assert_eq!(scheduler.active_count(), 1);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_registration_rules() {
        let scheduler = TaskScheduler::new();
        let counter = Arc::new(AtomicU64::new(0));

        scheduler
            .register("a", Duration::from_secs(60), counting(counter.clone()))
            .unwrap();
        assert_eq!(
            scheduler.register("a", Duration::from_secs(60), counting(counter.clone())),
            Err(SchedulerError::Duplicate("a".to_string()))
        );
        assert_eq!(
            scheduler.register("b", Duration::ZERO, counting(counter.clone())),
            Err(SchedulerError::ZeroInterval("b".to_string()))
        );

        scheduler.shutdown().await;
        assert!(scheduler.is_shut_down());
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(
            scheduler.register("c", Duration::from_secs(1), counting(counter)),
            Err(SchedulerError::ShutDown)
        );
    }

    #[test]
    fn test_register_without_runtime() {
        let scheduler = TaskScheduler::new();
        let task = counting(Arc::new(AtomicU64::new(0)));
        assert_eq!(
            scheduler.register("a", Duration::from_secs(1), task),
            Err(SchedulerError::NoRuntime("a".to_string()))
        );
        assert!(scheduler.tasks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_one_task() {
        let scheduler = TaskScheduler::new();
        let stopped = Arc::new(AtomicU64::new(0));
        let kept = Arc::new(AtomicU64::new(0));
        scheduler
            .register("stopped", Duration::from_secs(1), counting(stopped.clone()))
            .unwrap();
        scheduler
            .register("kept", Duration::from_secs(1), counting(kept.clone()))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(scheduler.cancel("stopped"));
        assert!(!scheduler.cancel("stopped"));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert_eq!(kept.load(Ordering::SeqCst), 4);
        assert_eq!(scheduler.active_count(), 1);
        let names: Vec<String> = scheduler.tasks().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["kept".to_string()]);

        // The name is free again
        scheduler
            .register("stopped", Duration::from_secs(1), counting(stopped.clone()))
            .unwrap();
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_module_tasks_withdraw_only_their_own() {
        let scheduler = TaskScheduler::new();
        let counter = Arc::new(AtomicU64::new(0));
        scheduler
            .register("host.sweep", Duration::from_secs(60), counting(counter.clone()))
            .unwrap();

        let module = scheduler.module_tasks();
        module
            .register("alpha.heartbeat", Duration::from_secs(60), counting(counter.clone()))
            .unwrap();
        module
            .register("alpha.report", Duration::from_secs(60), counting(counter.clone()))
            .unwrap();
        assert!(module
            .register("host.sweep", Duration::from_secs(60), counting(counter.clone()))
            .is_err());
        assert_eq!(module.names(), vec!["alpha.heartbeat".to_string(), "alpha.report".to_string()]);
        assert_eq!(scheduler.active_count(), 3);

        assert_eq!(module.cancel_all(), 2);
        assert_eq!(module.cancel_all(), 0);
        assert!(module.names().is_empty());
        let names: Vec<String> = scheduler.tasks().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["host.sweep".to_string()]);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_task_keeps_running() {
        let scheduler = TaskScheduler::new();
        let task: TaskFn = Arc::new(|| -> BoxFuture<'static, ()> {
            Box::pin(async { panic!("tick failed") })
        });
        scheduler.register("boom", Duration::from_secs(1), task).unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let info = &scheduler.tasks()[0];
        assert_eq!(info.runs, 3);
        assert_eq!(info.failures, 3);
        assert!(info.active);

        scheduler.shutdown().await;
    }
}
