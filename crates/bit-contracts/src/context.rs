//! # Bit Context
//!
//! Host services injected into every factory call. Bits keep clones of what
//! they need; there are no process-wide statics.

use crate::errors::SchedulerError;
use bit_bus::MessageBus;
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Body of a periodic task. Called once per tick.
pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Access to the host's shared periodic-task scheduler.
pub trait SchedulerHandle: Send + Sync {
    /// Run `task` every `interval` until the host shuts down. Names are
    /// unique across the host.
    fn register(&self, name: &str, interval: Duration, task: TaskFn) -> Result<(), SchedulerError>;
}

/// What a module's factories receive from the host.
#[derive(Clone)]
pub struct BitContext {
    bus: MessageBus,
    module_id: String,
    package_dir: PathBuf,
    scheduler: Arc<dyn SchedulerHandle>,
}

impl BitContext {
    pub fn new(
        bus: MessageBus,
        module_id: impl Into<String>,
        package_dir: impl Into<PathBuf>,
        scheduler: Arc<dyn SchedulerHandle>,
    ) -> Self {
        Self {
            bus,
            module_id: module_id.into(),
            package_dir: package_dir.into(),
            scheduler,
        }
    }

    /// The host-wide message bus.
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    /// The module's own package directory.
    pub fn package_dir(&self) -> &Path {
        &self.package_dir
    }

    pub fn scheduler(&self) -> &Arc<dyn SchedulerHandle> {
        &self.scheduler
    }

    /// Register a periodic task, prefixing its name with the module id.
    pub fn schedule<F, Fut>(&self, name: &str, interval: Duration, task: F) -> Result<(), SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let task: TaskFn = Arc::new(move || -> BoxFuture<'static, ()> { Box::pin(task()) });
        self.scheduler
            .register(&format!("{}.{}", self.module_id, name), interval, task)
    }
}

impl std::fmt::Debug for BitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitContext")
            .field("module_id", &self.module_id)
            .field("package_dir", &self.package_dir)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingScheduler(Mutex<Vec<(String, Duration)>>);

    impl SchedulerHandle for RecordingScheduler {
        fn register(&self, name: &str, interval: Duration, _task: TaskFn) -> Result<(), SchedulerError> {
            let mut tasks = self.0.lock();
            if tasks.iter().any(|(n, _)| n == name) {
                return Err(SchedulerError::Duplicate(name.to_string()));
            }
            tasks.push((name.to_string(), interval));
            Ok(())
        }
    }

    #[test]
    fn test_schedule_prefixes_module_id() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let ctx = BitContext::new(MessageBus::new(), "alpha", "/tmp/alpha", scheduler.clone());

        ctx.schedule("tick", Duration::from_secs(1), || async {}).unwrap();
        assert_eq!(
            scheduler.0.lock().as_slice(),
            &[("alpha.tick".to_string(), Duration::from_secs(1))]
        );
        assert_eq!(
            ctx.schedule("tick", Duration::from_secs(1), || async {}),
            Err(SchedulerError::Duplicate("alpha.tick".to_string()))
        );
    }
}
