//! Periodic task driver
//!
//! Runs one async task at a fixed interval on its own tokio task. Each
//! iteration awaits the task and the interval sleep concurrently, so the
//! next tick starts at the later of the two: a slow tick neither stacks nor
//! compresses the cadence. Task errors are logged and the scheduler keeps
//! running. `stop` cancels cooperatively and waits for an in-flight tick.

use crate::error::Result;
use crate::logging::get_logger;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type TaskFn = Box<dyn FnMut() -> TaskFuture + Send>;

pub struct AsyncScheduler {
    name: &'static str,
    interval: Duration,
    task: Option<TaskFn>,
    handle: Option<JoinHandle<TaskFn>>,
    cancel_tx: Option<watch::Sender<bool>>,
}

impl AsyncScheduler {
    pub fn new<F>(name: &'static str, interval: Duration, task: F) -> Self
    where
        F: FnMut() -> TaskFuture + Send + 'static,
    {
        Self {
            name,
            interval,
            task: Some(Box::new(task)),
            handle: None,
            cancel_tx: None,
        }
    }

    /// Start ticking. Starting an already started scheduler is a no-op.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let Some(mut task) = self.task.take() else {
            return;
        };
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let name = self.name;
        let interval = self.interval;
        let logger = get_logger("scheduler");
        logger.info(&format!("Starting scheduler '{}' ({:?})", name, interval));

        let handle = tokio::spawn(async move {
            loop {
                let tick = async {
                    if let Err(e) = task().await {
                        get_logger("scheduler")
                            .error(&format!("Task '{}' failed: {}", name, e));
                    }
                };
                let pause = async {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => false,
                        // a stop signal or a dropped sender ends the loop
                        _ = cancel_rx.changed() => true,
                    }
                };
                // the tick always runs to completion, cancellation only cuts
                // the remaining pause short
                let ((), cancelled) = tokio::join!(tick, pause);
                if cancelled || *cancel_rx.borrow() {
                    break;
                }
            }
            task
        });

        self.cancel_tx = Some(cancel_tx);
        self.handle = Some(handle);
    }

    /// Signal cancellation and wait for the in-flight tick to return.
    pub async fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(true);
        }
        match handle.await {
            Ok(task) => self.task = Some(task),
            Err(e) => {
                get_logger("scheduler")
                    .error(&format!("Scheduler '{}' task panicked: {}", self.name, e));
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.handle.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_scheduler(interval: Duration, counter: Arc<AtomicU32>) -> AsyncScheduler {
        AsyncScheduler::new("test", interval, move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_at_interval() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut scheduler = counting_scheduler(Duration::from_secs(30), counter.clone());
        assert!(!scheduler.is_started());

        scheduler.start();
        assert!(scheduler.is_started());
        tokio::time::sleep(Duration::from_secs(95)).await;
        scheduler.stop().await;
        assert!(!scheduler.is_started());

        // first tick immediately, then every 30s: t=0, 30, 60, 90
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_task_does_not_stack() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let mut scheduler = AsyncScheduler::new("slow", Duration::from_secs(10), move || {
            let c = c.clone();
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(25)).await;
                Ok(())
            })
        });
        scheduler.start();
        tokio::time::sleep(Duration::from_secs(60)).await;
        scheduler.stop().await;

        // each 25s tick delays the next; ticks at t=0, 25, 50
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn task_errors_do_not_kill_the_scheduler() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let mut scheduler = AsyncScheduler::new("failing", Duration::from_secs(10), move || {
            let c = c.clone();
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(crate::error::PvControlError::generic("boom"))
            })
        });
        scheduler.start();
        tokio::time::sleep(Duration::from_secs(35)).await;
        scheduler.stop().await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_restartable() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut scheduler = counting_scheduler(Duration::from_secs(10), counter.clone());
        scheduler.start();
        scheduler.start();
        tokio::time::sleep(Duration::from_secs(5)).await;
        scheduler.stop().await;
        let after_first = counter.load(Ordering::SeqCst);
        assert_eq!(after_first, 1);

        scheduler.start();
        assert!(scheduler.is_started());
        tokio::time::sleep(Duration::from_secs(5)).await;
        scheduler.stop().await;
        assert_eq!(counter.load(Ordering::SeqCst), after_first + 1);
    }
}
