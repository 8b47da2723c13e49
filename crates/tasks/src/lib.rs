//! Task lifecycle helpers.
//!
//! [`Shutdown`] is a one-shot, level-triggered quit signal built on a
//! `watch` channel; any number of [`ShutdownSignal`] handles can wait on it.
//! [`TaskGroup`] spawns tasks and lets the owner wait, with a deadline, for
//! all of them to finish.

mod metrics;

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    sync::{Notify, watch},
    task::JoinHandle,
};
use tracing::warn;

use crate::metrics::{IncCounterOnDrop, TaskGroupMetrics};

/// Owner side of a quit signal.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            tx: watch::channel(false).0,
        }
    }

    /// Fires the signal. Idempotent.
    pub fn signal(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_signalled(&self) -> bool {
        *self.tx.borrow()
    }

    /// A handle that observes this signal.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a [`Shutdown`]. Also fires if the owner is dropped.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_signalled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once the signal has fired.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.rx.clone();
        async move {
            // an error means the owner is gone, which counts as shutdown
            let _ = rx.wait_for(|quit| *quit).await;
        }
    }
}

/// Set of spawned tasks that can be awaited as a whole.
#[derive(Debug, Clone)]
pub struct TaskGroup {
    inner: Arc<GroupInner>,
}

#[derive(Debug)]
struct GroupInner {
    name: &'static str,
    active: AtomicUsize,
    idle: Notify,
    metrics: TaskGroupMetrics,
}

/// Decrements the active count when the task finishes or is cancelled.
struct ActiveGuard(Arc<GroupInner>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl TaskGroup {
    /// Creates a group whose metrics are labelled with `name`.
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                name,
                active: AtomicUsize::new(0),
                idle: Notify::new(),
                metrics: TaskGroupMetrics::new(name),
            }),
        }
    }

    /// Spawns `fut` on the current runtime as a member of the group.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        self.inner.metrics.inc_spawned();
        let guard = ActiveGuard(self.inner.clone());
        let finished = IncCounterOnDrop::new(self.inner.metrics.finished_total.clone());
        tokio::spawn(async move {
            let _guard = guard;
            let _finished = finished;
            fut.await;
        })
    }

    /// Number of tasks still running.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Waits until no task of the group is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Waits for the group to drain for at most `timeout`. Returns `false`
    /// if tasks were still running at the deadline.
    pub async fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        if tokio::time::timeout(timeout, self.wait_idle()).await.is_ok() {
            return true;
        }
        warn!(
            group = self.inner.name,
            active = self.active(),
            ?timeout,
            "Tasks still running at deadline"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_signal() {
        let shutdown = Shutdown::new();
        let signal = shutdown.subscribe();
        assert!(!signal.is_signalled());

        let waiter = tokio::spawn(signal.wait());
        shutdown.signal();
        shutdown.signal();
        waiter.await.unwrap();
        assert!(signal.is_signalled());
        assert!(shutdown.is_signalled());
    }

    #[tokio::test]
    async fn test_dropped_owner_counts_as_shutdown() {
        let shutdown = Shutdown::new();
        let signal = shutdown.subscribe();
        drop(shutdown);
        signal.wait().await;
        assert!(signal.is_signalled());
    }

    #[tokio::test]
    async fn test_task_group_drains() {
        let group = TaskGroup::new("test");
        let shutdown = Shutdown::new();
        for _ in 0..3 {
            let quit = shutdown.subscribe().wait();
            group.spawn(quit);
        }
        assert_eq!(group.active(), 3);
        assert!(!group.wait_idle_timeout(Duration::from_millis(20)).await);

        shutdown.signal();
        assert!(group.wait_idle_timeout(Duration::from_secs(1)).await);
        assert_eq!(group.active(), 0);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_times_out() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let group = TaskGroup::new("stuck");
        group.spawn(std::future::pending());
        assert!(!group.wait_idle_timeout(Duration::from_secs(5)).await);

        let logs = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(logs.contains("Tasks still running at deadline"), "{logs}");
        assert!(logs.contains("group=\"stuck\""), "{logs}");
        assert!(logs.contains("active=1"), "{logs}");
    }
}
