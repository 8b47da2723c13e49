//! Task group metrics

use core::fmt;
use metrics::Counter;

/// Counters for one [`TaskGroup`](crate::TaskGroup).
#[derive(Clone, Debug)]
pub(crate) struct TaskGroupMetrics {
    /// Number of spawned tasks
    pub(crate) spawned_total: Counter,
    /// Number of finished or cancelled tasks
    pub(crate) finished_total: Counter,
}

impl TaskGroupMetrics {
    pub(crate) fn new(group: &'static str) -> Self {
        Self {
            spawned_total: metrics::counter!("tasks.spawned_total", "group" => group),
            finished_total: metrics::counter!("tasks.finished_total", "group" => group),
        }
    }

    pub(crate) fn inc_spawned(&self) {
        self.spawned_total.increment(1);
    }
}

/// Increments a counter when dropped, so panicking tasks are counted too.
pub(crate) struct IncCounterOnDrop(Counter);

impl fmt::Debug for IncCounterOnDrop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IncCounterOnDrop").finish()
    }
}

impl IncCounterOnDrop {
    pub(crate) const fn new(counter: Counter) -> Self {
        Self(counter)
    }
}

impl Drop for IncCounterOnDrop {
    fn drop(&mut self) {
        self.0.increment(1);
    }
}
