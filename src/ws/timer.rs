use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use super::traits::{Scheduler, Timer};

type FireFn = Arc<dyn Fn(Timer, u64) + Send + Sync>;

/// [`Scheduler`] backed by tokio tasks.
///
/// Every scheduled timer is one spawned task sleeping until its deadline; cancelling
/// aborts the task. Works with a paused tokio clock, which is how the timing tests
/// drive it.
pub struct TokioScheduler {
    on_fire: FireFn,
    pending: HashMap<Timer, JoinHandle<()>>,
}

impl TokioScheduler {
    /// `on_fire` is called from the timer task with the timer and its ticket.
    pub fn new<F>(on_fire: F) -> Self
    where
        F: Fn(Timer, u64) + Send + Sync + 'static,
    {
        Self {
            on_fire: Arc::new(on_fire),
            pending: HashMap::new(),
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_once(&mut self, timer: Timer, ticket: u64, delay: Duration) {
        // Deadline is fixed now, not when the task first gets polled
        let deadline = Instant::now() + delay;
        let on_fire = Arc::clone(&self.on_fire);

        let handle = tokio::spawn(async move {
            sleep_until(deadline).await;
            on_fire(timer, ticket);
        });

        if let Some(previous) = self.pending.insert(timer, handle) {
            previous.abort();
        }
    }

    fn cancel(&mut self, timer: Timer) {
        if let Some(handle) = self.pending.remove(&timer) {
            handle.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.pending.drain() {
            handle.abort();
        }
    }
}

impl fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioScheduler")
            .field("pending", &self.pending.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
