use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::time::Instant;

/// An error produced when a [`RateLimiter`] grant cannot be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    /// The queue was administratively drained via
    /// [`RateLimiter::reject_all`].
    #[error("rate limiter rejected the waiter: {0}")]
    Rejected(String),
    /// The limiter was dropped while the waiter was still queued.
    #[error("rate limiter dropped")]
    Dropped,
}

type Waiter = oneshot::Sender<Result<(), AcquireError>>;

#[derive(Default)]
struct State {
    queue: VecDeque<Waiter>,
    last_grant: Option<Instant>,
    /// Whether a scheduling pass is currently active. At most one pass is
    /// active per limiter, which is what keeps grants strictly FIFO.
    draining: bool,
}

struct Inner {
    name: &'static str,
    interval: Duration,
    state: Mutex<State>,
}

/// A FIFO pacing queue.
///
/// [`acquire`](Self::acquire) hands out grants strictly in arrival order,
/// never closer together than the configured interval: a burst of N
/// simultaneous acquires drains in roughly (N - 1) times the interval.
///
/// There is no per-waiter timeout or cancellation; a waiter stays queued
/// until it is granted or administratively drained. Grants must be driven
/// by a running Tokio runtime, as each scheduling pass runs on a spawned
/// task.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queued = self
            .inner
            .state
            .try_lock()
            .map(|s| s.queue.len())
            .unwrap_or_default();
        f.debug_struct("RateLimiter")
            .field("name", &self.inner.name)
            .field("interval", &self.inner.interval)
            .field("queued", &queued)
            .finish()
    }
}

impl RateLimiter {
    /// Creates a limiter spacing grants at least `interval` apart. The
    /// `name` shows up in log records.
    pub fn new(name: &'static str, interval: Duration) -> Self {
        RateLimiter {
            inner: Arc::new(Inner {
                name,
                interval,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Creates a limiter from a millisecond interval, clamping negative
    /// inputs to zero. A zero interval still grants one waiter at a time,
    /// still FIFO, as fast as the scheduling passes allow.
    pub fn from_millis(name: &'static str, interval_ms: i64) -> Self {
        Self::new(name, Duration::from_millis(interval_ms.max(0) as u64))
    }

    /// The configured minimum spacing between grants.
    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Queues a waiter and returns a future that resolves once the waiter
    /// is granted.
    ///
    /// The waiter is enqueued synchronously, so grant order follows the
    /// order of `acquire` calls, not the order the returned futures are
    /// first polled in.
    pub fn acquire(&self) -> BoxFuture<'static, Result<(), AcquireError>> {
        let (sender, receiver) = oneshot::channel();

        {
            let mut state = self.inner.state.lock().unwrap();
            state.queue.push_back(sender);
        }
        self.schedule();

        async move {
            match receiver.await {
                Ok(result) => result,
                Err(_) => Err(AcquireError::Dropped),
            }
        }
        .boxed()
    }

    /// Immediately grants every queued waiter, ignoring the interval.
    ///
    /// This is not wired to any automatic trigger; it exists for shutdown
    /// paths and test harnesses.
    pub fn resolve_all(&self) {
        let drained: Vec<_> = {
            let mut state = self.inner.state.lock().unwrap();
            state.queue.drain(..).collect()
        };
        if !drained.is_empty() {
            tracing::debug!("Resolving all {} queued {} waiters", drained.len(), self.inner.name);
        }
        for waiter in drained {
            waiter.send(Ok(())).ok();
        }
    }

    /// Immediately rejects every queued waiter with the given reason.
    ///
    /// Like [`resolve_all`](Self::resolve_all), an administrative escape
    /// hatch with no automatic trigger.
    pub fn reject_all(&self, reason: impl Into<String>) {
        let error = AcquireError::Rejected(reason.into());
        let drained: Vec<_> = {
            let mut state = self.inner.state.lock().unwrap();
            state.queue.drain(..).collect()
        };
        if !drained.is_empty() {
            tracing::debug!("Rejecting all {} queued {} waiters", drained.len(), self.inner.name);
        }
        for waiter in drained {
            waiter.send(Err(error.clone())).ok();
        }
    }

    /// The scheduling check: starts a pass if none is active and there is
    /// work queued.
    ///
    /// Passes coalesce on the `draining` flag, so concurrent `acquire`
    /// calls never start a second pass for the same limiter.
    fn schedule(&self) {
        let wait = {
            let mut state = self.inner.state.lock().unwrap();
            if state.draining || state.queue.is_empty() {
                return;
            }
            state.draining = true;
            match state.last_grant {
                Some(last) => self.inner.interval.saturating_sub(last.elapsed()),
                None => Duration::ZERO,
            }
        };

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;

            {
                let mut state = this.inner.state.lock().unwrap();
                let now = Instant::now();
                // Re-measure: with coarse timer granularity the sleep can
                // fire a little early, in which case nothing is granted on
                // this pass and the follow-up check schedules the rest.
                let due = state
                    .last_grant
                    .map_or(true, |last| now.duration_since(last) >= this.inner.interval);
                if due {
                    if let Some(waiter) = state.queue.pop_front() {
                        tracing::trace!("Granting {} waiter", this.inner.name);
                        waiter.send(Ok(())).ok();
                        state.last_grant = Some(now);
                    }
                }
                state.draining = false;
            }

            // keep draining the remaining waiters, or go idle
            this.schedule();
        });
    }
}
