use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::Shared;
use tokio::time::Instant;

use crate::error::{ComputeError, ComputeResult};

/// A value paired with the deadline past which it must no longer be served
/// from cache.
///
/// Producers feeding an [`ExpiryCache`] create these via [`Expiring::new`]
/// or [`Expiring::with_ttl`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expiring<T> {
    /// The wrapped value.
    pub value: T,
    /// The deadline at which the value stops being servable.
    ///
    /// A value without a deadline is never considered fresh, but also never
    /// considered expired: it is discarded by the cache the moment its
    /// computation settles, while callers already waiting on it still
    /// receive it once.
    pub expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    /// Pairs `value` with an explicit deadline.
    pub fn new(value: T, expires_at: Instant) -> Self {
        Self {
            value,
            expires_at: Some(expires_at),
        }
    }

    /// Pairs `value` with a deadline `ttl` from now.
    pub fn with_ttl(value: T, ttl: Duration) -> Self {
        Self::new(value, Instant::now() + ttl)
    }

    /// Whether the deadline exists and has been reached.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }

    /// Whether the deadline exists and is strictly in the future.
    pub fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now < deadline)
    }
}

type ComputationChannel<T> = Shared<oneshot::Receiver<ComputeResult<Option<Expiring<T>>>>>;

/// Per-key slot state. Absence of the key means the slot is empty.
enum Slot<T> {
    /// A computation is in flight; concurrent callers join this channel.
    Pending(ComputationChannel<T>),
    /// A settled value, served until its deadline passes. `None` is itself
    /// a valid cached result: it carries no deadline to re-check and is
    /// therefore served until the process exits.
    Resolved(Option<Expiring<T>>),
}

type SlotMap<T> = Arc<Mutex<BTreeMap<String, Slot<T>>>>;

/// An in-memory cache for expensive async computations whose results carry
/// an expiry deadline.
///
/// Concurrent lookups for the same key are coalesced onto a single
/// computation; a settled value is served until its deadline passes, at
/// which point the first access evicts it and triggers exactly one
/// recomputation.
///
/// A failed computation is *not* retried: the settled error is replayed to
/// every subsequent caller of that key. The only guarantee made here is the
/// absence of duplicate concurrent computations, not liveness after
/// failure.
pub struct ExpiryCache<T> {
    name: &'static str,
    slots: SlotMap<T>,
}

impl<T> Clone for ExpiryCache<T> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        ExpiryCache {
            name: self.name,
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<T> fmt::Debug for ExpiryCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.try_lock().map(|s| s.len()).unwrap_or_default();
        f.debug_struct("ExpiryCache")
            .field("name", &self.name)
            .field("slots", &slots)
            .finish()
    }
}

impl<T> ExpiryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty cache. The `name` shows up in log records.
    pub fn new(name: &'static str) -> Self {
        ExpiryCache {
            name,
            slots: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Returns the cached value for `key`, or invokes `calculate` to
    /// produce it.
    ///
    /// The computation is deduplicated between concurrent callers: while it
    /// is in flight, all callers sharing the key converge on its result.
    /// The computation is driven on its own task, so it settles even when
    /// every caller has gone away; there is no cancellation or timeout.
    ///
    /// A resolved `Some` value is cached until its deadline passes, a
    /// resolved `None` is cached until the process exits, and a value whose
    /// deadline is missing or already reached when the computation settles
    /// is handed to the waiting callers once and not cached at all.
    ///
    /// # Errors
    ///
    /// A `calculate` error is replayed to this caller and to every
    /// subsequent caller of `key`; see the type-level docs.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        calculate: F,
    ) -> ComputeResult<Option<Expiring<T>>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ComputeResult<Option<Expiring<T>>>> + Send + 'static,
    {
        let channel = {
            let mut slots = self.slots.lock().unwrap();

            // Expired entries are evicted first, so the lookup below sees
            // an empty slot and starts the recomputation.
            if let Some(Slot::Resolved(value)) = slots.get(key) {
                if value.as_ref().is_some_and(|v| v.is_expired(Instant::now())) {
                    tracing::trace!("Evicting expired {} entry {:?}", self.name, key);
                    slots.remove(key);
                }
            }

            match slots.get(key) {
                Some(Slot::Resolved(value)) => return Ok(value.clone()),
                Some(Slot::Pending(channel)) => {
                    tracing::trace!("Joining in-flight {} computation for {:?}", self.name, key);
                    channel.clone()
                }
                None => {
                    let channel = self.create_channel(key, calculate);
                    let evicted = slots.insert(key.to_owned(), Slot::Pending(channel.clone()));
                    debug_assert!(evicted.is_none());
                    channel
                }
            }
        };

        channel.await.unwrap_or(Err(ComputeError::ChannelDropped))
    }

    /// Creates a shareable channel that computes the value for `key` and
    /// settles the slot.
    ///
    /// The computation is spawned on the current runtime so that it runs to
    /// completion independently of its callers.
    fn create_channel<F, Fut>(&self, key: &str, calculate: F) -> ComputationChannel<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ComputeResult<Option<Expiring<T>>>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let name = self.name;
        let key = key.to_owned();
        let slots = Arc::clone(&self.slots);

        let channel = async move {
            let result = calculate().await;

            // Settle the slot first, then notify the waiters. Callers
            // either observe the settled slot, or hold a channel that is
            // about to receive data.
            {
                let mut slots = slots.lock().unwrap();
                match &result {
                    Ok(Some(value)) if value.is_fresh(Instant::now()) => {
                        slots.insert(key, Slot::Resolved(Some(value.clone())));
                    }
                    Ok(Some(_)) => {
                        // The deadline is missing or already passed. The
                        // waiters still receive the value once.
                        tracing::trace!("Discarding already stale {name} entry {key:?}");
                        slots.remove(&key);
                    }
                    Ok(None) => {
                        slots.insert(key, Slot::Resolved(None));
                    }
                    Err(error) => {
                        // The slot stays pending: the settled channel keeps
                        // replaying this error to every subsequent caller.
                        tracing::debug!("{name} computation for {key:?} failed: {error}");
                    }
                }
            }

            sender.send(result).ok();
        };

        tokio::spawn(channel);

        receiver.shared()
    }
}
