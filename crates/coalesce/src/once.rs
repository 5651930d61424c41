use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::Shared;

use crate::error::{ComputeError, ComputeResult};

type InitChannel<T> = Shared<oneshot::Receiver<ComputeResult<T>>>;

/// An in-memory cache that evaluates an initializer at most once per key
/// for the lifetime of the process.
///
/// The first channel ever stored for a key is the permanent value of that
/// key, whether the initializer succeeded or failed. There is no expiry and
/// no invalidation through [`get_or_init`](Self::get_or_init); call sites
/// that need to refresh a value overwrite the slot via
/// [`insert`](Self::insert).
pub struct OnceCache<T> {
    name: &'static str,
    slots: Arc<Mutex<BTreeMap<String, InitChannel<T>>>>,
}

impl<T> Clone for OnceCache<T> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        OnceCache {
            name: self.name,
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<T> fmt::Debug for OnceCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.try_lock().map(|s| s.len()).unwrap_or_default();
        f.debug_struct("OnceCache")
            .field("name", &self.name)
            .field("slots", &slots)
            .finish()
    }
}

impl<T> OnceCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty cache. The `name` shows up in log records.
    pub fn new(name: &'static str) -> Self {
        OnceCache {
            name,
            slots: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Returns the value for `key`, invoking `init` if the slot is empty.
    ///
    /// Concurrent callers sharing a key converge on a single invocation of
    /// `init`, and its settled result, success or failure, is what every
    /// later caller receives for the rest of the process lifetime. An
    /// initializer passed for an already occupied slot is never invoked.
    ///
    /// # Errors
    ///
    /// An `init` error is permanent for `key`; it is replayed to every
    /// subsequent caller without any retry.
    pub async fn get_or_init<F, Fut>(&self, key: &str, init: F) -> ComputeResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ComputeResult<T>> + Send + 'static,
    {
        let channel = {
            let mut slots = self.slots.lock().unwrap();
            match slots.get(key) {
                Some(channel) => {
                    tracing::trace!("Joining settled or in-flight {} slot {:?}", self.name, key);
                    channel.clone()
                }
                None => {
                    let (sender, receiver) = oneshot::channel();

                    let name = self.name;
                    let key_for_task = key.to_owned();
                    tokio::spawn(async move {
                        let result = init().await;
                        if let Err(error) = &result {
                            tracing::debug!(
                                "{name} initializer for {key_for_task:?} failed permanently: {error}"
                            );
                        }
                        sender.send(result).ok();
                    });

                    let channel = receiver.shared();
                    slots.insert(key.to_owned(), channel.clone());
                    channel
                }
            }
        };

        channel.await.unwrap_or(Err(ComputeError::ChannelDropped))
    }

    /// Overwrites the slot for `key` with an already settled value.
    ///
    /// This is the lower-level escape hatch for the few call sites that
    /// need to refresh a permanently memoized value.
    pub fn insert(&self, key: &str, value: T) {
        let (sender, receiver) = oneshot::channel();
        sender.send(Ok(value)).ok();
        self.slots
            .lock()
            .unwrap()
            .insert(key.to_owned(), receiver.shared());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::time;

    use crate::test;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_initializes_once() {
        test::setup();

        let cache: OnceCache<String> = OnceCache::new("config");
        let calls = Arc::new(AtomicUsize::new(0));

        let init = |calls: &Arc<AtomicUsize>| {
            let calls = Arc::clone(calls);
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    time::sleep(Duration::from_millis(20)).await;
                    Ok("loaded".to_owned())
                }
            }
        };

        let (a, b, c) = futures::join!(
            cache.get_or_init("settings", init(&calls)),
            cache.get_or_init("settings", init(&calls)),
            cache.get_or_init("settings", init(&calls)),
        );

        assert_eq!(a.unwrap(), "loaded");
        assert_eq!(b.unwrap(), "loaded");
        assert_eq!(c.unwrap(), "loaded");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // the slot is permanent; later calls do not re-initialize
        let again = cache.get_or_init("settings", init(&calls)).await;
        assert_eq!(again.unwrap(), "loaded");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_permanent() {
        test::setup();

        let cache: OnceCache<String> = OnceCache::new("config");
        let recoveries = Arc::new(AtomicUsize::new(0));

        let first = cache
            .get_or_init("settings", || async {
                Err(ComputeError::Upstream("boom".into()))
            })
            .await;
        assert_eq!(first, Err(ComputeError::Upstream("boom".into())));

        // the second caller observes the original rejection; the alternate
        // initializer never runs
        let recovering = {
            let recoveries = Arc::clone(&recoveries);
            move || {
                recoveries.fetch_add(1, Ordering::SeqCst);
                async move { Ok("recovered".to_owned()) }
            }
        };
        let second = cache.get_or_init("settings", recovering).await;
        assert_eq!(second, Err(ComputeError::Upstream("boom".into())));
        assert_eq!(recoveries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dying_initializer_surfaces_as_channel_dropped() {
        test::setup();

        let cache: OnceCache<String> = OnceCache::new("config");

        // the initializer task dies without ever settling its channel
        let result = cache
            .get_or_init("settings", || async { panic!("initializer dies mid-flight") })
            .await;
        assert_eq!(result, Err(ComputeError::ChannelDropped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_overwrites_slot() {
        test::setup();

        let cache: OnceCache<String> = OnceCache::new("config");

        let first = cache.get_or_init("flag", || async { Ok("a".to_owned()) }).await;
        assert_eq!(first.unwrap(), "a");

        cache.insert("flag", "b".to_owned());

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = {
            let calls = Arc::clone(&calls);
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok("c".to_owned()) }
            }
        };
        let second = cache.get_or_init("flag", counted).await;
        assert_eq!(second.unwrap(), "b");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
