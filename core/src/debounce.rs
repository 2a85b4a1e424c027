use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Delay between the last trigger and the lookup actually running.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(700);

/// Debounced single-flight lookup.
///
/// Every [`trigger`](Self::trigger) supersedes the previous one: the pending
/// task is aborted and a new delay starts. When the delay elapses the lookup
/// runs, and its result is published on the watch channel only if no newer
/// trigger happened meanwhile and the key it was issued for is still current.
pub struct SingleFlight<K, V> {
    delay: Duration,
    generation: Arc<AtomicU64>,
    current_key: Arc<Mutex<Option<K>>>,
    pending: Mutex<Option<JoinHandle<()>>>,
    tx: Arc<watch::Sender<Option<(K, V)>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Clone + PartialEq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            delay,
            generation: Arc::new(AtomicU64::new(0)),
            current_key: Arc::new(Mutex::new(None)),
            pending: Mutex::new(None),
            tx: Arc::new(tx),
        }
    }

    /// Receiver for published `(key, value)` results.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<(K, V)>> {
        self.tx.subscribe()
    }

    pub fn trigger<F, Fut>(&self, key: K, lookup: F)
    where
        F: FnOnce(K) -> Fut + Send + 'static,
        Fut: Future<Output = Option<V>> + Send + 'static,
    {
        let issued = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self
            .current_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(key.clone());

        let delay = self.delay;
        let generation = Arc::clone(&self.generation);
        let current_key = Arc::clone(&self.current_key);
        let tx = Arc::clone(&self.tx);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(value) = lookup(key.clone()).await else {
                return;
            };
            let still_current = generation.load(Ordering::SeqCst) == issued
                && current_key
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .as_ref()
                    == Some(&key);
            if still_current {
                tx.send_replace(Some((key, value)));
            } else {
                tracing::debug!("discarding superseded lookup result");
            }
        });

        let previous = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Drop any pending lookup without publishing.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl<K, V> Drop for SingleFlight<K, V> {
    fn drop(&mut self) {
        if let Some(task) = self
            .pending
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
