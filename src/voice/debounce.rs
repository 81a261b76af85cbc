use std::{collections::HashMap, hash::Hash, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Timer-backed coalescing buffer keyed by entity.
///
/// The first value pushed for a key opens a window; values pushed while it is
/// open replace the pending one, and the latest is flushed when it closes.
/// [`bypass`](Self::bypass) flushes immediately and drops anything pending
/// for that key so a stale value cannot follow it out.
pub struct Coalescer<K, V> {
    window: Duration,
    pending: Arc<Mutex<HashMap<K, V>>>,
    out: flume::Sender<V>,
    cancel: CancellationToken,
}

impl<K, V> Coalescer<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    pub fn new(window: Duration, out: flume::Sender<V>, cancel: CancellationToken) -> Self {
        Self {
            window,
            pending: Arc::new(Mutex::new(HashMap::new())),
            out,
            cancel,
        }
    }

    pub fn push(&self, key: K, value: V) {
        if self.cancel.is_cancelled() {
            return;
        }

        let opened = self.pending.lock().insert(key.clone(), value).is_none();
        if !opened {
            return;
        }

        let pending = self.pending.clone();
        let out = self.out.clone();
        let cancel = self.cancel.clone();
        let window = self.window;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(window) => {
                    let mut pending = pending.lock();
                    if let Some(value) = pending.remove(&key) {
                        let _ = out.send(value);
                    }
                }
            }
        });
    }

    pub fn bypass(&self, key: &K, value: V) {
        if self.cancel.is_cancelled() {
            return;
        }
        let mut pending = self.pending.lock();
        pending.remove(key);
        // Flushes happen under the lock, so an older value cannot follow.
        let _ = self.out.send(value);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}
