//! Coalescing of concurrent duplicate work keyed by a string.
//!
//! One caller per key becomes the leader and runs the work; everyone else
//! waits for the leader's result. A leader that is cancelled mid-flight drops
//! its slot, and one of the waiters takes over with its own closure.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::watch;

type ResultSlot<T> = watch::Receiver<Option<T>>;

/// Group of in-flight calls. `T` is the shared outcome; it must be `Clone`
/// because every coalesced waiter receives it.
pub struct SingleFlight<T: Clone> {
    inflight: Mutex<HashMap<String, ResultSlot<T>>>,
}

impl<T: Clone + Send + Sync> SingleFlight<T> {
    pub fn new() -> Self {
        SingleFlight {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Number of keys currently in flight.
    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `work` under `key`, or wait for an identical in-flight call and
    /// share its result. Calls arriving after a completed flight run anew.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut work = Some(work);
        loop {
            enum Role<T> {
                Leader(watch::Sender<Option<T>>),
                Waiter(ResultSlot<T>),
            }

            let role = {
                let mut inflight = self.inflight.lock();
                match inflight.get(key) {
                    Some(rx) => Role::Waiter(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        inflight.insert(key.to_string(), rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => {
                    // The slot must vanish even if this future is dropped
                    // mid-flight, otherwise waiters would hang on a leader
                    // that no longer exists.
                    let _slot = SlotGuard {
                        inflight: &self.inflight,
                        key,
                    };
                    let work = work.take().expect("leader role is entered once");
                    let value = work().await;
                    drop(_slot);
                    let _ = tx.send(Some(value.clone()));
                    return value;
                }
                Role::Waiter(mut rx) => {
                    loop {
                        if let Some(value) = rx.borrow_and_update().clone() {
                            return value;
                        }
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                    // The sender is gone; pick up a result published right
                    // before it dropped, else retry (possibly as leader).
                    if let Some(value) = rx.borrow().clone() {
                        return value;
                    }
                }
            }
        }
    }
}

impl<T: Clone + Send + Sync> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct SlotGuard<'a, T: Clone> {
    inflight: &'a Mutex<HashMap<String, ResultSlot<T>>>,
    key: &'a str,
}

impl<T: Clone> Drop for SlotGuard<'_, T> {
    fn drop(&mut self) {
        self.inflight.lock().remove(self.key);
    }
}
