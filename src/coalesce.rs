//! Per-key request coalescing.
//!
//! The first caller for a key spawns the computation; later callers for the
//! same key wait on its result. The computation runs as its own task so one
//! caller going away does not cancel work others are waiting on. It is
//! aborted only when every waiter has gone.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::AbortHandle;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CoalesceError {
    #[error("shared computation ended without a result")]
    Abandoned,
}

struct Flight<T> {
    id: u64,
    rx: watch::Receiver<Option<T>>,
    abort: AbortHandle,
    waiters: usize,
}

type FlightMap<T> = Arc<Mutex<HashMap<String, Flight<T>>>>;

pub struct Coalescer<T> {
    inflight: FlightMap<T>,
    next_id: AtomicU64,
}

/// Whether a caller started the computation or joined one in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

impl<T> Coalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Number of keys with a computation in flight.
    pub fn inflight(&self) -> usize {
        lock(&self.inflight).len()
    }

    /// Run `make()` for `key` unless a run is already in flight, then wait
    /// for the shared result.
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> (Role, Result<T, CoalesceError>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (id, mut rx, role) = {
            let mut flights = lock(&self.inflight);
            match flights.get_mut(key) {
                Some(flight) => {
                    flight.waiters += 1;
                    (flight.id, flight.rx.clone(), Role::Follower)
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    let fut = make();
                    let inflight = Arc::clone(&self.inflight);
                    let owned_key = key.to_string();

                    let handle = tokio::spawn(async move {
                        let value = fut.await;
                        remove_flight(&inflight, &owned_key, id);
                        let _ = tx.send(Some(value));
                    });

                    flights.insert(
                        key.to_string(),
                        Flight {
                            id,
                            rx: rx.clone(),
                            abort: handle.abort_handle(),
                            waiters: 1,
                        },
                    );
                    (id, rx, Role::Leader)
                }
            }
        };

        let _waiter = WaiterGuard {
            inflight: Arc::clone(&self.inflight),
            key: key.to_string(),
            id,
        };

        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return (role, Ok(value));
            }
            if rx.changed().await.is_err() {
                // Sender dropped: the task panicked or was aborted.
                return (role, rx.borrow().clone().ok_or(CoalesceError::Abandoned));
            }
        }
    }
}

impl<T> Default for Coalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(map: &FlightMap<T>) -> std::sync::MutexGuard<'_, HashMap<String, Flight<T>>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn remove_flight<T>(map: &FlightMap<T>, key: &str, id: u64) {
    let mut flights = lock(map);
    if flights.get(key).map(|f| f.id == id).unwrap_or(false) {
        flights.remove(key);
    }
}

/// Decrements the waiter count on drop; the last waiter out aborts the task.
struct WaiterGuard<T> {
    inflight: FlightMap<T>,
    key: String,
    id: u64,
}

impl<T> Drop for WaiterGuard<T> {
    fn drop(&mut self) {
        let mut flights = lock(&self.inflight);
        let Some(flight) = flights.get_mut(&self.key) else {
            return;
        };
        if flight.id != self.id {
            return;
        }

        flight.waiters = flight.waiters.saturating_sub(1);
        if flight.waiters == 0 {
            flight.abort.abort();
            flights.remove(&self.key);
            tracing::debug!(key = %self.key, "last waiter left; computation cancelled");
        }
    }
}
