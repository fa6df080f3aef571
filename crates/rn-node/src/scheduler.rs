//! Per-endpoint delivery scheduler
//!
//! Decouples when an item becomes available for an endpoint from when the
//! endpoint's handler runs. Each endpoint owns a bounded FIFO (overflow
//! evicts the oldest item) and a minimum spacing between handler
//! invocations. Endpoints with queued items wait in a single pending list
//! and are flushed in the order they first became pending.
//!
//! While a flush is invoking handlers the pending list is locked: any
//! `ping` or `disconnect` issued in the meantime, including from inside a
//! handler, is cached and replayed in arrival order once the flush ends.
//! Each flush therefore works on a consistent snapshot.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use rn_core::time::millis_to_duration;
use rn_core::EndpointId;

/// Receives a whole batch of queued items for one endpoint
pub trait QueueHandler<T>: Send + Sync {
    fn handle_queue(&self, batch: Vec<T>);
}

struct Client<T> {
    handler: Weak<dyn QueueHandler<T>>,
    queue: VecDeque<T>,
    queue_size: usize,
    throttle: Duration,
    last_run: Option<Instant>,
}

impl<T> Client<T> {
    /// Earliest instant the handler may run again
    fn ready_at(&self, now: Instant) -> Instant {
        match self.last_run {
            Some(last) => last + self.throttle,
            None => now,
        }
    }
}

enum LockedOp<T> {
    Ping(EndpointId, T),
    Disconnect(EndpointId),
}

struct State<T> {
    clients: HashMap<EndpointId, Client<T>>,
    pending: Vec<EndpointId>,
    locked: bool,
    locked_ops: Vec<LockedOp<T>>,
    deadline: Option<Instant>,
}

impl<T> State<T> {
    fn apply_ping(&mut self, id: &EndpointId, item: T, now: Instant) -> bool {
        let Some(client) = self.clients.get_mut(id) else {
            tracing::trace!("Dropping item for unknown endpoint {}", id);
            return false;
        };

        let evicted = client.queue.len() >= client.queue_size;
        if evicted {
            client.queue.pop_front();
            tracing::trace!("Queue for {} full, evicted oldest item", id);
        }
        client.queue.push_back(item);

        let ready_at = client.ready_at(now);
        if !self.pending.contains(id) {
            self.pending.push(id.clone());
        }
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(ready_at),
            None => ready_at,
        });
        evicted
    }

    fn apply_disconnect(&mut self, id: &EndpointId, now: Instant) {
        self.clients.remove(id);
        self.pending.retain(|p| p != id);
        self.recompute_deadline(now);
    }

    fn recompute_deadline(&mut self, now: Instant) {
        self.deadline = self
            .pending
            .iter()
            .filter_map(|id| self.clients.get(id))
            .map(|client| client.ready_at(now))
            .min();
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

/// Shared handle to one scheduler
pub struct DeliveryScheduler<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for DeliveryScheduler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Default for DeliveryScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> DeliveryScheduler<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    clients: HashMap::new(),
                    pending: Vec::new(),
                    locked: false,
                    locked_ops: Vec::new(),
                    deadline: None,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Register an endpoint. Registering an existing id is a no-op.
    ///
    /// A queue size of 0 is treated as 1 and a negative throttle as 0.
    pub fn add_client(
        &self,
        id: EndpointId,
        handler: Weak<dyn QueueHandler<T>>,
        queue_size: usize,
        throttle_ms: i64,
    ) {
        let mut state = self.inner.state.lock();
        if state.clients.contains_key(&id) {
            tracing::debug!("Endpoint {} already registered with scheduler", id);
            return;
        }
        tracing::debug!(
            "Scheduler client {} (queue {}, throttle {}ms)",
            id,
            queue_size,
            throttle_ms
        );
        state.clients.insert(
            id,
            Client {
                handler,
                queue: VecDeque::new(),
                queue_size: queue_size.max(1),
                throttle: millis_to_duration(throttle_ms),
                last_run: None,
            },
        );
    }

    /// Queue an item for an endpoint.
    ///
    /// Returns `true` when the endpoint's queue was full and its oldest
    /// item was evicted. Pings issued during a flush are deferred and
    /// always return `false`.
    pub fn ping(&self, id: &EndpointId, item: T) -> bool {
        let evicted = {
            let mut state = self.inner.state.lock();
            if state.locked {
                state.locked_ops.push(LockedOp::Ping(id.clone(), item));
                return false;
            }
            state.apply_ping(id, item, Instant::now())
        };
        self.inner.notify.notify_one();
        evicted
    }

    /// Drop an endpoint's bookkeeping and any queued items
    pub fn disconnect(&self, id: &EndpointId) {
        {
            let mut state = self.inner.state.lock();
            if state.locked {
                state.locked_ops.push(LockedOp::Disconnect(id.clone()));
                return;
            }
            state.apply_disconnect(id, Instant::now());
        }
        self.inner.notify.notify_one();
    }

    pub fn has_client(&self, id: &EndpointId) -> bool {
        self.inner.state.lock().clients.contains_key(id)
    }

    /// Number of endpoints waiting for a flush
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// When the next flush is due, if anything is pending
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.state.lock().deadline
    }

    /// Run one flush. Returns the number of handlers invoked.
    ///
    /// A handler that panics is logged and counted as not invoked; the
    /// remaining batches still run and the scheduler unlocks as usual.
    pub fn flush(&self) -> usize {
        let now = Instant::now();
        let mut batches = Vec::new();

        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.locked {
                return 0;
            }
            state.locked = true;

            for id in std::mem::take(&mut state.pending) {
                let Some(client) = state.clients.get_mut(&id) else {
                    continue;
                };
                if client.ready_at(now) > now {
                    // Throttled; stays pending in its original position
                    state.pending.push(id);
                    continue;
                }
                if client.queue.is_empty() {
                    continue;
                }
                client.last_run = Some(now);
                let batch: Vec<T> = client.queue.drain(..).collect();
                batches.push((id, client.handler.clone(), batch));
            }
        }

        let _unlock = Unlock { inner: &self.inner };

        let mut invoked = 0;
        for (id, handler, batch) in batches {
            let Some(handler) = handler.upgrade() else {
                tracing::trace!("Handler for {} is gone, dropping {} items", id, batch.len());
                continue;
            };
            tracing::trace!("Flushing {} items to {}", batch.len(), id);
            match panic::catch_unwind(AssertUnwindSafe(|| handler.handle_queue(batch))) {
                Ok(()) => invoked += 1,
                Err(_) => tracing::error!("Queue handler for {} panicked", id),
            }
        }

        invoked
    }

    /// Drive flushes from a background task until `cancel` fires
    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                let deadline = scheduler.deadline();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = scheduler.inner.notify.notified() => continue,
                    _ = sleep_until(deadline) => {
                        scheduler.flush();
                    }
                }
            }
            tracing::debug!("Delivery scheduler stopped");
        })
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Clears the flush lock and replays cached ops, even during an unwind
struct Unlock<'a, T> {
    inner: &'a Inner<T>,
}

impl<T> Drop for Unlock<'_, T> {
    fn drop(&mut self) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        state.locked = false;

        let now = Instant::now();
        for op in std::mem::take(&mut state.locked_ops) {
            match op {
                LockedOp::Ping(id, item) => {
                    state.apply_ping(&id, item, now);
                }
                LockedOp::Disconnect(id) => state.apply_disconnect(&id, now),
            }
        }
        state.recompute_deadline(now);
    }
}
