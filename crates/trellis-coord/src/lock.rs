use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use trellis_common::config::LockTimeouts;
use trellis_common::{CoordError, CoordResult, OperationClass};

/// Proof of holding the lock on `resource_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTicket {
    ticket_id: Uuid,
    resource_key: String,
    class: OperationClass,
    holder_id: String,
    acquired_at: Instant,
    expires_at: Instant,
}

impl LockTicket {
    pub fn ticket_id(&self) -> Uuid {
        self.ticket_id
    }

    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    pub fn class(&self) -> OperationClass {
        self.class
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

struct Waiter {
    id: Uuid,
    holder_id: String,
    class: OperationClass,
    tx: oneshot::Sender<LockTicket>,
}

#[derive(Default)]
struct ResourceState {
    holder: Option<LockTicket>,
    waiters: VecDeque<Waiter>,
}

impl ResourceState {
    fn is_idle(&self) -> bool {
        self.holder.is_none() && self.waiters.is_empty()
    }

    fn involves(&self, holder_id: &str) -> bool {
        self.holder.as_ref().is_some_and(|t| t.holder_id == holder_id)
            || self.waiters.iter().any(|w| w.holder_id == holder_id)
    }
}

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicU64,
    contended: AtomicU64,
    timeouts: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockStats {
    pub acquired: u64,
    /// Acquisitions that had to queue.
    pub contended: u64,
    pub timeouts: u64,
    /// Holders removed because their lease ran out.
    pub evictions: u64,
}

pub struct LockCoordinator {
    resources: DashMap<String, ResourceState>,
    timeouts: LockTimeouts,
    lease: Duration,
    counters: Counters,
}

impl fmt::Debug for LockCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockCoordinator")
            .field("resources", &self.resources.len())
            .field("timeouts", &self.timeouts)
            .field("lease", &self.lease)
            .finish()
    }
}

impl LockCoordinator {
    pub fn new(timeouts: LockTimeouts, lease: Duration) -> Self {
        Self {
            resources: DashMap::new(),
            timeouts,
            lease,
            counters: Counters::default(),
        }
    }

    pub fn timeouts(&self) -> &LockTimeouts {
        &self.timeouts
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            contended: self.counters.contended.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    /// Whether a live ticket exists for `resource_key`.
    pub fn is_locked(&self, resource_key: &str) -> bool {
        let now = Instant::now();
        self.resources
            .get(resource_key)
            .and_then(|s| s.holder.as_ref().map(|t| !t.is_expired_at(now)))
            .unwrap_or(false)
    }

    pub fn waiting(&self, resource_key: &str) -> usize {
        self.resources
            .get(resource_key)
            .map(|s| s.waiters.len())
            .unwrap_or(0)
    }

    fn issue(
        &self,
        resource_key: &str,
        ticket_id: Uuid,
        holder_id: String,
        class: OperationClass,
        now: Instant,
    ) -> LockTicket {
        LockTicket {
            ticket_id,
            resource_key: resource_key.to_string(),
            class,
            holder_id,
            acquired_at: now,
            expires_at: now + self.lease,
        }
    }

    /// Evicts an expired holder, then hands the lock to the first waiter
    /// still listening.
    fn promote(&self, resource_key: &str, state: &mut ResourceState, now: Instant) {
        if let Some(holder) = state.holder.as_ref().filter(|t| t.is_expired_at(now)) {
            tracing::warn!(
                resource_key,
                holder_id = %holder.holder_id,
                class = %holder.class,
                "lock lease expired, evicting holder"
            );
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            state.holder = None;
        }

        while state.holder.is_none() {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            let ticket = self.issue(resource_key, waiter.id, waiter.holder_id, waiter.class, now);
            if waiter.tx.send(ticket.clone()).is_ok() {
                self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                state.holder = Some(ticket);
            }
        }
    }

    fn holder_expiry(&self, resource_key: &str) -> Option<Instant> {
        self.resources
            .get(resource_key)
            .and_then(|s| s.holder.as_ref().map(|t| t.expires_at))
    }

    fn drop_if_idle(&self, resource_key: &str) {
        self.resources.remove_if(resource_key, |_, s| s.is_idle());
    }

    /// Acquires the lock on `resource_key` for `holder_id`, waiting at most
    /// the timeout configured for `class`.
    ///
    /// Fails immediately with `LockReentry` if `holder_id` already holds or
    /// waits for this key.
    pub async fn acquire(
        &self,
        holder_id: &str,
        resource_key: &str,
        class: OperationClass,
    ) -> CoordResult<LockTicket> {
        if resource_key.is_empty() {
            return Err(CoordError::invalid_scope("lock resource key must not be empty"));
        }
        if holder_id.is_empty() {
            return Err(CoordError::invalid_scope("lock holder id must not be empty"));
        }

        let timeout = self.timeouts.timeout_for(class);
        let started = Instant::now();
        let deadline = started + timeout;

        let (waiter_id, rx) = {
            let mut state = self.resources.entry(resource_key.to_string()).or_default();
            self.promote(resource_key, &mut state, started);

            if state.involves(holder_id) {
                return Err(CoordError::LockReentry {
                    resource_key: resource_key.to_string(),
                    holder_id: holder_id.to_string(),
                });
            }

            if state.is_idle() {
                let ticket = self.issue(resource_key, Uuid::new_v4(), holder_id.to_string(), class, started);
                state.holder = Some(ticket.clone());
                self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(resource_key, holder_id, %class, "lock acquired");
                return Ok(ticket);
            }

            let (tx, rx) = oneshot::channel();
            let id = Uuid::new_v4();
            state.waiters.push_back(Waiter {
                id,
                holder_id: holder_id.to_string(),
                class,
                tx,
            });
            (id, rx)
        };

        self.counters.contended.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(resource_key, holder_id, %class, "lock busy, queued");

        let mut pending = PendingWait {
            coordinator: self,
            resource_key,
            waiter_id,
            rx,
            settled: false,
        };

        loop {
            let wake_at = self
                .holder_expiry(resource_key)
                .map(|e| e.min(deadline))
                .unwrap_or(deadline);

            tokio::select! {
                granted = &mut pending.rx => {
                    pending.settled = true;
                    return match granted {
                        Ok(ticket) => Ok(ticket),
                        // The coordinator never drops a queued sender without
                        // granting, so a closed channel means the state is gone.
                        Err(_) => Err(self.timeout_error(resource_key, class, started)),
                    };
                }
                _ = tokio::time::sleep_until(wake_at) => {}
            }

            let now = Instant::now();
            if let Some(mut state) = self.resources.get_mut(resource_key) {
                self.promote(resource_key, &mut state, now);
            }
            if let Ok(ticket) = pending.rx.try_recv() {
                pending.settled = true;
                return Ok(ticket);
            }

            if now >= deadline {
                // Granted in the same instant we gave up: keep the ticket.
                if let Some(ticket) = pending.withdraw() {
                    return Ok(ticket);
                }
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    resource_key,
                    holder_id,
                    %class,
                    timeout_ms = timeout.as_millis() as u64,
                    "lock acquisition timed out"
                );
                return Err(self.timeout_error(resource_key, class, started));
            }
        }
    }

    fn timeout_error(&self, resource_key: &str, class: OperationClass, started: Instant) -> CoordError {
        CoordError::LockTimeout {
            resource_key: resource_key.to_string(),
            class,
            waited_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Releases `ticket`. Returns `false` if the ticket is no longer the
    /// live holder (its lease expired and the lock moved on).
    pub fn release(&self, ticket: &LockTicket) -> bool {
        let key = ticket.resource_key.as_str();
        let released = match self.resources.get_mut(key) {
            Some(mut state) => {
                if state.holder.as_ref().is_some_and(|h| h.ticket_id == ticket.ticket_id) {
                    state.holder = None;
                    self.promote(key, &mut state, Instant::now());
                    true
                } else {
                    false
                }
            }
            None => false,
        };

        if released {
            tracing::trace!(resource_key = key, holder_id = %ticket.holder_id, "lock released");
        } else {
            tracing::warn!(
                resource_key = key,
                holder_id = %ticket.holder_id,
                "released a ticket that no longer holds the lock"
            );
        }
        self.drop_if_idle(key);
        released
    }

    /// Acquires and wraps the ticket in a guard that releases on drop.
    pub async fn lock(
        self: &Arc<Self>,
        holder_id: &str,
        resource_key: &str,
        class: OperationClass,
    ) -> CoordResult<LockGuard> {
        let ticket = self.acquire(holder_id, resource_key, class).await?;
        Ok(LockGuard {
            coordinator: Arc::clone(self),
            ticket,
            released: false,
        })
    }

    /// Runs `body` while holding the lock. The lock is released on every exit
    /// path, including errors, panics and cancellation of the returned future.
    pub async fn with_lock<T, E, F, Fut>(
        self: &Arc<Self>,
        holder_id: &str,
        resource_key: &str,
        class: OperationClass,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CoordError>,
    {
        let guard = self.lock(holder_id, resource_key, class).await?;
        let out = body().await;
        guard.release();
        out
    }
}

/// Queue membership of an in-progress `acquire`. Dropping it before it
/// settles (the acquire future was cancelled) leaves the queue, and releases
/// any ticket that was granted in the meantime.
struct PendingWait<'a> {
    coordinator: &'a LockCoordinator,
    resource_key: &'a str,
    waiter_id: Uuid,
    rx: oneshot::Receiver<LockTicket>,
    settled: bool,
}

impl PendingWait<'_> {
    /// Leaves the queue. Returns the ticket if the grant already happened.
    fn withdraw(&mut self) -> Option<LockTicket> {
        self.settled = true;
        let granted = match self.coordinator.resources.get_mut(self.resource_key) {
            Some(mut state) => {
                let before = state.waiters.len();
                state.waiters.retain(|w| w.id != self.waiter_id);
                if state.waiters.len() < before {
                    None
                } else {
                    self.rx.try_recv().ok()
                }
            }
            None => self.rx.try_recv().ok(),
        };
        if granted.is_none() {
            self.coordinator.drop_if_idle(self.resource_key);
        }
        granted
    }
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(ticket) = self.withdraw() {
            tracing::debug!(resource_key = self.resource_key, "acquire cancelled after grant, releasing");
            self.coordinator.release(&ticket);
        }
    }
}

/// Releases its ticket when dropped.
pub struct LockGuard {
    coordinator: Arc<LockCoordinator>,
    ticket: LockTicket,
    released: bool,
}

impl LockGuard {
    pub fn ticket(&self) -> &LockTicket {
        &self.ticket
    }

    /// Releases now instead of at drop. Returns whether the ticket was still
    /// the live holder.
    pub fn release(mut self) -> bool {
        self.released = true;
        self.coordinator.release(&self.ticket)
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("ticket", &self.ticket).finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            self.coordinator.release(&self.ticket);
        }
    }
}
