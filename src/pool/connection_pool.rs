//! Bounded connection pool.
//!
//! All bookkeeping lives behind one mutex that is never held across an await.
//! Callers that find the pool at capacity queue up in FIFO order and are handed
//! either a returned connection or a free slot directly, so a late arrival can
//! never overtake someone who has been waiting. Anything handed to a waiter
//! that has since given up flows back into the pool on drop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::metrics::{PoolMetrics, VerificationMetrics};
use super::record::{Handoff, PooledConnection, Record, RecordId, SlotReservation};
use super::retry::create_with_retry;
use super::verification::{FailureOutcome, VerificationConfig};
use super::{ConnectionFactory, PoolConfig, PoolError};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_RECORD_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of [`ConnectionPool::verify_all_connections`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub verified: usize,
    pub failed: usize,
}

/// How a record comes back from a checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Return {
    /// The caller is done with it
    Released,
    /// It failed its checkout probe and goes back flagged
    Unverified,
}

/// A bounded pool of connections produced by a [`ConnectionFactory`].
///
/// Cloning is cheap and every clone refers to the same pool. The pool must be
/// created inside a Tokio runtime since it spawns its reaper immediately.
pub struct ConnectionPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct PoolInner<F: ConnectionFactory> {
    id: u64,
    name: String,
    config: PoolConfig,
    verification: Option<VerificationConfig>,
    factory: F,
    state: Mutex<PoolState<F>>,
    shutdown: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

struct PoolState<F: ConnectionFactory> {
    /// Most recently returned at the back
    idle: VecDeque<Record<F::Connection>>,
    /// Checked-out records and when they left the pool
    active: HashMap<RecordId, Instant>,
    /// Slots reserved for connections that are being opened
    pending: usize,
    /// Idle records pulled out by a verification pass
    maintenance: usize,
    waiters: VecDeque<oneshot::Sender<Handoff<F>>>,
    max_connections: usize,
    /// High-water mark of `total()` since the last interval reset
    peak_connections: usize,
    closed: bool,
    total_created: u64,
    total_destroyed: u64,
    total_acquired: u64,
    total_released: u64,
    total_errors: u64,
    total_wait: Duration,
    verification_failures: u64,
}

impl<F: ConnectionFactory> PoolState<F> {
    fn new(max_connections: usize) -> Self {
        Self {
            idle: VecDeque::with_capacity(max_connections),
            active: HashMap::with_capacity(max_connections),
            pending: 0,
            maintenance: 0,
            waiters: VecDeque::new(),
            max_connections,
            peak_connections: 0,
            closed: false,
            total_created: 0,
            total_destroyed: 0,
            total_acquired: 0,
            total_released: 0,
            total_errors: 0,
            total_wait: Duration::ZERO,
            verification_failures: 0,
        }
    }

    fn total(&self) -> usize {
        self.idle.len() + self.active.len() + self.maintenance
    }

    fn has_capacity(&self) -> bool {
        self.total() + self.pending < self.max_connections
    }

    fn note_peak(&mut self) {
        self.peak_connections = self.peak_connections.max(self.total());
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create a pool. Connections are opened on demand; see [`warm_up`](Self::warm_up).
    pub fn new(name: impl Into<String>, config: PoolConfig, factory: F) -> Result<Self, PoolError> {
        Self::build(name.into(), config, None, factory)
    }

    /// Create a pool whose idle connections are re-validated before reuse.
    pub fn with_verification(
        name: impl Into<String>,
        config: PoolConfig,
        verification: VerificationConfig,
        factory: F,
    ) -> Result<Self, PoolError> {
        Self::build(name.into(), config, Some(verification), factory)
    }

    fn build(
        name: String,
        config: PoolConfig,
        verification: Option<VerificationConfig>,
        factory: F,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        if let Some(ref verification) = verification {
            verification.validate()?;
        }

        tracing::info!(
            pool = %name,
            kind = %factory.kind(),
            min = config.min_connections,
            max = config.max_connections,
            verification = verification.is_some(),
            "Creating connection pool"
        );

        let inner = Arc::new(PoolInner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(PoolState::new(config.max_connections)),
            name,
            config,
            verification,
            factory,
            shutdown: CancellationToken::new(),
            reaper: Mutex::new(None),
        });

        let reaper = spawn_reaper(&inner);
        *inner.reaper.lock().unwrap_or_else(PoisonError::into_inner) = Some(reaper);

        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Current capacity, which may differ from the configured maximum after `resize()`.
    pub fn max_connections(&self) -> usize {
        self.inner.lock().max_connections
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Resolves once [`destroy`](Self::destroy) has started.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }

    /// Check out a connection.
    ///
    /// Reuses a fresh idle connection when there is one, opens a new one when
    /// there is room, and otherwise waits up to `acquire_timeout` for another
    /// caller to give one back.
    pub async fn acquire(&self) -> Result<PooledConnection<F>, PoolError> {
        let started = Instant::now();
        let result = self.inner.acquire_inner(started).await;
        let waited = started.elapsed();

        {
            let mut state = self.inner.lock();
            state.total_wait += waited;
            match result {
                Ok(_) => state.total_acquired += 1,
                Err(_) => state.total_errors += 1,
            }
        }

        match result {
            Ok(ref conn) => {
                tracing::debug!(pool = %self.inner.name, record = %conn.id(), ?waited, "Connection checked out");
            }
            Err(ref e) => {
                tracing::warn!(pool = %self.inner.name, ?waited, "Acquire failed: {}", e);
            }
        }
        result
    }

    /// Give a connection back.
    ///
    /// A connection from another pool is rejected with [`PoolError::NotOwned`]
    /// and goes back to the pool it came from.
    pub async fn release(&self, conn: PooledConnection<F>) -> Result<(), PoolError> {
        if conn.pool_id() != self.inner.id {
            return Err(PoolError::NotOwned {
                pool: self.inner.name.clone(),
                record: conn.id(),
            });
        }

        let record = conn.into_record();
        let id = record.id;
        if let Some((record, reason)) = self.inner.return_record(record, Return::Released) {
            self.inner.destroy_record(record, reason).await;
        } else {
            tracing::debug!(pool = %self.inner.name, record = %id, "Connection returned");
        }
        Ok(())
    }

    /// Probe a checked-out connection. Never fails; a broken probe means `false`.
    pub async fn validate_connection(&self, conn: &mut PooledConnection<F>) -> bool {
        let alive = self.inner.factory.validate(&mut **conn).await;
        if alive && let Some(record) = conn.record_mut() {
            record.last_verified_at = Some(Instant::now());
        }
        alive
    }

    /// Probe every idle connection and destroy the ones that fail.
    ///
    /// Checked-out connections are skipped and counted in neither total.
    pub async fn verify_all_connections(&self) -> VerifyReport {
        // Run the pass on its own task so a caller that stops waiting cannot
        // strand the records it pulled out of the idle set.
        let inner = Arc::clone(&self.inner);
        match tokio::spawn(async move { inner.verify_pass().await }).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(pool = %self.inner.name, "Verification pass aborted: {}", e);
                VerifyReport::default()
            }
        }
    }

    /// Open connections until `min_connections` exist. Returns how many were opened.
    pub async fn warm_up(&self) -> Result<usize, PoolError> {
        let mut opened = 0;
        loop {
            let mut slot = {
                let mut state = self.inner.lock();
                if state.closed {
                    return Err(PoolError::Closed {
                        pool: self.inner.name.clone(),
                    });
                }
                if state.total() + state.pending >= self.inner.config.min_connections
                    || !state.has_capacity()
                {
                    break;
                }
                state.pending += 1;
                SlotReservation::new(Arc::downgrade(&self.inner))
            };

            let record = self.inner.open_record().await?;
            let doomed = {
                let mut state = self.inner.lock();
                slot.disarm();
                state.pending = state.pending.saturating_sub(1);
                if state.closed {
                    Some(record)
                } else {
                    if let Some(record) = self.inner.hand_off_record(&mut state, record) {
                        state.idle.push_back(record);
                        state.note_peak();
                    }
                    None
                }
            };
            if let Some(record) = doomed {
                self.inner.destroy_record(record, "pool closed").await;
                return Err(PoolError::Closed {
                    pool: self.inner.name.clone(),
                });
            }
            opened += 1;
        }

        if opened > 0 {
            tracing::info!(pool = %self.inner.name, opened, "Pool warmed up");
        }
        Ok(opened)
    }

    /// Change the live capacity. Never goes below `min_connections`.
    ///
    /// Growing hands the new room to blocked callers right away. Shrinking
    /// closes surplus idle connections now and surplus checked-out ones as
    /// they come back. Returns the capacity now in effect.
    pub async fn resize(&self, max_connections: usize) -> usize {
        let max_connections = max_connections.max(self.inner.config.min_connections);
        let doomed = {
            let mut state = self.inner.lock();
            if state.closed {
                return state.max_connections;
            }
            let previous = state.max_connections;
            state.max_connections = max_connections;

            let mut doomed = Vec::new();
            while state.total() > max_connections {
                match state.idle.pop_front() {
                    Some(record) => doomed.push(record),
                    None => break,
                }
            }
            self.inner.offer_capacity(&mut state);

            if previous != max_connections {
                tracing::info!(
                    pool = %self.inner.name,
                    from = previous,
                    to = max_connections,
                    "Pool resized"
                );
            }
            doomed
        };

        for record in doomed {
            self.inner.destroy_record(record, "pool shrunk").await;
        }
        max_connections
    }

    pub fn metrics(&self) -> PoolMetrics {
        let state = self.inner.lock();
        self.inner.snapshot(&state, Instant::now())
    }

    /// Like [`metrics`](Self::metrics), then restart the peak-connections
    /// high-water mark from the current total. Each call covers the interval
    /// since the previous one.
    pub fn interval_metrics(&self) -> PoolMetrics {
        let mut state = self.inner.lock();
        let metrics = self.inner.snapshot(&state, Instant::now());
        state.peak_connections = state.total();
        metrics
    }

    /// Shut the pool down.
    ///
    /// Stops the reaper, closes idle connections, fails blocked and future
    /// `acquire()` calls with [`PoolError::Closed`]. Connections still checked
    /// out are closed when they come back. Calling it twice is harmless.
    pub async fn destroy(&self) {
        let (idle, waiters) = {
            let mut state = self.inner.lock();
            if state.closed {
                (Vec::new(), VecDeque::new())
            } else {
                state.closed = true;
                let idle: Vec<_> = state.idle.drain(..).collect();
                (idle, std::mem::take(&mut state.waiters))
            }
        };
        drop(waiters);

        self.inner.shutdown.cancel();
        let reaper = self
            .inner
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = reaper
            && let Err(e) = handle.await
            && !e.is_cancelled()
        {
            tracing::warn!(pool = %self.inner.name, "Reaper task failed: {}", e);
        }

        let closing = idle.len();
        futures::future::join_all(
            idle.into_iter()
                .map(|record| self.inner.destroy_record(record, "pool shutdown")),
        )
        .await;
        tracing::info!(pool = %self.inner.name, closed = closing, "Pool shut down");
    }
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn lock(&self) -> MutexGuard<'_, PoolState<F>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn acquire_inner(
        self: &Arc<Self>,
        started: Instant,
    ) -> Result<PooledConnection<F>, PoolError> {
        enum Next<F: ConnectionFactory> {
            Checkout(PooledConnection<F>),
            Create(SlotReservation<F>, Option<Record<F::Connection>>),
            Wait(oneshot::Receiver<Handoff<F>>),
        }

        let next = {
            let mut state = self.lock();
            if state.closed {
                return Err(self.closed_error());
            }
            let now = Instant::now();
            if let Some(record) = self.take_candidate(&mut state, now) {
                Next::Checkout(self.checkout_guard(&mut state, record, now))
            } else if state.has_capacity() {
                state.pending += 1;
                Next::Create(SlotReservation::new(Arc::downgrade(self)), None)
            } else if let Some(stale) = self.take_unusable(&mut state, now) {
                // Full, but holding an idle record nobody may use: replace it.
                state.pending += 1;
                Next::Create(SlotReservation::new(Arc::downgrade(self)), Some(stale))
            } else {
                state.waiters.retain(|w| !w.is_closed());
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Next::Wait(rx)
            }
        };

        match next {
            Next::Checkout(conn) => self.verify_checkout(conn).await,
            Next::Create(slot, stale) => {
                if let Some(record) = stale {
                    self.destroy_record(record, "replaced stale idle connection")
                        .await;
                }
                self.create_checked_out(slot).await
            }
            Next::Wait(mut rx) => {
                let deadline =
                    tokio::time::Instant::from_std(started + self.config.acquire_timeout);
                let handoff = match tokio::time::timeout_at(deadline, &mut rx).await {
                    Ok(Ok(handoff)) => handoff,
                    Ok(Err(_)) => return Err(self.closed_error()),
                    Err(_) => {
                        // A hand-off may have landed right at the deadline.
                        rx.close();
                        match rx.try_recv() {
                            Ok(handoff) => handoff,
                            Err(_) => {
                                return Err(PoolError::AcquireTimeout {
                                    pool: self.name.clone(),
                                    waited: started.elapsed(),
                                });
                            }
                        }
                    }
                };
                match handoff {
                    Handoff::Connection(conn) => self.verify_checkout(conn).await,
                    Handoff::Slot(slot) => self.create_checked_out(slot).await,
                }
            }
        }
    }

    fn snapshot(&self, state: &PoolState<F>, now: Instant) -> PoolMetrics {
        PoolMetrics {
            total_connections: state.total(),
            active_connections: state.active.len(),
            idle_connections: state.idle.len() + state.maintenance,
            peak_connections: state.peak_connections.max(state.total()),
            max_connections: state.max_connections,
            waiting: state.waiters.iter().filter(|w| !w.is_closed()).count(),
            total_created: state.total_created,
            total_destroyed: state.total_destroyed,
            total_acquired: state.total_acquired,
            total_released: state.total_released,
            total_errors: state.total_errors,
            total_wait: state.total_wait,
            verification: self.verification.as_ref().map(|policy| VerificationMetrics {
                total_verification_failures: state.verification_failures,
                connections_needing_verification: state
                    .idle
                    .iter()
                    .filter(|r| policy.needs_verification(r, now))
                    .count(),
            }),
        }
    }

    fn closed_error(&self) -> PoolError {
        PoolError::Closed {
            pool: self.name.clone(),
        }
    }

    /// Most recently returned idle record that is healthy and not past `idle_timeout`.
    fn take_candidate(
        &self,
        state: &mut PoolState<F>,
        now: Instant,
    ) -> Option<Record<F::Connection>> {
        let pos = state
            .idle
            .iter()
            .rposition(|r| r.healthy && r.idle_for(now) <= self.config.idle_timeout)?;
        state.idle.remove(pos)
    }

    /// Stalest idle record that `take_candidate` would never pick.
    fn take_unusable(
        &self,
        state: &mut PoolState<F>,
        now: Instant,
    ) -> Option<Record<F::Connection>> {
        let pos = state
            .idle
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.healthy || r.idle_for(now) > self.config.idle_timeout)
            .max_by_key(|(_, r)| r.idle_for(now))
            .map(|(pos, _)| pos)?;
        state.idle.remove(pos)
    }

    fn checkout_guard(
        self: &Arc<Self>,
        state: &mut PoolState<F>,
        mut record: Record<F::Connection>,
        now: Instant,
    ) -> PooledConnection<F> {
        record.healthy = true;
        record.last_used_at = now;
        state.active.insert(record.id, now);
        state.note_peak();
        PooledConnection::new(record, Arc::downgrade(self), self.id)
    }

    /// Give `record` to the oldest live waiter. Returns it if nobody is waiting.
    fn hand_off_record(
        self: &Arc<Self>,
        state: &mut PoolState<F>,
        mut record: Record<F::Connection>,
    ) -> Option<Record<F::Connection>> {
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.is_closed() {
                continue;
            }
            let id = record.id;
            let conn = self.checkout_guard(state, record, Instant::now());
            let Err(returned) = waiter.send(Handoff::Connection(conn)) else {
                return None;
            };
            // A failed send gives back exactly what was sent
            let Handoff::Connection(conn) = returned else {
                unreachable!("connection hand-off returned as a slot");
            };
            state.active.remove(&id);
            record = conn.into_record();
        }
        Some(record)
    }

    /// Hand free capacity to waiters as reserved creation slots.
    fn offer_capacity(self: &Arc<Self>, state: &mut PoolState<F>) {
        while state.has_capacity() {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            if waiter.is_closed() {
                continue;
            }
            state.pending += 1;
            let slot = SlotReservation::new(Arc::downgrade(self));
            let Err(returned) = waiter.send(Handoff::Slot(slot)) else {
                continue;
            };
            let Handoff::Slot(mut slot) = returned else {
                unreachable!("slot hand-off returned as a connection");
            };
            slot.disarm();
            state.pending -= 1;
        }
    }

    /// A creation slot was given up without producing a connection.
    pub(crate) fn release_slot(self: &Arc<Self>) {
        let mut state = self.lock();
        state.pending = state.pending.saturating_sub(1);
        self.offer_capacity(&mut state);
    }

    /// Put a checked-out record back. Returns it when it must be destroyed instead.
    fn return_record(
        self: &Arc<Self>,
        mut record: Record<F::Connection>,
        how: Return,
    ) -> Option<(Record<F::Connection>, &'static str)> {
        let mut state = self.lock();
        if state.active.remove(&record.id).is_none() {
            tracing::warn!(pool = %self.name, record = %record.id, "Returned connection was not checked out");
        }
        record.last_used_at = Instant::now();

        if how == Return::Released {
            state.total_released += 1;
            match self.verification {
                Some(ref policy) => policy.on_release(&mut record),
                None if !record.healthy => return Some((record, "released unhealthy")),
                None => {}
            }
        }

        if state.closed {
            return Some((record, "pool closed"));
        }
        if state.total() >= state.max_connections {
            return Some((record, "pool over capacity"));
        }
        if let Some(record) = self.hand_off_record(&mut state, record) {
            state.idle.push_back(record);
        }
        None
    }

    /// Release path for a guard dropped without an explicit `release()`.
    pub(crate) fn return_from_drop(self: &Arc<Self>, record: Record<F::Connection>) {
        let Some((record, reason)) = self.return_record(record, Return::Released) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(self);
                handle.spawn(async move {
                    pool.destroy_record(record, reason).await;
                });
            }
            Err(_) => {
                // No runtime to close it on; dropping the session is all we can do.
                let id = record.id;
                drop(record);
                let mut state = self.lock();
                state.total_destroyed += 1;
                self.offer_capacity(&mut state);
                tracing::debug!(pool = %self.name, record = %id, reason, "Dropped connection without closing");
            }
        }
    }

    /// Close a record that has already left the idle and active sets.
    async fn destroy_record(self: &Arc<Self>, record: Record<F::Connection>, reason: &'static str) {
        let id = record.id;
        if let Err(e) = self.factory.close(record.conn).await {
            tracing::warn!(pool = %self.name, record = %id, "Error closing connection (ignored): {:#}", e);
        }
        {
            let mut state = self.lock();
            state.total_destroyed += 1;
            self.offer_capacity(&mut state);
        }
        tracing::debug!(pool = %self.name, record = %id, reason, "Connection destroyed");
    }

    async fn try_open(&self) -> anyhow::Result<F::Connection> {
        let mut conn = self.factory.create().await?;
        if self.factory.validate(&mut conn).await {
            return Ok(conn);
        }
        if let Err(e) = self.factory.close(conn).await {
            tracing::debug!(pool = %self.name, "Error closing rejected connection: {:#}", e);
        }
        anyhow::bail!(
            "new {} connection failed its liveness check",
            self.factory.kind()
        )
    }

    /// Create and validate a connection, retrying per the pool config.
    async fn open_record(&self) -> Result<Record<F::Connection>, PoolError> {
        let conn = match create_with_retry(&self.name, &self.config, &self.shutdown, || {
            self.try_open()
        })
        .await
        {
            Ok(conn) => conn,
            Err(exhausted) if exhausted.aborted => return Err(self.closed_error()),
            Err(exhausted) => {
                return Err(PoolError::CreationFailed {
                    pool: self.name.clone(),
                    attempts: exhausted.attempts,
                    source: exhausted.source,
                });
            }
        };

        let id = RecordId(NEXT_RECORD_ID.fetch_add(1, Ordering::Relaxed));
        self.lock().total_created += 1;
        tracing::info!(pool = %self.name, record = %id, "Opened new {} connection", self.factory.kind());
        Ok(Record::new(id, conn, Instant::now()))
    }

    async fn create_checked_out(
        self: &Arc<Self>,
        mut slot: SlotReservation<F>,
    ) -> Result<PooledConnection<F>, PoolError> {
        // On error `slot` drops armed and its capacity goes to the next waiter.
        let record = self.open_record().await?;

        let outcome = {
            let mut state = self.lock();
            slot.disarm();
            state.pending = state.pending.saturating_sub(1);
            if state.closed {
                Err(record)
            } else {
                Ok(self.checkout_guard(&mut state, record, Instant::now()))
            }
        };

        match outcome {
            Ok(conn) => Ok(conn),
            Err(record) => {
                self.destroy_record(record, "pool closed").await;
                Err(self.closed_error())
            }
        }
    }

    /// Run the re-validation overlay on a record about to be handed out.
    async fn verify_checkout(
        self: &Arc<Self>,
        mut conn: PooledConnection<F>,
    ) -> Result<PooledConnection<F>, PoolError> {
        let Some(ref policy) = self.verification else {
            return Ok(conn);
        };
        let stale = conn
            .record()
            .is_some_and(|r| policy.needs_verification(r, Instant::now()));
        if !stale {
            return Ok(conn);
        }

        if self.factory.validate(&mut *conn).await {
            if let Some(record) = conn.record_mut() {
                record.last_verified_at = Some(Instant::now());
            }
            return Ok(conn);
        }

        let mut record = conn.into_record();
        let id = record.id;
        let outcome = policy.record_failure(&mut record);
        self.lock().verification_failures += 1;

        match outcome {
            FailureOutcome::Retain { failures } => {
                tracing::warn!(pool = %self.name, record = %id, failures, "Connection failed verification");
                if let Some((record, reason)) = self.return_record(record, Return::Unverified) {
                    self.destroy_record(record, reason).await;
                }
                Err(PoolError::VerificationFailed {
                    pool: self.name.clone(),
                    record: id,
                    failures,
                })
            }
            FailureOutcome::Evict { failures } => {
                tracing::warn!(pool = %self.name, record = %id, failures, "Evicting connection after repeated verification failures");
                self.lock().active.remove(&id);
                self.destroy_record(record, "verification failures exceeded")
                    .await;
                Err(PoolError::VerificationExceeded {
                    pool: self.name.clone(),
                    record: id,
                    failures,
                })
            }
        }
    }

    async fn verify_pass(self: Arc<Self>) -> VerifyReport {
        let batch: Vec<Record<F::Connection>> = {
            let mut state = self.lock();
            if state.closed {
                return VerifyReport::default();
            }
            let batch: Vec<_> = state.idle.drain(..).collect();
            state.maintenance += batch.len();
            batch
        };

        let mut report = VerifyReport::default();
        for mut record in batch {
            let alive = self.factory.validate(&mut record.conn).await;
            let doomed = {
                let mut state = self.lock();
                state.maintenance = state.maintenance.saturating_sub(1);
                if !alive {
                    report.failed += 1;
                    if self.verification.is_some() {
                        state.verification_failures += 1;
                    }
                    Some((record, "failed verification"))
                } else {
                    report.verified += 1;
                    record.last_verified_at = Some(Instant::now());
                    record.verification_failures = 0;
                    if state.closed {
                        Some((record, "pool closed"))
                    } else {
                        if let Some(record) = self.hand_off_record(&mut state, record) {
                            state.idle.push_back(record);
                        }
                        None
                    }
                }
            };
            if let Some((record, reason)) = doomed {
                self.destroy_record(record, reason).await;
            }
        }

        tracing::info!(
            pool = %self.name,
            verified = report.verified,
            failed = report.failed,
            "Verified idle connections"
        );
        report
    }

    /// Destroy idle records past `idle_timeout`, stalest first, down to `min_connections`.
    async fn reap_idle(self: &Arc<Self>) {
        let now = Instant::now();
        let doomed = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            let mut removable = state.total().saturating_sub(self.config.min_connections);
            let mut records: Vec<_> = state.idle.drain(..).collect();
            records.sort_by_key(|r| r.last_used_at);

            let mut doomed = Vec::new();
            for record in records {
                if removable > 0 && record.idle_for(now) > self.config.idle_timeout {
                    removable -= 1;
                    doomed.push(record);
                } else {
                    state.idle.push_back(record);
                }
            }
            doomed
        };

        if !doomed.is_empty() {
            tracing::debug!(pool = %self.name, count = doomed.len(), "Reaping idle connections");
        }
        for record in doomed {
            self.destroy_record(record, "idle timeout").await;
        }
    }
}

impl<F: ConnectionFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn spawn_reaper<F: ConnectionFactory>(inner: &Arc<PoolInner<F>>) -> JoinHandle<()> {
    let pool = Arc::downgrade(inner);
    let shutdown = inner.shutdown.clone();
    let period = inner.config.health_check_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(pool) = pool.upgrade() else {
                break;
            };
            pool.reap_idle().await;
        }
    })
}
