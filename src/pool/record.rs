//! Per-connection bookkeeping and the guard lent to callers.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Weak;
use std::time::Instant;

use super::ConnectionFactory;
use super::connection_pool::PoolInner;

/// Identifier of one pooled connection, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A live connection plus the state the pool tracks about it.
pub(crate) struct Record<C> {
    pub id: RecordId,
    pub conn: C,
    /// Cleared by a caller that saw the connection misbehave
    pub healthy: bool,
    pub created_at: Instant,
    pub last_used_at: Instant,
    /// Consecutive failed re-validations (verification overlay only)
    pub verification_failures: u32,
    /// `None` forces a re-validation before the next checkout
    pub last_verified_at: Option<Instant>,
}

impl<C> Record<C> {
    /// A freshly created connection has just passed its liveness check.
    pub fn new(id: RecordId, conn: C, now: Instant) -> Self {
        Self {
            id,
            conn,
            healthy: true,
            created_at: now,
            last_used_at: now,
            verification_failures: 0,
            last_verified_at: Some(now),
        }
    }

    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_used_at)
    }
}

/// A connection checked out of a [`ConnectionPool`](super::ConnectionPool).
///
/// Dereferences to the underlying protocol client. Hand it back with
/// [`ConnectionPool::release`](super::ConnectionPool::release); dropping it
/// without releasing returns it to the pool as well, so early returns and `?`
/// never leak a connection. Call [`mark_unhealthy`](Self::mark_unhealthy)
/// before releasing if the session misbehaved.
pub struct PooledConnection<F: ConnectionFactory> {
    record: Option<Record<F::Connection>>,
    pool: Weak<PoolInner<F>>,
    pool_id: u64,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    pub(crate) fn new(
        record: Record<F::Connection>,
        pool: Weak<PoolInner<F>>,
        pool_id: u64,
    ) -> Self {
        Self {
            record: Some(record),
            pool,
            pool_id,
        }
    }

    pub fn id(&self) -> RecordId {
        self.live().id
    }

    /// Flag the connection as broken; the pool will not trust it again
    /// without re-validating it.
    pub fn mark_unhealthy(&mut self) {
        if let Some(record) = self.record.as_mut() {
            record.healthy = false;
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.live().healthy
    }

    pub fn created_at(&self) -> Instant {
        self.live().created_at
    }

    /// Failed re-validations carried over from earlier checkouts.
    pub fn verification_failures(&self) -> u32 {
        self.live().verification_failures
    }

    fn live(&self) -> &Record<F::Connection> {
        match self.record.as_ref() {
            Some(record) => record,
            None => unreachable!("pooled connection accessed after release"),
        }
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub(crate) fn record(&self) -> Option<&Record<F::Connection>> {
        self.record.as_ref()
    }

    pub(crate) fn record_mut(&mut self) -> Option<&mut Record<F::Connection>> {
        self.record.as_mut()
    }

    /// Take the record out, disarming the return-on-drop.
    pub(crate) fn into_record(mut self) -> Record<F::Connection> {
        match self.record.take() {
            Some(record) => record,
            None => unreachable!("pooled connection accessed after release"),
        }
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        &self.live().conn
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.record.as_mut() {
            Some(record) => &mut record.conn,
            None => unreachable!("pooled connection accessed after release"),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.record.as_ref().map(|r| r.id))
            .field("healthy", &self.record.as_ref().map(|r| r.healthy))
            .field("pool_id", &self.pool_id)
            .finish()
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        let Some(record) = self.record.take() else {
            return;
        };
        if let Some(pool) = self.pool.upgrade() {
            pool.return_from_drop(record);
        }
    }
}

/// A reserved slot for creating one new connection.
///
/// Dropping an armed reservation gives the slot back and offers it to the next
/// waiter, so a cancelled `acquire()` never shrinks the pool's capacity.
pub(crate) struct SlotReservation<F: ConnectionFactory> {
    pool: Weak<PoolInner<F>>,
    armed: bool,
}

impl<F: ConnectionFactory> SlotReservation<F> {
    pub fn new(pool: Weak<PoolInner<F>>) -> Self {
        Self { pool, armed: true }
    }

    /// The slot has been consumed (or returned) by the caller holding the lock.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<F: ConnectionFactory> Drop for SlotReservation<F> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.release_slot();
        }
    }
}

/// What a blocked `acquire()` receives from the pool.
pub(crate) enum Handoff<F: ConnectionFactory> {
    /// An idle connection, already checked out to the waiter
    Connection(PooledConnection<F>),
    /// Capacity to open a new connection
    Slot(SlotReservation<F>),
}
