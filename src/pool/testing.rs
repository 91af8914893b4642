//! In-memory connection factory for pool tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{ConnectionFactory, ConnectionKind, PoolConfig};

/// Small pool with short timers so tests finish quickly.
pub(crate) fn quick_config() -> PoolConfig {
    PoolConfig {
        min_connections: 1,
        max_connections: 2,
        acquire_timeout: Duration::from_millis(100),
        idle_timeout: Duration::from_secs(60),
        max_retries: 2,
        retry_delay: Duration::from_millis(5),
        health_check_interval: Duration::from_secs(60),
    }
}

#[derive(Debug)]
pub(crate) struct MockConnection {
    pub serial: u64,
}

#[derive(Default)]
struct MockState {
    next_serial: AtomicU64,
    create_calls: AtomicU64,
    created: AtomicU64,
    closed: AtomicU64,
    validations: AtomicU64,
    fail_creates: AtomicU32,
    reject_all: AtomicBool,
    fail_close: AtomicBool,
    dead: Mutex<HashSet<u64>>,
}

/// Cloning shares the counters, so a test keeps one handle while the pool owns another.
#[derive(Clone, Default)]
pub(crate) struct MockFactory {
    state: Arc<MockState>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_creates(&self, count: u32) {
        self.state.fail_creates.store(count, Ordering::SeqCst);
    }

    /// Every liveness probe fails while set.
    pub fn set_reject_all(&self, reject: bool) {
        self.state.reject_all.store(reject, Ordering::SeqCst);
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.state.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn kill(&self, serial: u64) {
        self.state.dead.lock().unwrap().insert(serial);
    }

    pub fn revive(&self, serial: u64) {
        self.state.dead.lock().unwrap().remove(&serial);
    }

    pub fn create_calls(&self) -> u64 {
        self.state.create_calls.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> u64 {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u64 {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn validations(&self) -> u64 {
        self.state.validations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::MessageStore
    }

    async fn create(&self) -> anyhow::Result<MockConnection> {
        self.state.create_calls.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .state
            .fail_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            anyhow::bail!("connection refused");
        }
        let serial = self.state.next_serial.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.created.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection { serial })
    }

    async fn validate(&self, conn: &mut MockConnection) -> bool {
        self.state.validations.fetch_add(1, Ordering::SeqCst);
        if self.state.reject_all.load(Ordering::SeqCst) {
            return false;
        }
        !self.state.dead.lock().unwrap().contains(&conn.serial)
    }

    async fn close(&self, _conn: MockConnection) -> anyhow::Result<()> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_close.load(Ordering::SeqCst) {
            anyhow::bail!("broken pipe");
        }
        Ok(())
    }
}
