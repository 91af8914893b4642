//! Process-wide registry that resizes pools from their recent usage.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::constants::{DECISION_CHANNEL_CAPACITY, SIZING_HISTORY_LIMIT};
use crate::pool::{ConnectionFactory, ConnectionPool};

use super::window::{WindowStats, propose_max};
use super::{DynamicPoolConfig, ScaleDecision, UsageSample};

struct PoolEntry {
    config: DynamicPoolConfig,
    history: VecDeque<UsageSample>,
    last_scale_action: Option<Instant>,
}

/// Registry of named pool configurations and their usage history.
///
/// The controller owns configuration snapshots, not pools. Every applied
/// change is published as a [`ScaleDecision`]; [`attach`](Self::attach)
/// connects a live pool so it follows those decisions.
pub struct SizingController {
    pools: RwLock<HashMap<String, Arc<Mutex<PoolEntry>>>>,
    decisions: broadcast::Sender<ScaleDecision>,
}

impl Default for SizingController {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_entry(entry: &Mutex<PoolEntry>) -> MutexGuard<'_, PoolEntry> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SizingController {
    pub fn new() -> Self {
        let (decisions, _) = broadcast::channel(DECISION_CHANNEL_CAPACITY);
        Self {
            pools: RwLock::new(HashMap::new()),
            decisions,
        }
    }

    /// The shared instance used by the daemon.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<SizingController>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Register (or re-register) a pool. History starts empty.
    ///
    /// A `max_connections` outside the effective range is clamped into it.
    pub fn register_pool(&self, name: impl Into<String>, mut config: DynamicPoolConfig) {
        let name = name.into();
        if let Some(requested) = config.clamp_to_effective_range() {
            tracing::warn!(
                pool = %name,
                requested,
                clamped = config.pool.max_connections,
                "max_connections outside the effective range, clamped"
            );
        }
        tracing::info!(
            pool = %name,
            max = config.pool.max_connections,
            min_effective = config.min_effective_connections,
            max_effective = config.max_effective_connections,
            adaptive = config.adaptive_scaling,
            "Registered pool with sizing controller"
        );
        let entry = PoolEntry {
            config,
            history: VecDeque::with_capacity(SIZING_HISTORY_LIMIT),
            last_scale_action: None,
        };
        self.pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(Mutex::new(entry)));
    }

    /// Record a usage sample. Returns `false` if the pool is not registered.
    pub fn update_pool_stats(&self, name: &str, sample: UsageSample) -> bool {
        let Some(entry) = self.entry(name) else {
            tracing::debug!(pool = %name, "Usage sample for unregistered pool dropped");
            return false;
        };
        let mut entry = lock_entry(&entry);
        if entry.history.len() >= SIZING_HISTORY_LIMIT {
            entry.history.pop_front();
        }
        entry.history.push_back(sample);
        true
    }

    pub fn pool_config(&self, name: &str) -> Option<DynamicPoolConfig> {
        let entry = self.entry(name)?;
        let config = lock_entry(&entry).config.clone();
        Some(config)
    }

    /// Samples currently in the window, oldest first.
    pub fn pool_stats(&self, name: &str) -> Vec<UsageSample> {
        let Some(entry) = self.entry(name) else {
            return Vec::new();
        };
        let history = lock_entry(&entry).history.iter().copied().collect();
        history
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScaleDecision> {
        self.decisions.subscribe()
    }

    fn entry(&self, name: &str) -> Option<Arc<Mutex<PoolEntry>>> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Evaluate every pool once.
    pub fn tick(&self) -> Vec<ScaleDecision> {
        self.tick_at(Instant::now())
    }

    /// Evaluate every pool as of `now`. Returns the decisions applied.
    pub fn tick_at(&self, now: Instant) -> Vec<ScaleDecision> {
        let entries: Vec<(String, Arc<Mutex<PoolEntry>>)> = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
            .collect();

        let mut applied = Vec::new();
        for (name, entry) in entries {
            let decision = {
                let mut entry = lock_entry(&entry);
                evaluate(&name, &mut entry, now)
            };
            if let Some(decision) = decision {
                tracing::info!(
                    pool = %decision.pool,
                    direction = %decision.direction,
                    from = decision.old_max,
                    to = decision.new_max,
                    utilization = decision.avg_utilization,
                    wait_ms = decision.avg_wait_ms,
                    error_rate = decision.avg_error_rate,
                    peak = decision.peak_connections,
                    "Scaling pool"
                );
                // No subscribers is fine; the snapshot is already updated.
                let _ = self.decisions.send(decision.clone());
                applied.push(decision);
            }
        }
        applied
    }

    /// Run `tick()` every `every` until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.tick();
                    }
                }
            }
            tracing::debug!("Sizing controller stopped");
        })
    }

    /// Keep `pool` sized to the decisions published for `name`.
    ///
    /// The pool is first brought in line with the stored snapshot. The task
    /// ends when the pool is destroyed.
    pub fn attach<F: ConnectionFactory>(
        self: &Arc<Self>,
        name: impl Into<String>,
        pool: ConnectionPool<F>,
    ) -> JoinHandle<()> {
        let name = name.into();
        let controller = Arc::clone(self);
        let mut decisions = self.subscribe();

        tokio::spawn(async move {
            controller.sync_pool(&name, &pool).await;
            loop {
                tokio::select! {
                    _ = pool.closed() => break,
                    received = decisions.recv() => match received {
                        Ok(decision) if decision.pool == name => {
                            pool.resize(decision.new_max).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(pool = %name, skipped, "Missed scale decisions, resyncing");
                            controller.sync_pool(&name, &pool).await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!(pool = %name, "Detached from sizing controller");
        })
    }

    async fn sync_pool<F: ConnectionFactory>(&self, name: &str, pool: &ConnectionPool<F>) {
        let Some(config) = self.pool_config(name) else {
            return;
        };
        let target = config.pool.max_connections;
        if pool.max_connections() != target {
            pool.resize(target).await;
        }
    }
}

fn evaluate(name: &str, entry: &mut PoolEntry, now: Instant) -> Option<ScaleDecision> {
    if !entry.config.adaptive_scaling {
        return None;
    }
    let stats = WindowStats::from_samples(&entry.history)?;

    if let Some(last) = entry.last_scale_action
        && now.saturating_duration_since(last) < entry.config.scale_down_delay
    {
        tracing::trace!(pool = %name, "Sizing cooldown in effect");
        return None;
    }

    let (direction, new_max) = propose_max(&entry.config, &stats)?;
    let old_max = entry.config.pool.max_connections;
    entry.config.pool.max_connections = new_max;
    entry.last_scale_action = Some(now);

    Some(ScaleDecision {
        pool: name.to_string(),
        direction,
        old_max,
        new_max,
        avg_utilization: stats.avg_utilization,
        avg_wait_ms: stats.avg_wait_ms,
        avg_error_rate: stats.avg_error_rate,
        peak_connections: stats.peak_connections,
        at: chrono::Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ConnectionKind;
    use crate::pool::testing::{MockFactory, quick_config};
    use crate::sizing::ScaleDirection;

    fn busy() -> UsageSample {
        UsageSample {
            average_wait_time_ms: 1500.0,
            peak_connections: 4,
            utilization_rate: 90.0,
            error_rate: 0.02,
            requests_per_minute: 40.0,
        }
    }

    fn quiet() -> UsageSample {
        UsageSample {
            average_wait_time_ms: 100.0,
            peak_connections: 1,
            utilization_rate: 20.0,
            error_rate: 0.0,
            requests_per_minute: 2.0,
        }
    }

    fn config_with_max(max: usize) -> DynamicPoolConfig {
        let mut config = DynamicPoolConfig::recommended(ConnectionKind::MessageStore);
        config.pool.max_connections = max;
        config.min_effective_connections = 2;
        config.max_effective_connections = 8;
        config
    }

    fn feed(controller: &SizingController, name: &str, sample: UsageSample, count: usize) {
        for _ in 0..count {
            assert!(controller.update_pool_stats(name, sample));
        }
    }

    #[test]
    fn test_scale_up_from_four_to_six() {
        let controller = SizingController::new();
        controller.register_pool("imap", config_with_max(4));
        feed(&controller, "imap", busy(), 3);

        let decisions = controller.tick_at(Instant::now());
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].direction, ScaleDirection::Up);
        assert_eq!((decisions[0].old_max, decisions[0].new_max), (4, 6));
        assert_eq!(
            controller.pool_config("imap").unwrap().pool.max_connections,
            6
        );
    }

    #[test]
    fn test_oversized_pool_is_clamped_not_shrunk_by_busy_window() {
        let controller = SizingController::new();
        controller.register_pool("imap", config_with_max(10));
        assert_eq!(
            controller.pool_config("imap").unwrap().pool.max_connections,
            8
        );

        let saturated = UsageSample {
            utilization_rate: 95.0,
            error_rate: 0.0,
            ..busy()
        };
        feed(&controller, "imap", saturated, 3);
        assert!(controller.tick_at(Instant::now()).is_empty());
        assert_eq!(
            controller.pool_config("imap").unwrap().pool.max_connections,
            8
        );
    }

    #[test]
    fn test_scale_down_from_six_to_four() {
        let controller = SizingController::new();
        controller.register_pool("imap", config_with_max(6));
        feed(&controller, "imap", quiet(), 3);

        let decisions = controller.tick_at(Instant::now());
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].direction, ScaleDirection::Down);
        assert_eq!(decisions[0].new_max, 4);
    }

    #[test]
    fn test_too_few_samples_skipped() {
        let controller = SizingController::new();
        controller.register_pool("imap", config_with_max(4));
        feed(&controller, "imap", busy(), 2);

        assert!(controller.tick_at(Instant::now()).is_empty());
        assert_eq!(
            controller.pool_config("imap").unwrap().pool.max_connections,
            4
        );
    }

    #[test]
    fn test_cooldown_applies_to_both_directions() {
        let controller = SizingController::new();
        controller.register_pool("imap", config_with_max(4));
        feed(&controller, "imap", busy(), 3);

        let start = Instant::now();
        assert_eq!(controller.tick_at(start).len(), 1);

        // Still qualifies for another scale-up, but inside the cooldown.
        assert!(controller.tick_at(start + Duration::from_secs(60)).is_empty());

        // The load drops; a scale-down is also held back by the same cooldown.
        feed(&controller, "imap", quiet(), 10);
        assert!(controller.tick_at(start + Duration::from_secs(119)).is_empty());

        let decisions = controller.tick_at(start + Duration::from_secs(121));
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].direction, ScaleDirection::Down);
        assert_eq!((decisions[0].old_max, decisions[0].new_max), (6, 4));
    }

    #[test]
    fn test_history_capped_at_limit() {
        let controller = SizingController::new();
        controller.register_pool("smtp", config_with_max(2));
        for n in 0..15 {
            let sample = UsageSample {
                requests_per_minute: n as f64,
                ..quiet()
            };
            controller.update_pool_stats("smtp", sample);
        }

        let stats = controller.pool_stats("smtp");
        assert_eq!(stats.len(), SIZING_HISTORY_LIMIT);
        assert_eq!(stats[0].requests_per_minute, 5.0);
        assert_eq!(stats[9].requests_per_minute, 14.0);
    }

    #[test]
    fn test_unknown_pool() {
        let controller = SizingController::new();
        assert!(!controller.update_pool_stats("nope", busy()));
        assert!(controller.pool_config("nope").is_none());
        assert!(controller.pool_stats("nope").is_empty());
    }

    #[test]
    fn test_reregistering_clears_history() {
        let controller = SizingController::new();
        controller.register_pool("imap", config_with_max(4));
        feed(&controller, "imap", busy(), 3);
        controller.register_pool("imap", config_with_max(4));
        assert!(controller.pool_stats("imap").is_empty());
    }

    #[test]
    fn test_disabled_pool_never_scaled() {
        let controller = SizingController::new();
        let mut config = config_with_max(4);
        config.adaptive_scaling = false;
        controller.register_pool("imap", config);
        feed(&controller, "imap", busy(), 5);
        assert!(controller.tick_at(Instant::now()).is_empty());
    }

    #[test]
    fn test_pools_evaluated_independently() {
        let controller = SizingController::new();
        controller.register_pool("imap", config_with_max(4));
        controller.register_pool("smtp", config_with_max(4));
        feed(&controller, "imap", busy(), 3);
        feed(&controller, "smtp", UsageSample::default(), 1);

        let decisions = controller.tick_at(Instant::now());
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].pool, "imap");
    }

    #[tokio::test]
    async fn test_decisions_are_published() {
        let controller = SizingController::new();
        let mut rx = controller.subscribe();
        controller.register_pool("imap", config_with_max(4));
        feed(&controller, "imap", busy(), 3);
        controller.tick();

        let decision = rx.recv().await.unwrap();
        assert_eq!(decision.pool, "imap");
        assert_eq!(decision.new_max, 6);
    }

    #[tokio::test]
    async fn test_attach_resizes_live_pool() {
        let controller = Arc::new(SizingController::new());
        let pool = ConnectionPool::new("imap", quick_config(), MockFactory::new()).unwrap();
        assert_eq!(pool.max_connections(), 2);

        // Attaching brings the pool in line with the stored snapshot.
        controller.register_pool("imap", config_with_max(4));
        let handle = controller.attach("imap", pool.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.max_connections(), 4);

        feed(&controller, "imap", busy(), 3);
        controller.tick();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.max_connections(), 6);

        pool.destroy().await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_spawned_controller_stops_on_shutdown() {
        let controller = Arc::new(SizingController::new());
        let shutdown = CancellationToken::new();
        let handle = Arc::clone(&controller).spawn(Duration::from_millis(10), shutdown.clone());

        controller.register_pool("imap", config_with_max(4));
        feed(&controller, "imap", busy(), 3);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            controller.pool_config("imap").unwrap().pool.max_connections,
            6
        );

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
