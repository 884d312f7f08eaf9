use chrono::Utc;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{PanelConfig, TargetConfig};
use crate::models::{CycleOutcome, Status};
use crate::probe::Prober;
use crate::store::StatusStore;

/// Counters describing scheduler activity.
#[derive(Debug, Default)]
pub struct CycleStats {
    pub started: AtomicU64,
    pub completed: AtomicU64,
    pub skipped: AtomicU64,
}

/// Runs a probe cycle every poll interval, never more than one at a time.
pub struct PollScheduler<P: Prober> {
    config: Arc<PanelConfig>,
    prober: Arc<P>,
    store: StatusStore,
    in_flight: Arc<AtomicBool>,
    stats: Arc<CycleStats>,
}

/// Clears the in-flight flag when a cycle ends, including when its task is aborted.
struct CycleGuard {
    in_flight: Arc<AtomicBool>,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}

impl<P: Prober> PollScheduler<P> {
    pub fn new(config: Arc<PanelConfig>, prober: Arc<P>, store: StatusStore) -> Self {
        Self {
            config,
            prober,
            store,
            in_flight: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(CycleStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<CycleStats> {
        Arc::clone(&self.stats)
    }

    /// Ticks forever. The first tick fires immediately.
    pub async fn run(self) {
        let period = self.config.poll_interval();
        info!("Poll scheduler active, probing every {}s", period.as_secs());

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let Some(guard) = self.try_begin() else {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                warn!("Previous probe cycle still running, skipping this tick");
                continue;
            };

            self.stats.started.fetch_add(1, Ordering::Relaxed);
            let config = Arc::clone(&self.config);
            let prober = Arc::clone(&self.prober);
            let store = self.store.clone();
            let stats = Arc::clone(&self.stats);
            tokio::spawn(async move {
                let _guard = guard;
                run_cycle(&config, prober.as_ref(), &store).await;
                stats.completed.fetch_add(1, Ordering::Relaxed);
            });
        }
    }

    fn try_begin(&self) -> Option<CycleGuard> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleGuard {
                in_flight: Arc::clone(&self.in_flight),
            })
    }
}

/// Probes every target plus the uplink speed, applies the results in one
/// store update and persists the store.
pub async fn run_cycle<P: Prober>(config: &PanelConfig, prober: &P, store: &StatusStore) {
    let start_time = Utc::now();
    let timeout = config.probe_timeout();

    let gate = probe_with_retry(prober, &config.gate, timeout, true);
    let services = join_all(
        config
            .services
            .iter()
            .map(|svc| async move { (svc.name.clone(), probe_with_retry(prober, svc, timeout, false).await) }),
    );
    let (gate, services, speed) = tokio::join!(gate, services, prober.measure_speed());

    let outcome = CycleOutcome { gate, services, speed };
    let changes = store.apply_update(|doc| outcome.apply_to(doc)).await;

    for change in &changes {
        let msg = format!("[CHANGE] {} {} -> {}", change.name, change.old, change.new);
        if change.new == Status::Down {
            error!("{}", msg);
        } else {
            warn!("{}", msg);
        }
    }

    if let Err(e) = store.persist(&config.state_file).await {
        error!("Failed to persist panel state: {:#}", e);
    }

    let duration = Utc::now() - start_time;
    info!(
        "Probe cycle completed {} checks in {:.2}s.",
        config.services.len() + 2,
        duration.num_milliseconds() as f64 / 1000.0
    );
}

async fn probe_with_retry<P: Prober>(prober: &P, target: &TargetConfig, timeout: Duration, gate: bool) -> Status {
    let mut status = probe_once(prober, target, timeout, gate).await;
    for attempt in 1..=target.max_retries {
        if status.is_up() {
            break;
        }
        debug!("Retrying {} (attempt {})", target.name, attempt);
        tokio::time::sleep(Duration::from_millis(50)).await;
        status = probe_once(prober, target, timeout, gate).await;
    }
    status
}

/// The gate is always pinged; services use a port probe when they name a port.
async fn probe_once<P: Prober>(prober: &P, target: &TargetConfig, timeout: Duration, gate: bool) -> Status {
    match target.port {
        Some(port) if !gate => prober.check_port(&target.address, port, timeout).await,
        _ => prober.check_reachable(&target.address, target.ping_count, timeout).await,
    }
}
