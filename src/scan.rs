use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::aggregator::Aggregator;
use crate::broadcast::Broadcaster;
use crate::store::SnapshotStore;

#[derive(Debug, Clone, Serialize)]
pub struct ScanStatus {
    pub running: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_cycle_at: Option<OffsetDateTime>,
    pub cycle_count: u64,
}

/// Contrôleur du cycle périodique : start/stop/status idempotents.
///
/// États {STOPPED, RUNNING}; start/stop redondants = no-op. Le scheduler
/// possède sa propre annulation (canal watch) : stop() coupe les ticks futurs
/// sans interrompre un cycle en vol, les cycles restent sérialisés.
pub struct ScanController {
    aggregator: Arc<Aggregator>,
    store: Arc<SnapshotStore>,
    broadcaster: Arc<Broadcaster>,
    interval: Duration,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    cycle_count: Arc<AtomicU64>,
    last_cycle_at: Arc<Mutex<Option<OffsetDateTime>>>,
}

impl ScanController {
    pub fn new(
        aggregator: Arc<Aggregator>,
        store: Arc<SnapshotStore>,
        broadcaster: Arc<Broadcaster>,
        interval: Duration,
    ) -> Self {
        Self {
            aggregator,
            store,
            broadcaster,
            interval,
            shutdown: Mutex::new(None),
            cycle_count: Arc::new(AtomicU64::new(0)),
            last_cycle_at: Arc::new(Mutex::new(None)),
        }
    }

    /// Démarre le scan périodique (un cycle immédiat, puis un par intervalle).
    /// Déjà en cours = no-op, renvoie le statut courant.
    pub fn start(&self) -> ScanStatus {
        let mut shutdown = self.shutdown.lock();
        if shutdown.is_some() {
            println!("[scan] start ignored, already running");
            return self.status_with(true);
        }

        let (tx, mut rx) = watch::channel(false);
        *shutdown = Some(tx);

        let aggregator = self.aggregator.clone();
        let store = self.store.clone();
        let broadcaster = self.broadcaster.clone();
        let cycle_count = self.cycle_count.clone();
        let last_cycle_at = self.last_cycle_at.clone();
        let tick = self.interval;

        tokio::spawn(async move {
            println!("[scan] periodic scanning started (interval {}s)", tick.as_secs());
            let mut timer = tokio::time::interval(tick);
            // un cycle qui déborde l'intervalle saute le tick suivant,
            // jamais de cycles en file ni chevauchés
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let started = tokio::time::Instant::now();

                        let snapshot = aggregator.run_cycle().await;
                        let snapshot = store.publish(snapshot);
                        broadcaster.notify(&snapshot);

                        *last_cycle_at.lock() = Some(OffsetDateTime::now_utc());
                        cycle_count.fetch_add(1, Ordering::Relaxed);

                        let elapsed = started.elapsed();
                        if elapsed > tick {
                            eprintln!(
                                "[scan] cycle overran interval ({}ms > {}ms), next tick skipped",
                                elapsed.as_millis(),
                                tick.as_millis()
                            );
                        }
                    }
                    _ = rx.changed() => {
                        println!("[scan] periodic scanning stopped");
                        break;
                    }
                }
            }
        });

        self.status_with(true)
    }

    /// Coupe la planification; un cycle en vol se termine normalement.
    /// Déjà arrêté = no-op.
    pub fn stop(&self) -> ScanStatus {
        let mut shutdown = self.shutdown.lock();
        match shutdown.take() {
            Some(tx) => {
                let _ = tx.send(true);
                println!("[scan] stop requested");
            }
            None => println!("[scan] stop ignored, not running"),
        }
        self.status_with(false)
    }

    pub fn status(&self) -> ScanStatus {
        let running = self.shutdown.lock().is_some();
        self.status_with(running)
    }

    fn status_with(&self, running: bool) -> ScanStatus {
        ScanStatus {
            running,
            last_cycle_at: *self.last_cycle_at.lock(),
            cycle_count: self.cycle_count.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PROBE_SECTIONS;
    use crate::probe::{Probe, ProbeFuture, ProbeSpec, SectionShape};
    use serde_json::json;

    struct EmptyProbe;

    impl Probe for EmptyProbe {
        fn invoke(&self) -> ProbeFuture<'_> {
            Box::pin(async { Ok(json!({})) })
        }
    }

    fn controller(interval: Duration) -> (Arc<ScanController>, Arc<SnapshotStore>) {
        let store = Arc::new(SnapshotStore::new(20));
        let probes = PROBE_SECTIONS
            .iter()
            .map(|name| {
                let spec = ProbeSpec {
                    name: name.to_string(),
                    command: String::new(),
                    timeout: Duration::from_secs(1),
                    retries: 0,
                    backoff: Duration::from_millis(10),
                    // toutes en Object : EmptyProbe renvoie {}
                    shape: SectionShape::Object,
                };
                (spec, Arc::new(EmptyProbe) as Arc<dyn Probe>)
            })
            .collect();
        let aggregator = Arc::new(Aggregator::new(probes, store.clone()));
        let broadcaster = Arc::new(Broadcaster::new(8, 4));
        (
            Arc::new(ScanController::new(aggregator, store.clone(), broadcaster, interval)),
            store,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_with_single_timer() {
        let (controller, store) = controller(Duration::from_secs(10));

        assert!(!controller.status().running);
        let status = controller.start();
        assert!(status.running);

        // second start : no-op, aucun second timer
        let status = controller.start();
        assert!(status.running);

        // t=0 (cycle immédiat), t=10, t=20, t=30 -> 4 cycles maximum
        tokio::time::sleep(Duration::from_secs(35)).await;
        let count = controller.status().cycle_count;
        assert!(count >= 1, "immediate cycle never ran");
        assert!(count <= 4, "duplicate scheduler detected ({count} cycles)");

        assert!(store.latest().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_halts_ticks() {
        let (controller, _store) = controller(Duration::from_secs(10));

        controller.start();
        tokio::time::sleep(Duration::from_secs(15)).await;

        let status = controller.stop();
        assert!(!status.running);
        let after_stop = controller.status().cycle_count;
        assert!(after_stop >= 1);

        // plus aucun cycle planifié après stop
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(controller.status().cycle_count, after_stop);

        // stop redondant : no-op
        let status = controller.stop();
        assert!(!status.running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_progress() {
        let (controller, _store) = controller(Duration::from_secs(10));
        assert_eq!(controller.status().cycle_count, 0);
        assert!(controller.status().last_cycle_at.is_none());

        controller.start();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let status = controller.status();
        assert!(status.running);
        assert!(status.cycle_count >= 1);
        assert!(status.last_cycle_at.is_some());
        controller.stop();
    }
}
