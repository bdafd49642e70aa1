/**
 * VIGIL KERNEL - Point d'entrée du cœur d'agrégation de télémétrie sécurité
 *
 * RÔLE : Orchestration de tous les modules : config, sondes, aggregator,
 * store, broadcaster, contrôleur de scan et surface HTTP.
 *
 * ARCHITECTURE : Collecte périodique concurrente → snapshot immuable →
 * diffusion bornée vers les observateurs. Les sondes sont des collaborateurs
 * externes (commandes shell produisant du JSON).
 */

mod aggregator;
mod broadcast;
mod config;
mod http;
mod models;
mod probe;
mod scan;
mod store;

use crate::aggregator::Aggregator;
use crate::broadcast::Broadcaster;
use crate::config::load_config;
use crate::probe::{CommandProbe, Probe};
use crate::scan::ScanController;
use crate::store::SnapshotStore;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    let cfg = load_config().await;

    // registre des sondes : une commande externe par section
    let probes: Vec<(probe::ProbeSpec, Arc<dyn Probe>)> = cfg
        .probe_specs()
        .into_iter()
        .map(|spec| {
            let probe: Arc<dyn Probe> = Arc::new(CommandProbe::new(spec.command.clone()));
            (spec, probe)
        })
        .collect();
    println!("[kernel] registered {} probes", probes.len());

    let store = Arc::new(SnapshotStore::new(cfg.store.history_size));
    let aggregator = Arc::new(Aggregator::new(probes, store.clone()));
    let broadcaster = Arc::new(Broadcaster::new(
        cfg.broadcast.queue_capacity,
        cfg.broadcast.overflow_strikes,
    ));
    let controller = Arc::new(ScanController::new(
        aggregator,
        store.clone(),
        broadcaster.clone(),
        Duration::from_secs(cfg.scan.interval_seconds),
    ));

    // démarrage auto du scan périodique (choix de déploiement)
    if cfg.scan.auto_start {
        controller.start();
    }

    // fabrique l'état unique pour Axum
    let app_state = http::AppState { store, broadcaster, controller };
    let app = http::build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http.bind_port));
    println!("[kernel] listening on http://{addr}");
    let listener = TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
