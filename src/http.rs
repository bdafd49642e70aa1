/**
 * API REST VIGIL - Surface HTTP du kernel de télémétrie
 *
 * RÔLE :
 * Adaptateur de présentation au-dessus des capacités du cœur : lecture du
 * dernier snapshot, historique borné, contrôle du scan périodique et flux
 * push temps réel (SSE).
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, routes JSON : /snapshot, /snapshots, /scan/..
 * - /stream : un abonné broadcaster par connexion, chaque événement SSE est
 *   un WireMessage sérialisé; la déconnexion du client désabonne (Drop)
 * - Les lecteurs ne sont jamais synchronisés avec le cycle d'écriture
 */

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;

use crate::broadcast::Broadcaster;
use crate::models::Snapshot;
use crate::scan::{ScanController, ScanStatus};
use crate::store::SnapshotStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SnapshotStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub controller: Arc<ScanController>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/snapshot", get(get_snapshot))
        .route("/snapshots", get(get_history))
        .route("/scan/start", post(scan_start))
        .route("/scan/stop", post(scan_stop))
        .route("/scan/status", get(scan_status))
        .route("/stream", get(stream_updates))
        .with_state(app_state)
}

// GET /snapshot (dernier snapshot publié)
async fn get_snapshot(State(app): State<AppState>) -> Result<Json<Snapshot>, StatusCode> {
    match app.store.latest() {
        Some(snapshot) => Ok(Json((*snapshot).clone())),
        None => Err(StatusCode::NOT_FOUND),
    }
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

// GET /snapshots?limit=n (historique borné, du plus ancien au plus récent)
async fn get_history(
    State(app): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Json<Vec<Snapshot>> {
    let n = params.limit.unwrap_or(20);
    let history = app.store.history(n).iter().map(|s| (**s).clone()).collect();
    Json(history)
}

// POST /scan/start
async fn scan_start(State(app): State<AppState>) -> Json<ScanStatus> {
    Json(app.controller.start())
}

// POST /scan/stop
async fn scan_stop(State(app): State<AppState>) -> Json<ScanStatus> {
    Json(app.controller.stop())
}

// GET /scan/status
async fn scan_status(State(app): State<AppState>) -> Json<ScanStatus> {
    Json(app.controller.status())
}

// GET /stream (push temps réel : connection, update, puis live_update)
async fn stream_updates(
    State(app): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let handle = app.broadcaster.subscribe(app.store.latest());

    let stream = futures::stream::unfold(handle, |handle| async move {
        let msg = handle.recv().await?;
        match serde_json::to_string(&msg) {
            Ok(json) => Some((Ok(Event::default().data(json)), handle)),
            Err(e) => {
                eprintln!("[http] failed to encode wire message: {e}");
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
