//! Axum-based HTTP control surface
//!
//! JSON control API under `/api/pvcontrol`, Prometheus text exposition on
//! `/metrics` and the static UI bundle as fallback. Handlers only read
//! service snapshots and mutate the controller's `desired_*` fields; the
//! control loop itself never runs on a request task.

use crate::car::{Car as _, SharedCar};
use crate::controller::{ChargeController, ChargeMode, PhaseMode, Priority};
use crate::meter::{Meter as _, SharedMeter};
use crate::metrics::METRICS;
use crate::relay::{PhaseRelay as _, SharedPhaseRelay};
use crate::wallbox::{CarStatus, SharedWallbox, Wallbox as _};
use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, get_service, put},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::services::ServeDir;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub controller: Arc<Mutex<ChargeController>>,
    pub meter: SharedMeter,
    pub wallbox: SharedWallbox,
    pub relay: SharedPhaseRelay,
    pub car: SharedCar,
}

async fn get_pvcontrol(State(state): State<AppState>) -> impl IntoResponse {
    let controller = state.controller.lock().await.get_data();
    let meter = state.meter.lock().await.get_data();
    let wallbox = state.wallbox.lock().await.get_data();
    let relay = state.relay.lock().await.get_data();
    let car = state.car.lock().await.get_data();
    Json(serde_json::json!({
        "version": state.version,
        "controller": controller,
        "meter": meter,
        "wallbox": wallbox,
        "relay": relay,
        "car": car,
    }))
}

async fn get_controller(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.lock().await.view())
}

async fn get_meter(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.meter.lock().await.view())
}

async fn get_wallbox(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.wallbox.lock().await.view())
}

async fn get_relay(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.relay.lock().await.view())
}

async fn get_car(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.car.lock().await.view())
}

// curl -X PUT http://localhost:8080/api/pvcontrol/controller/desired_mode \
//   -H 'Content-Type: application/json' --data '"PV_ONLY"'
async fn put_desired_mode(
    State(state): State<AppState>,
    Json(mode): Json<ChargeMode>,
) -> impl IntoResponse {
    state.controller.lock().await.set_desired_mode(mode);
    StatusCode::NO_CONTENT
}

async fn put_phase_mode(
    State(state): State<AppState>,
    Json(mode): Json<PhaseMode>,
) -> impl IntoResponse {
    state.controller.lock().await.set_phase_mode(mode);
    StatusCode::NO_CONTENT
}

async fn put_desired_priority(
    State(state): State<AppState>,
    Json(priority): Json<Priority>,
) -> impl IntoResponse {
    state.controller.lock().await.set_desired_priority(priority);
    StatusCode::NO_CONTENT
}

// for testing only, 1=NoVehicle, 2=Charging, 3=WaitingForVehicle, 4=ChargingFinished
async fn put_car_status(
    State(state): State<AppState>,
    Json(status): Json<CarStatus>,
) -> Response {
    match state.wallbox.lock().await.set_car_status(status) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()).into_response(),
    }
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.encode_text(),
    )
}

/// Fingerprinted bundle files (`name-<hash>.ext`) never change content and
/// may be cached forever; `index.html` and API responses must not.
pub(crate) fn is_immutable_asset(filename: &str) -> bool {
    let Some((stem, ext)) = filename.rsplit_once('.') else {
        return false;
    };
    if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return false;
    }
    let Some((base, hash)) = stem.rsplit_once('-') else {
        return false;
    };
    !base.is_empty()
        && base.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && hash.len() >= 8
        && hash.chars().all(|c| c.is_ascii_alphanumeric())
}

async fn cache_control_for_assets(req: Request, next: Next) -> Response {
    let filename = req
        .uri()
        .path()
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_owned();
    let mut res = next.run(req).await;
    if res.status().is_success() && is_immutable_asset(&filename) {
        res.headers_mut().insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("public, max-age=31536000, immutable"),
        );
    }
    res
}

pub fn build_router(state: AppState, basehref: &str, asset_dir: &str) -> Router {
    let serve_dir = ServeDir::new(asset_dir).append_index_html_on_directories(true);

    let router = Router::new()
        .route("/api/pvcontrol", get(get_pvcontrol))
        .route("/api/pvcontrol/controller", get(get_controller))
        .route(
            "/api/pvcontrol/controller/desired_mode",
            put(put_desired_mode),
        )
        .route("/api/pvcontrol/controller/phase_mode", put(put_phase_mode))
        .route(
            "/api/pvcontrol/controller/desired_priority",
            put(put_desired_priority),
        )
        .route("/api/pvcontrol/meter", get(get_meter))
        .route("/api/pvcontrol/wallbox", get(get_wallbox))
        .route("/api/pvcontrol/wallbox/car_status", put(put_car_status))
        .route("/api/pvcontrol/relay", get(get_relay))
        .route("/api/pvcontrol/car", get(get_car))
        .route("/metrics", get(metrics))
        .fallback_service(get_service(serve_dir))
        .with_state(state)
        .layer(middleware::from_fn(cache_control_for_assets))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let basehref = basehref.trim_end_matches('/');
    if basehref.is_empty() {
        router
    } else {
        Router::new().nest(basehref, router)
    }
}

pub async fn serve(
    state: AppState,
    host: &str,
    port: u16,
    basehref: &str,
    asset_dir: &str,
) -> anyhow::Result<()> {
    let router = build_router(state, basehref, asset_dir);
    let logger = crate::logging::get_logger("web");

    let (addr, parsed_ok): (SocketAddr, bool) = match host.parse::<IpAddr>() {
        Ok(ip) => (SocketAddr::new(ip, port), true),
        Err(_) => (([127, 0, 0, 1], port).into(), false),
    };
    if !parsed_ok {
        logger.warn(&format!("Invalid host '{}'; falling back to 127.0.0.1", host));
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    logger.info(&format!(
        "Web server listening at http://{}:{} (UI /, API /api/pvcontrol, metrics /metrics)",
        local_addr.ip(),
        local_addr.port()
    ));

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immutable_asset_detection() {
        assert!(is_immutable_asset("main-a1b2c3d4.js"));
        assert!(is_immutable_asset("styles-0123456789abcdef.css"));
        assert!(is_immutable_asset("logo_2-AbCdEf12.svg"));

        assert!(!is_immutable_asset("index.html"));
        assert!(!is_immutable_asset("main.js"));
        assert!(!is_immutable_asset("main-abc.js")); // hash too short
        assert!(!is_immutable_asset("main-a1b2c3d4"));
        assert!(!is_immutable_asset("-a1b2c3d4.js"));
        assert!(!is_immutable_asset("main-a1b2_c3d4e.js")); // underscore in hash
    }
}
