//! HTTP/JSON surface
//!
//! Thin axum layer over [`SpotEngine`]. Drivers are identified by the
//! `x-holder-id` header set by the upstream identity provider; the value is
//! trusted as-is.
//!
//! Handlers that go through the reservation ledger run on the blocking pool,
//! since the ledger waits up to `ledger.lock_timeout_ms` on per-spot locks.

use crate::checkin::{parse_qr_payload, qr_payload};
use crate::engine::{NearbySpot, SpotEngine};
use crate::geo::Cluster;
use crate::ledger::HoldRequest;
use crate::types::{
    AvailabilitySnapshot, BoundingBox, CheckInEvent, CheckInToken, Direction, GeoPoint, HolderId,
    Reservation, ReservationId, Spot, SpotId, ZoneId,
};
use crate::Error;
use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Header carrying the verified driver identity
pub const HOLDER_HEADER: &str = "x-holder-id";

const DEFAULT_CLUSTER_PRECISION_DEG: f64 = 0.01;

type AppState = Arc<SpotEngine>;

/// Build the router
pub fn router(engine: Arc<SpotEngine>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/spots", post(register_spot))
        .route("/spots/nearby", get(nearby))
        .route("/spots/within", get(within))
        .route("/spots/clusters", get(clusters))
        .route("/spots/search", get(search))
        .route("/spots/:id", get(get_spot).delete(remove_spot))
        .route("/spots/:id/service", put(set_service))
        .route("/spots/:id/location", put(relocate_spot))
        .route("/reservations", post(hold))
        .route("/reservations/:id", get(get_reservation))
        .route("/reservations/:id/confirm", post(confirm))
        .route("/reservations/:id/release", post(release))
        .route("/reservations/:id/cancel", post(cancel))
        .route("/holders/me/reservations", get(my_reservations))
        .route("/checkin", post(checkin))
        .route("/zones/:id/snapshot", get(snapshot))
        .route("/zones/:id/subscribe", get(subscribe))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

// Error handling
#[derive(Debug)]
pub enum ApiError {
    Engine(Error),
    MissingHolder,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingHolder => StatusCode::UNAUTHORIZED,
            ApiError::Engine(e) => match e {
                Error::SpotUnavailable(_)
                | Error::HolderLimitReached { .. }
                | Error::WrongState { .. }
                | Error::VersionConflict { .. } => StatusCode::CONFLICT,
                Error::InvalidToken(_) | Error::TokenMismatch(_) => StatusCode::FORBIDDEN,
                Error::AlreadyExpired(_) => StatusCode::GONE,
                Error::NotFound(_) => StatusCode::NOT_FOUND,
                Error::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
                Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (kind, message) = match &self {
            ApiError::MissingHolder => (
                "unauthenticated",
                format!("missing {} header", HOLDER_HEADER),
            ),
            ApiError::Engine(e) => (e.kind(), e.to_string()),
        };

        if status.is_server_error() {
            tracing::error!(error = kind, "Request failed: {}", message);
        }

        (
            status,
            Json(serde_json::json!({
                "error": kind,
                "message": message,
            })),
        )
            .into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Engine(err)
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Driver identity taken from [`HOLDER_HEADER`]
#[derive(Debug, Clone)]
pub struct Holder(pub HolderId);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Holder {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(HOLDER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| Holder(HolderId::new(value)))
            .ok_or(ApiError::MissingHolder)
    }
}

/// Run a ledger call on the blocking pool
async fn blocking<T, F>(engine: AppState, call: F) -> ApiResult<T>
where
    F: FnOnce(&SpotEngine) -> crate::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || call(&engine))
        .await
        .map_err(|e| ApiError::Engine(Error::Concurrency(format!("blocking task failed: {}", e))))?
        .map_err(ApiError::from)
}

fn reservation_id(raw: &str) -> ApiResult<ReservationId> {
    raw.parse()
        .map_err(|_| ApiError::Engine(Error::InvalidArgument(format!("bad reservation id: {}", raw))))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

async fn health_check(State(engine): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: engine.config().service_name.clone(),
        version: engine.config().service_version.clone(),
    })
}

async fn metrics_handler(State(engine): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        engine.metrics().render(),
    )
}

#[derive(Debug, Deserialize)]
pub struct RegisterSpotRequest {
    pub id: SpotId,
    pub latitude: f64,
    pub longitude: f64,
    pub zone_id: ZoneId,
    pub label: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub out_of_service: bool,
}

async fn register_spot(
    State(engine): State<AppState>,
    Json(req): Json<RegisterSpotRequest>,
) -> ApiResult<(StatusCode, Json<Spot>)> {
    let mut spot = Spot::new(
        req.id,
        GeoPoint::new(req.latitude, req.longitude),
        req.zone_id,
        req.label,
    );
    spot.address = req.address;
    spot.out_of_service = req.out_of_service;

    let spot = engine.register_spot(spot)?;
    Ok((StatusCode::CREATED, Json(spot)))
}

#[derive(Debug, Deserialize)]
pub struct NearbyQuery {
    pub lat: f64,
    pub lon: f64,
    pub radius_m: f64,
    pub limit: Option<usize>,
    #[serde(default)]
    pub free_only: bool,
}

async fn nearby(
    State(engine): State<AppState>,
    Query(q): Query<NearbyQuery>,
) -> ApiResult<Json<Vec<NearbySpot>>> {
    let center = GeoPoint::new(q.lat, q.lon);
    Ok(Json(engine.nearby(&center, q.radius_m, q.limit, q.free_only)?))
}

#[derive(Debug, Deserialize)]
pub struct BoundsQuery {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
    pub precision: Option<f64>,
}

impl BoundsQuery {
    fn bounds(&self) -> BoundingBox {
        BoundingBox::new(self.min_lat, self.min_lon, self.max_lat, self.max_lon)
    }
}

async fn within(
    State(engine): State<AppState>,
    Query(q): Query<BoundsQuery>,
) -> ApiResult<Json<Vec<Spot>>> {
    Ok(Json(engine.within(&q.bounds())?))
}

async fn clusters(
    State(engine): State<AppState>,
    Query(q): Query<BoundsQuery>,
) -> ApiResult<Json<Vec<Cluster>>> {
    let precision = q.precision.unwrap_or(DEFAULT_CLUSTER_PRECISION_DEG);
    Ok(Json(engine.clusters(&q.bounds(), precision)?))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub limit: Option<usize>,
}

async fn search(
    State(engine): State<AppState>,
    Query(q): Query<SearchQuery>,
) -> ApiResult<Json<Vec<Spot>>> {
    Ok(Json(engine.search(&q.q, q.limit)?))
}

async fn get_spot(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Spot>> {
    Ok(Json(engine.spot(&SpotId::new(id))?))
}

async fn remove_spot(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Spot>> {
    let spot_id = SpotId::new(id);
    let spot = blocking(engine, move |engine| engine.remove_spot(&spot_id)).await?;
    Ok(Json(spot))
}

#[derive(Debug, Deserialize)]
pub struct ServiceRequest {
    pub out_of_service: bool,
    pub expected_version: u64,
}

async fn set_service(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ServiceRequest>,
) -> ApiResult<Json<Spot>> {
    let spot_id = SpotId::new(id);
    let spot = blocking(engine, move |engine| {
        engine.set_out_of_service(&spot_id, req.out_of_service, req.expected_version)
    })
    .await?;
    Ok(Json(spot))
}

#[derive(Debug, Deserialize)]
pub struct LocationRequest {
    pub latitude: f64,
    pub longitude: f64,
    pub expected_version: u64,
}

async fn relocate_spot(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<LocationRequest>,
) -> ApiResult<Json<Spot>> {
    let location = GeoPoint::new(req.latitude, req.longitude);
    let spot = engine.relocate_spot(&SpotId::new(id), location, req.expected_version)?;
    Ok(Json(spot))
}

#[derive(Debug, Deserialize)]
pub struct HoldBody {
    pub spot_id: SpotId,
    pub ttl_secs: Option<u64>,
    pub vehicle_id: Option<String>,
    pub expected_version: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HoldResponse {
    pub reservation: Reservation,
    pub qr_payload: String,
}

async fn hold(
    State(engine): State<AppState>,
    Holder(holder): Holder,
    Json(body): Json<HoldBody>,
) -> ApiResult<(StatusCode, Json<HoldResponse>)> {
    let request = HoldRequest {
        ttl: body.ttl_secs.map(std::time::Duration::from_secs),
        vehicle_id: body.vehicle_id,
        expected_version: body.expected_version,
    };
    let spot_id = body.spot_id;
    let reservation = blocking(engine, move |engine| engine.hold(&holder, &spot_id, request)).await?;
    let qr_payload = qr_payload(&reservation);

    Ok((
        StatusCode::CREATED,
        Json(HoldResponse {
            reservation,
            qr_payload,
        }),
    ))
}

async fn get_reservation(
    State(engine): State<AppState>,
    Holder(holder): Holder,
    Path(id): Path<String>,
) -> ApiResult<Json<Reservation>> {
    Ok(Json(engine.reservation(&holder, &reservation_id(&id)?)?))
}

#[derive(Debug, Deserialize)]
pub struct ConfirmBody {
    pub token: CheckInToken,
}

async fn confirm(
    State(engine): State<AppState>,
    Holder(holder): Holder,
    Path(id): Path<String>,
    Json(body): Json<ConfirmBody>,
) -> ApiResult<Json<Reservation>> {
    let id = reservation_id(&id)?;
    let reservation = blocking(engine, move |engine| engine.confirm(&holder, &id, &body.token)).await?;
    Ok(Json(reservation))
}

async fn release(
    State(engine): State<AppState>,
    Holder(holder): Holder,
    Path(id): Path<String>,
) -> ApiResult<Json<Reservation>> {
    let id = reservation_id(&id)?;
    let reservation = blocking(engine, move |engine| engine.release(&holder, &id)).await?;
    Ok(Json(reservation))
}

async fn cancel(
    State(engine): State<AppState>,
    Holder(holder): Holder,
    Path(id): Path<String>,
) -> ApiResult<Json<Reservation>> {
    let id = reservation_id(&id)?;
    let reservation = blocking(engine, move |engine| engine.cancel(&holder, &id)).await?;
    Ok(Json(reservation))
}

async fn my_reservations(
    State(engine): State<AppState>,
    Holder(holder): Holder,
) -> ApiResult<Json<Vec<Reservation>>> {
    Ok(Json(engine.reservations(&holder)?))
}

#[derive(Debug, Deserialize)]
pub struct ScanBody {
    pub payload: String,
    pub direction: Direction,
    /// Scan time reported by the gate; defaults to now
    pub timestamp: Option<DateTime<Utc>>,
}

async fn checkin(
    State(engine): State<AppState>,
    Json(body): Json<ScanBody>,
) -> ApiResult<Json<Reservation>> {
    let reservation = match body.timestamp {
        Some(timestamp) => {
            let (reservation_id, scanned_token) = parse_qr_payload(&body.payload)?;
            let event = CheckInEvent {
                reservation_id,
                scanned_token,
                timestamp,
                direction: body.direction,
            };
            blocking(engine, move |engine| engine.check_in(&event)).await?
        }
        None => {
            blocking(engine, move |engine| engine.scan(&body.payload, body.direction)).await?
        }
    };
    Ok(Json(reservation))
}

async fn snapshot(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<AvailabilitySnapshot>> {
    Ok(Json(engine.snapshot(&ZoneId::new(id))?))
}

async fn subscribe(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let zone_id = ZoneId::new(id);
    let updates = engine.subscribe(&zone_id)?;
    tracing::debug!(zone_id = %zone_id, "Snapshot subscriber attached");

    let events = updates.map(|snapshot| Event::default().event("snapshot").json_data(snapshot.as_ref()));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
