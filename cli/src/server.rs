use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize};
use tower_http::limit::RequestBodyLimitLayer;

use daybook_core::aggregate::week_start;
use daybook_core::backfill::BackfillReport;
use daybook_core::error::SyncError;
use daybook_core::form::FormOptions;
use daybook_core::models::{
    BloodPressure, DailyHealthRecord, HeartRateStats, RecordDetails, SleepDuration, TrackedEdit,
};
use daybook_core::service::DaybookService;
use daybook_core::sync::SyncDayReport;

const BODY_LIMIT: usize = 1024 * 1024; // 1 MB

#[derive(Clone)]
struct AppState {
    service: Arc<DaybookService>,
    api_key: Option<String>,
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct ListQuery {
    days: Option<usize>,
}

#[derive(Deserialize)]
struct SyncQuery {
    #[serde(default)]
    overwrite: bool,
}

#[derive(Deserialize)]
struct WeekQuery {
    #[serde(default)]
    live: bool,
}

fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// Partial update of a record. A tracked field set to `null` is cleared;
/// a missing field is left alone. `details` replaces all user-owned fields.
#[derive(Deserialize, Default)]
#[allow(clippy::option_option)]
struct PatchRecordRequest {
    #[serde(default, deserialize_with = "deserialize_some")]
    steps: Option<Option<i64>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    glucose: Option<Option<f64>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    ketones: Option<Option<f64>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    blood_pressure: Option<Option<BloodPressure>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    weight: Option<Option<f64>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    sleep: Option<Option<SleepDuration>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    heart_rate: Option<Option<HeartRateStats>>,
    details: Option<RecordDetails>,
}

impl PatchRecordRequest {
    fn tracked_edits(&self) -> Vec<TrackedEdit> {
        [
            self.steps.map(TrackedEdit::Steps),
            self.glucose.map(TrackedEdit::Glucose),
            self.ketones.map(TrackedEdit::Ketones),
            self.blood_pressure.map(TrackedEdit::BloodPressure),
            self.weight.map(TrackedEdit::Weight),
            self.sleep.map(TrackedEdit::Sleep),
            self.heart_rate.map(TrackedEdit::HeartRate),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

#[derive(Serialize)]
struct WeekResponse {
    start: NaiveDate,
    end: NaiveDate,
    total: i64,
    live: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unavailable(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            Self::Internal(err) => {
                tracing::error!("internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Authorization => Self::Unavailable(err.to_string()),
            other => Self::Internal(other.into()),
        }
    }
}

fn parse_day(s: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| ApiError::BadRequest(format!("Invalid date '{s}'. Use YYYY-MM-DD")))
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Handlers ---

async fn list_records(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<DailyHealthRecord>>, ApiError> {
    Ok(Json(state.service.list_records(query.days)?))
}

async fn get_record(
    State(state): State<AppState>,
    Path(day): Path<String>,
) -> Result<Json<DailyHealthRecord>, ApiError> {
    let day = parse_day(&day)?;
    state
        .service
        .record_for_day(day)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No record for {day}")))
}

async fn delete_record(
    State(state): State<AppState>,
    Path(day): Path<String>,
) -> Result<StatusCode, ApiError> {
    let day = parse_day(&day)?;
    if state.service.delete_record(day)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("No record for {day}")))
    }
}

async fn patch_record(
    State(state): State<AppState>,
    Path(day): Path<String>,
    Json(req): Json<PatchRecordRequest>,
) -> Result<(StatusCode, Json<DailyHealthRecord>), ApiError> {
    let day = parse_day(&day)?;
    let edits = req.tracked_edits();
    if edits.is_empty() && req.details.is_none() {
        return Err(ApiError::BadRequest(
            "At least one field must be provided".to_string(),
        ));
    }
    for edit in &edits {
        edit.validate()
            .map_err(|e| ApiError::BadRequest(format!("{e}")))?;
    }

    let mut form = state
        .service
        .open_form(day, Local::now().date_naive(), FormOptions::default())
        .await?;
    for edit in edits {
        form.edit(edit)?;
    }
    if let Some(details) = req.details {
        form.edit_details(|d| *d = details)?;
    }

    let status = if form.is_new() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let record = form.save()?.clone();
    Ok((status, Json(record)))
}

async fn sync_record(
    State(state): State<AppState>,
    Path(day): Path<String>,
    Query(query): Query<SyncQuery>,
) -> Result<Json<SyncDayReport>, ApiError> {
    let day = parse_day(&day)?;
    Ok(Json(state.service.sync_day(day, query.overwrite).await?))
}

async fn run_backfill(State(state): State<AppState>) -> Result<Json<BackfillReport>, ApiError> {
    let cancel = AtomicBool::new(false);
    let report = state
        .service
        .backfill(Local::now().date_naive(), &cancel, |p| {
            tracing::debug!(day = %p.day, completed = p.completed, total = p.total, "backfill progress");
        })
        .await?;
    Ok(Json(report))
}

async fn week_total(
    State(state): State<AppState>,
    Path(day): Path<String>,
    Query(query): Query<WeekQuery>,
) -> Result<Json<WeekResponse>, ApiError> {
    let day = parse_day(&day)?;
    let total = if query.live {
        state.service.live_week_total(day, |_, _| {}).await
    } else {
        state.service.cached_week_total(day)?
    };
    Ok(Json(WeekResponse {
        start: week_start(day),
        end: day,
        total,
        live: query.live,
    }))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/records", get(list_records))
        .route(
            "/api/records/{day}",
            get(get_record).patch(patch_record).delete(delete_record),
        )
        .route("/api/records/{day}/sync", post(sync_record))
        .route("/api/records/{day}/week", get(week_total))
        .route("/api/backfill", post(run_backfill))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

/// First and last four characters of the key, or a mask when the key is too
/// short to shorten without giving most of it away.
fn key_preview(key: &str) -> String {
    if key.len() < 12 {
        return "****".to_string();
    }
    match (key.get(..4), key.get(key.len() - 4..)) {
        (Some(head), Some(tail)) => format!("{head}...{tail}"),
        _ => "****".to_string(),
    }
}

pub async fn start_server(
    service: DaybookService,
    port: u16,
    bind: &str,
    api_key: Option<String>,
) -> anyhow::Result<()> {
    let state = AppState {
        service: Arc::new(service),
        api_key: api_key.clone(),
    };

    let app = build_router(state);

    if let Some(ref key) = api_key {
        eprintln!(
            "API key: {} (see api_key file in data directory)",
            key_preview(key)
        );
    } else {
        eprintln!("Warning: Authentication disabled (--no-auth). API is open to anyone.");
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        eprintln!(
            "Warning: Listening on {bind} with no authentication. Any device on your network can access this API."
        );
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}")).await?;
    eprintln!("Listening on http://{bind}:{port}");
    tracing::info!(%bind, port, "server started");
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::DateTime;
    use daybook_core::provider::{MetricSamples, QuantitySample, SampleFileProvider};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const DAY: &str = "2025-06-10";

    #[test]
    fn test_key_preview_handles_odd_keys() {
        assert_eq!(key_preview("0123456789abcdef"), "0123...cdef");
        assert_eq!(key_preview("abc"), "****");
        assert_eq!(key_preview(""), "****");
        // Multibyte characters straddle the cut points
        assert_eq!(key_preview("€€€€€€"), "****");
    }

    fn samples() -> MetricSamples {
        let at = |ts: &str| DateTime::parse_from_rfc3339(ts).unwrap();
        MetricSamples {
            steps: vec![
                QuantitySample {
                    at: at("2025-06-10T08:00:00-04:00"),
                    value: 3000.0,
                },
                QuantitySample {
                    at: at("2025-06-10T18:00:00-04:00"),
                    value: 2500.0,
                },
                QuantitySample {
                    at: at("2025-06-09T12:00:00-04:00"),
                    value: 4000.0,
                },
            ],
            weight: vec![QuantitySample {
                at: at("2025-06-10T07:00:00-04:00"),
                value: 182.4,
            }],
            ..MetricSamples::default()
        }
    }

    fn test_state(api_key: Option<String>) -> AppState {
        let provider = Arc::new(SampleFileProvider::in_memory(samples()));
        AppState {
            service: Arc::new(DaybookService::new_in_memory(provider).unwrap()),
            api_key,
        }
    }

    fn test_app(api_key: Option<String>) -> Router {
        build_router(test_state(api_key))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn patch(uri: &str, json: &serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::patch(uri)
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn auth_missing_key_returns_401() {
        let app = test_app(Some("test-key-abc123".to_string()));

        let response = app
            .oneshot(
                axum::http::Request::get("/api/records")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Invalid or missing API key");
    }

    #[tokio::test]
    async fn auth_wrong_key_returns_401() {
        let app = test_app(Some("test-key-abc123".to_string()));

        let response = app
            .oneshot(
                axum::http::Request::get("/api/records")
                    .header("Authorization", "Bearer wrong-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn auth_correct_key_succeeds() {
        let app = test_app(Some("test-key-abc123".to_string()));

        let response = app
            .oneshot(
                axum::http::Request::get("/api/records")
                    .header("Authorization", "Bearer test-key-abc123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn security_headers_present() {
        let app = test_app(None);

        let response = app
            .oneshot(
                axum::http::Request::get("/api/records")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
        assert_eq!(
            response.headers().get("content-security-policy").unwrap(),
            "default-src 'none'"
        );
    }

    #[tokio::test]
    async fn security_headers_on_auth_failure() {
        let app = test_app(Some("secret".to_string()));

        let response = app
            .oneshot(
                axum::http::Request::get("/api/records")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
    }

    #[tokio::test]
    async fn body_size_limit_rejects_oversized() {
        let app = test_app(None);

        let big_body = vec![0u8; BODY_LIMIT + 1];
        let response = app
            .oneshot(
                axum::http::Request::patch(format!("/api/records/{DAY}"))
                    .header("content-type", "application/json")
                    .body(Body::from(big_body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn internal_error_does_not_leak_details() {
        let error = ApiError::Internal(anyhow::anyhow!("secret database path /home/user/.daybook"));
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = body_json(response).await;
        assert_eq!(json["error"], "Internal server error");
        assert!(!json["error"].as_str().unwrap().contains("secret"));
    }

    #[tokio::test]
    async fn get_missing_record_returns_404() {
        let app = test_app(None);

        let response = app
            .oneshot(
                axum::http::Request::get(format!("/api/records/{DAY}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_date_returns_400() {
        let app = test_app(None);

        let response = app
            .oneshot(
                axum::http::Request::get("/api/records/June-10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sync_creates_record_with_provenance() {
        let app = test_app(None);

        let response = app
            .clone()
            .oneshot(
                axum::http::Request::post(format!("/api/records/{DAY}/sync"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report = body_json(response).await;
        assert_eq!(report["created"], true);
        assert_eq!(report["record"]["metrics"]["steps"], 5500);
        assert_eq!(report["record"]["metrics"]["weight"], 182.4);
        assert_eq!(report["record"]["provenance"]["steps"], true);

        let response = app
            .oneshot(
                axum::http::Request::get(format!("/api/records/{DAY}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let record = body_json(response).await;
        assert_eq!(record["metrics"]["steps"], 5500);
    }

    #[tokio::test]
    async fn manual_edit_survives_sync_without_overwrite() {
        let app = test_app(None);

        let response = app
            .clone()
            .oneshot(patch(
                &format!("/api/records/{DAY}"),
                &serde_json::json!({ "steps": 9000 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let record = body_json(response).await;
        assert_eq!(record["metrics"]["steps"], 9000);
        assert_eq!(record["provenance"]["steps"], false);

        let response = app
            .clone()
            .oneshot(
                axum::http::Request::post(format!("/api/records/{DAY}/sync"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let report = body_json(response).await;
        assert_eq!(report["record"]["metrics"]["steps"], 9000);
        assert_eq!(report["record"]["metrics"]["weight"], 182.4);

        let response = app
            .oneshot(
                axum::http::Request::post(format!("/api/records/{DAY}/sync?overwrite=true"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let report = body_json(response).await;
        assert_eq!(report["record"]["metrics"]["steps"], 5500);
        assert_eq!(report["record"]["provenance"]["steps"], true);
    }

    #[tokio::test]
    async fn patch_null_clears_field() {
        let app = test_app(None);

        app.clone()
            .oneshot(patch(
                &format!("/api/records/{DAY}"),
                &serde_json::json!({ "glucose": 101.0, "ketones": 0.8 }),
            ))
            .await
            .unwrap();

        let response = app
            .oneshot(patch(
                &format!("/api/records/{DAY}"),
                &serde_json::json!({ "glucose": null }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let record = body_json(response).await;
        assert!(record["metrics"]["glucose"].is_null());
        assert_eq!(record["metrics"]["ketones"], 0.8);
    }

    #[tokio::test]
    async fn patch_rejects_invalid_and_empty_bodies() {
        let app = test_app(None);

        let response = app
            .clone()
            .oneshot(patch(
                &format!("/api/records/{DAY}"),
                &serde_json::json!({ "glucose": 5000.0 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(patch(&format!("/api/records/{DAY}"), &serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_record_then_404() {
        let app = test_app(None);

        app.clone()
            .oneshot(patch(
                &format!("/api/records/{DAY}"),
                &serde_json::json!({ "steps": 100 }),
            ))
            .await
            .unwrap();

        let delete = || {
            axum::http::Request::delete(format!("/api/records/{DAY}"))
                .body(Body::empty())
                .unwrap()
        };
        let response = app.clone().oneshot(delete()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.oneshot(delete()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn week_total_cached_and_live() {
        let app = test_app(None);

        app.clone()
            .oneshot(patch(
                "/api/records/2025-06-09",
                &serde_json::json!({ "steps": 1000 }),
            ))
            .await
            .unwrap();

        let week = |live: bool| {
            axum::http::Request::get(format!("/api/records/{DAY}/week?live={live}"))
                .body(Body::empty())
                .unwrap()
        };

        let response = app.clone().oneshot(week(false)).await.unwrap();
        let json = body_json(response).await;
        assert_eq!(json["total"], 1000);
        assert_eq!(json["start"], "2025-06-04");
        assert_eq!(json["live"], false);

        let response = app.oneshot(week(true)).await.unwrap();
        let json = body_json(response).await;
        assert_eq!(json["total"], 9500);
        assert_eq!(json["live"], true);
    }

    #[tokio::test]
    async fn backfill_on_empty_store_creates_today() {
        let app = test_app(None);

        let response = app
            .oneshot(
                axum::http::Request::post("/api/backfill")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report = body_json(response).await;
        let today = Local::now().date_naive().format("%Y-%m-%d").to_string();
        assert_eq!(report["created"], serde_json::json!([today]));
        assert_eq!(report["cancelled"], false);
    }

    #[tokio::test]
    async fn unauthorized_provider_returns_503() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(SampleFileProvider::new(dir.path().join("missing.json")));
        let app = build_router(AppState {
            service: Arc::new(DaybookService::new_in_memory(provider).unwrap()),
            api_key: None,
        });

        let response = app
            .oneshot(
                axum::http::Request::post(format!("/api/records/{DAY}/sync"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
