mod http;
mod idempotency;
mod jobs;
mod llm;
mod metrics;
mod models;
mod pricing;
mod security;
mod verify;

use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use llm::{ChatGateway, GatewayConfig};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, BulkVerificationRequest, BulkVerificationResponse, ImageSetReport, ImageSetRequest,
    PriceAnalysisRequest, PriceQuote, VerificationRequest, VerificationResult,
};
use pricing::{PricingEngine, PricingError};
use security::{AuthContext, AuthState, require_api_auth};
use serde::Serialize;
use serde_json::json;
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use verify::{ImagePreprocessor, PreprocessMode, VerificationEngine};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "offermart.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let auth_state = AuthState::from_env();

    // Two gateway instances behind one adapter: vision-capable for expiry
    // analysis, text-only for pricing. Constructed once and injected.
    let vision_gateway = Arc::new(ChatGateway::new(GatewayConfig::vision_from_env()));
    let pricing_gateway = Arc::new(ChatGateway::new(GatewayConfig::pricing_from_env()));
    let preprocessor = ImagePreprocessor::new(http::build_client(), PreprocessMode::from_env());
    let verification = VerificationEngine::new(vision_gateway, preprocessor);
    let pricing = Arc::new(PricingEngine::new(pricing_gateway));

    let (queue, _worker) = jobs::JobQueue::spawn(verification.clone());
    let openapi_raw = include_str!("../docs/openapi.yaml");
    let openapi: serde_json::Value =
        serde_yaml::from_str(openapi_raw).unwrap_or(serde_json::json!({"openapi":"3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|u| redis::Client::open(u).ok());
    let state = AppState {
        verification,
        pricing,
        queue,
        openapi: Arc::new(openapi),
        idempotency: Arc::new(Mutex::new(HashMap::new())),
        prometheus_handle,
        redis,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .nest(
            "/verify",
            Router::new()
                .route("/expiry", post(verify_expiry))
                .route("/expiry/bulk", post(verify_expiry_bulk))
                .route("/images", post(verify_images)),
        )
        .route("/pricing/predict", post(predict_price))
        .nest(
            "/jobs",
            Router::new()
                .route("/verify/bulk", post(enqueue_bulk_job))
                .route("/{id}", get(get_job_status)),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "offermart.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    verification: VerificationEngine,
    pricing: Arc<PricingEngine>,
    queue: jobs::JobQueue,
    openapi: Arc<serde_json::Value>,
    idempotency: Arc<Mutex<HashMap<String, PriceQuote>>>,
    prometheus_handle: PrometheusHandle,
    redis: Option<redis::Client>,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "offermart-api-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::invalid_input("unauthorized"));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>OfferMart API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(axum::http::StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

/// Verify a single label photo against the declared expiry date.
///
/// - Method: `POST`
/// - Path: `/verify/expiry`
/// - Auth: `Authorization: Bearer <key>` or `X-OfferMart-Key: <key>`
/// - Body: `VerificationRequest`
/// - Response: `VerificationResult` (never an error for model/image trouble;
///   those collapse into the unverified verdict)
async fn verify_expiry(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<VerificationRequest>,
) -> Result<Json<VerificationResult>, AppError> {
    crate::metrics::inc_requests("/verify/expiry");
    if payload.image_url.trim().is_empty() {
        return Err(AppError::invalid_input("image_url is required"));
    }
    info!(
        target = "offermart.api",
        org_id = %context.org_id,
        "expiry verification invoked",
    );

    let started = Instant::now();
    let result = state
        .verification
        .verify_expiry_date(&payload.image_url, payload.declared_expiry_date.as_deref())
        .await;
    crate::metrics::engine_elapsed("verify", started.elapsed().as_millis());
    Ok(Json(result))
}

/// Verify a batch of products in one call, one verdict per product in input
/// order.
///
/// - Method: `POST`
/// - Path: `/verify/expiry/bulk`
/// - Body: `BulkVerificationRequest`
async fn verify_expiry_bulk(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<BulkVerificationRequest>,
) -> Result<Json<BulkVerificationResponse>, AppError> {
    crate::metrics::inc_requests("/verify/expiry/bulk");
    if payload.products.is_empty() {
        return Err(AppError::invalid_input("no products provided"));
    }
    if payload.products.len() > max_bulk_products() {
        return Err(AppError::invalid_input("too_many_products"));
    }
    info!(
        target = "offermart.api",
        org_id = %context.org_id,
        products = payload.products.len(),
        "bulk verification invoked",
    );

    let started = Instant::now();
    let results = state
        .verification
        .verify_bulk_expiry_dates(&payload.products)
        .await;
    crate::metrics::engine_elapsed("verify_bulk", started.elapsed().as_millis());
    Ok(Json(BulkVerificationResponse { results }))
}

/// Best-of-N verification across every photo of one product.
///
/// - Method: `POST`
/// - Path: `/verify/images`
/// - Body: `ImageSetRequest`
async fn verify_images(
    State(state): State<AppState>,
    Json(payload): Json<ImageSetRequest>,
) -> Result<Json<ImageSetReport>, AppError> {
    crate::metrics::inc_requests("/verify/images");
    if payload.images.is_empty() {
        return Err(AppError::invalid_input("no images provided"));
    }
    if payload.images.len() > max_images_allowed() {
        return Err(AppError::invalid_input("too_many_images"));
    }

    let started = Instant::now();
    let report = state
        .verification
        .verify_product_images(&payload.images, &payload.declared_expiry_date)
        .await;
    crate::metrics::engine_elapsed("verify_images", started.elapsed().as_millis());
    Ok(Json(report))
}

/// Recommend a seller/market price split for a product.
///
/// - Method: `POST`
/// - Path: `/pricing/predict`
/// - Body: `PriceAnalysisRequest`
/// - Response: `PriceQuote`; 422 `pricing_unavailable` when no model
///   candidate validates (the UI degrades to manual price entry), 502 when
///   the gateway itself fails.
async fn predict_price(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<PriceAnalysisRequest>,
) -> Result<Json<PriceQuote>, AppError> {
    crate::metrics::inc_requests("/pricing/predict");
    if !payload.original_price.is_finite() || payload.original_price <= 0.0 {
        return Err(AppError::invalid_input("original_price must be positive"));
    }
    info!(
        target = "offermart.api",
        org_id = %context.org_id,
        "price prediction invoked",
    );

    if let Some(key) = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        if let Some(client) = &state.redis {
            if let Some(existing) = idempotency::redis_get(client, &key).await {
                return Ok(Json(existing));
            }
            let quote = state.pricing.predict_price(&payload).await?;
            let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(3600);
            idempotency::redis_set(client, &key, &quote, ttl).await;
            return Ok(Json(quote));
        }
        if let Some(existing) = state.idempotency.lock().await.get(&key).cloned() {
            return Ok(Json(existing));
        }
        let quote = state.pricing.predict_price(&payload).await?;
        state.idempotency.lock().await.insert(key, quote.clone());
        return Ok(Json(quote));
    }

    let quote = state.pricing.predict_price(&payload).await?;
    Ok(Json(quote))
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_bulk_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<BulkVerificationRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/verify/bulk");
    if payload.products.is_empty() {
        return Err(AppError::invalid_input("no products provided"));
    }
    let id = state
        .queue
        .enqueue_bulk(payload, context)
        .await
        .map_err(|err| AppError::internal(err.error))?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::invalid_input("invalid_job_id"));
    };
    if let Some(info) = state.queue.get(uuid).await {
        Ok(Json(info))
    } else {
        Err(AppError::invalid_input("not_found"))
    }
}

#[derive(Debug)]
enum AppError {
    InvalidInput { detail: String },
    Internal { detail: String },
    Pricing(PricingError),
}

impl AppError {
    fn invalid_input(detail: impl Into<String>) -> Self {
        Self::InvalidInput {
            detail: detail.into(),
        }
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self::Internal {
            detail: detail.into(),
        }
    }
}

impl From<PricingError> for AppError {
    fn from(value: PricingError) -> Self {
        Self::Pricing(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, detail) = match self {
            AppError::InvalidInput { detail } => {
                (StatusCode::BAD_REQUEST, "invalid_input", detail)
            }
            AppError::Internal { detail } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", detail)
            }
            AppError::Pricing(PricingError::Gateway(err)) => {
                (StatusCode::BAD_GATEWAY, "gateway_error", err.to_string())
            }
            AppError::Pricing(PricingError::Unavailable) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "pricing_unavailable",
                "no valid recommendation; ask the seller to set a price manually".to_string(),
            ),
        };
        let payload = ApiError {
            error: code.to_string(),
            detail: Some(detail),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

fn max_images_allowed() -> usize {
    std::env::var("MAX_IMAGES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v >= 1)
        .unwrap_or(6)
}

fn max_bulk_products() -> usize {
    std::env::var("MAX_BULK_PRODUCTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v >= 1)
        .unwrap_or(25)
}
