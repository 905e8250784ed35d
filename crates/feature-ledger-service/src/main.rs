use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use feature_ledger_api::{
    AddFeatureRequest, FeatureLedgerApi, FeatureUseOutcome, RecordFeatureUseRequest,
    UsedFeaturesView, API_CONTRACT_VERSION,
};
use feature_ledger_core::{Cart, Feature, LedgerError, ShopperContext};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: FeatureLedgerApi,
    /// Serializes read-reconcile-write cycles on the active cart.
    record_lock: Arc<Mutex<()>>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct CatalogResponse {
    count: usize,
    features: Vec<Feature>,
}

#[derive(Debug, Parser)]
#[command(name = "feature-ledger-service")]
#[command(about = "Local HTTP service for Feature Ledger")]
struct Args {
    #[arg(long, default_value = "./feature_ledger.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value = "EUR")]
    currency: String,
    #[arg(long, default_value = "DE")]
    country: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        let status = if err.downcast_ref::<LedgerError>().is_some() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        if status.is_server_error() {
            tracing::error!(error = %format!("{err:#}"), "request failed");
        }
        ServiceError::new(status, format!("{err:#}"))
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }
}

impl ServiceState {
    fn new(api: FeatureLedgerApi) -> Self {
        Self { api, record_lock: Arc::new(Mutex::new(())) }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/catalog", get(catalog_list).post(catalog_add))
        .route("/v1/cart", get(cart_show))
        .route("/v1/features/use", post(features_use))
        .route("/v1/features/used", get(features_used))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let shopper = ShopperContext::new(args.currency, args.country)?;
    let state = ServiceState::new(FeatureLedgerApi::new(args.db, shopper));
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "feature ledger service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn catalog_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<CatalogResponse>>, ServiceError> {
    let features = state.api.list_features()?;
    Ok(Json(envelope(CatalogResponse { count: features.len(), features })))
}

async fn catalog_add(
    State(state): State<ServiceState>,
    Json(request): Json<AddFeatureRequest>,
) -> Result<Json<ServiceEnvelope<Feature>>, ServiceError> {
    let feature = state.api.add_feature(request)?;
    Ok(Json(envelope(feature)))
}

async fn cart_show(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Cart>>, ServiceError> {
    let cart = state
        .api
        .active_cart()?
        .ok_or_else(|| ServiceError::new(StatusCode::NOT_FOUND, "no active cart"))?;
    Ok(Json(envelope(cart)))
}

async fn features_use(
    State(state): State<ServiceState>,
    Json(request): Json<RecordFeatureUseRequest>,
) -> Result<Json<ServiceEnvelope<FeatureUseOutcome>>, ServiceError> {
    let _guard = state.record_lock.lock().await;
    let outcome = state.api.record_feature_use(&request)?;
    Ok(Json(envelope(outcome)))
}

async fn features_used(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<UsedFeaturesView>>, ServiceError> {
    let view = state.api.used_features()?;
    Ok(Json(envelope(view)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use feature_ledger_core::Decision;
    use http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("feature-ledger-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_state(db_path: PathBuf) -> ServiceState {
        let shopper = ShopperContext { currency: "EUR".to_string(), country: "DE".to_string() };
        ServiceState::new(FeatureLedgerApi::new(db_path, shopper))
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> Response {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request {method} {uri}: {err}"));

        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request {method} {uri} failed: {err}"),
        }
    }

    fn data_str<'a>(value: &'a Value, pointer: &str) -> &'a str {
        value
            .pointer(pointer)
            .and_then(Value::as_str)
            .unwrap_or_else(|| panic!("missing string at `{pointer}` in response: {value}"))
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = app(test_state(unique_temp_db_path()));

        let response = send(&router, "GET", "/v1/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(data_str(&value, "/data/status"), "ok");
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn service_catalog_use_and_used_flow_round_trip() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone()));

        for (id, key, name) in [("f1", "gift-wrap", "Gift wrap"), ("f2", "express", "Express")] {
            let response = send(
                &router,
                "POST",
                "/v1/catalog",
                Some(serde_json::json!({"id": id, "key": key, "name": name})),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let listed = response_json(send(&router, "GET", "/v1/catalog", None).await).await;
        assert_eq!(listed.pointer("/data/count").and_then(Value::as_u64), Some(2));

        let missing_cart = send(&router, "GET", "/v1/cart", None).await;
        assert_eq!(missing_cart.status(), StatusCode::NOT_FOUND);

        let first = response_json(
            send(&router, "POST", "/v1/features/use", Some(serde_json::json!({"key": "express"})))
                .await,
        )
        .await;
        assert_eq!(data_str(&first, "/data/decision"), "recorded");
        assert_eq!(first.pointer("/data/cart_created").and_then(Value::as_bool), Some(true));

        let repeat = response_json(
            send(&router, "POST", "/v1/features/use", Some(serde_json::json!({"key": "express"})))
                .await,
        )
        .await;
        assert_eq!(data_str(&repeat, "/data/decision"), "already_recorded");
        assert_eq!(repeat.pointer("/data/cart_updated").and_then(Value::as_bool), Some(false));

        let second = response_json(
            send(&router, "POST", "/v1/features/use", Some(serde_json::json!({"key": "gift-wrap"})))
                .await,
        )
        .await;
        assert_eq!(
            second.pointer("/data/used_feature_ids"),
            Some(&serde_json::json!(["f2", "f1"]))
        );

        let used = response_json(send(&router, "GET", "/v1/features/used", None).await).await;
        assert_eq!(data_str(&used, "/data/features/0/name"), "Gift wrap");
        assert_eq!(data_str(&used, "/data/features/1/name"), "Express");

        let cart = response_json(send(&router, "GET", "/v1/cart", None).await).await;
        assert_eq!(cart.pointer("/data/version").and_then(Value::as_i64), Some(3));
        assert_eq!(data_str(&cart, "/data/id"), data_str(&first, "/data/cart_id"));

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn blank_feature_key_is_a_bad_request() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone()));

        let response =
            send(&router, "POST", "/v1/features/use", Some(serde_json::json!({"key": "  "}))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert!(data_str(&value, "/error").contains("feature key must not be empty"));

        let invalid_feature = send(
            &router,
            "POST",
            "/v1/catalog",
            Some(serde_json::json!({"key": "", "name": "Nameless"})),
        )
        .await;
        assert_eq!(invalid_feature.status(), StatusCode::BAD_REQUEST);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_uses_of_one_feature_record_it_once() {
        const ROUNDS: usize = 5;
        const REQUESTS_PER_ROUND: usize = 8;

        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone()));
        for round in 0..ROUNDS {
            let response = send(
                &router,
                "POST",
                "/v1/catalog",
                Some(serde_json::json!({
                    "id": format!("f{round}"),
                    "key": format!("feature-{round}"),
                    "name": format!("Feature {round}")
                })),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        for round in 0..ROUNDS {
            let barrier = Arc::new(tokio::sync::Barrier::new(REQUESTS_PER_ROUND));
            let mut handles = Vec::new();
            for _ in 0..REQUESTS_PER_ROUND {
                let router = router.clone();
                let barrier = Arc::clone(&barrier);
                handles.push(tokio::spawn(async move {
                    barrier.wait().await;
                    let response = send(
                        &router,
                        "POST",
                        "/v1/features/use",
                        Some(serde_json::json!({"key": format!("feature-{round}")})),
                    )
                    .await;
                    assert_eq!(response.status(), StatusCode::OK);
                    response_json(response).await
                }));
            }

            let mut recorded = 0;
            for handle in handles {
                let value = handle.await.unwrap_or_else(|err| panic!("task panicked: {err}"));
                if data_str(&value, "/data/decision") == Decision::Recorded.as_str() {
                    recorded += 1;
                }
            }
            assert_eq!(recorded, 1, "round {round} recorded the feature {recorded} times");
        }

        let used = response_json(send(&router, "GET", "/v1/features/used", None).await).await;
        assert_eq!(
            used.pointer("/data/used_feature_ids"),
            Some(&serde_json::json!(["f0", "f1", "f2", "f3", "f4"]))
        );
        let cart = response_json(send(&router, "GET", "/v1/cart", None).await).await;
        assert_eq!(cart.pointer("/data/version").and_then(Value::as_i64), Some(6));

        let _ = std::fs::remove_file(&db_path);
    }
}
