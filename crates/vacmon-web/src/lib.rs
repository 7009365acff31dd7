//! Axum JSON API for VACMON.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use vacmon_analytics::{
    Aggregator, ChatCompletionsGenerator, InsightConfig, InsightError, MarketAnalyst,
};
use vacmon_storage::VacancyStore;
use vacmon_sync::SyncPipeline;

pub const CRATE_NAME: &str = "vacmon-web";

const DEFAULT_PAGE_LIMIT: i64 = 100;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
    pub analyst: MarketAnalyst,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>, analyst: MarketAnalyst) -> Self {
        Self { pipeline, analyst }
    }

    fn store(&self) -> &VacancyStore {
        self.pipeline.store()
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    skip: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CleanupQuery {
    days: Option<i64>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/vacancies", get(vacancies_handler))
        .route("/vacancies/stats", get(stats_handler))
        .route("/vacancies/refresh", post(refresh_handler))
        .route("/vacancies/cleanup", delete(cleanup_handler))
        .route("/analytics/market-insights", get(market_insights_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("VACMON_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);

    let pipeline = Arc::new(vacmon_sync::pipeline_from_env().await?);
    let generator = ChatCompletionsGenerator::new(InsightConfig::from_env())?;
    let state = AppState::new(pipeline.clone(), MarketAnalyst::new(Arc::new(generator)));

    // held for the lifetime of the server
    let _scheduler = pipeline.start_scheduler().await?;

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "vacmon api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler() -> Json<serde_json::Value> {
    Json(json!({
        "service": "vacmon",
        "message": "Vacancy market monitor API",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn vacancies_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let skip = query.skip.unwrap_or(0);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    match state.store().list(skip, limit).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store().all().await {
        Ok(rows) => Json(Aggregator::default().aggregate(&rows)).into_response(),
        Err(err) => server_error(err),
    }
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    let summary = state.pipeline.collect_all().await;
    Json(summary).into_response()
}

async fn cleanup_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CleanupQuery>,
) -> Response {
    let days = query
        .days
        .unwrap_or(state.pipeline.config().retention_days);
    match state.pipeline.purge(days).await {
        Ok(deleted_count) => Json(json!({ "deleted_count": deleted_count })).into_response(),
        Err(err) => server_error(err),
    }
}

async fn market_insights_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.analyst.analyze(state.store(), Utc::now()).await {
        Ok(result) => Json(json!({ "analysis": result.analysis })).into_response(),
        Err(err) => match err.downcast_ref::<InsightError>() {
            Some(insight_err) => {
                warn!(error = %insight_err, "insight generation failed");
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({ "error": insight_err.to_string() })),
                )
                    .into_response()
            }
            None => server_error(err),
        },
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{DateTime, Duration};
    use http_body_util::BodyExt;
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;
    use vacmon_analytics::InsightGenerator;
    use vacmon_core::{TechStack, VacancyDraft};
    use vacmon_sync::{SourceRegistry, SyncConfig};

    struct CannedGenerator(Result<&'static str, ()>);

    #[async_trait]
    impl InsightGenerator for CannedGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String, InsightError> {
            match self.0 {
                Ok(text) => Ok(text.to_string()),
                Err(()) => Err(InsightError::Status {
                    status: 401,
                    body: "invalid key".into(),
                }),
            }
        }
    }

    async fn state_with(generator: CannedGenerator) -> AppState {
        let store = VacancyStore::in_memory().await.unwrap();
        let config = SyncConfig {
            min_delay_secs: 0,
            max_delay_secs: 0,
            workspace_root: "/nonexistent-vacmon-root".into(),
            ..Default::default()
        };
        let pipeline = SyncPipeline::new(config, store)
            .unwrap()
            .with_registry(SourceRegistry { sources: vec![] });
        AppState::new(Arc::new(pipeline), MarketAnalyst::new(Arc::new(generator)))
    }

    async fn seed(state: &AppState, n: u32, at: DateTime<Utc>) {
        let draft = VacancyDraft {
            source: "hh.ru".into(),
            url: format!("https://hh.ru/vacancy/{n}"),
            title: format!("Python developer {n}"),
            company: "Acme".into(),
            city: Some("Москва".into()),
            tech_stack: TechStack::from_iter(["python", "docker"]),
            salary_from: Some(1000.0),
            salary_to: None,
            currency: Some("RUR".into()),
        };
        let mut tx = state.store().begin().await.unwrap();
        vacmon_storage::insert_vacancy(&mut tx, &draft, at).await.unwrap();
        tx.commit().await.unwrap();
    }

    async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, JsonValue) {
        let resp = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn handler_smoke_root_and_health() {
        let app = app(state_with(CannedGenerator(Ok("ok"))).await);
        let (status, body) = send(app.clone(), "GET", "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "vacmon");

        let (status, body) = send(app, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn handler_lists_vacancies_with_paging() {
        let state = state_with(CannedGenerator(Ok("ok"))).await;
        for n in 0..3 {
            seed(&state, n, Utc::now()).await;
        }
        let app = app(state);

        let (status, body) = send(app.clone(), "GET", "/vacancies").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 3);

        let (_, body) = send(app, "GET", "/vacancies?skip=1&limit=1").await;
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["url"], "https://hh.ru/vacancy/1");
        assert_eq!(rows[0]["tech_stack"], serde_json::json!(["python", "docker"]));
    }

    #[tokio::test]
    async fn handler_stats_aggregates_store() {
        let state = state_with(CannedGenerator(Ok("ok"))).await;
        seed(&state, 1, Utc::now()).await;
        seed(&state, 2, Utc::now()).await;
        let (status, body) = send(app(state), "GET", "/vacancies/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["technologies"]["top"][0]["key"], "python");
        assert_eq!(body["technologies"]["top"][0]["count"], 2);
        assert_eq!(body["salary"]["specified"], 2);
    }

    #[tokio::test]
    async fn handler_refresh_returns_run_summary() {
        let app = app(state_with(CannedGenerator(Ok("ok"))).await);
        let (status, body) = send(app, "POST", "/vacancies/refresh").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totals"]["new_count"], 0);
        assert!(body["run_id"].is_string());
    }

    #[tokio::test]
    async fn handler_cleanup_reports_deleted_count() {
        let state = state_with(CannedGenerator(Ok("ok"))).await;
        seed(&state, 1, Utc::now() - Duration::days(40)).await;
        seed(&state, 2, Utc::now()).await;
        let app = app(state);

        let (status, body) = send(app.clone(), "DELETE", "/vacancies/cleanup?days=30").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted_count"], 1);

        let (_, body) = send(app, "DELETE", "/vacancies/cleanup").await;
        assert_eq!(body["deleted_count"], 0);
    }

    #[tokio::test]
    async fn handler_cleanup_with_out_of_range_days_deletes_nothing() {
        let state = state_with(CannedGenerator(Ok("ok"))).await;
        seed(&state, 1, Utc::now() - Duration::days(400)).await;
        let uri = format!("/vacancies/cleanup?days={}", i64::MAX);
        let (status, body) = send(app(state), "DELETE", &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted_count"], 0);
    }

    #[tokio::test]
    async fn handler_market_insights_success() {
        let app = app(state_with(CannedGenerator(Ok("python keeps growing"))).await);
        let (status, body) = send(app, "GET", "/analytics/market-insights").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["analysis"], "python keeps growing");
    }

    #[tokio::test]
    async fn handler_market_insights_generator_failure_is_bad_gateway() {
        let app = app(state_with(CannedGenerator(Err(()))).await);
        let (status, body) = send(app, "GET", "/analytics/market-insights").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("401"));
    }
}
