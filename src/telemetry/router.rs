//! 指纹样本 API 路由

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json},
    routing::get,
};

use crate::common::auth;

use super::handlers::{
    clear_samples, get_latest_sample, get_model_stats, get_overview, get_samples,
    get_session_stats,
};
use super::store::TelemetryService;

/// 指纹样本 API 状态
#[derive(Clone)]
pub struct TelemetryState {
    pub admin_api_key: Option<String>,
    pub service: Arc<TelemetryService>,
}

/// 指纹样本 API 认证中间件
///
/// 未配置 adminApiKey 时放行所有请求(本机调试场景)
async fn telemetry_auth_middleware(
    State(state): State<TelemetryState>,
    request: Request<Body>,
    next: Next,
) -> axum::response::Response {
    let Some(ref admin_api_key) = state.admin_api_key else {
        return next.run(request).await;
    };
    match auth::extract_api_key(&request) {
        Some(key) if auth::constant_time_eq(&key, admin_api_key) => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": {"type": "authentication_error", "message": "Invalid API key"}
            })),
        )
            .into_response(),
    }
}

/// 创建指纹样本 API 路由
///
/// 返回 Router<()>，可直接 nest 到主应用
pub fn create_telemetry_router(
    admin_api_key: Option<String>,
    service: Arc<TelemetryService>,
) -> Router {
    let state = TelemetryState {
        admin_api_key,
        service,
    };

    Router::new()
        .route("/samples", get(get_samples).delete(clear_samples))
        .route("/samples/latest", get(get_latest_sample))
        .route("/stats", get(get_overview))
        .route("/models", get(get_model_stats))
        .route("/sessions", get(get_session_stats))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            telemetry_auth_middleware,
        ))
        .with_state(state)
}
