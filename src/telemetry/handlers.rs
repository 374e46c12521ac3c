//! 指纹样本 API 处理器

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};

use super::router::TelemetryState;
use super::types::SampleQuery;

/// GET /api/fingerprint/samples
pub async fn get_samples(
    State(state): State<TelemetryState>,
    Query(query): Query<SampleQuery>,
) -> impl IntoResponse {
    // 校验时间格式
    if let Some(ref t) = query.start_time {
        if chrono::DateTime::parse_from_rfc3339(t).is_err() {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": {"type": "invalid_request_error", "message": format!("无效的 startTime 格式，需要 RFC3339 格式: {}", t)}
                })),
            ).into_response();
        }
    }
    if let Some(ref t) = query.end_time {
        if chrono::DateTime::parse_from_rfc3339(t).is_err() {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": {"type": "invalid_request_error", "message": format!("无效的 endTime 格式，需要 RFC3339 格式: {}", t)}
                })),
            ).into_response();
        }
    }
    match state.service.query(query).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            tracing::error!("查询样本失败: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": {"type": "internal_error", "message": format!("查询失败: {}", e)}
                })),
            )
                .into_response()
        }
    }
}

/// GET /api/fingerprint/samples/latest
pub async fn get_latest_sample(State(state): State<TelemetryState>) -> impl IntoResponse {
    match state.service.latest().await {
        Ok(Some(sample)) => Json(sample).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": {"type": "not_found_error", "message": "还没有任何样本"}
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("查询最新样本失败: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": {"type": "internal_error", "message": format!("查询失败: {}", e)}
                })),
            )
                .into_response()
        }
    }
}

/// GET /api/fingerprint/stats
pub async fn get_overview(State(state): State<TelemetryState>) -> impl IntoResponse {
    match state.service.get_stats().await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            tracing::error!("获取总览统计失败: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": {"type": "internal_error", "message": format!("统计失败: {}", e)}
                })),
            )
                .into_response()
        }
    }
}

/// GET /api/fingerprint/models
pub async fn get_model_stats(State(state): State<TelemetryState>) -> impl IntoResponse {
    match state.service.model_stats().await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            tracing::error!("获取模型基线失败: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": {"type": "internal_error", "message": format!("查询失败: {}", e)}
                })),
            )
                .into_response()
        }
    }
}

/// GET /api/fingerprint/sessions
pub async fn get_session_stats(State(state): State<TelemetryState>) -> impl IntoResponse {
    match state.service.session_stats().await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            tracing::error!("获取会话汇总失败: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": {"type": "internal_error", "message": format!("查询失败: {}", e)}
                })),
            )
                .into_response()
        }
    }
}

/// DELETE /api/fingerprint/samples
pub async fn clear_samples(State(state): State<TelemetryState>) -> impl IntoResponse {
    match state.service.clear().await {
        Ok(count) => Json(serde_json::json!({
            "success": true,
            "message": format!("已清除 {} 条样本", count)
        }))
        .into_response(),
        Err(e) => {
            tracing::error!("清空样本失败: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": {"type": "internal_error", "message": format!("清空失败: {}", e)}
                })),
            )
                .into_response()
        }
    }
}
