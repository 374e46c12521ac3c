//! 代理转发处理器

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::post,
};

use crate::fingerprint::{FingerprintEngine, RequestDecision};
use crate::telemetry::TelemetryService;

use super::stream::TapStream;

/// 代理共享状态
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<FingerprintEngine>,
    pub telemetry: Arc<TelemetryService>,
    pub client: reqwest::Client,
    pub upstream_base_url: String,
}

/// 创建代理路由：/v1/messages 走采样，其余路径透明转发
pub fn create_proxy_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(proxy_messages))
        .fallback(proxy_passthrough)
        .layer(DefaultBodyLimit::max(128 * 1024 * 1024))
        .with_state(state)
}

/// 请求侧不向上游转发的头
///
/// accept-encoding 必须丢弃：上游一旦压缩，SSE 分块就无法旁路解析
fn skip_request_header(name: &str) -> bool {
    matches!(
        name,
        "host"
            | "content-length"
            | "accept-encoding"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// 响应侧不向客户端回传的头
fn skip_response_header(name: &str) -> bool {
    matches!(
        name,
        "content-length" | "connection" | "keep-alive" | "transfer-encoding" | "trailer"
    )
}

fn upstream_error_response(prefix: &str, e: reqwest::Error) -> Response {
    tracing::error!("{}: {}", prefix, e);
    (
        StatusCode::BAD_GATEWAY,
        Json(serde_json::json!({
            "error": {"type": "upstream_error", "message": format!("{}: {}", prefix, e)}
        })),
    )
        .into_response()
}

/// POST /v1/messages
///
/// 请求先过采集引擎（封禁/强制策略/登记捕获），流式响应经 TapStream
/// 旁路采样后原样下发，非流式整体读出透传。
async fn proxy_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    #[cfg(feature = "sensitive-logs")]
    tracing::debug!(
        "请求体: {}",
        crate::common::truncate_with_ellipsis(&String::from_utf8_lossy(&body), 2048)
    );

    let existing_beta = headers.get("anthropic-beta").and_then(|v| v.to_str().ok());
    let (key, outgoing_body, beta_override) = match state.engine.on_request(&body, existing_beta) {
        RequestDecision::Block { body } => {
            return Response::builder()
                .status(StatusCode::FORBIDDEN)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
        RequestDecision::Forward {
            key,
            body: rewritten,
            beta_header,
        } => (key, rewritten.map(Bytes::from).unwrap_or(body), beta_header),
    };

    let url = format!(
        "{}/v1/messages",
        state.upstream_base_url.trim_end_matches('/')
    );
    let mut request = state.client.post(&url);
    for (name, value) in headers.iter() {
        if skip_request_header(name.as_str()) {
            continue;
        }
        request = request.header(name, value);
    }
    if let Some(beta) = beta_override {
        request = request.header("anthropic-beta", beta);
    }

    let upstream = match request.body(outgoing_body).send().await {
        Ok(resp) => resp,
        Err(e) => {
            // 把登记的捕获收回来，不等 TTL 清扫
            let _ = state.engine.on_response_complete(key);
            return upstream_error_response("上游请求失败", e);
        }
    };

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let streaming = state.engine.on_response_headers(key, &upstream_headers);

    let mut builder = Response::builder().status(status);
    for (name, value) in upstream_headers.iter() {
        if skip_response_header(name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }

    if streaming {
        let tap = TapStream::new(
            upstream.bytes_stream(),
            key,
            state.engine.clone(),
            state.telemetry.clone(),
        );
        builder
            .body(Body::from_stream(tap))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    } else {
        match upstream.bytes().await {
            Ok(bytes) => {
                // 非流式响应不采样，但要把捕获移出登记表
                if let Some(sample) = state.engine.on_response_complete(key) {
                    state.telemetry.submit(sample);
                }
                builder
                    .body(Body::from(bytes))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
            Err(e) => {
                let _ = state.engine.on_response_complete(key);
                upstream_error_response("读取上游响应失败", e)
            }
        }
    }
}

/// 其余路径透明转发（count_tokens、models 等）
async fn proxy_passthrough(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": {"type": "invalid_request_error", "message": format!("读取请求体失败: {}", e)}
                })),
            )
                .into_response();
        }
    };

    let path_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!(
        "{}{}",
        state.upstream_base_url.trim_end_matches('/'),
        path_query
    );

    let mut request = state.client.request(parts.method, &url);
    for (name, value) in parts.headers.iter() {
        if skip_request_header(name.as_str()) {
            continue;
        }
        request = request.header(name, value);
    }

    match request.body(body_bytes).send().await {
        Ok(upstream) => {
            let status = upstream.status();
            let upstream_headers = upstream.headers().clone();
            match upstream.bytes().await {
                Ok(bytes) => {
                    let mut builder = Response::builder().status(status);
                    for (name, value) in upstream_headers.iter() {
                        if skip_response_header(name.as_str()) {
                            continue;
                        }
                        builder = builder.header(name, value);
                    }
                    builder
                        .body(Body::from(bytes))
                        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
                }
                Err(e) => upstream_error_response("读取上游响应失败", e),
            }
        }
        Err(e) => upstream_error_response("上游请求失败", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::fingerprint::EngineSettings;

    #[test]
    fn test_header_filters() {
        assert!(skip_request_header("host"));
        assert!(skip_request_header("accept-encoding"));
        assert!(skip_request_header("content-length"));
        assert!(!skip_request_header("x-api-key"));
        assert!(!skip_request_header("anthropic-version"));

        assert!(skip_response_header("transfer-encoding"));
        assert!(!skip_response_header("anthropic-ratelimit-unified-5h-utilization"));
        assert!(!skip_response_header("request-id"));
    }

    /// 状态可克隆、路由可构建
    #[tokio::test]
    async fn test_router_construction() {
        let state = AppState {
            engine: Arc::new(FingerprintEngine::new(EngineSettings::default())),
            telemetry: Arc::new(TelemetryService::new(":memory:").unwrap()),
            client: reqwest::Client::new(),
            upstream_base_url: "https://api.anthropic.com".to_string(),
        };
        let _cloned = state.clone();
        let _router = create_proxy_router(state);
    }
}
