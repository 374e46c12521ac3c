//! API Key 提取与校验

use axum::{body::Body, http::Request};
use subtle::ConstantTimeEq;

/// 从请求头中提取 API Key
///
/// 依次尝试 x-api-key 和 Authorization: Bearer
pub fn extract_api_key(request: &Request<Body>) -> Option<String> {
    if let Some(key) = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
    {
        return Some(key.to_string());
    }
    request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

/// 常量时间比较，防止时序攻击
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_header(name: &str, value: &str) -> Request<Body> {
        Request::builder()
            .header(name, value)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_extract_from_x_api_key() {
        let req = request_with_header("x-api-key", "sk-test-123");
        assert_eq!(extract_api_key(&req).as_deref(), Some("sk-test-123"));
    }

    #[test]
    fn test_extract_from_bearer() {
        let req = request_with_header("authorization", "Bearer sk-test-456");
        assert_eq!(extract_api_key(&req).as_deref(), Some("sk-test-456"));
    }

    /// x-api-key 优先于 Authorization
    #[test]
    fn test_x_api_key_takes_precedence() {
        let req = Request::builder()
            .header("x-api-key", "primary")
            .header("authorization", "Bearer secondary")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_api_key(&req).as_deref(), Some("primary"));
    }

    #[test]
    fn test_missing_key_and_wrong_scheme() {
        let req = Request::builder().body(Body::empty()).unwrap();
        assert!(extract_api_key(&req).is_none());

        let req = request_with_header("authorization", "Basic dXNlcg==");
        assert!(extract_api_key(&req).is_none());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("sk-abc", "sk-abc"));
        assert!(!constant_time_eq("sk-abc", "sk-abd"));
        assert!(!constant_time_eq("sk-abc", "sk-abc-longer"));
        assert!(constant_time_eq("", ""));
    }
}
