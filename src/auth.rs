// 鉴权辅助：统一路径保护规则与 Bearer 令牌解析。
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;

pub fn is_protected_path(path: &str) -> bool {
    if !path.starts_with("/codebox") {
        return false;
    }
    if path.starts_with("/codebox/auth/login") {
        return false;
    }
    if path.starts_with("/codebox/health") {
        return false;
    }
    true
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?;
    let text = value.to_str().ok()?.trim();
    if let Some(prefix) = text.get(..7) {
        if prefix.eq_ignore_ascii_case("bearer ") {
            if let Some(raw) = text.get(7..) {
                let cleaned = raw.trim();
                if !cleaned.is_empty() {
                    return Some(cleaned.to_string());
                }
            }
        }
    }
    None
}

/// 浏览器 WebSocket 不便携带请求头，兼容 ?token= 查询参数。
pub fn extract_query_token(query: Option<&str>) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some("token") {
            let value = parts.next().unwrap_or("").trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_is_protected_path() {
        assert!(!is_protected_path("/"));
        assert!(!is_protected_path("/codebox/auth/login"));
        assert!(!is_protected_path("/codebox/health"));
        assert!(is_protected_path("/codebox/containers"));
        assert!(is_protected_path("/codebox/auth/me"));
        assert!(is_protected_path("/codebox/terminal/ws/abc"));
    }

    #[test]
    fn bearer_extraction_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("BEARER cbt_abc"));
        assert_eq!(extract_bearer_token(&headers), Some("cbt_abc".to_string()));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn query_token_extraction() {
        assert_eq!(
            extract_query_token(Some("foo=1&token=cbt_xyz")),
            Some("cbt_xyz".to_string())
        );
        assert_eq!(extract_query_token(Some("foo=1")), None);
        assert_eq!(extract_query_token(None), None);
    }
}
