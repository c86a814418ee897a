//! Request authorization: bearer token → principal name.
//!
//! The principal is the assignee recorded when a dequeue hands out tasks,
//! and the only one allowed to push their results.

use std::collections::BTreeMap;

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;

/// Principal used when authorization is disabled and no token is sent.
pub const ANONYMOUS: &str = "anonymous";

pub trait Authorizer: Send + Sync + 'static {
    /// Resolve the caller, or `None` to refuse the request.
    fn principal(&self, token: Option<&str>) -> Option<String>;
}

/// Accepts every caller. A bearer token, if any, names the principal.
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn principal(&self, token: Option<&str>) -> Option<String> {
        Some(token.unwrap_or(ANONYMOUS).to_string())
    }
}

/// Fixed token table.
pub struct StaticTokens {
    tokens: BTreeMap<String, String>,
}

impl StaticTokens {
    pub fn new(tokens: BTreeMap<String, String>) -> Self {
        Self { tokens }
    }
}

impl Authorizer for StaticTokens {
    fn principal(&self, token: Option<&str>) -> Option<String> {
        self.tokens.get(token?).cloned()
    }
}

/// Extract the token of an `Authorization: Bearer …` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        assert_eq!(bearer_token(&headers), Some("s3cret"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn static_tokens_map_to_principals() {
        let auth = StaticTokens::new(BTreeMap::from([("t1".to_string(), "node-a".to_string())]));
        assert_eq!(auth.principal(Some("t1")).as_deref(), Some("node-a"));
        assert_eq!(auth.principal(Some("t2")), None);
        assert_eq!(auth.principal(None), None);
    }

    #[test]
    fn allow_all_names_anonymous() {
        assert_eq!(AllowAll.principal(None).as_deref(), Some(ANONYMOUS));
        assert_eq!(AllowAll.principal(Some("node-b")).as_deref(), Some("node-b"));
    }
}
