//! Access token extraction
//!
//! Clients send the token as `Authorization: Bearer <token>` or as the
//! `access_token` query parameter. The header wins when both are present.

use std::convert::Infallible;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use url::form_urlencoded;

/// The caller's access token, if any. Absence is reported by the identity
/// resolver, not by the extractor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessToken(pub Option<String>);

#[async_trait]
impl<S> FromRequestParts<S> for AccessToken
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = from_header(&parts.headers).or_else(|| from_query(parts.uri.query()));
        Ok(AccessToken(token))
    }
}

impl AccessToken {
    pub fn into_inner(self) -> Option<String> {
        self.0
    }
}

fn from_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token.trim().to_owned())
        .filter(|token| !token.is_empty())
}

fn from_query(query: Option<&str>) -> Option<String> {
    form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == "access_token")
        .map(|(_, value)| value.into_owned())
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> AccessToken {
        let (mut parts, _) = request.into_parts();
        AccessToken::from_request_parts(&mut parts, &()).await.unwrap()
    }

    #[tokio::test]
    async fn test_bearer_header() {
        let request = Request::get("/sync")
            .header(AUTHORIZATION, "Bearer abc")
            .body(())
            .unwrap();
        assert_eq!(extract(request).await, AccessToken(Some("abc".into())));
    }

    #[tokio::test]
    async fn test_query_parameter() {
        let request = Request::get("/sync?since=s1&access_token=a%2Bb").body(()).unwrap();
        assert_eq!(extract(request).await, AccessToken(Some("a+b".into())));
    }

    #[tokio::test]
    async fn test_header_wins_over_query() {
        let request = Request::get("/sync?access_token=query")
            .header(AUTHORIZATION, "Bearer header")
            .body(())
            .unwrap();
        assert_eq!(extract(request).await, AccessToken(Some("header".into())));
    }

    #[tokio::test]
    async fn test_no_token() {
        let request = Request::get("/sync")
            .header(AUTHORIZATION, "Basic dXNlcjpwYXNz")
            .body(())
            .unwrap();
        assert_eq!(extract(request).await, AccessToken(None));
    }
}
