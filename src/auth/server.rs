use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::CookieJar;
use log::debug;
use std::convert::Infallible;

use crate::auth::{verify_jwt_token, Claims, ACCESS_TOKEN_COOKIE};
use crate::state::AppState;
use crate::types::ErrorBody;

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Resolves the caller from the `Authorization` header, falling back to the
/// access token cookie. Requests without a valid token pass through with no
/// identity attached.
pub async fn attach_identity(
    cookie_jar: CookieJar,
    State(app_state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = bearer_token(request.headers())
        .map(str::to_string)
        .or_else(|| cookie_jar.get(ACCESS_TOKEN_COOKIE).map(|c| c.value().to_string()));

    match token {
        Some(token) => match verify_jwt_token(&token, &app_state.config.jwt_secret) {
            Ok(claims) => {
                debug!("Identity attached for user: {}", claims.sub);
                request.extensions_mut().insert(claims);
            }
            Err(e) => {
                debug!("Token verification failed: {e:?}");
            }
        },
        None => debug!("No access token on {} {}", request.method(), request.uri()),
    }

    next.run(request).await
}

/// Rejects requests that `attach_identity` could not identify.
pub async fn require_auth(request: Request, next: Next) -> Response {
    if request.extensions().get::<Claims>().is_none() {
        debug!("Unauthenticated request to {}", request.uri());
        return (StatusCode::UNAUTHORIZED, Json(ErrorBody::new("Unauthorized"))).into_response();
    }
    next.run(request).await
}

/// The caller's claims when the request carried a valid token.
#[derive(Debug, Clone)]
pub struct MaybeClaims(pub Option<Claims>);

impl<S> FromRequestParts<S> for MaybeClaims
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeClaims(parts.extensions.get::<Claims>().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }
}
