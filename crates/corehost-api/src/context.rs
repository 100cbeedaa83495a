//! Request context extraction and authentication middleware.
//!
//! In debug mode the principal is supplied via `X-Principal-Kind` and
//! `X-User-Id` headers for local development. In production mode both come
//! from a verified HS256 JWT: the kind claim (default `kind`) and the user
//! claim (default `sub`).

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{FromRequestParts, State};
use axum::http::header::HeaderName;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::Value;
use ulid::Ulid;

use crate::error::ApiError;
use crate::server::AppState;

/// Header name for request IDs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Who is making the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// Console administrator; manages the version registry and deployments.
    Admin {
        /// Administrator identifier.
        user_id: String,
    },
    /// A user of one instance; role and scope come from the instance directory.
    InstanceUser {
        /// Instance user identifier.
        user_id: u64,
    },
}

impl Principal {
    /// Parses a principal from its kind label and user identifier.
    ///
    /// Returns `None` for unknown kinds or non-numeric instance user IDs.
    #[must_use]
    pub fn parse(kind: &str, user_id: &str) -> Option<Self> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return None;
        }
        match kind.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Self::Admin {
                user_id: user_id.to_string(),
            }),
            "instance_user" => user_id
                .parse::<u64>()
                .ok()
                .map(|user_id| Self::InstanceUser { user_id }),
            _ => None,
        }
    }

    /// Kind label, as it appears in tokens and headers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Admin { .. } => "admin",
            Self::InstanceUser { .. } => "instance_user",
        }
    }

    /// Instance user ID, if this is an instance user.
    #[must_use]
    pub const fn instance_user_id(&self) -> Option<u64> {
        match self {
            Self::Admin { .. } => None,
            Self::InstanceUser { user_id } => Some(*user_id),
        }
    }
}

/// Per-request context derived from authentication and headers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The authenticated principal.
    pub principal: Principal,
    /// Request ID for tracing/correlation.
    pub request_id: String,
}

impl RequestContext {
    /// Requires a console administrator.
    ///
    /// # Errors
    ///
    /// Returns a 403 error for any other principal.
    pub fn require_admin(&self) -> Result<(), ApiError> {
        match self.principal {
            Principal::Admin { .. } => Ok(()),
            Principal::InstanceUser { .. } => Err(ApiError::forbidden(
                "this operation requires a console administrator",
            )
            .with_request_id(self.request_id.clone())),
        }
    }

    /// Wraps `err` with this request's ID.
    #[must_use]
    pub fn error(&self, err: impl Into<ApiError>) -> ApiError {
        err.into().with_request_id(self.request_id.clone())
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequestContext {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if let Some(existing) = parts.extensions.get::<Self>() {
            return Ok(existing.clone());
        }

        let headers = &parts.headers;
        let request_id =
            request_id_from_headers(headers).unwrap_or_else(|| Ulid::new().to_string());

        let principal = if state.config.debug {
            principal_from_headers(headers, &request_id)?
        } else {
            principal_from_jwt(headers, state, &request_id)?
        };

        let ctx = Self {
            principal,
            request_id,
        };

        parts.extensions.insert(ctx.clone());
        Ok(ctx)
    }
}

fn principal_from_headers(headers: &HeaderMap, request_id: &str) -> Result<Principal, ApiError> {
    let kind = header_string(headers, "X-Principal-Kind").ok_or_else(|| {
        ApiError::unauthorized("missing X-Principal-Kind header (debug mode)")
            .with_request_id(request_id.to_string())
    })?;
    let user_id = header_string(headers, "X-User-Id").ok_or_else(|| {
        ApiError::unauthorized("missing X-User-Id header (debug mode)")
            .with_request_id(request_id.to_string())
    })?;
    Principal::parse(&kind, &user_id).ok_or_else(|| {
        ApiError::unauthorized(format!("unrecognized principal '{kind}' / '{user_id}'"))
            .with_request_id(request_id.to_string())
    })
}

fn principal_from_jwt(
    headers: &HeaderMap,
    state: &AppState,
    request_id: &str,
) -> Result<Principal, ApiError> {
    let token = bearer_token(headers)
        .ok_or_else(|| ApiError::missing_auth().with_request_id(request_id.to_string()))?;

    let jwt = &state.config.jwt;
    let Some(secret) = jwt.hs256_secret.as_deref() else {
        return Err(
            ApiError::internal("jwt.hs256_secret is required when debug=false")
                .with_request_id(request_id.to_string()),
        );
    };

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_nbf = true;
    if let Some(iss) = jwt.issuer.as_deref() {
        validation.set_issuer(&[iss]);
    }
    if let Some(aud) = jwt.audience.as_deref() {
        validation.set_audience(&[aud]);
    }

    let data = jsonwebtoken::decode::<Value>(
        &token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|_| ApiError::invalid_token().with_request_id(request_id.to_string()))?;

    let Some(obj) = data.claims.as_object() else {
        return Err(ApiError::invalid_token().with_request_id(request_id.to_string()));
    };

    let kind = extract_required_claim(obj, &jwt.kind_claim, request_id)?;
    let user_id = extract_required_claim(obj, &jwt.user_claim, request_id)?;
    Principal::parse(&kind, &user_id)
        .ok_or_else(|| ApiError::invalid_token().with_request_id(request_id.to_string()))
}

fn request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    header_string(headers, "X-Request-Id")
}

/// Reads a claim as a string; numeric user IDs are accepted too.
fn extract_required_claim(
    obj: &serde_json::Map<String, Value>,
    claim: &str,
    request_id: &str,
) -> Result<String, ApiError> {
    let value = match obj.get(claim) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    value.ok_or_else(|| ApiError::invalid_token().with_request_id(request_id.to_string()))
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = header_string(headers, "Authorization")?;
    let token = raw.strip_prefix("Bearer ")?;
    Some(token.to_string())
}

pub(crate) fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(name)?;
    header_value_to_string(value)
}

fn header_value_to_string(value: &HeaderValue) -> Option<String> {
    value.to_str().ok().map(str::to_string)
}

/// Authentication middleware.
///
/// Injects a verified [`RequestContext`] into request extensions and echoes
/// the request ID on the response.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let (mut parts, body) = req.into_parts();

    let ctx = match RequestContext::from_request_parts(&mut parts, &state).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };

    let mut req = Request::from_parts(parts, body);
    let request_id = ctx.request_id.clone();
    req.extensions_mut().insert(ctx);

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_principal_kinds() {
        assert_eq!(
            Principal::parse("admin", "ops"),
            Some(Principal::Admin {
                user_id: "ops".into()
            })
        );
        assert_eq!(
            Principal::parse("INSTANCE_USER", " 42 "),
            Some(Principal::InstanceUser { user_id: 42 })
        );
    }

    #[test]
    fn rejects_unknown_kinds_and_bad_ids() {
        assert_eq!(Principal::parse("client", "1"), None);
        assert_eq!(Principal::parse("instance_user", "alice"), None);
        assert_eq!(Principal::parse("admin", "  "), None);
    }

    #[test]
    fn numeric_claims_are_accepted() {
        let claims = serde_json::json!({ "sub": 42, "kind": "instance_user" });
        let obj = claims.as_object().unwrap();
        assert_eq!(extract_required_claim(obj, "sub", "r").unwrap(), "42");
        assert!(extract_required_claim(obj, "missing", "r").is_err());
    }

    #[test]
    fn bearer_token_requires_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
        headers.insert("Authorization", HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc"));
    }
}
