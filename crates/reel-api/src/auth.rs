//! Caller identity.
//!
//! Authentication happens at the gateway, which forwards the verified owner
//! in `x-owner-id`. Requests reaching the API without it are rejected.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::ApiError;

pub const OWNER_HEADER: &str = "x-owner-id";

const MAX_OWNER_LEN: usize = 128;

/// Axum extractor for the calling owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner(pub String);

impl Owner {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let owner = parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::unauthorized("Missing owner identity"))?;

        if owner.len() > MAX_OWNER_LEN {
            return Err(ApiError::unauthorized("Invalid owner identity"));
        }

        Ok(Owner(owner.to_string()))
    }
}
