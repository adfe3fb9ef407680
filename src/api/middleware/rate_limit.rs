use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tracing::warn;

use crate::api::error::{ErrorNumber, ErrorResponse};

pub type SharedLimiter = Arc<DefaultDirectRateLimiter>;

/// One bucket shared by all mutating routes: each start or sweep fans out
/// into dozens of hypervisor calls.
pub fn mutating_limiter(requests_per_minute: u32) -> SharedLimiter {
    let per_minute = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(Quota::per_minute(per_minute)))
}

#[derive(Debug)]
pub struct RateLimitExceeded;

impl IntoResponse for RateLimitExceeded {
    fn into_response(self) -> Response {
        ErrorResponse::new(
            StatusCode::TOO_MANY_REQUESTS,
            ErrorNumber::RateLimited,
            "Rate limit exceeded. Please try again later.",
        )
        .into_response()
    }
}

pub async fn rate_limit(
    State(limiter): State<SharedLimiter>,
    request: Request,
    next: Next,
) -> Response {
    match limiter.check() {
        Ok(()) => next.run(request).await,
        Err(_) => {
            warn!(path = %request.uri().path(), "Rate limit exceeded");
            RateLimitExceeded.into_response()
        }
    }
}
