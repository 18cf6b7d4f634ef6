//! Load shedding middleware for axum
//!
//! Per request:
//! - exempt paths go straight through, uncounted and unmeasured
//! - otherwise the [`LoadShedder`] draws a verdict
//! - rejected requests get the rejection handler's response; the wrapped
//!   handler never runs and the body is never read
//! - accepted requests hold a [`RequestTicket`](crate::shed::RequestTicket)
//!   while the handler runs, which feeds latency and in-flight count back
//!   on every exit path

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, trace};

use crate::shed::{LoadShedder, Verdict};

/// Seconds suggested to shed clients before retrying
const RETRY_AFTER_SECS: &str = "1";

/// Shedding middleware, for use with [`middleware::from_fn_with_state`]
pub async fn load_shed_middleware(
    State(shedder): State<Arc<LoadShedder>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path();

    if shedder.is_exempt(path) {
        trace!(path = %path, "Exempt path, skipping load shedding");
        shedder.stats().record_exempt();
        return next.run(request).await;
    }

    match shedder.decide() {
        Verdict::Reject => {
            debug!(path = %path, method = %request.method(), "Request shed");
            shedder.reject(&request)
        }
        Verdict::Accept => {
            let _ticket = shedder.begin();
            next.run(request).await
        }
    }
}

/// Wrap every route of `router` in load shedding
pub fn with_load_shedding<S>(router: Router<S>, shedder: Arc<LoadShedder>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(middleware::from_fn_with_state(shedder, load_shed_middleware))
}

/// Default rejection: 503 Service Unavailable with a short JSON body
pub fn default_rejection(_request: &Request<Body>) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::RETRY_AFTER, RETRY_AFTER_SECS)],
        Json(json!({
            "error": {
                "code": 503,
                "message": "Service Unavailable: server is shedding load, retry later"
            }
        })),
    )
        .into_response()
}
