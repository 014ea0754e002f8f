use std::time::Duration;

use salvo::http::header::HeaderName;
use salvo::prelude::*;
use salvo::rate_limiter::{BasicQuota, FixedGuard, MokaStore, RateIssuer, RateLimiter};

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Keys requests by client IP. Connections without an IP (in-process test
/// clients, unix sockets) share one bucket instead of being refused.
pub struct ClientIpIssuer;

impl ClientIpIssuer {
    fn key(req: &Request) -> String {
        let addr = req.remote_addr().to_string();
        let addr = addr.strip_prefix("socket://").unwrap_or(&addr);
        addr.parse::<std::net::SocketAddr>()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|_| addr.to_string())
    }
}

impl RateIssuer for ClientIpIssuer {
    type Key = String;

    async fn issue(&self, req: &mut Request, _depot: &Depot) -> Option<Self::Key> {
        Some(Self::key(req))
    }
}

/// `limit` requests per client within each `window`. Over the limit the
/// request is answered with 429 before reaching the handler.
pub fn webhook_rate_limiter(limit: usize, window: Duration) -> impl Handler {
    RateLimiter::new(
        FixedGuard::new(),
        MokaStore::new(),
        ClientIpIssuer,
        BasicQuota::new(
            limit,
            time::Duration::new(window.as_secs() as i64, window.subsec_nanos() as i32),
        ),
    )
}

/// Copies the id assigned by `RequestId` onto the response.
#[handler]
pub async fn expose_request_id(
    req: &mut Request,
    depot: &mut Depot,
    res: &mut Response,
    ctrl: &mut FlowCtrl,
) {
    ctrl.call_next(req, depot, res).await;
    if let Some(id) = req.headers().get(REQUEST_ID_HEADER).cloned() {
        res.headers_mut().insert(REQUEST_ID_HEADER, id);
    }
}
