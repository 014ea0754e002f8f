use std::sync::Arc;

use salvo::prelude::*;
use tracing::warn;

use crate::bridge::BridgeCore;
use crate::viber::SIGNATURE_HEADERS;

/// `POST /webhook`: hands the raw body and signature to the relay core.
#[derive(Clone)]
pub struct WebhookHandler {
    core: Arc<BridgeCore>,
    max_body_bytes: usize,
}

impl WebhookHandler {
    pub fn new(core: Arc<BridgeCore>, max_body_bytes: usize) -> Self {
        Self {
            core,
            max_body_bytes,
        }
    }
}

fn signature_header(req: &Request) -> Option<String> {
    SIGNATURE_HEADERS.iter().find_map(|name| {
        req.headers()
            .get(*name)
            .and_then(|value| value.to_str().ok())
            .map(ToOwned::to_owned)
    })
}

#[handler]
impl WebhookHandler {
    async fn handle(&self, req: &mut Request, res: &mut Response) {
        let signature = signature_header(req);
        let body = match req.payload_with_max_size(self.max_body_bytes).await {
            Ok(body) => body.to_vec(),
            Err(err) => {
                warn!("viber webhook body rejected: {err}");
                res.status_code(StatusCode::PAYLOAD_TOO_LARGE);
                res.render(Text::Plain("payload too large"));
                return;
            }
        };

        let reply = self.core.handle_webhook(body, signature.as_deref()).await;
        res.status_code(
            StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        );
        res.render(Text::Plain(reply.body));
    }
}
