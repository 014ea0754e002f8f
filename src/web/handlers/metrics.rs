use std::sync::Arc;

use salvo::http::header::{CONTENT_TYPE, HeaderValue};
use salvo::prelude::*;

use crate::db::DatabaseManager;
use crate::web::metrics::BridgeMetrics;

#[derive(Clone)]
pub struct MetricsHandler {
    metrics: Arc<BridgeMetrics>,
    db: DatabaseManager,
}

impl MetricsHandler {
    pub fn new(metrics: Arc<BridgeMetrics>, db: DatabaseManager) -> Self {
        Self { metrics, db }
    }
}

#[handler]
impl MetricsHandler {
    async fn handle(&self, res: &mut Response) {
        let body = self.metrics.render(self.db.cache_stats());
        res.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
        );
        res.write_body(body).ok();
    }
}
