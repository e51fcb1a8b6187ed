//! Request and lifecycle counters.
//!
//! The sink is built once at start-up and handed to the router and the
//! transfer service; nothing here is global.

use std::sync::Arc;

use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use tracing::info;

/// Lifecycle events worth counting beyond raw request totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    TokenIssued,
    Uploaded,
    Downloaded,
    DurableMinted,
    DurableReused,
    PaymentRejected,
    Swept,
}

impl Event {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TokenIssued => "token.issued",
            Self::Uploaded => "token.uploaded",
            Self::Downloaded => "token.downloaded",
            Self::DurableMinted => "durable.minted",
            Self::DurableReused => "durable.reused",
            Self::PaymentRejected => "payment.rejected",
            Self::Swept => "token.swept",
        }
    }
}

pub trait MetricsSink: Send + Sync {
    fn record_request(&self, route: &str, status: u16);
    fn record_event(&self, event: Event, count: u64);
    /// Emit accumulated totals, e.g. at shutdown.
    fn report(&self) {}
}

/// In-memory counters keyed by route/status and by event.
#[derive(Default)]
pub struct RouteCounters {
    requests: DashMap<(String, u16), u64>,
    events: DashMap<Event, u64>,
}

impl RouteCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self, route: &str, status: u16) -> u64 {
        self.requests
            .get(&(route.to_owned(), status))
            .map_or(0, |n| *n)
    }

    pub fn events(&self, event: Event) -> u64 {
        self.events.get(&event).map_or(0, |n| *n)
    }
}

impl MetricsSink for RouteCounters {
    fn record_request(&self, route: &str, status: u16) {
        *self
            .requests
            .entry((route.to_owned(), status))
            .or_insert(0) += 1;
    }

    fn record_event(&self, event: Event, count: u64) {
        *self.events.entry(event).or_insert(0) += count;
    }

    fn report(&self) {
        for entry in self.requests.iter() {
            let (route, status) = entry.key();
            info!(route = %route, status, count = *entry.value(), "request total");
        }
        for entry in self.events.iter() {
            info!(event = entry.key().as_str(), count = *entry.value(), "event total");
        }
    }
}

/// Route-layer middleware counting each request by matched route and status.
pub async fn track_requests(
    State(metrics): State<Arc<dyn MetricsSink>>,
    req: Request,
    next: Next,
) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned());
    let resp = next.run(req).await;
    if let Some(route) = route {
        metrics.record_request(&route, resp.status().as_u16());
    }
    resp
}
