//! Inspection HTTP endpoint: live connections, stats, Prometheus metrics.
//!
//! No authentication; meant to be bound to loopback. An optional CIDR
//! allowlist rejects anything else.

use crate::cache::VerdictCache;
use crate::state::{ConnectionRecord, ConnectionRegistry};
use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use ipnet::IpNet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub verdicts: Arc<VerdictCache>,
    pub start_time: Instant,
}

// ── Prometheus Metrics ────────────────────────────────────────────────────────

struct Metrics {
    registry: Registry,
    packets_total: Counter,
    decisions_total: Counter,
    tracked_connections: Gauge,
    cached_verdicts: Gauge,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();
        let packets_total = Counter::default();
        let decisions_total = Counter::default();
        let tracked_connections = Gauge::default();
        let cached_verdicts = Gauge::default();

        registry.register(
            "netmonitor_packets_total",
            "Packets delivered to user space",
            packets_total.clone(),
        );
        registry.register(
            "netmonitor_decisions_total",
            "Fresh (non-cached) verdict decisions",
            decisions_total.clone(),
        );
        registry.register(
            "netmonitor_tracked_connections",
            "Connections currently in the registry",
            tracked_connections.clone(),
        );
        registry.register(
            "netmonitor_cached_verdicts",
            "Flow verdicts currently cached",
            cached_verdicts.clone(),
        );

        Self {
            registry,
            packets_total,
            decisions_total,
            tracked_connections,
            cached_verdicts,
        }
    }
}

// ── Response Types ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatsResponse {
    uptime_seconds: u64,
    total_packets: u64,
    decisions: u64,
    tracked_connections: usize,
    cached_verdicts: usize,
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>, allowed_ips: &[String]) -> Router {
    let metrics = Arc::new(Metrics::new());

    let mut app = Router::new()
        .route("/connections", get(get_connections))
        .route("/stats", get(get_stats))
        .route("/metrics", get({
            let m = metrics.clone();
            let s = state.clone();
            move || get_metrics(s.clone(), m.clone())
        }));

    // An empty allowlist admits everyone; the default binding is loopback
    // anyway.
    if !allowed_ips.is_empty() {
        let nets = Arc::new(parse_allowlist(allowed_ips));
        app = app.layer(middleware::from_fn(move |req, next| {
            restrict_clients(req, next, nets.clone())
        }));
    }

    app.with_state(state)
}

// ── Client allowlist ──────────────────────────────────────────────────────────

fn parse_allowlist(allowed_ips: &[String]) -> Vec<IpNet> {
    allowed_ips
        .iter()
        .filter_map(|cidr| match cidr.parse::<IpNet>() {
            Ok(net) => Some(net),
            Err(_) => {
                tracing::warn!(cidr = %cidr, "ignoring unparseable allowlist entry");
                None
            }
        })
        .collect()
}

/// Reject clients outside the configured CIDRs. Requests carrying no peer
/// address pass; the listener is built with connect info, so that does not
/// happen in practice.
async fn restrict_clients(
    req: axum::extract::Request,
    next: middleware::Next,
    allowed: Arc<Vec<IpNet>>,
) -> axum::response::Response {
    let permitted = match req.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(peer)) => allowed.iter().any(|net| net.contains(&peer.ip())),
        None => true,
    };
    if permitted {
        next.run(req).await
    } else {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        tracing::debug!(peer = ?peer, "rejected inspection client");
        StatusCode::FORBIDDEN.into_response()
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_connections(
    State(state): State<Arc<AppState>>,
) -> Json<HashMap<String, Vec<ConnectionRecord>>> {
    Json(state.registry.snapshot())
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        uptime_seconds: state.start_time.elapsed().as_secs(),
        total_packets: state.registry.total_packets.load(Ordering::Relaxed),
        decisions: state.registry.decisions.load(Ordering::Relaxed),
        tracked_connections: state.registry.tracked(),
        cached_verdicts: state.verdicts.len(),
    })
}

async fn get_metrics(state: Arc<AppState>, metrics: Arc<Metrics>) -> impl IntoResponse {
    // Sync counters from atomic state into prometheus gauges/counters.
    // Counters are monotonic, so increment by the delta since last scrape.
    let total_packets = state.registry.total_packets.load(Ordering::Relaxed);
    let decisions = state.registry.decisions.load(Ordering::Relaxed);

    let current = metrics.packets_total.get();
    if total_packets > current {
        metrics.packets_total.inc_by(total_packets - current);
    }
    let current = metrics.decisions_total.get();
    if decisions > current {
        metrics.decisions_total.inc_by(decisions - current);
    }
    metrics.tracked_connections.set(state.registry.tracked() as i64);
    metrics.cached_verdicts.set(state.verdicts.len() as i64);

    let mut buf = String::new();
    encode(&mut buf, &metrics.registry).unwrap();
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
}
