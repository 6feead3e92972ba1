//! Prometheus metrics for the notification core, with a small warp server
//! exposing them (plus a liveness endpoint) for scraping.
//!
//! Label sets are bounded by construction: provider names come from the
//! fixed registration list and every reason/category/status label is drawn
//! from a closed set.

use std::net::IpAddr;

use lazy_static::lazy_static;
use prometheus::{
	HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use tokio_util::sync::CancellationToken;
use warp::Filter;

use crate::health::ProviderHealthChecker;

lazy_static! {
	static ref REGISTRY: Registry = Registry::new();

	pub static ref NOTIFICATIONS_CREATED: IntCounterVec = IntCounterVec::new(
		Opts::new("notifications_created_total", "Notifications accepted by the service"),
		&["type"],
	)
	.expect("metric can be created");
	pub static ref NOTIFICATIONS_RATE_LIMITED: IntCounter = IntCounter::new(
		"notifications_rate_limited_total",
		"Notifications rejected by the service rate limit",
	)
	.expect("metric can be created");
	pub static ref NOTIFICATION_BROADCASTS: IntCounterVec = IntCounterVec::new(
		Opts::new("notification_broadcasts_total", "Per-subscriber broadcast outcomes"),
		&["outcome"],
	)
	.expect("metric can be created");

	pub static ref PUSH_DISPATCHES_TOTAL: IntCounterVec = IntCounterVec::new(
		Opts::new("push_dispatches_total", "Dispatch attempts started per provider"),
		&["provider"],
	)
	.expect("metric can be created");
	pub static ref ACTIVE_DISPATCHES: IntGauge = IntGauge::new(
		"push_active_dispatches",
		"Dispatch tasks currently in flight",
	)
	.expect("metric can be created");
	pub static ref DELIVERY_DURATION: HistogramVec = HistogramVec::new(
		HistogramOpts::new("push_delivery_duration_seconds", "Delivery attempt duration")
			.buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
		&["provider", "status"],
	)
	.expect("metric can be created");
	pub static ref DELIVERY_ERRORS: IntCounterVec = IntCounterVec::new(
		Opts::new("push_delivery_errors_total", "Delivery errors by bounded category"),
		&["provider", "category"],
	)
	.expect("metric can be created");
	pub static ref DELIVERY_TIMEOUTS: IntCounterVec = IntCounterVec::new(
		Opts::new("push_delivery_timeouts_total", "Delivery attempts that hit the deadline"),
		&["provider"],
	)
	.expect("metric can be created");
	pub static ref RETRY_ATTEMPTS: IntCounterVec = IntCounterVec::new(
		Opts::new("push_retry_attempts_total", "Retries scheduled per provider"),
		&["provider"],
	)
	.expect("metric can be created");
	pub static ref RETRY_SUCCESSES: IntCounterVec = IntCounterVec::new(
		Opts::new("push_retry_successes_total", "Deliveries that succeeded on a retry"),
		&["provider"],
	)
	.expect("metric can be created");
	pub static ref FILTER_RESULTS: IntCounterVec = IntCounterVec::new(
		Opts::new("push_filter_results_total", "Filter matches and rejections with reason"),
		&["provider", "result", "reason"],
	)
	.expect("metric can be created");
	pub static ref DISPATCH_REJECTIONS: IntCounterVec = IntCounterVec::new(
		Opts::new("push_dispatch_rejections_total", "Dispatches dropped before sending"),
		&["provider", "reason"],
	)
	.expect("metric can be created");

	pub static ref CIRCUIT_BREAKER_STATE: IntGaugeVec = IntGaugeVec::new(
		Opts::new(
			"circuit_breaker_state",
			"Breaker state per provider (0 closed, 1 open, 2 half-open)",
		),
		&["provider"],
	)
	.expect("metric can be created");
	pub static ref CIRCUIT_BREAKER_TRANSITIONS: IntCounterVec = IntCounterVec::new(
		Opts::new("circuit_breaker_transitions_total", "Breaker state transitions"),
		&["provider", "to"],
	)
	.expect("metric can be created");
	pub static ref CIRCUIT_BREAKER_REJECTIONS: IntCounterVec = IntCounterVec::new(
		Opts::new("circuit_breaker_rejections_total", "Calls blocked by the breaker"),
		&["provider", "reason"],
	)
	.expect("metric can be created");

	pub static ref PROVIDER_HEALTH: IntGaugeVec = IntGaugeVec::new(
		Opts::new("provider_health", "Provider health per the periodic probe (1 healthy)"),
		&["provider"],
	)
	.expect("metric can be created");
}

/// Registers every metric with the crate registry. Call once at startup;
/// a second call fails the duplicate registration.
pub fn register_metrics() {
	macro_rules! register {
		($($metric:expr),* $(,)?) => {
			$(
				REGISTRY
					.register(Box::new($metric.clone()))
					.expect("metric can be registered");
			)*
		};
	}
	register!(
		NOTIFICATIONS_CREATED,
		NOTIFICATIONS_RATE_LIMITED,
		NOTIFICATION_BROADCASTS,
		PUSH_DISPATCHES_TOTAL,
		ACTIVE_DISPATCHES,
		DELIVERY_DURATION,
		DELIVERY_ERRORS,
		DELIVERY_TIMEOUTS,
		RETRY_ATTEMPTS,
		RETRY_SUCCESSES,
		FILTER_RESULTS,
		DISPATCH_REJECTIONS,
		CIRCUIT_BREAKER_STATE,
		CIRCUIT_BREAKER_TRANSITIONS,
		CIRCUIT_BREAKER_REJECTIONS,
		PROVIDER_HEALTH,
	);
}

fn metrics_handler() -> String {
	use prometheus::Encoder;
	let encoder = prometheus::TextEncoder::new();
	let mut buffer = Vec::new();
	if let Err(error) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
		tracing::error!(error = %error, "Could not encode metrics");
	}
	String::from_utf8(buffer).unwrap_or_default()
}

/// Serves `/metrics` and `/health` until the token is cancelled.
///
/// `/health` reports 200 with the checker's summary while overall healthy,
/// 503 otherwise; without a checker it is a plain liveness endpoint.
pub fn start_observability_server(
	hostname: &str,
	port: u16,
	health_checker: Option<std::sync::Arc<ProviderHealthChecker>>,
	token: CancellationToken,
) -> anyhow::Result<()> {
	let address: IpAddr = hostname.parse()?;

	let metrics_route = warp::path("metrics").and(warp::path::end()).map(metrics_handler);
	let health_route = warp::path("health").and(warp::path::end()).map(move || {
		match &health_checker {
			Some(checker) => {
				let summary = checker.get_health_summary();
				let status = if summary.overall_healthy {
					warp::http::StatusCode::OK
				} else {
					warp::http::StatusCode::SERVICE_UNAVAILABLE
				};
				warp::reply::with_status(warp::reply::json(&summary), status)
			},
			None => warp::reply::with_status(
				warp::reply::json(&serde_json::json!({"status": "ok"})),
				warp::http::StatusCode::OK,
			),
		}
	});

	let (bound, server) = warp::serve(metrics_route.or(health_route))
		.try_bind_with_graceful_shutdown((address, port), async move {
			token.cancelled().await;
		})?;
	tracing::info!(address = %bound, "Observability server listening");
	tokio::spawn(server);
	Ok(())
}
