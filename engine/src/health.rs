//! Periodic provider liveness checking.
//!
//! Every `interval` the checker probes each registered provider
//! concurrently, bounded by `timeout`, going through the provider's
//! circuit breaker where it has one so that probe failures and recoveries
//! drive the breaker like real traffic does. An open breaker is itself a
//! protective state, never counted as a probe failure.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{
	circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerError},
	metrics::PROVIDER_HEALTH,
	provider::{Provider, ProviderError},
};

#[derive(Clone, Copy, Debug)]
pub struct HealthCheckConfig {
	pub interval: Duration,
	pub timeout: Duration,
}

impl Default for HealthCheckConfig {
	fn default() -> Self {
		Self { interval: Duration::from_secs(60), timeout: Duration::from_secs(10) }
	}
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct ProviderHealth {
	pub healthy: bool,
	pub last_check: Option<DateTime<Utc>>,
	pub last_success: Option<DateTime<Utc>>,
	pub last_failure: Option<DateTime<Utc>>,
	pub total_checks: u64,
	pub total_failures: u64,
	pub consecutive_failures: u32,
	pub last_error: Option<String>,
	pub circuit_state: Option<BreakerState>,
}

impl ProviderHealth {
	fn new() -> Self {
		Self {
			// Providers start out presumed healthy until a probe says
			// otherwise.
			healthy: true,
			last_check: None,
			last_success: None,
			last_failure: None,
			total_checks: 0,
			total_failures: 0,
			consecutive_failures: 0,
			last_error: None,
			circuit_state: None,
		}
	}
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct HealthSummary {
	pub total: usize,
	pub healthy: usize,
	pub open_circuits: usize,
	pub overall_healthy: bool,
	pub last_check: Option<DateTime<Utc>>,
}

struct HealthTarget {
	provider: Arc<dyn Provider>,
	breaker: Option<Arc<CircuitBreaker>>,
}

pub struct ProviderHealthChecker {
	targets: Vec<HealthTarget>,
	records: RwLock<HashMap<String, ProviderHealth>>,
	config: HealthCheckConfig,
}

impl ProviderHealthChecker {
	pub fn new(
		targets: Vec<(Arc<dyn Provider>, Option<Arc<CircuitBreaker>>)>,
		config: HealthCheckConfig,
	) -> Self {
		let records = targets
			.iter()
			.map(|(provider, _)| (provider.name().to_string(), ProviderHealth::new()))
			.collect();
		Self {
			targets: targets
				.into_iter()
				.map(|(provider, breaker)| HealthTarget { provider, breaker })
				.collect(),
			records: RwLock::new(records),
			config,
		}
	}

	/// Spawns the periodic sweep. Runs until the token is cancelled.
	pub fn start(self: Arc<Self>, token: CancellationToken) {
		tokio::spawn(async move {
			tracing::info!(
				providers = self.targets.len(),
				interval_secs = self.config.interval.as_secs(),
				"Provider health checker started",
			);
			let mut interval = tokio::time::interval(self.config.interval);
			loop {
				tokio::select! {
					_ = token.cancelled() => break,
					_ = interval.tick() => self.check_all().await,
				}
			}
			tracing::info!("Provider health checker stopped");
		});
	}

	/// Probes every provider concurrently, each bounded by the probe
	/// timeout.
	pub async fn check_all(&self) {
		futures::future::join_all(self.targets.iter().map(|target| self.check_one(target))).await;
	}

	async fn check_one(&self, target: &HealthTarget) {
		let name = target.provider.name().to_string();
		let probe = || async {
			match tokio::time::timeout(self.config.timeout, async {
				target.provider.validate_config()
			})
			.await
			{
				Ok(Ok(())) => Ok(()),
				Ok(Err(error)) => Err(ProviderError::from(error)),
				Err(_) => Err(ProviderError::timeout(format!(
					"health probe timed out after {}ms",
					self.config.timeout.as_millis()
				))),
			}
		};

		let result = match &target.breaker {
			Some(breaker) => breaker.call(probe).await,
			None => probe().await.map_err(CircuitBreakerError::Provider),
		};

		let now = Utc::now();
		let circuit_state = target.breaker.as_ref().map(|breaker| breaker.state());
		let mut records = self.records.write();
		let record = records.entry(name.clone()).or_insert_with(ProviderHealth::new);
		record.last_check = Some(now);
		record.circuit_state = circuit_state;
		record.total_checks += 1;

		match result {
			Ok(()) => {
				record.healthy = true;
				record.last_success = Some(now);
				record.consecutive_failures = 0;
				record.last_error = None;
			},
			// A breaker rejecting the probe is protection, not evidence
			// that the provider itself failed.
			Err(CircuitBreakerError::Open) | Err(CircuitBreakerError::TooManyRequests) => {},
			Err(CircuitBreakerError::Provider(error)) => {
				record.healthy = false;
				record.last_failure = Some(now);
				record.total_failures += 1;
				record.consecutive_failures += 1;
				record.last_error = Some(error.to_string());
				tracing::warn!(
					provider = %name,
					error = %error,
					consecutive_failures = record.consecutive_failures,
					"Provider health probe failed",
				);
			},
		}

		PROVIDER_HEALTH
			.with_label_values(&[&name])
			.set(if record.healthy { 1 } else { 0 });
	}

	pub fn get_provider_health(&self, name: &str) -> Option<ProviderHealth> {
		self.records.read().get(name).cloned()
	}

	pub fn get_all_provider_health(&self) -> HashMap<String, ProviderHealth> {
		self.records.read().clone()
	}

	/// Overall health is the conjunction over providers whose breaker is
	/// not open.
	pub fn is_healthy(&self) -> bool {
		self.records
			.read()
			.values()
			.filter(|record| record.circuit_state != Some(BreakerState::Open))
			.all(|record| record.healthy)
	}

	pub fn get_health_summary(&self) -> HealthSummary {
		let records = self.records.read();
		HealthSummary {
			total: records.len(),
			healthy: records.values().filter(|record| record.healthy).count(),
			open_circuits: records
				.values()
				.filter(|record| record.circuit_state == Some(BreakerState::Open))
				.count(),
			overall_healthy: records
				.values()
				.filter(|record| record.circuit_state != Some(BreakerState::Open))
				.all(|record| record.healthy),
			last_check: records.values().filter_map(|record| record.last_check).max(),
		}
	}
}
