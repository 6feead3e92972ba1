//! Per-provider circuit breaker.
//!
//! Three states: closed (normal), open (rejecting), half-open (bounded
//! trial probes). All state lives under one mutex; the half-open probe
//! budget is a counter with try-acquire semantics, released by guard drop
//! so that a caller abandoning a probe mid-flight cannot leak a slot.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::{
	metrics::{CIRCUIT_BREAKER_REJECTIONS, CIRCUIT_BREAKER_STATE, CIRCUIT_BREAKER_TRANSITIONS},
	provider::ProviderError,
};

pub const DEFAULT_MAX_FAILURES: u32 = 5;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_HALF_OPEN_MAX_REQUESTS: usize = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
	Closed,
	Open,
	HalfOpen,
}

impl BreakerState {
	/// Encoding used for the state gauge.
	fn gauge_value(self) -> i64 {
		match self {
			BreakerState::Closed => 0,
			BreakerState::Open => 1,
			BreakerState::HalfOpen => 2,
		}
	}

	pub fn as_label(self) -> &'static str {
		match self {
			BreakerState::Closed => "closed",
			BreakerState::Open => "open",
			BreakerState::HalfOpen => "half_open",
		}
	}
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
	pub max_failures: u32,
	pub timeout_ms: u64,
	pub half_open_max_requests: usize,
}

impl Default for CircuitBreakerConfig {
	fn default() -> Self {
		Self {
			max_failures: DEFAULT_MAX_FAILURES,
			timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
			half_open_max_requests: DEFAULT_HALF_OPEN_MAX_REQUESTS,
		}
	}
}

impl CircuitBreakerConfig {
	pub fn timeout(&self) -> Duration {
		Duration::from_millis(self.timeout_ms)
	}

	/// All three parameters must be positive. Invalid configs fall back to
	/// the defaults rather than failing construction.
	pub fn validated(self, provider_name: &str) -> Self {
		if self.max_failures == 0 || self.timeout_ms == 0 || self.half_open_max_requests == 0 {
			tracing::warn!(
				provider = provider_name,
				max_failures = self.max_failures,
				timeout_ms = self.timeout_ms,
				half_open_max_requests = self.half_open_max_requests,
				"Invalid circuit breaker config, falling back to defaults",
			);
			Self::default()
		} else {
			self
		}
	}
}

#[derive(Debug, Error)]
pub enum CircuitBreakerError {
	#[error("circuit breaker is open")]
	Open,
	#[error("circuit breaker half-open probe budget exhausted")]
	TooManyRequests,
	#[error(transparent)]
	Provider(#[from] ProviderError),
}

#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct CircuitBreakerStats {
	pub state: BreakerState,
	pub failure_count: u32,
	pub half_open_in_flight: usize,
}

#[derive(Debug)]
struct Inner {
	state: BreakerState,
	failure_count: u32,
	last_failure: Option<Instant>,
	half_open_in_flight: usize,
}

#[derive(Debug)]
pub struct CircuitBreaker {
	provider_name: String,
	config: CircuitBreakerConfig,
	inner: parking_lot::Mutex<Inner>,
}

enum Admission {
	Closed,
	Probe,
}

// Releases a half-open probe slot even if the probe future is dropped.
struct ProbeSlot<'a> {
	breaker: &'a CircuitBreaker,
}

impl Drop for ProbeSlot<'_> {
	fn drop(&mut self) {
		let mut inner = self.breaker.inner.lock();
		inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
	}
}

impl CircuitBreaker {
	pub fn new(provider_name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
		let provider_name = provider_name.into();
		let config = config.validated(&provider_name);
		CIRCUIT_BREAKER_STATE
			.with_label_values(&[&provider_name])
			.set(BreakerState::Closed.gauge_value());
		Self {
			provider_name,
			config,
			inner: parking_lot::Mutex::new(Inner {
				state: BreakerState::Closed,
				failure_count: 0,
				last_failure: None,
				half_open_in_flight: 0,
			}),
		}
	}

	/// Runs `operation` under the breaker's admission policy.
	///
	/// A cancelled operation never counts as a provider failure; an attempt
	/// that timed out does.
	pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
	where
		F: FnOnce() -> Fut,
		Fut: std::future::Future<Output = Result<T, ProviderError>>,
	{
		let admission = {
			let mut inner = self.inner.lock();
			loop {
				match inner.state {
					BreakerState::Closed => break Admission::Closed,
					BreakerState::Open => {
						let cooled_down = inner
							.last_failure
							.is_none_or(|at| at.elapsed() >= self.config.timeout());
						if cooled_down {
							self.transition(&mut inner, BreakerState::HalfOpen);
						} else {
							CIRCUIT_BREAKER_REJECTIONS
								.with_label_values(&[&self.provider_name, "open"])
								.inc();
							return Err(CircuitBreakerError::Open);
						}
					},
					BreakerState::HalfOpen => {
						if inner.half_open_in_flight < self.config.half_open_max_requests {
							inner.half_open_in_flight += 1;
							break Admission::Probe;
						}
						CIRCUIT_BREAKER_REJECTIONS
							.with_label_values(&[&self.provider_name, "too_many_requests"])
							.inc();
						return Err(CircuitBreakerError::TooManyRequests);
					},
				}
			}
		};

		let _slot = matches!(admission, Admission::Probe).then_some(ProbeSlot { breaker: self });

		match operation().await {
			Ok(value) => {
				self.on_success();
				Ok(value)
			},
			Err(error) => {
				if !error.is_cancelled() {
					self.on_failure();
				}
				Err(CircuitBreakerError::Provider(error))
			},
		}
	}

	fn on_success(&self) {
		let mut inner = self.inner.lock();
		match inner.state {
			BreakerState::HalfOpen => {
				self.transition(&mut inner, BreakerState::Closed);
				inner.failure_count = 0;
				inner.last_failure = None;
			},
			BreakerState::Closed => {
				inner.failure_count = 0;
			},
			// A stale probe completing after another probe re-opened the
			// breaker does not change state.
			BreakerState::Open => {},
		}
	}

	fn on_failure(&self) {
		let mut inner = self.inner.lock();
		match inner.state {
			BreakerState::Closed => {
				inner.failure_count += 1;
				if inner.failure_count >= self.config.max_failures {
					inner.last_failure = Some(Instant::now());
					self.transition(&mut inner, BreakerState::Open);
				}
			},
			BreakerState::HalfOpen => {
				inner.last_failure = Some(Instant::now());
				self.transition(&mut inner, BreakerState::Open);
			},
			BreakerState::Open => {},
		}
	}

	fn transition(&self, inner: &mut Inner, to: BreakerState) {
		if inner.state == to {
			return;
		}
		tracing::info!(
			provider = %self.provider_name,
			from = inner.state.as_label(),
			to = to.as_label(),
			failures = inner.failure_count,
			"Circuit breaker state change",
		);
		inner.state = to;
		CIRCUIT_BREAKER_STATE
			.with_label_values(&[&self.provider_name])
			.set(to.gauge_value());
		CIRCUIT_BREAKER_TRANSITIONS
			.with_label_values(&[&self.provider_name, to.as_label()])
			.inc();
	}

	pub fn state(&self) -> BreakerState {
		self.inner.lock().state
	}

	pub fn failures(&self) -> u32 {
		self.inner.lock().failure_count
	}

	/// Healthy means "not rejecting": closed or half-open.
	pub fn is_healthy(&self) -> bool {
		self.state() != BreakerState::Open
	}

	pub fn reset(&self) {
		let mut inner = self.inner.lock();
		self.transition(&mut inner, BreakerState::Closed);
		inner.failure_count = 0;
		inner.last_failure = None;
	}

	pub fn stats(&self) -> CircuitBreakerStats {
		let inner = self.inner.lock();
		CircuitBreakerStats {
			state: inner.state,
			failure_count: inner.failure_count,
			half_open_in_flight: inner.half_open_in_flight,
		}
	}
}
