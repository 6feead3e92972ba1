//! Push dispatcher: fans persisted notifications out to delivery
//! providers with per-provider filtering, rate limiting, circuit breaking
//! and capped jitter-backoff retries under a global concurrency budget.
//!
//! Dispatch is fire-and-forget from the producer's perspective. One task
//! runs per (notification, provider) pair; a failure is only ever visible
//! through logs, metrics and the health checker.

pub mod filter;

use std::{sync::Arc, time::Duration};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::{sync::Semaphore, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
	circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError},
	errors::ERROR_CATEGORY_TIMEOUT,
	health::{HealthCheckConfig, ProviderHealthChecker},
	metrics::{
		ACTIVE_DISPATCHES, DELIVERY_DURATION, DELIVERY_ERRORS, DELIVERY_TIMEOUTS,
		DISPATCH_REJECTIONS, FILTER_RESULTS, PUSH_DISPATCHES_TOTAL, RETRY_ATTEMPTS,
		RETRY_SUCCESSES,
	},
	notification::Notification,
	provider::{Provider, ProviderError},
	rate_limiter::{RateLimitConfig, TokenBucket},
	service::NotificationService,
};

use filter::{ProviderFilterConfig, MATCH_REASON_ALL};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const JITTER_FRACTION: f64 = 0.25;

#[derive(Clone, Debug)]
pub struct DispatchConfig {
	pub max_retries: u32,
	/// Base retry delay. Unset means 1 s with the default 30 s cap.
	pub retry_delay: Option<Duration>,
	/// Per-attempt deadline. Unset or zero disables it.
	pub default_timeout: Option<Duration>,
	pub per_provider_concurrency: usize,
	pub default_max_concurrent: usize,
	/// How long dispatch waits for a concurrency slot before dropping the
	/// (notification, provider) pair as `queue_full`.
	pub acquire_timeout: Duration,
}

impl Default for DispatchConfig {
	fn default() -> Self {
		Self {
			max_retries: 3,
			retry_delay: None,
			default_timeout: Some(Duration::from_secs(30)),
			per_provider_concurrency: 3,
			default_max_concurrent: 10,
			acquire_timeout: Duration::from_millis(100),
		}
	}
}

/// One configured delivery channel handed to the dispatcher.
pub struct ProviderRegistration {
	pub provider: Arc<dyn Provider>,
	pub filter: ProviderFilterConfig,
	pub rate_limit: Option<RateLimitConfig>,
	pub circuit_breaker: Option<CircuitBreakerConfig>,
}

struct EnhancedProvider {
	name: String,
	provider: Arc<dyn Provider>,
	breaker: Option<Arc<CircuitBreaker>>,
	limiter: Option<Mutex<TokenBucket>>,
	filter: ProviderFilterConfig,
}

pub struct PushDispatcher {
	providers: Vec<Arc<EnhancedProvider>>,
	semaphore: Arc<Semaphore>,
	config: DispatchConfig,
	health_checker: Option<Arc<ProviderHealthChecker>>,
	token: CancellationToken,
}

impl PushDispatcher {
	/// Builds one enhanced provider per registration whose capability
	/// validates and reports enabled. Invalid registrations are logged
	/// and skipped, never fatal.
	pub fn new(registrations: Vec<ProviderRegistration>, config: DispatchConfig) -> Self {
		let mut providers: Vec<Arc<EnhancedProvider>> = Vec::new();
		for registration in registrations {
			let name = registration.provider.name().to_string();
			if providers.iter().any(|existing| existing.name == name) {
				tracing::warn!(provider = %name, "Duplicate provider name, skipping");
				continue;
			}
			if let Err(error) = registration.provider.validate_config() {
				tracing::error!(
					provider = %name,
					error = %error,
					"Provider configuration invalid, skipping",
				);
				continue;
			}
			if !registration.provider.is_enabled() {
				tracing::debug!(provider = %name, "Provider disabled, skipping");
				continue;
			}
			providers.push(Arc::new(EnhancedProvider {
				breaker: registration
					.circuit_breaker
					.map(|breaker_config| Arc::new(CircuitBreaker::new(name.clone(), breaker_config))),
				limiter: registration.rate_limit.map(|limit| Mutex::new(TokenBucket::new(limit))),
				filter: registration.filter,
				provider: registration.provider,
				name,
			}));
		}

		let max_concurrent = config
			.default_max_concurrent
			.max(providers.len() * config.per_provider_concurrency);
		Self {
			providers,
			semaphore: Arc::new(Semaphore::new(max_concurrent)),
			config,
			health_checker: None,
			token: CancellationToken::new(),
		}
	}

	/// Attaches a health checker probing every registered provider
	/// through its breaker.
	pub fn with_health_checker(mut self, config: HealthCheckConfig) -> Self {
		let targets = self
			.providers
			.iter()
			.map(|provider| (provider.provider.clone(), provider.breaker.clone()))
			.collect();
		self.health_checker = Some(Arc::new(ProviderHealthChecker::new(targets, config)));
		self
	}

	pub fn health_checker(&self) -> Option<&Arc<ProviderHealthChecker>> {
		self.health_checker.as_ref()
	}

	pub fn get_provider_health(&self, name: &str) -> Option<crate::health::ProviderHealth> {
		self.health_checker.as_ref()?.get_provider_health(name)
	}

	pub fn get_all_provider_health(
		&self,
	) -> std::collections::HashMap<String, crate::health::ProviderHealth> {
		self.health_checker
			.as_ref()
			.map(|checker| checker.get_all_provider_health())
			.unwrap_or_default()
	}

	/// Without a health checker there is nothing known to be unhealthy.
	pub fn is_healthy(&self) -> bool {
		self.health_checker.as_ref().is_none_or(|checker| checker.is_healthy())
	}

	pub fn get_health_summary(&self) -> Option<crate::health::HealthSummary> {
		self.health_checker.as_ref().map(|checker| checker.get_health_summary())
	}

	/// Subscribes to the service and spawns the dispatch loop. Stopping
	/// the service (which cancels the subscription) stops the dispatcher
	/// and, eventually, all in-flight attempts.
	pub fn start(self: &Arc<Self>, service: &NotificationService) {
		let subscription = service.subscribe();

		let subscription_token = subscription.cancellation_token();
		let token = self.token.clone();
		tokio::spawn(async move {
			subscription_token.cancelled().await;
			token.cancel();
		});

		if let Some(health_checker) = &self.health_checker {
			health_checker.clone().start(self.token.child_token());
		}

		tokio::spawn(self.clone().run_dispatch_loop(subscription));
	}

	pub fn stop(&self) {
		self.token.cancel();
	}

	async fn run_dispatch_loop(self: Arc<Self>, mut subscription: crate::service::Subscription) {
		tracing::info!(providers = self.providers.len(), "Push dispatcher started");
		loop {
			tokio::select! {
				_ = self.token.cancelled() => break,
				maybe_notification = subscription.receiver.recv() => match maybe_notification {
					Some(notification) => {
						if notification.is_toast() {
							continue;
						}
						self.dispatch(Arc::new(notification)).await;
					},
					None => break,
				},
			}
		}
		tracing::info!("Push dispatcher stopped");
	}

	/// Fans one notification out, spawning an independent bounded task per
	/// matching provider. Never blocks the broadcast fan-out for longer
	/// than the semaphore acquire timeout per provider.
	async fn dispatch(&self, notification: Arc<Notification>) {
		for enhanced in &self.providers {
			if !enhanced.provider.is_enabled() ||
				!enhanced.provider.supports_type(notification.kind)
			{
				continue;
			}

			match filter::evaluate(&enhanced.filter, &notification) {
				Ok(()) => {
					FILTER_RESULTS
						.with_label_values(&[&enhanced.name, "match", MATCH_REASON_ALL])
						.inc();
				},
				Err(reason) => {
					FILTER_RESULTS
						.with_label_values(&[&enhanced.name, "reject", reason.as_label()])
						.inc();
					tracing::debug!(
						provider = %enhanced.name,
						id = %notification.id,
						reason = reason.as_label(),
						"Notification filtered out",
					);
					continue;
				},
			}

			let permit = match tokio::time::timeout(
				self.config.acquire_timeout,
				self.semaphore.clone().acquire_owned(),
			)
			.await
			{
				Ok(Ok(permit)) => permit,
				Ok(Err(_)) => return,
				Err(_) => {
					DISPATCH_REJECTIONS
						.with_label_values(&[&enhanced.name, "queue_full"])
						.inc();
					tracing::warn!(
						provider = %enhanced.name,
						id = %notification.id,
						"Dispatch capacity exhausted, dropping notification",
					);
					continue;
				},
			};

			let enhanced = enhanced.clone();
			let notification = notification.clone();
			let config = self.config.clone();
			let token = self.token.clone();
			tokio::spawn(async move {
				// Hold the slot for the task's whole lifetime; the drop
				// releases it on success, failure and panic alike.
				let _permit = permit;
				let dispatch = std::panic::AssertUnwindSafe(dispatch_enhanced(
					&enhanced,
					&notification,
					&config,
					token,
				));
				if let Err(panic) = dispatch.catch_unwind().await {
					tracing::error!(
						provider = %enhanced.name,
						id = %notification.id,
						panic = panic_message(&panic),
						"Dispatch task panicked",
					);
				}
			});
		}
	}
}

enum AttemptOutcome {
	Success,
	CircuitOpen,
	TooManyRequests,
	TimedOut(ProviderError),
	Cancelled,
	Failed(ProviderError),
}

async fn dispatch_enhanced(
	enhanced: &EnhancedProvider,
	notification: &Notification,
	config: &DispatchConfig,
	token: CancellationToken,
) {
	if let Some(limiter) = &enhanced.limiter {
		if !limiter.lock().allow() {
			DISPATCH_REJECTIONS
				.with_label_values(&[&enhanced.name, "rate_limited"])
				.inc();
			tracing::debug!(
				provider = %enhanced.name,
				id = %notification.id,
				"Provider rate limit exceeded, dropping notification",
			);
			return;
		}
	}

	PUSH_DISPATCHES_TOTAL.with_label_values(&[&enhanced.name]).inc();
	ACTIVE_DISPATCHES.inc();
	let _active = scopeguard::guard((), |()| ACTIVE_DISPATCHES.dec());

	let mut attempts: u32 = 1;
	loop {
		let started = Instant::now();
		let outcome = tokio::select! {
			_ = token.cancelled() => AttemptOutcome::Cancelled,
			outcome = attempt_send(enhanced, notification, config) => outcome,
		};
		let elapsed = started.elapsed().as_secs_f64();

		match outcome {
			AttemptOutcome::Success => {
				DELIVERY_DURATION
					.with_label_values(&[&enhanced.name, "success"])
					.observe(elapsed);
				if attempts > 1 {
					RETRY_SUCCESSES.with_label_values(&[&enhanced.name]).inc();
				}
				tracing::debug!(
					provider = %enhanced.name,
					id = %notification.id,
					attempts,
					"Notification delivered",
				);
				return;
			},
			AttemptOutcome::CircuitOpen => {
				DELIVERY_DURATION
					.with_label_values(&[&enhanced.name, "circuit_open"])
					.observe(elapsed);
				tracing::debug!(
					provider = %enhanced.name,
					id = %notification.id,
					"Circuit breaker open, delivery skipped",
				);
				return;
			},
			AttemptOutcome::TooManyRequests => {
				DELIVERY_DURATION
					.with_label_values(&[&enhanced.name, "circuit_open"])
					.observe(elapsed);
				tracing::debug!(
					provider = %enhanced.name,
					id = %notification.id,
					"Circuit breaker probe budget exhausted, delivery skipped",
				);
				return;
			},
			AttemptOutcome::TimedOut(error) => {
				DELIVERY_DURATION
					.with_label_values(&[&enhanced.name, "timeout"])
					.observe(elapsed);
				DELIVERY_TIMEOUTS.with_label_values(&[&enhanced.name]).inc();
				DELIVERY_ERRORS
					.with_label_values(&[&enhanced.name, ERROR_CATEGORY_TIMEOUT])
					.inc();
				// The request may already have been delivered; retrying
				// could duplicate it.
				tracing::warn!(
					provider = %enhanced.name,
					id = %notification.id,
					error = %error,
					"Delivery timed out, not retrying",
				);
				return;
			},
			AttemptOutcome::Cancelled => {
				DELIVERY_DURATION
					.with_label_values(&[&enhanced.name, "error"])
					.observe(elapsed);
				DELIVERY_ERRORS
					.with_label_values(&[&enhanced.name, "cancelled"])
					.inc();
				tracing::debug!(
					provider = %enhanced.name,
					id = %notification.id,
					"Dispatch cancelled",
				);
				return;
			},
			AttemptOutcome::Failed(error) => {
				DELIVERY_DURATION
					.with_label_values(&[&enhanced.name, "error"])
					.observe(elapsed);
				DELIVERY_ERRORS
					.with_label_values(&[&enhanced.name, error.category()])
					.inc();

				let retryable =
					error.retryable_hint() != Some(false) && attempts <= config.max_retries;
				if !retryable {
					tracing::warn!(
						provider = %enhanced.name,
						id = %notification.id,
						error = %error,
						attempts,
						"Delivery failed, giving up",
					);
					return;
				}

				RETRY_ATTEMPTS.with_label_values(&[&enhanced.name]).inc();
				let delay = retry_backoff(attempts, config.retry_delay);
				tracing::debug!(
					provider = %enhanced.name,
					id = %notification.id,
					error = %error,
					attempts,
					delay_ms = delay.as_millis() as u64,
					"Delivery failed, retrying",
				);
				tokio::select! {
					_ = token.cancelled() => return,
					_ = tokio::time::sleep(delay) => {},
				}
				attempts += 1;
			},
		}
	}
}

/// Runs one send attempt, bounded by the per-attempt deadline and routed
/// through the provider's breaker when it has one. The deadline sits
/// inside the breaker call so a timed-out attempt counts as a breaker
/// failure.
async fn attempt_send(
	enhanced: &EnhancedProvider,
	notification: &Notification,
	config: &DispatchConfig,
) -> AttemptOutcome {
	let send = || async {
		match config.default_timeout {
			Some(deadline) if !deadline.is_zero() => {
				match tokio::time::timeout(deadline, enhanced.provider.send(notification)).await {
					Ok(result) => result,
					Err(_) => Err(ProviderError::timeout(format!(
						"send timed out after {}ms",
						deadline.as_millis()
					))),
				}
			},
			_ => enhanced.provider.send(notification).await,
		}
	};

	let result = match &enhanced.breaker {
		Some(breaker) => breaker.call(send).await,
		None => send().await.map_err(CircuitBreakerError::Provider),
	};

	match result {
		Ok(()) => AttemptOutcome::Success,
		Err(CircuitBreakerError::Open) => AttemptOutcome::CircuitOpen,
		Err(CircuitBreakerError::TooManyRequests) => AttemptOutcome::TooManyRequests,
		Err(CircuitBreakerError::Provider(error)) if error.is_cancelled() =>
			AttemptOutcome::Cancelled,
		Err(CircuitBreakerError::Provider(error)) if error.is_timeout() =>
			AttemptOutcome::TimedOut(error),
		Err(CircuitBreakerError::Provider(error)) => AttemptOutcome::Failed(error),
	}
}

/// Exponential backoff with jitter: `min(max(base * 2^(attempts-1), base),
/// max_delay)` plus or minus up to 25% of the uncapped exponential. The
/// exponent saturates so late attempts cannot overflow.
fn retry_backoff(attempts: u32, retry_delay: Option<Duration>) -> Duration {
	let base = retry_delay.unwrap_or(DEFAULT_RETRY_DELAY);
	let max_delay = match retry_delay {
		Some(configured) if configured > base => configured,
		_ => DEFAULT_MAX_RETRY_DELAY,
	};

	let exponential = base.saturating_mul(2u32.saturating_pow(attempts.saturating_sub(1)));
	let delay = exponential.max(base).min(max_delay);

	let jitter_range = exponential.mul_f64(JITTER_FRACTION);
	if jitter_range.is_zero() {
		return delay;
	}
	use rand::Rng;
	let mut rng = rand::thread_rng();
	let jitter = rng.gen_range(Duration::ZERO..jitter_range);
	if rng.gen_bool(0.5) {
		delay.saturating_add(jitter)
	} else {
		delay.saturating_sub(jitter)
	}
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
	if let Some(message) = panic.downcast_ref::<&str>() {
		(*message).to_string()
	} else if let Some(message) = panic.downcast_ref::<String>() {
		message.clone()
	} else {
		"unknown panic payload".to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		notification::{NotificationType, Priority},
		service::{NotificationService, ServiceConfig},
		store::{NotificationStore, DEFAULT_DEDUP_WINDOW, DEFAULT_MAX_SIZE},
	};
	use std::sync::atomic::{AtomicU32, Ordering};

	type SendBehavior =
		Box<dyn Fn(u32) -> Result<(), ProviderError> + Send + Sync>;

	struct TestProvider {
		name: String,
		enabled: bool,
		send_delay: Option<Duration>,
		sends: AtomicU32,
		behavior: SendBehavior,
	}

	impl TestProvider {
		fn ok(name: &str) -> Self {
			Self::with_behavior(name, Box::new(|_| Ok(())))
		}

		fn with_behavior(name: &str, behavior: SendBehavior) -> Self {
			Self {
				name: name.to_string(),
				enabled: true,
				send_delay: None,
				sends: AtomicU32::new(0),
				behavior,
			}
		}

		fn sends(&self) -> u32 {
			self.sends.load(Ordering::SeqCst)
		}
	}

	#[async_trait::async_trait]
	impl Provider for TestProvider {
		fn name(&self) -> &str {
			&self.name
		}

		fn is_enabled(&self) -> bool {
			self.enabled
		}

		fn supports_type(&self, _kind: NotificationType) -> bool {
			true
		}

		fn validate_config(&self) -> anyhow::Result<()> {
			Ok(())
		}

		async fn send(&self, _notification: &Notification) -> Result<(), ProviderError> {
			let attempt = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
			if let Some(delay) = self.send_delay {
				tokio::time::sleep(delay).await;
			}
			(self.behavior)(attempt)
		}
	}

	fn notification() -> Notification {
		Notification::new(NotificationType::Error, Priority::High, "t", "m")
			.with_component("diskmanager")
	}

	fn enhanced(provider: Arc<TestProvider>) -> EnhancedProvider {
		EnhancedProvider {
			name: provider.name.clone(),
			provider,
			breaker: None,
			limiter: None,
			filter: ProviderFilterConfig::default(),
		}
	}

	fn config() -> DispatchConfig {
		DispatchConfig { default_timeout: None, ..Default::default() }
	}

	async fn wait_for_permits(semaphore: &Semaphore, expected: usize) {
		for _ in 0..1000 {
			if semaphore.available_permits() == expected {
				return;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		panic!("semaphore never returned to {expected} permits");
	}

	#[tokio::test(start_paused = true)]
	async fn timed_out_send_is_never_retried() {
		let provider = Arc::new(TestProvider {
			send_delay: Some(Duration::from_millis(50)),
			..TestProvider::ok("slow")
		});
		let enhanced = enhanced(provider.clone());
		let config = DispatchConfig {
			max_retries: 3,
			default_timeout: Some(Duration::from_millis(10)),
			..Default::default()
		};

		dispatch_enhanced(&enhanced, &notification(), &config, CancellationToken::new()).await;
		assert_eq!(provider.sends(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn failing_send_is_retried_at_most_max_retries_times() {
		let provider = Arc::new(TestProvider::with_behavior(
			"flaky",
			Box::new(|_| Err(ProviderError::new("boom"))),
		));
		let enhanced = enhanced(provider.clone());
		let config = DispatchConfig { max_retries: 2, ..config() };

		dispatch_enhanced(&enhanced, &notification(), &config, CancellationToken::new()).await;
		assert_eq!(provider.sends(), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn retry_succeeds_after_transient_failure() {
		let provider = Arc::new(TestProvider::with_behavior(
			"transient",
			Box::new(|attempt| {
				if attempt == 1 {
					Err(ProviderError::new("connection refused"))
				} else {
					Ok(())
				}
			}),
		));
		let enhanced = enhanced(provider.clone());

		dispatch_enhanced(&enhanced, &notification(), &config(), CancellationToken::new()).await;
		assert_eq!(provider.sends(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn provider_marked_non_retryable_is_not_retried() {
		let provider = Arc::new(TestProvider::with_behavior(
			"permanent",
			Box::new(|_| Err(ProviderError::new("bad payload").with_retryable(false))),
		));
		let enhanced = enhanced(provider.clone());

		dispatch_enhanced(&enhanced, &notification(), &config(), CancellationToken::new()).await;
		assert_eq!(provider.sends(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn provider_rate_limit_drops_before_sending() {
		let provider = Arc::new(TestProvider::ok("limited"));
		let mut enhanced = enhanced(provider.clone());
		enhanced.limiter = Some(Mutex::new(TokenBucket::new(RateLimitConfig {
			requests_per_minute: 1,
			burst_size: 1,
		})));

		let n = notification();
		dispatch_enhanced(&enhanced, &n, &config(), CancellationToken::new()).await;
		dispatch_enhanced(&enhanced, &n, &config(), CancellationToken::new()).await;
		assert_eq!(provider.sends(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn open_breaker_short_circuits_without_sending() {
		let provider = Arc::new(TestProvider::ok("guarded"));
		let mut enhanced = enhanced(provider.clone());
		let breaker = Arc::new(CircuitBreaker::new(
			"guarded",
			crate::circuit_breaker::CircuitBreakerConfig {
				max_failures: 1,
				timeout_ms: 60_000,
				half_open_max_requests: 1,
			},
		));
		let _ = breaker
			.call(|| async { Err::<(), _>(ProviderError::new("seed failure")) })
			.await;
		enhanced.breaker = Some(breaker);

		dispatch_enhanced(&enhanced, &notification(), &config(), CancellationToken::new()).await;
		assert_eq!(provider.sends(), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn timed_out_attempt_counts_as_breaker_failure() {
		let provider = Arc::new(TestProvider {
			send_delay: Some(Duration::from_millis(50)),
			..TestProvider::ok("slow")
		});
		let mut enhanced = enhanced(provider.clone());
		let breaker = Arc::new(CircuitBreaker::new(
			"slow",
			crate::circuit_breaker::CircuitBreakerConfig {
				max_failures: 1,
				timeout_ms: 60_000,
				half_open_max_requests: 1,
			},
		));
		enhanced.breaker = Some(breaker.clone());
		let config = DispatchConfig {
			default_timeout: Some(Duration::from_millis(10)),
			..Default::default()
		};

		dispatch_enhanced(&enhanced, &notification(), &config, CancellationToken::new()).await;
		assert_eq!(breaker.state(), crate::circuit_breaker::BreakerState::Open);
	}

	#[tokio::test(start_paused = true)]
	async fn cancellation_interrupts_the_retry_wait() {
		let provider = Arc::new(TestProvider::with_behavior(
			"cancelled",
			Box::new(|_| Err(ProviderError::new("boom"))),
		));
		let enhanced = Arc::new(enhanced(provider.clone()));
		let config = DispatchConfig {
			retry_delay: Some(Duration::from_secs(3600)),
			..config()
		};
		let token = CancellationToken::new();

		let task = tokio::spawn({
			let enhanced = enhanced.clone();
			let token = token.clone();
			let n = notification();
			async move { dispatch_enhanced(&enhanced, &n, &config, token).await }
		});
		tokio::task::yield_now().await;
		token.cancel();
		task.await.unwrap();
		assert_eq!(provider.sends(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn semaphore_slot_survives_success_failure_and_panic() {
		let healthy = Arc::new(TestProvider::ok("healthy"));
		let failing = Arc::new(TestProvider::with_behavior(
			"failing",
			Box::new(|_| Err(ProviderError::new("boom").with_retryable(false))),
		));
		let panicking = Arc::new(TestProvider::with_behavior(
			"panicking",
			Box::new(|_| panic!("provider blew up")),
		));

		let dispatcher = Arc::new(PushDispatcher::new(
			[healthy.clone(), failing, panicking]
				.into_iter()
				.map(|provider| ProviderRegistration {
					provider: provider as Arc<dyn Provider>,
					filter: ProviderFilterConfig::default(),
					rate_limit: None,
					circuit_breaker: None,
				})
				.collect(),
			config(),
		));
		let capacity = dispatcher.semaphore.available_permits();

		dispatcher.dispatch(Arc::new(notification())).await;
		wait_for_permits(&dispatcher.semaphore, capacity).await;
		assert_eq!(healthy.sends(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn saturated_semaphore_drops_with_queue_full() {
		let hanging = Arc::new(TestProvider {
			send_delay: Some(Duration::from_secs(3600)),
			..TestProvider::ok("hanging")
		});
		let dispatcher = Arc::new(PushDispatcher::new(
			vec![ProviderRegistration {
				provider: hanging.clone() as Arc<dyn Provider>,
				filter: ProviderFilterConfig::default(),
				rate_limit: None,
				circuit_breaker: None,
			}],
			DispatchConfig {
				default_max_concurrent: 1,
				per_provider_concurrency: 1,
				default_timeout: None,
				..Default::default()
			},
		));

		dispatcher.dispatch(Arc::new(notification())).await;
		// Slot is now held by the hanging send; the next dispatch cannot
		// acquire it within the acquire timeout.
		dispatcher.dispatch(Arc::new(notification())).await;
		assert_eq!(hanging.sends(), 1);

		dispatcher.stop();
		wait_for_permits(&dispatcher.semaphore, 1).await;
	}

	#[tokio::test(start_paused = true)]
	async fn dispatcher_skips_disabled_and_unsupported_providers() {
		let disabled = Arc::new(TestProvider { enabled: false, ..TestProvider::ok("disabled") });
		let dispatcher = PushDispatcher::new(
			vec![ProviderRegistration {
				provider: disabled.clone() as Arc<dyn Provider>,
				filter: ProviderFilterConfig::default(),
				rate_limit: None,
				circuit_breaker: None,
			}],
			config(),
		);
		assert!(dispatcher.providers.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn duplicate_provider_names_are_rejected() {
		let first = Arc::new(TestProvider::ok("webhook"));
		let second = Arc::new(TestProvider::ok("webhook"));
		let dispatcher = PushDispatcher::new(
			[first, second]
				.into_iter()
				.map(|provider| ProviderRegistration {
					provider: provider as Arc<dyn Provider>,
					filter: ProviderFilterConfig::default(),
					rate_limit: None,
					circuit_breaker: None,
				})
				.collect(),
			config(),
		);
		assert_eq!(dispatcher.providers.len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn max_concurrent_scales_with_provider_count() {
		let registrations: Vec<ProviderRegistration> = (0..5)
			.map(|i| ProviderRegistration {
				provider: Arc::new(TestProvider::ok(&format!("p{i}"))) as Arc<dyn Provider>,
				filter: ProviderFilterConfig::default(),
				rate_limit: None,
				circuit_breaker: None,
			})
			.collect();
		let dispatcher = PushDispatcher::new(
			registrations,
			DispatchConfig {
				default_max_concurrent: 10,
				per_provider_concurrency: 3,
				..Default::default()
			},
		);
		assert_eq!(dispatcher.semaphore.available_permits(), 15);
	}

	#[tokio::test(start_paused = true)]
	async fn toasts_are_not_dispatched() {
		let provider = Arc::new(TestProvider::ok("webhook"));
		let store = Arc::new(NotificationStore::new(DEFAULT_MAX_SIZE, DEFAULT_DEDUP_WINDOW));
		let service = NotificationService::new(store, ServiceConfig::default());
		let dispatcher = Arc::new(PushDispatcher::new(
			vec![ProviderRegistration {
				provider: provider.clone() as Arc<dyn Provider>,
				filter: ProviderFilterConfig::default(),
				rate_limit: None,
				circuit_breaker: None,
			}],
			config(),
		));
		dispatcher.start(&service);
		tokio::task::yield_now().await;

		service
			.create_with_metadata(
				Notification::new(NotificationType::Info, Priority::Low, "toast", "m")
					.with_metadata_value(crate::notification::TOAST_METADATA_KEY, true),
			)
			.unwrap();
		service
			.create(NotificationType::Error, Priority::High, "real", "m")
			.unwrap();

		for _ in 0..100 {
			if provider.sends() == 1 {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert_eq!(provider.sends(), 1);

		service.stop();
	}

	#[test]
	fn backoff_follows_the_canonical_rule() {
		// Unset retry delay: base 1s, cap 30s, jitter 25% of the uncapped
		// exponential.
		for attempts in 1..=10u32 {
			let base = DEFAULT_RETRY_DELAY;
			let exponential = base.saturating_mul(2u32.saturating_pow(attempts - 1));
			let expected = exponential.max(base).min(DEFAULT_MAX_RETRY_DELAY);
			let jitter = exponential.mul_f64(JITTER_FRACTION);
			let delay = retry_backoff(attempts, None);
			assert!(delay >= expected.saturating_sub(jitter), "attempt {attempts}: {delay:?}");
			assert!(delay <= expected.saturating_add(jitter), "attempt {attempts}: {delay:?}");
		}
	}

	#[test]
	fn backoff_with_configured_delay_uses_it_as_base() {
		let configured = Duration::from_millis(200);
		let delay = retry_backoff(1, Some(configured));
		let jitter = configured.mul_f64(JITTER_FRACTION);
		assert!(delay >= configured.saturating_sub(jitter));
		assert!(delay <= configured.saturating_add(jitter));
	}

	#[test]
	fn backoff_never_overflows_on_late_attempts() {
		let delay = retry_backoff(u32::MAX, None);
		assert!(delay <= DEFAULT_MAX_RETRY_DELAY.saturating_add(Duration::MAX.mul_f64(0.25)));
		let delay = retry_backoff(64, Some(Duration::from_secs(3600)));
		assert!(delay >= Duration::ZERO);
	}
}
