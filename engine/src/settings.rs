//! Settings for the notification core.
//!
//! Defaults live in code; an optional TOML file and `BIRDWATCH_`-prefixed
//! environment variables override them (`BIRDWATCH_DISPATCH__MAX_RETRIES`
//! style, doubled underscores separating sections). The host application
//! owns everything else about configuration.

use std::{path::Path, sync::Arc, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::{
	circuit_breaker::CircuitBreakerConfig,
	dispatch::{filter::ProviderFilterConfig, DispatchConfig, ProviderRegistration},
	health::HealthCheckConfig,
	provider::Provider,
	rate_limiter::RateLimitConfig,
	service::ServiceConfig,
};

pub const ENV_PREFIX: &str = "BIRDWATCH";
pub const SETTINGS_FILE: &str = "notifications";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
	pub max_size: usize,
	pub dedup_window_secs: i64,
}

impl Default for StoreSettings {
	fn default() -> Self {
		Self { max_size: 1000, dedup_window_secs: 300 }
	}
}

impl StoreSettings {
	pub fn dedup_window(&self) -> chrono::Duration {
		chrono::Duration::seconds(self.dedup_window_secs)
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
	pub rate_limit_window_secs: u64,
	pub rate_limit_max_events: usize,
	pub cleanup_interval_secs: u64,
	pub subscriber_queue_size: usize,
}

impl Default for ServiceSettings {
	fn default() -> Self {
		Self {
			rate_limit_window_secs: 60,
			rate_limit_max_events: 100,
			cleanup_interval_secs: 300,
			subscriber_queue_size: 64,
		}
	}
}

impl From<&ServiceSettings> for ServiceConfig {
	fn from(settings: &ServiceSettings) -> Self {
		Self {
			rate_limit_window: Duration::from_secs(settings.rate_limit_window_secs),
			rate_limit_max_events: settings.rate_limit_max_events,
			cleanup_interval: Duration::from_secs(settings.cleanup_interval_secs),
			subscriber_queue_size: settings.subscriber_queue_size,
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
	pub max_retries: u32,
	pub retry_delay_ms: Option<u64>,
	pub default_timeout_ms: Option<u64>,
	pub per_provider_concurrency: usize,
	pub default_max_concurrent: usize,
	pub acquire_timeout_ms: u64,
}

impl Default for DispatchSettings {
	fn default() -> Self {
		Self {
			max_retries: 3,
			retry_delay_ms: None,
			default_timeout_ms: Some(30_000),
			per_provider_concurrency: 3,
			default_max_concurrent: 10,
			acquire_timeout_ms: 100,
		}
	}
}

impl From<&DispatchSettings> for DispatchConfig {
	fn from(settings: &DispatchSettings) -> Self {
		Self {
			max_retries: settings.max_retries,
			retry_delay: settings.retry_delay_ms.map(Duration::from_millis),
			default_timeout: settings
				.default_timeout_ms
				.filter(|&ms| ms > 0)
				.map(Duration::from_millis),
			per_provider_concurrency: settings.per_provider_concurrency,
			default_max_concurrent: settings.default_max_concurrent,
			acquire_timeout: Duration::from_millis(settings.acquire_timeout_ms),
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HealthCheckSettings {
	pub interval_secs: u64,
	pub timeout_secs: u64,
}

impl Default for HealthCheckSettings {
	fn default() -> Self {
		Self { interval_secs: 60, timeout_secs: 10 }
	}
}

impl From<&HealthCheckSettings> for HealthCheckConfig {
	fn from(settings: &HealthCheckSettings) -> Self {
		Self {
			interval: Duration::from_secs(settings.interval_secs),
			timeout: Duration::from_secs(settings.timeout_secs),
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
	pub hostname: String,
	pub port: u16,
}

impl Default for ObservabilitySettings {
	fn default() -> Self {
		Self { hostname: "127.0.0.1".to_string(), port: 9090 }
	}
}

/// Per-provider dispatch policy, matched to a concrete provider by name
/// when the host application wires the dispatcher up.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
	pub name: String,
	pub filter: ProviderFilterConfig,
	pub rate_limit: Option<RateLimitConfig>,
	pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl ProviderSettings {
	pub fn into_registration(self, provider: Arc<dyn Provider>) -> ProviderRegistration {
		ProviderRegistration {
			provider,
			filter: self.filter,
			rate_limit: self.rate_limit,
			circuit_breaker: self.circuit_breaker,
		}
	}
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
	pub store: StoreSettings,
	pub service: ServiceSettings,
	pub dispatch: DispatchSettings,
	pub health_check: Option<HealthCheckSettings>,
	pub observability: Option<ObservabilitySettings>,
	pub providers: Vec<ProviderSettings>,
}

impl Settings {
	/// Loads settings from `<config_root>/notifications.toml` (optional)
	/// with environment overrides on top of the in-code defaults.
	pub fn new(config_root: &Path) -> Result<Self, ConfigError> {
		Config::builder()
			.add_source(
				File::from(config_root.join(SETTINGS_FILE)).required(false),
			)
			.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
			.build()?
			.try_deserialize()
	}

	#[cfg(test)]
	pub fn new_test() -> Self {
		Self::default()
	}
}
