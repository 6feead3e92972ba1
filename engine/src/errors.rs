//! Error taxonomy for the notification core.
//!
//! Store and service errors propagate to callers. Dispatch errors never do:
//! delivery is fire-and-forget from the producer's perspective and failures
//! surface only through logs, metrics and the health checker.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotificationError {
	#[error("notification not found: {0}")]
	NotFound(String),
	#[error("notification rate limit exceeded")]
	RateLimited,
	#[error("invalid {what}: {reason}")]
	Validation { what: &'static str, reason: String },
}

/// Bounded delivery-error categories used as metric labels. Adding a
/// category is a metrics schema change.
pub const ERROR_CATEGORY_TIMEOUT: &str = "timeout";
pub const ERROR_CATEGORY_CANCELLED: &str = "cancelled";
pub const ERROR_CATEGORY_NETWORK: &str = "network";
pub const ERROR_CATEGORY_VALIDATION: &str = "validation";
pub const ERROR_CATEGORY_PERMISSION: &str = "permission";
pub const ERROR_CATEGORY_NOT_FOUND: &str = "not_found";
pub const ERROR_CATEGORY_PROVIDER: &str = "provider_error";

/// Maps an error message onto one of the closed category labels.
pub fn error_category(message: &str) -> &'static str {
	let message = message.to_lowercase();
	let contains_any = |needles: &[&str]| needles.iter().any(|needle| message.contains(needle));

	if is_timeout_error(&message) {
		ERROR_CATEGORY_TIMEOUT
	} else if contains_any(&["cancelled", "canceled"]) {
		ERROR_CATEGORY_CANCELLED
	} else if contains_any(&["network", "connection", "dial", "lookup"]) {
		ERROR_CATEGORY_NETWORK
	} else if contains_any(&["validation", "invalid", "malformed"]) {
		ERROR_CATEGORY_VALIDATION
	} else if contains_any(&["permission", "unauthorized", "forbidden"]) {
		ERROR_CATEGORY_PERMISSION
	} else if contains_any(&["not found", "404"]) {
		ERROR_CATEGORY_NOT_FOUND
	} else {
		ERROR_CATEGORY_PROVIDER
	}
}

/// Whether an error message describes a timed-out request. Timed-out sends
/// are never retried: the request body may already have reached the server
/// and a retry could duplicate delivery.
pub fn is_timeout_error(message: &str) -> bool {
	let message = message.to_lowercase();
	[
		"timed out",
		"timeout",
		"status: 504",
		"gateway time-out",
		"deadline exceeded",
	]
	.iter()
	.any(|needle| message.contains(needle))
}
