//! Delivery-provider capability seam.
//!
//! The core never knows what a provider actually is (webhook, script,
//! third-party router). It only sees this trait, registered at dispatcher
//! construction and probed by the health checker.

use async_trait::async_trait;
use thiserror::Error;

use crate::{
	errors::{error_category, is_timeout_error, ERROR_CATEGORY_CANCELLED, ERROR_CATEGORY_TIMEOUT},
	notification::{Notification, NotificationType},
};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
	fn name(&self) -> &str;

	fn is_enabled(&self) -> bool;

	fn supports_type(&self, kind: NotificationType) -> bool;

	/// Cheap configuration check, also used as the health-probe proxy.
	fn validate_config(&self) -> anyhow::Result<()>;

	async fn send(&self, notification: &Notification) -> Result<(), ProviderError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ProviderErrorKind {
	Other,
	Timeout,
	Cancelled,
}

/// Error returned by a provider's `send`. Providers may mark an error as
/// explicitly retryable or not; unmarked errors are retryable unless they
/// classify as timeouts or cancellations.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProviderError {
	message: String,
	kind: ProviderErrorKind,
	retryable: Option<bool>,
}

impl ProviderError {
	pub fn new(message: impl Into<String>) -> Self {
		Self { message: message.into(), kind: ProviderErrorKind::Other, retryable: None }
	}

	pub fn timeout(message: impl Into<String>) -> Self {
		Self { message: message.into(), kind: ProviderErrorKind::Timeout, retryable: None }
	}

	pub fn cancelled(message: impl Into<String>) -> Self {
		Self { message: message.into(), kind: ProviderErrorKind::Cancelled, retryable: None }
	}

	pub fn with_retryable(mut self, retryable: bool) -> Self {
		self.retryable = Some(retryable);
		self
	}

	/// The provider's explicit retryability marker, if it set one.
	pub fn retryable_hint(&self) -> Option<bool> {
		self.retryable
	}

	pub fn is_cancelled(&self) -> bool {
		self.kind == ProviderErrorKind::Cancelled
	}

	/// Timed-out attempts are never retried, whether signalled by kind or
	/// recognisable from the message.
	pub fn is_timeout(&self) -> bool {
		self.kind == ProviderErrorKind::Timeout || is_timeout_error(&self.message)
	}

	/// Bounded metric label for this error.
	pub fn category(&self) -> &'static str {
		match self.kind {
			ProviderErrorKind::Timeout => ERROR_CATEGORY_TIMEOUT,
			ProviderErrorKind::Cancelled => ERROR_CATEGORY_CANCELLED,
			ProviderErrorKind::Other => error_category(&self.message),
		}
	}
}

impl From<anyhow::Error> for ProviderError {
	fn from(error: anyhow::Error) -> Self {
		Self::new(format!("{error:#}"))
	}
}
