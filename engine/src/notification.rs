//! Notification value object and its content fingerprint.
//!
//! The fingerprint is the dedup contract: a stable 64 bit hash over
//! `lower(component)|type|trim(title)|trim(message)`, base-36 encoded. The
//! fields, their order and the normalisation must not change without a
//! migration of stored state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

/// Metadata attached to a notification. Nested maps and sequences are
/// supported; `Clone` performs the deep copy subscribers rely on.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Metadata key marking a notification as an ephemeral UI toast. Toasts are
/// excluded from listings and from push dispatch.
pub const TOAST_METADATA_KEY: &str = "isToast";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
	Error,
	Warning,
	Info,
	Detection,
	System,
}

impl std::fmt::Display for NotificationType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(match self {
			NotificationType::Error => "error",
			NotificationType::Warning => "warning",
			NotificationType::Info => "info",
			NotificationType::Detection => "detection",
			NotificationType::System => "system",
		})
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
	Critical,
	High,
	Medium,
	Low,
}

impl Priority {
	/// Ranking used for escalation on dedup merge. Higher wins.
	pub fn weight(self) -> u8 {
		match self {
			Priority::Critical => 4,
			Priority::High => 3,
			Priority::Medium => 2,
			Priority::Low => 1,
		}
	}
}

impl std::fmt::Display for Priority {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(match self {
			Priority::Critical => "critical",
			Priority::High => "high",
			Priority::Medium => "medium",
			Priority::Low => "low",
		})
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
	Unread,
	Read,
	Acknowledged,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notification {
	pub id: String,
	#[serde(rename = "type")]
	pub kind: NotificationType,
	pub priority: Priority,
	pub status: Status,
	pub title: String,
	pub message: String,
	#[serde(default)]
	pub component: String,
	pub timestamp: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Metadata::is_empty")]
	pub metadata: Metadata,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub expires_at: Option<DateTime<Utc>>,
	// Derived, internal only. Recomputed on deserialisation and on update.
	#[serde(skip, default)]
	pub content_hash: String,
	#[serde(default = "default_occurrence_count")]
	pub occurrence_count: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub first_occurrence: Option<DateTime<Utc>>,
}

fn default_occurrence_count() -> u32 {
	1
}

impl Notification {
	pub fn new(
		kind: NotificationType,
		priority: Priority,
		title: impl Into<String>,
		message: impl Into<String>,
	) -> Self {
		let title = title.into();
		let message = message.into();
		let mut notification = Self {
			id: uuid::Uuid::new_v4().to_string(),
			kind,
			priority,
			status: Status::Unread,
			title,
			message,
			component: String::new(),
			timestamp: Utc::now(),
			metadata: Metadata::new(),
			expires_at: None,
			content_hash: String::new(),
			occurrence_count: 1,
			first_occurrence: None,
		};
		notification.refresh_content_hash();
		notification
	}

	pub fn with_component(mut self, component: impl Into<String>) -> Self {
		self.component = component.into();
		self.refresh_content_hash();
		self
	}

	pub fn with_metadata(mut self, metadata: Metadata) -> Self {
		self.metadata = metadata;
		self
	}

	pub fn with_metadata_value(
		mut self,
		key: impl Into<String>,
		value: impl Into<serde_json::Value>,
	) -> Self {
		self.metadata.insert(key.into(), value.into());
		self
	}

	pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
		self.expires_at = Some(expires_at);
		self
	}

	/// Recomputes the content hash from the current hashed fields. Must be
	/// called whenever component, kind, title or message change.
	pub fn refresh_content_hash(&mut self) {
		self.content_hash =
			content_fingerprint(&self.component, self.kind, &self.title, &self.message);
	}

	pub fn mark_read(&mut self) {
		self.status = Status::Read;
	}

	pub fn mark_acknowledged(&mut self) {
		self.status = Status::Acknowledged;
	}

	pub fn is_toast(&self) -> bool {
		matches!(
			self.metadata.get(TOAST_METADATA_KEY),
			Some(serde_json::Value::Bool(true))
		)
	}

	pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
		self.expires_at.is_some_and(|at| now > at)
	}
}

/// Stable fingerprint over the dedup-relevant fields. Case-insensitive on
/// component, whitespace-insensitive at the ends of title and message,
/// sensitive everywhere else.
pub fn content_fingerprint(
	component: &str,
	kind: NotificationType,
	title: &str,
	message: &str,
) -> String {
	let input = format!(
		"{}|{}|{}|{}",
		component.to_lowercase(),
		kind,
		title.trim(),
		message.trim()
	);
	to_base36(xxh64(input.as_bytes(), 0))
}

fn to_base36(mut value: u64) -> String {
	const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
	if value == 0 {
		return "0".to_string();
	}
	let mut out = Vec::with_capacity(13);
	while value > 0 {
		out.push(ALPHABET[(value % 36) as usize]);
		value /= 36;
	}
	out.reverse();
	String::from_utf8(out).expect("base36 alphabet is ascii")
}
