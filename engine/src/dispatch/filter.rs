//! Per-provider notification filtering.
//!
//! Gates run in a fixed order and each carries its own rejection reason so
//! the metrics can say why a provider was skipped. An empty list on any
//! axis means "no constraint on this axis".

use serde::Deserialize;

use crate::notification::{Metadata, Notification, NotificationType, Priority};

/// Reserved metadata-filter key carrying a comparison expression such as
/// `">= 0.8"` instead of an equality match.
pub const CONFIDENCE_FILTER_KEY: &str = "confidence";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProviderFilterConfig {
	pub types: Vec<NotificationType>,
	pub priorities: Vec<Priority>,
	pub components: Vec<String>,
	pub metadata_filters: Metadata,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
	TypeMismatch,
	PriorityMismatch,
	ComponentMismatch,
	MetadataMismatch,
	ConfidenceThreshold,
}

impl RejectReason {
	pub fn as_label(self) -> &'static str {
		match self {
			RejectReason::TypeMismatch => "type_mismatch",
			RejectReason::PriorityMismatch => "priority_mismatch",
			RejectReason::ComponentMismatch => "component_mismatch",
			RejectReason::MetadataMismatch => "metadata_mismatch",
			RejectReason::ConfidenceThreshold => "confidence_threshold",
		}
	}
}

/// Label recorded when every gate passes.
pub const MATCH_REASON_ALL: &str = "all";

/// Runs the notification through every gate. `Ok(())` means full match.
pub fn evaluate(
	filter: &ProviderFilterConfig,
	notification: &Notification,
) -> Result<(), RejectReason> {
	if !filter.types.is_empty() && !filter.types.contains(&notification.kind) {
		return Err(RejectReason::TypeMismatch);
	}
	if !filter.priorities.is_empty() && !filter.priorities.contains(&notification.priority) {
		return Err(RejectReason::PriorityMismatch);
	}
	if !filter.components.is_empty() && !filter.components.contains(&notification.component) {
		return Err(RejectReason::ComponentMismatch);
	}

	for (key, expected) in &filter.metadata_filters {
		if key == CONFIDENCE_FILTER_KEY {
			continue;
		}
		match notification.metadata.get(key) {
			Some(actual) if stringify(actual) == stringify(expected) => {},
			_ => return Err(RejectReason::MetadataMismatch),
		}
	}

	if let Some(threshold) = filter.metadata_filters.get(CONFIDENCE_FILTER_KEY) {
		let Some((op, wanted)) = parse_threshold(&stringify(threshold)) else {
			return Err(RejectReason::ConfidenceThreshold);
		};
		let Some(actual) = notification
			.metadata
			.get(CONFIDENCE_FILTER_KEY)
			.and_then(coerce_to_f64)
		else {
			return Err(RejectReason::ConfidenceThreshold);
		};
		if !op.compare(actual, wanted) {
			return Err(RejectReason::ConfidenceThreshold);
		}
	}

	Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CompareOp {
	Greater,
	GreaterOrEqual,
	Less,
	LessOrEqual,
	Equal,
}

impl CompareOp {
	fn compare(self, actual: f64, wanted: f64) -> bool {
		match self {
			CompareOp::Greater => actual > wanted,
			CompareOp::GreaterOrEqual => actual >= wanted,
			CompareOp::Less => actual < wanted,
			CompareOp::LessOrEqual => actual <= wanted,
			CompareOp::Equal => actual == wanted,
		}
	}
}

/// Parses `op value` with `op` one of `>`, `>=`, `<`, `<=`, `=`, `==`.
/// Two-character operators win over their one-character prefixes and
/// whitespace around the value is ignored.
fn parse_threshold(expression: &str) -> Option<(CompareOp, f64)> {
	let expression = expression.trim();
	let (op, rest) = if let Some(rest) = expression.strip_prefix(">=") {
		(CompareOp::GreaterOrEqual, rest)
	} else if let Some(rest) = expression.strip_prefix("<=") {
		(CompareOp::LessOrEqual, rest)
	} else if let Some(rest) = expression.strip_prefix("==") {
		(CompareOp::Equal, rest)
	} else if let Some(rest) = expression.strip_prefix('>') {
		(CompareOp::Greater, rest)
	} else if let Some(rest) = expression.strip_prefix('<') {
		(CompareOp::Less, rest)
	} else if let Some(rest) = expression.strip_prefix('=') {
		(CompareOp::Equal, rest)
	} else {
		return None;
	};
	rest.trim().parse::<f64>().ok().map(|value| (op, value))
}

/// Accepts numbers of any width and numeric strings; rejects everything
/// else.
fn coerce_to_f64(value: &serde_json::Value) -> Option<f64> {
	match value {
		serde_json::Value::Number(number) => number.as_f64(),
		serde_json::Value::String(text) => text.trim().parse::<f64>().ok(),
		_ => None,
	}
}

fn stringify(value: &serde_json::Value) -> String {
	match value {
		serde_json::Value::String(text) => text.clone(),
		other => other.to_string(),
	}
}
