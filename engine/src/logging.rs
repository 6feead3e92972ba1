//! Tracing subscriber helpers. The host application may install its own
//! subscriber instead; nothing in the core requires this one.

use tracing_subscriber::EnvFilter;

/// Installs a JSON-formatted subscriber filtered by `RUST_LOG`.
pub fn init_json_logger() {
	tracing_subscriber::fmt()
		.json()
		.with_env_filter(EnvFilter::from_default_env())
		.init();
}
