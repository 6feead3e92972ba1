//! Push-notification dispatch core for the Birdwatch detection backend.
//!
//! Detection, error and system events are stored in a bounded in-memory
//! store with content-based deduplication, broadcast to in-process
//! subscribers, and pushed to external delivery providers with filtering,
//! rate limiting, circuit breaking and bounded-concurrency retries. See
//! [`service::NotificationService`] and [`dispatch::PushDispatcher`] for
//! the two entry points.

pub mod circuit_breaker;
pub mod dispatch;
pub mod errors;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod notification;
pub mod provider;
pub mod rate_limiter;
pub mod service;
pub mod settings;
pub mod store;
