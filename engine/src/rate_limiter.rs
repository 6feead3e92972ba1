//! Rate limiting primitives: a per-provider token bucket and the
//! process-wide sliding window guarding notification creation.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
	pub requests_per_minute: u32,
	pub burst_size: u32,
}

impl Default for RateLimitConfig {
	fn default() -> Self {
		Self { requests_per_minute: 60, burst_size: 10 }
	}
}

/// Token bucket refilled at `requests_per_minute / 60` tokens per second up
/// to `burst_size` capacity.
#[derive(Debug)]
pub struct TokenBucket {
	tokens: f64,
	capacity: f64,
	rate_per_sec: f64,
	last_refill: Instant,
}

impl TokenBucket {
	pub fn new(config: RateLimitConfig) -> Self {
		let capacity = f64::from(config.burst_size.max(1));
		Self {
			tokens: capacity,
			capacity,
			rate_per_sec: f64::from(config.requests_per_minute) / 60.0,
			last_refill: Instant::now(),
		}
	}

	fn refill(&mut self) {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last_refill).as_secs_f64();
		self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
		self.last_refill = now;
	}

	pub fn allow(&mut self) -> bool {
		self.refill();
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

/// Sliding-window event counter: at most `max_events` within `window`.
#[derive(Debug)]
pub struct SlidingWindow {
	window: Duration,
	max_events: usize,
	events: VecDeque<Instant>,
}

impl SlidingWindow {
	pub fn new(window: Duration, max_events: usize) -> Self {
		Self { window, max_events, events: VecDeque::with_capacity(max_events) }
	}

	pub fn allow(&mut self) -> bool {
		let now = Instant::now();
		while self.events.front().is_some_and(|&at| now.duration_since(at) >= self.window) {
			self.events.pop_front();
		}
		if self.events.len() >= self.max_events {
			false
		} else {
			self.events.push_back(now);
			true
		}
	}
}
