//! Notification service: creation, the process-wide rate-limit gate,
//! persistence and the multi-subscriber broadcast fabric.
//!
//! Every accepted notification is persisted before fan-out, so subscribers
//! only ever see already stored entities, and each subscriber receives its
//! own clone. Producers are free to keep mutating their copy afterwards.

use std::sync::{
	atomic::{AtomicU64, Ordering},
	Arc,
};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
	errors::NotificationError,
	metrics::{NOTIFICATIONS_CREATED, NOTIFICATIONS_RATE_LIMITED, NOTIFICATION_BROADCASTS},
	notification::{Notification, NotificationType, Priority},
	rate_limiter::SlidingWindow,
	store::{NotificationFilter, NotificationStore},
};

#[derive(Clone, Copy, Debug)]
pub struct ServiceConfig {
	pub rate_limit_window: Duration,
	pub rate_limit_max_events: usize,
	pub cleanup_interval: Duration,
	pub subscriber_queue_size: usize,
}

impl Default for ServiceConfig {
	fn default() -> Self {
		Self {
			rate_limit_window: Duration::from_secs(60),
			rate_limit_max_events: 100,
			cleanup_interval: Duration::from_secs(300),
			subscriber_queue_size: 64,
		}
	}
}

pub type SubscriptionId = u64;

struct Subscriber {
	id: SubscriptionId,
	sender: mpsc::Sender<Notification>,
	token: CancellationToken,
}

/// A live subscription. Dropping the receiver alone does not remove the
/// subscriber; call `cancel` or `NotificationService::unsubscribe`.
pub struct Subscription {
	pub id: SubscriptionId,
	pub receiver: mpsc::Receiver<Notification>,
	token: CancellationToken,
}

impl Subscription {
	pub fn cancel(&self) {
		self.token.cancel();
	}

	pub fn cancellation_token(&self) -> CancellationToken {
		self.token.clone()
	}
}

pub struct NotificationService {
	store: Arc<NotificationStore>,
	config: ServiceConfig,
	subscribers: RwLock<Vec<Subscriber>>,
	rate_limiter: Mutex<SlidingWindow>,
	next_subscription_id: AtomicU64,
	token: CancellationToken,
}

impl NotificationService {
	pub fn new(store: Arc<NotificationStore>, config: ServiceConfig) -> Arc<Self> {
		Arc::new(Self {
			store,
			subscribers: RwLock::new(Vec::new()),
			rate_limiter: Mutex::new(SlidingWindow::new(
				config.rate_limit_window,
				config.rate_limit_max_events,
			)),
			next_subscription_id: AtomicU64::new(0),
			token: CancellationToken::new(),
			config,
		})
	}

	/// Spawns the expiry cleanup loop. Runs until `stop`.
	pub fn start(self: &Arc<Self>) {
		let service = self.clone();
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(service.config.cleanup_interval);
			interval.tick().await;
			loop {
				tokio::select! {
					_ = service.token.cancelled() => break,
					_ = interval.tick() => {
						let removed = service.store.delete_expired();
						if removed > 0 {
							tracing::debug!(removed, "Removed expired notifications");
						}
					},
				}
			}
		});
	}

	pub fn create(
		&self,
		kind: NotificationType,
		priority: Priority,
		title: impl Into<String>,
		message: impl Into<String>,
	) -> Result<Notification, NotificationError> {
		self.create_with_metadata(Notification::new(kind, priority, title, message))
	}

	pub fn create_with_component(
		&self,
		kind: NotificationType,
		priority: Priority,
		component: impl Into<String>,
		title: impl Into<String>,
		message: impl Into<String>,
	) -> Result<Notification, NotificationError> {
		self.create_with_metadata(
			Notification::new(kind, priority, title, message).with_component(component),
		)
	}

	/// Persists and broadcasts a caller-constructed notification. Returns
	/// the stored entity, which is the merge target when the fingerprint
	/// was already live.
	pub fn create_with_metadata(
		&self,
		notification: Notification,
	) -> Result<Notification, NotificationError> {
		if !self.rate_limiter.lock().allow() {
			NOTIFICATIONS_RATE_LIMITED.inc();
			return Err(NotificationError::RateLimited);
		}

		NOTIFICATIONS_CREATED.with_label_values(&[&notification.kind.to_string()]).inc();

		let id = self.store.save(notification);
		let stored = self.store.get(&id).ok_or_else(|| NotificationError::NotFound(id))?;
		self.broadcast(&stored);
		Ok(stored)
	}

	pub fn subscribe(&self) -> Subscription {
		let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
		let (sender, receiver) = mpsc::channel(self.config.subscriber_queue_size);
		let token = self.token.child_token();
		self.subscribers.write().push(Subscriber { id, sender, token: token.clone() });
		tracing::debug!(subscription_id = id, "Subscriber added");
		Subscription { id, receiver, token }
	}

	pub fn unsubscribe(&self, id: SubscriptionId) {
		let mut subscribers = self.subscribers.write();
		subscribers.retain(|subscriber| {
			if subscriber.id == id {
				subscriber.token.cancel();
				false
			} else {
				true
			}
		});
	}

	/// Fans a fresh clone out to every subscriber with a non-blocking
	/// offer. The subscriber list is snapshotted under the read lock;
	/// cancelled subscribers are pruned under the write lock afterwards.
	fn broadcast(&self, notification: &Notification) {
		let snapshot: Vec<(SubscriptionId, mpsc::Sender<Notification>, CancellationToken)> = self
			.subscribers
			.read()
			.iter()
			.map(|s| (s.id, s.sender.clone(), s.token.clone()))
			.collect();

		let (mut success, mut failed, mut cancelled) = (0usize, 0usize, 0usize);
		for (id, sender, token) in snapshot {
			if token.is_cancelled() {
				cancelled += 1;
				continue;
			}
			match sender.try_send(notification.clone()) {
				Ok(()) => success += 1,
				Err(mpsc::error::TrySendError::Full(_)) => {
					tracing::warn!(subscription_id = id, "Subscriber queue full, dropping notification");
					failed += 1;
				},
				Err(mpsc::error::TrySendError::Closed(_)) => cancelled += 1,
			}
		}

		NOTIFICATION_BROADCASTS.with_label_values(&["delivered"]).inc_by(success as u64);
		NOTIFICATION_BROADCASTS.with_label_values(&["dropped"]).inc_by(failed as u64);
		NOTIFICATION_BROADCASTS.with_label_values(&["cancelled"]).inc_by(cancelled as u64);
		tracing::debug!(
			id = %notification.id,
			success,
			failed,
			cancelled,
			"Broadcast complete",
		);

		if cancelled > 0 {
			self.subscribers
				.write()
				.retain(|s| !s.token.is_cancelled() && !s.sender.is_closed());
		}
	}

	pub fn list(&self, filter: &NotificationFilter) -> Vec<Notification> {
		self.store.list(filter)
	}

	pub fn get(&self, id: &str) -> Option<Notification> {
		self.store.get(id)
	}

	pub fn mark_read(&self, id: &str) -> Result<(), NotificationError> {
		let mut notification =
			self.store.get(id).ok_or_else(|| NotificationError::NotFound(id.to_string()))?;
		notification.mark_read();
		self.store.update(notification)
	}

	pub fn mark_acknowledged(&self, id: &str) -> Result<(), NotificationError> {
		let mut notification =
			self.store.get(id).ok_or_else(|| NotificationError::NotFound(id.to_string()))?;
		notification.mark_acknowledged();
		self.store.update(notification)
	}

	pub fn delete(&self, id: &str) -> Result<(), NotificationError> {
		self.store.delete(id)
	}

	pub fn get_unread_count(&self) -> usize {
		self.store.get_unread_count()
	}

	pub fn store(&self) -> &Arc<NotificationStore> {
		&self.store
	}

	/// Cancels the cleanup loop and every subscription token derived from
	/// this service.
	pub fn stop(&self) {
		self.token.cancel();
	}
}
