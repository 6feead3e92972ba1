//! Bounded in-memory notification store with content-based deduplication.
//!
//! Primary index is `id -> Notification`; a secondary index maps
//! `content_hash -> id` to the most recent notification per fingerprint.
//! Secondary entries may briefly orphan (point at an evicted id); an
//! opportunistic sweep on `save` removes them. All state sits behind one
//! `RwLock` and no user code ever runs under it.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

use crate::{
	errors::NotificationError,
	notification::{Notification, NotificationType, Priority, Status},
};

pub const DEFAULT_MAX_SIZE: usize = 1000;
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::minutes(5);

/// How often the secondary index is swept for orphaned entries.
const HASH_INDEX_CLEANUP_INTERVAL: Duration = Duration::hours(1);

#[derive(Clone, Debug, Default)]
pub struct NotificationFilter {
	pub kinds: Vec<NotificationType>,
	pub statuses: Vec<Status>,
	pub priorities: Vec<Priority>,
	pub component: Option<String>,
	pub offset: usize,
	/// Zero means no limit.
	pub limit: usize,
}

impl NotificationFilter {
	fn matches(&self, notification: &Notification) -> bool {
		(self.kinds.is_empty() || self.kinds.contains(&notification.kind)) &&
			(self.statuses.is_empty() || self.statuses.contains(&notification.status)) &&
			(self.priorities.is_empty() || self.priorities.contains(&notification.priority)) &&
			self.component
				.as_ref()
				.is_none_or(|component| *component == notification.component)
	}
}

struct StoreInner {
	notifications: HashMap<String, Notification>,
	hash_index: HashMap<String, String>,
	unread_count: usize,
	dedup_window: Duration,
	last_cleanup: DateTime<Utc>,
}

pub struct NotificationStore {
	max_size: usize,
	inner: RwLock<StoreInner>,
}

impl NotificationStore {
	pub fn new(max_size: usize, dedup_window: Duration) -> Self {
		Self {
			max_size: max_size.max(1),
			inner: RwLock::new(StoreInner {
				notifications: HashMap::new(),
				hash_index: HashMap::new(),
				unread_count: 0,
				dedup_window: if dedup_window <= Duration::zero() {
					DEFAULT_DEDUP_WINDOW
				} else {
					dedup_window
				},
				last_cleanup: Utc::now(),
			}),
		}
	}

	/// Saves a notification, merging it into an existing one when the same
	/// fingerprint was stored within the dedup window. Returns the id of
	/// the stored (possibly pre-existing) notification.
	pub fn save(&self, notification: Notification) -> String {
		let now = Utc::now();
		let mut inner = self.inner.write();
		let inner = &mut *inner;

		if now - inner.last_cleanup > HASH_INDEX_CLEANUP_INTERVAL {
			inner.cleanup_hash_index(now);
			inner.last_cleanup = now;
		}

		if let Some(existing_id) = inner.hash_index.get(&notification.content_hash).cloned() {
			let window = inner.dedup_window;
			if let Some(existing) = inner.notifications.get_mut(&existing_id) {
				if existing.content_hash == notification.content_hash &&
					existing.timestamp > now - window
				{
					existing.occurrence_count += 1;
					if existing.first_occurrence.is_none() {
						existing.first_occurrence = Some(existing.timestamp);
					}
					existing.timestamp = notification.timestamp;
					if notification.priority.weight() > existing.priority.weight() {
						existing.priority = notification.priority;
					}
					for (key, value) in notification.metadata {
						existing.metadata.insert(key, value);
					}
					if existing.status != Status::Unread {
						existing.status = Status::Unread;
						inner.unread_count += 1;
					}
					return existing_id;
				}
			}
		}

		if inner.notifications.len() >= self.max_size {
			inner.evict_oldest();
		}
		if notification.status == Status::Unread {
			inner.unread_count += 1;
		}
		let id = notification.id.clone();
		inner.hash_index.insert(notification.content_hash.clone(), id.clone());
		inner.notifications.insert(id.clone(), notification);
		id
	}

	pub fn get(&self, id: &str) -> Option<Notification> {
		self.inner.read().notifications.get(id).cloned()
	}

	/// Lists stored notifications as deep clones, newest first, with
	/// toasts excluded unconditionally.
	pub fn list(&self, filter: &NotificationFilter) -> Vec<Notification> {
		let inner = self.inner.read();
		let mut notifications: Vec<Notification> = inner
			.notifications
			.values()
			.filter(|n| !n.is_toast() && filter.matches(n))
			.cloned()
			.collect();
		drop(inner);

		notifications.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
		let notifications: Vec<Notification> =
			notifications.into_iter().skip(filter.offset).collect();
		if filter.limit > 0 {
			notifications.into_iter().take(filter.limit).collect()
		} else {
			notifications
		}
	}

	/// Replaces the stored notification's fields in place so the hash
	/// index keeps pointing at the same entry, fixing the index up when a
	/// hashed field changed.
	pub fn update(&self, mut notification: Notification) -> Result<(), NotificationError> {
		notification.refresh_content_hash();
		let mut inner = self.inner.write();
		let inner = &mut *inner;

		let Some(existing) = inner.notifications.get_mut(&notification.id) else {
			return Err(NotificationError::NotFound(notification.id));
		};

		let old_hash = existing.content_hash.clone();
		let was_unread = existing.status == Status::Unread;
		*existing = notification;
		let is_unread = existing.status == Status::Unread;
		let new_hash = existing.content_hash.clone();
		let id = existing.id.clone();

		match (was_unread, is_unread) {
			(true, false) => inner.unread_count -= 1,
			(false, true) => inner.unread_count += 1,
			_ => {},
		}

		if old_hash != new_hash {
			if inner.hash_index.get(&old_hash) == Some(&id) {
				inner.hash_index.remove(&old_hash);
			}
			inner.hash_index.insert(new_hash, id);
		}
		Ok(())
	}

	pub fn delete(&self, id: &str) -> Result<(), NotificationError> {
		let mut inner = self.inner.write();
		let Some(removed) = inner.notifications.remove(id) else {
			return Err(NotificationError::NotFound(id.to_string()));
		};
		inner.forget(&removed);
		Ok(())
	}

	/// Removes every notification whose expiry has passed. Returns how
	/// many were removed.
	pub fn delete_expired(&self) -> usize {
		let now = Utc::now();
		let mut inner = self.inner.write();
		let expired: Vec<String> = inner
			.notifications
			.values()
			.filter(|n| n.is_expired(now))
			.map(|n| n.id.clone())
			.collect();
		for id in &expired {
			if let Some(removed) = inner.notifications.remove(id) {
				inner.forget(&removed);
			}
		}
		expired.len()
	}

	/// Looks up a live notification by fingerprint. Entries outside the
	/// dedup window are not returned even when still stored.
	pub fn find_by_content_hash(&self, content_hash: &str) -> Option<Notification> {
		let now = Utc::now();
		let inner = self.inner.read();
		let id = inner.hash_index.get(content_hash)?;
		let notification = inner.notifications.get(id)?;
		(notification.content_hash == content_hash &&
			notification.timestamp > now - inner.dedup_window)
			.then(|| notification.clone())
	}

	/// Non-positive durations reset the window to the default.
	pub fn set_dedup_window(&self, window: Duration) {
		self.inner.write().dedup_window =
			if window <= Duration::zero() { DEFAULT_DEDUP_WINDOW } else { window };
	}

	pub fn get_unread_count(&self) -> usize {
		self.inner.read().unread_count
	}

	pub fn len(&self) -> usize {
		self.inner.read().notifications.len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.read().notifications.is_empty()
	}
}

impl StoreInner {
	/// Removes the single oldest notification by timestamp.
	fn evict_oldest(&mut self) {
		let oldest_id = self
			.notifications
			.values()
			.min_by_key(|n| n.timestamp)
			.map(|n| n.id.clone());
		if let Some(id) = oldest_id {
			if let Some(removed) = self.notifications.remove(&id) {
				self.forget(&removed);
			}
		}
	}

	/// Index and counter hygiene for a notification already removed from
	/// the primary map.
	fn forget(&mut self, removed: &Notification) {
		if removed.status == Status::Unread {
			self.unread_count -= 1;
		}
		if self.hash_index.get(&removed.content_hash) == Some(&removed.id) {
			self.hash_index.remove(&removed.content_hash);
		}
	}

	fn cleanup_hash_index(&mut self, now: DateTime<Utc>) {
		let window = self.dedup_window;
		let notifications = &self.notifications;
		self.hash_index.retain(|hash, id| match notifications.get(id) {
			None => false,
			Some(n) => n.content_hash == *hash || n.timestamp > now - window,
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::notification::Metadata;

	fn store() -> NotificationStore {
		NotificationStore::new(DEFAULT_MAX_SIZE, DEFAULT_DEDUP_WINDOW)
	}

	fn notification(title: &str) -> Notification {
		Notification::new(NotificationType::Error, Priority::Medium, title, "message")
			.with_component("diskmanager")
	}

	#[test]
	fn duplicate_within_window_merges_and_escalates() {
		let store = store();
		let first = notification("X");
		let first_timestamp = first.timestamp;
		let first_id = store.save(first);

		let mut second = notification("X");
		second.priority = Priority::High;
		second.timestamp = first_timestamp + Duration::seconds(1);
		let second_id = store.save(second);

		assert_eq!(first_id, second_id);
		let listed = store.list(&NotificationFilter::default());
		assert_eq!(listed.len(), 1);
		let merged = &listed[0];
		assert_eq!(merged.occurrence_count, 2);
		assert_eq!(merged.priority, Priority::High);
		assert_eq!(merged.timestamp, first_timestamp + Duration::seconds(1));
		assert_eq!(merged.status, Status::Unread);
		assert_eq!(merged.first_occurrence, Some(first_timestamp));
	}

	#[test]
	fn merge_never_lowers_priority() {
		let store = store();
		let mut first = notification("X");
		first.priority = Priority::Critical;
		store.save(first);

		let mut second = notification("X");
		second.priority = Priority::Low;
		store.save(second);

		assert_eq!(store.list(&NotificationFilter::default())[0].priority, Priority::Critical);
	}

	#[test]
	fn merge_overwrites_metadata_keys_and_forces_unread() {
		let store = store();
		let first = notification("X")
			.with_metadata_value("k", "old")
			.with_metadata_value("keep", 1);
		let id = store.save(first);

		let mut stored = store.get(&id).unwrap();
		stored.mark_read();
		store.update(stored).unwrap();
		assert_eq!(store.get_unread_count(), 0);

		let second = notification("X").with_metadata_value("k", "new");
		store.save(second);

		let merged = store.get(&id).unwrap();
		assert_eq!(merged.metadata["k"], "new");
		assert_eq!(merged.metadata["keep"], 1);
		assert_eq!(merged.status, Status::Unread);
		assert_eq!(store.get_unread_count(), 1);
	}

	#[test]
	fn duplicate_outside_window_is_stored_separately() {
		let store = store();
		let mut first = notification("X");
		first.timestamp = Utc::now() - Duration::minutes(10);
		store.save(first);

		store.save(notification("X"));
		assert_eq!(store.len(), 2);
	}

	#[test]
	fn capacity_bound_evicts_single_oldest() {
		let store = NotificationStore::new(2, DEFAULT_DEDUP_WINDOW);
		let mut oldest = notification("a");
		oldest.timestamp = Utc::now() - Duration::minutes(3);
		let oldest_id = store.save(oldest);
		store.save(notification("b"));
		store.save(notification("c"));

		assert_eq!(store.len(), 2);
		assert!(store.get(&oldest_id).is_none());
		assert_eq!(store.get_unread_count(), 2);
	}

	#[test]
	fn unread_counter_tracks_all_mutations() {
		let store = store();
		let id_a = store.save(notification("a"));
		let id_b = store.save(notification("b"));
		assert_eq!(store.get_unread_count(), 2);

		let mut a = store.get(&id_a).unwrap();
		a.mark_acknowledged();
		store.update(a).unwrap();
		assert_eq!(store.get_unread_count(), 1);

		store.delete(&id_b).unwrap();
		assert_eq!(store.get_unread_count(), 0);

		let mut expired = notification("c");
		expired.expires_at = Some(Utc::now() - Duration::seconds(1));
		store.save(expired);
		assert_eq!(store.get_unread_count(), 1);
		assert_eq!(store.delete_expired(), 1);
		assert_eq!(store.get_unread_count(), 0);
	}

	#[test]
	fn list_excludes_toasts_and_orders_newest_first() {
		let store = store();
		let mut old = notification("old");
		old.timestamp = Utc::now() - Duration::minutes(2);
		store.save(old);
		store.save(notification("new"));
		store.save(
			Notification::new(NotificationType::Info, Priority::Low, "toast", "m")
				.with_metadata_value(crate::notification::TOAST_METADATA_KEY, true),
		);

		let listed = store.list(&NotificationFilter::default());
		assert_eq!(listed.len(), 2);
		assert_eq!(listed[0].title, "new");
		assert_eq!(listed[1].title, "old");
	}

	#[test]
	fn list_applies_filter_offset_and_limit() {
		let store = store();
		for i in 0..5 {
			let mut n = notification(&format!("n{i}"));
			n.timestamp = Utc::now() + Duration::seconds(i);
			store.save(n);
		}
		store.save(Notification::new(NotificationType::Info, Priority::Low, "info", "m"));

		let filter = NotificationFilter {
			kinds: vec![NotificationType::Error],
			offset: 1,
			limit: 2,
			..Default::default()
		};
		let listed = store.list(&filter);
		assert_eq!(listed.len(), 2);
		assert_eq!(listed[0].title, "n3");
		assert_eq!(listed[1].title, "n2");
	}

	#[test]
	fn listed_clones_are_isolated_from_the_store() {
		let store = store();
		let nested = serde_json::json!({"inner": {"k": "v"}, "seq": [1, 2, 3]});
		let id = store.save(notification("X").with_metadata_value("nested", nested));

		let mut listed = store.list(&NotificationFilter::default());
		listed[0].metadata["nested"]["inner"]["k"] = serde_json::json!("mutated");
		listed[0].metadata["nested"]["seq"][0] = serde_json::json!(99);

		let stored = store.get(&id).unwrap();
		assert_eq!(stored.metadata["nested"]["inner"]["k"], "v");
		assert_eq!(stored.metadata["nested"]["seq"][0], 1);
	}

	#[test]
	fn update_recomputes_hash_and_fixes_index() {
		let store = store();
		let id = store.save(notification("before"));
		let old_hash = store.get(&id).unwrap().content_hash;

		let mut updated = store.get(&id).unwrap();
		updated.title = "after".to_string();
		store.update(updated).unwrap();

		let stored = store.get(&id).unwrap();
		assert_ne!(stored.content_hash, old_hash);
		assert!(store.find_by_content_hash(&old_hash).is_none());
		assert_eq!(store.find_by_content_hash(&stored.content_hash).unwrap().id, id);
	}

	#[test]
	fn update_missing_id_is_not_found() {
		let store = store();
		let ghost = notification("ghost");
		assert!(matches!(store.update(ghost), Err(NotificationError::NotFound(_))));
	}

	#[test]
	fn find_by_content_hash_respects_the_window() {
		let store = store();
		let mut stale = notification("X");
		stale.timestamp = Utc::now() - Duration::minutes(10);
		let hash = stale.content_hash.clone();
		store.save(stale);

		assert!(store.find_by_content_hash(&hash).is_none());

		store.save(notification("X"));
		assert!(store.find_by_content_hash(&hash).is_some());
	}

	#[test]
	fn set_dedup_window_resets_on_non_positive() {
		let store = store();
		store.set_dedup_window(Duration::seconds(-1));
		assert_eq!(store.inner.read().dedup_window, DEFAULT_DEDUP_WINDOW);
		store.set_dedup_window(Duration::seconds(30));
		assert_eq!(store.inner.read().dedup_window, Duration::seconds(30));
	}

	#[test]
	fn delete_keeps_foreign_hash_entries() {
		let store = store();
		// Two notifications sharing a fingerprint but stored separately
		// because the first is outside the window. The index points at the
		// second; deleting the first must not remove that entry.
		let mut first = notification("X");
		first.timestamp = Utc::now() - Duration::minutes(10);
		let first_id = store.save(first);
		let second_id = store.save(notification("X"));

		store.delete(&first_id).unwrap();
		let hash = store.get(&second_id).unwrap().content_hash;
		assert_eq!(store.find_by_content_hash(&hash).unwrap().id, second_id);
	}

	#[test]
	fn metadata_merge_is_shallow_with_new_key_wins() {
		let store = store();
		let mut meta = Metadata::new();
		meta.insert("a".into(), serde_json::json!({"x": 1}));
		store.save(notification("X").with_metadata(meta));

		let mut meta = Metadata::new();
		meta.insert("a".into(), serde_json::json!({"y": 2}));
		store.save(notification("X").with_metadata(meta));

		let merged = &store.list(&NotificationFilter::default())[0];
		assert_eq!(merged.metadata["a"], serde_json::json!({"y": 2}));
	}
}
