//! Deduplicating priority queue of pending flushes.
//!
//! Entries are `(extent_tag, should_remove)` pairs; eviction-triggered
//! flushes (`should_remove = true`) are drained before sync-triggered ones,
//! and within a class the tiebreak is ascending extent tag (the ordering
//! within a class is left unspecified upstream; ascending tag gives a total
//! order for free from a `BTreeSet`).

use std::collections::BTreeSet;

use parking_lot::Mutex;

/// `order_key = false` means `should_remove = true` (eviction), sorting
/// ahead of `order_key = true` (`should_remove = false`, sync) because
/// `false < true`.
#[derive(Default)]
pub struct FlushQueue {
	entries: Mutex<BTreeSet<(bool, u64)>>,
}

impl FlushQueue {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&self, tag: u64, should_remove: bool) {
		let order_key = !should_remove;
		self.entries.lock().insert((order_key, tag));
	}

	pub fn pop(&self) -> Option<(u64, bool)> {
		let mut entries = self.entries.lock();
		let first = *entries.iter().next()?;
		entries.remove(&first);
		let (order_key, tag) = first;
		Some((tag, !order_key))
	}

	pub fn is_empty(&self) -> bool {
		self.entries.lock().is_empty()
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}
}

static_assertions::assert_impl_all!(FlushQueue: Send, Sync);

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn eviction_flushes_drain_before_sync_flushes() {
		let q = FlushQueue::new();
		q.insert(0x3000, false);
		q.insert(0x1000, true);
		q.insert(0x2000, true);

		assert_eq!(q.pop(), Some((0x1000, true)));
		assert_eq!(q.pop(), Some((0x2000, true)));
		assert_eq!(q.pop(), Some((0x3000, false)));
		assert!(q.is_empty());
	}

	#[test]
	fn duplicate_insert_is_a_no_op() {
		let q = FlushQueue::new();
		q.insert(0x1000, true);
		q.insert(0x1000, true);
		assert_eq!(q.len(), 1);
	}

	#[test]
	fn empty_pop_returns_none() {
		let q = FlushQueue::new();
		assert_eq!(q.pop(), None);
	}
}
