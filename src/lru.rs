//! LRU membership tracker over resident extents.
//!
//! This is *not* a data cache: the scratch file holds the bytes. The policy
//! only tracks which extent tags are currently resident and in what
//! recency order, and notifies a caller-supplied callback when capacity is
//! exceeded so the caller can schedule a flush-and-remove. Grounded in the
//! callback-driven eviction shape the storage engine uses elsewhere (cache
//! eviction flushes dirty state before admitting a replacement), generalized
//! here over a plain `Fn(u64)` instead of a fixed admission policy, since a
//! page-admission heuristic like a multi-queue cache has no bearing on a
//! pure extent-membership tracker.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::consts::EXTENT_MASK;

type OnEvict = Box<dyn Fn(u64) + Send + Sync>;

pub struct ExtentLru {
	cache: Mutex<LruCache<u64, ()>>,
	on_evict: OnEvict,
}

impl ExtentLru {
	/// `capacity_extents` must be at least 1; the engine derives it from
	/// `cache_bytes / EXTENT_SIZE` and is responsible for enforcing that.
	pub fn new(capacity_extents: usize, on_evict: impl Fn(u64) + Send + Sync + 'static) -> Self {
		let capacity = NonZeroUsize::new(capacity_extents.max(1)).unwrap();
		Self {
			cache: Mutex::new(LruCache::new(capacity)),
			on_evict: Box::new(on_evict),
		}
	}

	/// Rounds `page_tag` to its containing extent tag, promotes that extent
	/// to most-recently-used, and evicts the least-recently-used extent
	/// (via the eviction callback) if this insertion overflowed capacity.
	pub fn touch(&self, page_tag: u64) {
		let extent_tag = page_tag & !EXTENT_MASK;
		let evicted = self.cache.lock().push(extent_tag, ());
		if let Some((evicted_tag, ())) = evicted {
			if evicted_tag != extent_tag {
				(self.on_evict)(evicted_tag);
			}
		}
	}

	pub fn contains(&self, extent_tag: u64) -> bool {
		self.cache.lock().contains(&extent_tag)
	}

	pub fn len(&self) -> usize {
		self.cache.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

static_assertions::assert_impl_all!(ExtentLru: Send, Sync);

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::{Arc, Mutex as StdMutex};

	#[test]
	fn touch_is_idempotent_within_capacity() {
		let lru = ExtentLru::new(2, |_| panic!("should not evict"));
		lru.touch(0x1000);
		lru.touch(0x1000);
		assert_eq!(lru.len(), 1);
	}

	#[test]
	fn overflow_evicts_least_recently_used() {
		let evicted = Arc::new(StdMutex::new(Vec::new()));
		let evicted_clone = evicted.clone();
		let lru = ExtentLru::new(2, move |tag| evicted_clone.lock().unwrap().push(tag));

		lru.touch(0x0000); // extent A
		lru.touch(EXTENT_MASK + 1); // extent B (distinct extent tag)
		lru.touch(2 * (EXTENT_MASK + 1)); // extent C, over capacity: evicts A

		assert_eq!(*evicted.lock().unwrap(), vec![0x0000]);
		assert!(!lru.contains(0x0000));
		assert!(lru.contains(EXTENT_MASK + 1));
		assert!(lru.contains(2 * (EXTENT_MASK + 1)));
	}

	#[test]
	fn re_touch_promotes_and_protects_from_eviction() {
		let evicted = Arc::new(StdMutex::new(Vec::new()));
		let evicted_clone = evicted.clone();
		let lru = ExtentLru::new(2, move |tag| evicted_clone.lock().unwrap().push(tag));

		let a = 0u64;
		let b = EXTENT_MASK + 1;
		let c = 2 * (EXTENT_MASK + 1);

		lru.touch(a);
		lru.touch(b);
		lru.touch(a); // a is now more recent than b
		lru.touch(c); // over capacity: evicts b, not a

		assert_eq!(*evicted.lock().unwrap(), vec![b]);
		assert!(lru.contains(a));
	}
}
