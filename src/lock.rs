//! Sharded extent lock table.
//!
//! Each extent tag maps to an entry of `{dirty, refcount}`: `refcount > 0`
//! means that many shared (reader) holders, `refcount == -1` means one
//! exclusive (writer) holder, `refcount == 0` means idle. This is a counting
//! lock built by hand rather than a reused `RwLock`, because the bring-in
//! path in `aligned_page_read` needs to go from exclusive to shared without
//! ever releasing — a downgrade `parking_lot`'s `RwLock`/`RawRwLock` does not
//! expose.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::collections::hash_map::DefaultHasher;

use parking_lot::Mutex;

use crate::consts::EXTENT_LOCK_SHARDS;

#[derive(Debug, Clone, Copy)]
struct ExtentEntry {
	dirty: bool,
	refcount: i32,
}

struct Shard {
	entries: HashMap<u64, ExtentEntry>,
}

pub struct ExtentLockTable {
	shards: Vec<Mutex<Shard>>,
}

fn shard_index(tag: u64, num_shards: usize) -> usize {
	let mut hasher = DefaultHasher::new();
	tag.hash(&mut hasher);
	(hasher.finish() as usize) % num_shards
}

impl ExtentLockTable {
	pub fn new() -> Self {
		Self::with_shards(EXTENT_LOCK_SHARDS)
	}

	pub fn with_shards(num_shards: usize) -> Self {
		let mut shards = Vec::with_capacity(num_shards);
		shards.resize_with(num_shards, || {
			Mutex::new(Shard {
				entries: HashMap::new(),
			})
		});
		Self { shards }
	}

	fn shard_for(&self, tag: u64) -> &Mutex<Shard> {
		&self.shards[shard_index(tag, self.shards.len())]
	}

	/// Attempts to acquire `tag`, returning `false` without blocking if the
	/// request is incompatible with the current holder.
	pub fn try_lock(&self, tag: u64, exclusive: bool) -> bool {
		let mut shard = self.shard_for(tag).lock();
		match shard.entries.get_mut(&tag) {
			Some(entry) => {
				let compatible = if exclusive {
					entry.refcount == 0
				} else {
					entry.refcount >= 0
				};
				if !compatible {
					return false;
				}
				if exclusive {
					entry.dirty = true;
					entry.refcount = -1;
				} else {
					entry.refcount += 1;
				}
				true
			}
			None => {
				let entry = if exclusive {
					ExtentEntry {
						dirty: true,
						refcount: -1,
					}
				} else {
					ExtentEntry {
						dirty: false,
						refcount: 1,
					}
				};
				shard.entries.insert(tag, entry);
				true
			}
		}
	}

	/// Retries `try_lock` with a yielding back-off until it succeeds.
	pub fn spin_lock(&self, tag: u64, exclusive: bool) {
		while !self.try_lock(tag, exclusive) {
			std::thread::yield_now();
		}
	}

	/// Downgrades a held exclusive lock to a single shared holder. Panics if
	/// the caller does not actually hold the exclusive lock, since that is
	/// an invariant violation rather than a recoverable condition.
	pub fn downgrade(&self, tag: u64) {
		let mut shard = self.shard_for(tag).lock();
		let entry = shard
			.entries
			.get_mut(&tag)
			.expect("downgrade of an untracked extent tag");
		assert_eq!(entry.refcount, -1, "downgrade requires a held exclusive lock");
		entry.refcount = 1;
	}

	/// Releases a held lock. `mark_clean` only applies to exclusive releases.
	pub fn unlock(&self, tag: u64, exclusive: bool, mark_clean: bool) {
		let mut shard = self.shard_for(tag).lock();
		let entry = shard
			.entries
			.get_mut(&tag)
			.expect("unlock of an untracked extent tag");
		if exclusive {
			assert_eq!(entry.refcount, -1, "exclusive unlock without a held exclusive lock");
			if mark_clean {
				entry.dirty = false;
			}
			entry.refcount = 0;
		} else {
			entry.refcount -= 1;
		}
	}

	pub fn is_dirty(&self, tag: u64) -> bool {
		let shard = self.shard_for(tag).lock();
		shard
			.entries
			.get(&tag)
			.map(|e| e.dirty)
			.unwrap_or(false)
	}

	pub fn is_clean(&self, tag: u64) -> bool {
		!self.is_dirty(tag)
	}

	/// Scans shards round-robin starting from `starting_shard`, returning the
	/// first dirty, unreferenced extent tag found. Opportunistically erases
	/// clean, unreferenced entries encountered along the way, since they are
	/// equivalent to never having existed.
	pub fn first_dirty_unreferenced(&self, starting_shard: usize) -> Option<(u64, usize)> {
		let num_shards = self.shards.len();
		for i in 0..num_shards {
			let j = (starting_shard + i) % num_shards;
			let mut shard = self.shards[j].lock();
			let mut found = None;
			shard.entries.retain(|tag, entry| {
				if found.is_some() {
					return true;
				}
				if entry.dirty && entry.refcount == 0 {
					found = Some(*tag);
					true
				} else if !entry.dirty && entry.refcount == 0 {
					false
				} else {
					true
				}
			});
			if let Some(tag) = found {
				return Some((tag, j));
			}
		}
		None
	}
}

impl Default for ExtentLockTable {
	fn default() -> Self {
		Self::new()
	}
}

static_assertions::assert_impl_all!(ExtentLockTable: Send, Sync);

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fresh_tag_exclusive_then_shared_excluded() {
		let table = ExtentLockTable::new();
		assert!(table.try_lock(0x1000, true));
		assert!(!table.try_lock(0x1000, false));
		assert!(!table.try_lock(0x1000, true));
		table.unlock(0x1000, true, true);
		assert!(table.is_clean(0x1000));
	}

	#[test]
	fn shared_readers_stack_exclusive_excluded() {
		let table = ExtentLockTable::new();
		assert!(table.try_lock(0x2000, false));
		assert!(table.try_lock(0x2000, false));
		assert!(!table.try_lock(0x2000, true));
		table.unlock(0x2000, false, false);
		table.unlock(0x2000, false, false);
		assert!(table.try_lock(0x2000, true));
	}

	#[test]
	fn downgrade_allows_one_shared_holder() {
		let table = ExtentLockTable::new();
		assert!(table.try_lock(0x3000, true));
		table.downgrade(0x3000);
		assert!(table.try_lock(0x3000, false));
		assert!(!table.try_lock(0x3000, true));
	}

	#[test]
	fn first_dirty_unreferenced_finds_and_skips_clean() {
		let table = ExtentLockTable::with_shards(4);
		assert!(table.try_lock(0x1000, true));
		table.unlock(0x1000, true, true); // clean, unreferenced
		assert!(table.try_lock(0x2000, true));
		table.unlock(0x2000, true, false); // dirty, unreferenced

		let (tag, _) = table.first_dirty_unreferenced(0).unwrap();
		assert_eq!(tag, 0x2000);
	}

	#[test]
	fn exclusive_then_unlock_round_trips_dirty_flag() {
		let table = ExtentLockTable::new();
		table.try_lock(0x4000, true);
		assert!(table.is_dirty(0x4000));
		table.unlock(0x4000, true, false);
		assert!(table.is_dirty(0x4000));
	}
}
