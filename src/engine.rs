//! The storage engine: owns the scratch pool, extent lock table, LRU policy
//! and flush queue, and implements the read/write/flush/unflush algorithms
//! that mediate between the mount shim and the remote object store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::{Backend, Config};
use crate::consts::{extent_tag as extent_tag_of, extent_object_name, page_tag as page_tag_of, EXTENT_SIZE, FILL_BYTE, PAGE_SIZE, SCRATCH_DESCRIPTORS};
use crate::error::{EngineError, VfsError};
use crate::flush_queue::FlushQueue;
use crate::lock::ExtentLockTable;
use crate::lru::ExtentLru;
use crate::scratch::ScratchPool;
use crate::vfs::{read_full, write_full, InMemoryVfs, LocalDiskVfs, OpenMode, VfsBackend};

pub struct Engine {
	config: Arc<Config>,
	scratch: ScratchPool,
	locks: ExtentLockTable,
	lru: ExtentLru,
	flush_queue: Arc<FlushQueue>,
	vfs: Box<dyn VfsBackend>,
}

static_assertions::assert_impl_all!(Engine: Send, Sync);

impl Engine {
	pub fn new(config: Arc<Config>) -> Result<Arc<Self>, EngineError> {
		let vfs: Box<dyn VfsBackend> = match config.backend {
			Backend::Local => Box::new(LocalDiskVfs::new(".")),
			Backend::Memory => Box::new(InMemoryVfs::new()),
		};
		Self::with_vfs(config, vfs)
	}

	/// Builds an engine over a caller-supplied backend, bypassing
	/// `config.backend`. Used by tests to inject a mocked [`VfsBackend`].
	pub fn with_vfs(config: Arc<Config>, vfs: Box<dyn VfsBackend>) -> Result<Arc<Self>, EngineError> {
		let scratch = ScratchPool::create(
			&config.scratch_dir,
			config.device_size,
			config.keep_scratch_file,
			SCRATCH_DESCRIPTORS,
		)?;

		let flush_queue = Arc::new(FlushQueue::new());
		let capacity_extents = (config.cache_bytes / EXTENT_SIZE).max(1) as usize;
		let lru_flush_queue = flush_queue.clone();
		let lru = ExtentLru::new(capacity_extents, move |tag| {
			log::debug!(target: "s3bd::lru", "evicting extent {tag:016x}, scheduling flush-and-remove");
			lru_flush_queue.insert(tag, true);
		});

		Ok(Arc::new(Self {
			config,
			scratch,
			locks: ExtentLockTable::new(),
			lru,
			flush_queue,
			vfs,
		}))
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn spawn_workers(self: &Arc<Self>) -> WorkerHandles {
		let continue_flag = Arc::new(AtomicBool::new(true));

		let sync_handle = {
			let engine = self.clone();
			let flag = continue_flag.clone();
			thread::spawn(move || engine.sync_worker_loop(&flag))
		};
		let drain_handle = {
			let engine = self.clone();
			let flag = continue_flag.clone();
			thread::spawn(move || engine.drain_worker_loop(&flag))
		};

		WorkerHandles {
			continue_flag,
			sync_handle: Some(sync_handle),
			drain_handle: Some(drain_handle),
		}
	}

	fn sync_worker_loop(&self, continue_flag: &AtomicBool) {
		let mut shard_hint = 0usize;
		let sleep_for = Duration::from_secs(self.config.sync_interval_secs.max(1));
		while continue_flag.load(Ordering::Acquire) {
			match self.locks.first_dirty_unreferenced(shard_hint) {
				Some((tag, shard)) => {
					self.flush_queue.insert(tag, false);
					shard_hint = shard;
				}
				None => thread::sleep(sleep_for),
			}
		}
	}

	fn drain_worker_loop(&self, continue_flag: &AtomicBool) {
		while continue_flag.load(Ordering::Acquire) {
			match self.flush_queue.pop() {
				Some((tag, should_remove)) => {
					if let Err(err) = self.storage_flush(tag, should_remove) {
						log::warn!(target: "s3bd::engine", "flush of extent {tag:016x} failed, extent remains dirty: {err}");
					}
				}
				None => thread::sleep(Duration::from_millis(100)),
			}
		}
	}

	/// Reads `buf.len()` bytes starting at `offset`. Returns the number of
	/// bytes actually delivered; a partial delivery on error is only
	/// possible once at least one page has already succeeded.
	pub fn storage_read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, EngineError> {
		if buf.is_empty() {
			return Ok(0);
		}

		if crate::consts::is_page_aligned(offset) {
			let mut delivered = 0usize;
			let mut off = offset;
			while delivered < buf.len() {
				let chunk = (buf.len() - delivered).min(PAGE_SIZE as usize);
				match self.aligned_page_read(off, chunk, &mut buf[delivered..delivered + chunk], true) {
					Ok(()) => {
						delivered += chunk;
						off += chunk as u64;
					}
					Err(err) => {
						if delivered == 0 {
							return Err(err);
						}
						return Ok(delivered);
					}
				}
			}
			Ok(delivered)
		} else {
			let page = page_tag_of(offset);
			let in_page = (offset - page) as usize;
			let head_len = ((PAGE_SIZE as usize) - in_page).min(buf.len());

			let mut page_buf = vec![0u8; PAGE_SIZE as usize];
			self.aligned_page_read(page, PAGE_SIZE as usize, &mut page_buf, true)?;
			buf[..head_len].copy_from_slice(&page_buf[in_page..in_page + head_len]);

			if head_len == buf.len() {
				return Ok(head_len);
			}
			let rest = self.storage_read(offset + head_len as u64, &mut buf[head_len..])?;
			Ok(head_len + rest)
		}
	}

	/// Writes `buf` starting at `offset`. Returns the number of bytes
	/// actually accepted.
	pub fn storage_write(&self, offset: u64, buf: &[u8]) -> Result<usize, EngineError> {
		if buf.is_empty() {
			return Ok(0);
		}

		if crate::consts::is_page_aligned(offset) && buf.len() as u64 % PAGE_SIZE == 0 {
			let mut written = 0usize;
			let mut off = offset;
			while written < buf.len() {
				let chunk = PAGE_SIZE as usize;
				match self.aligned_whole_page_write(off, &buf[written..written + chunk]) {
					Ok(()) => {
						written += chunk;
						off += chunk as u64;
					}
					Err(err) => {
						if written == 0 {
							return Err(err);
						}
						return Ok(written);
					}
				}
			}
			Ok(written)
		} else {
			let page = page_tag_of(offset);
			let in_page = (offset - page) as usize;
			let chunk_len = ((PAGE_SIZE as usize) - in_page).min(buf.len());

			let mut page_buf = vec![0u8; PAGE_SIZE as usize];
			// Reads performed during read-modify-write are must-succeed-or-fail.
			self.aligned_page_read(page, PAGE_SIZE as usize, &mut page_buf, true)?;
			page_buf[in_page..in_page + chunk_len].copy_from_slice(&buf[..chunk_len]);
			self.aligned_whole_page_write(page, &page_buf)?;

			if chunk_len == buf.len() {
				return Ok(chunk_len);
			}
			let rest = self.storage_write(offset + chunk_len as u64, &buf[chunk_len..])?;
			Ok(chunk_len + rest)
		}
	}

	fn aligned_page_read(
		&self,
		page_tag: u64,
		size: usize,
		dst: &mut [u8],
		should_report: bool,
	) -> Result<(), EngineError> {
		debug_assert!(crate::consts::is_page_aligned(page_tag), "unaligned page tag");
		debug_assert!(size <= PAGE_SIZE as usize);

		if should_report {
			self.lru.touch(page_tag);
		}

		let extent = extent_tag_of(page_tag);
		self.locks.spin_lock(extent, true);

		if let Err(err) = self.storage_unflush(extent) {
			self.locks.unlock(extent, true, false);
			return Err(err);
		}
		self.locks.downgrade(extent);

		let result = (|| -> Result<(), EngineError> {
			let guard = self.scratch.acquire();
			match guard.seek_data(page_tag)? {
				Some(pos) if pos == page_tag => {
					guard.read_at_full(&mut dst[..size], page_tag)?;
					Ok(())
				}
				_ => Err(EngineError::Invariant(format!(
					"page {page_tag:016x} missing from scratch file after unflush"
				))),
			}
		})();

		self.locks.unlock(extent, false, false);
		result
	}

	fn aligned_whole_page_write(&self, page_tag: u64, src: &[u8]) -> Result<(), EngineError> {
		debug_assert!(crate::consts::is_page_aligned(page_tag), "unaligned page tag");
		debug_assert_eq!(src.len(), PAGE_SIZE as usize);

		self.lru.touch(page_tag);

		let extent = extent_tag_of(page_tag);
		self.locks.spin_lock(extent, true);

		if let Err(err) = self.storage_unflush(extent) {
			self.locks.unlock(extent, true, false);
			return Err(err);
		}

		let result = (|| -> Result<(), EngineError> {
			let guard = self.scratch.acquire();
			guard.write_at_full(src, page_tag)?;
			Ok(())
		})();

		// Never mark clean here: the write just made the extent dirty.
		self.locks.unlock(extent, true, false);
		result
	}

	/// Ensures the extent window in the scratch file has zero holes.
	/// Caller must already hold the exclusive extent lock.
	fn storage_unflush(&self, extent_tag: u64) -> Result<(), EngineError> {
		let window_end = extent_tag + EXTENT_SIZE;
		let has_hole = {
			let guard = self.scratch.acquire();
			match guard.seek_hole(extent_tag)? {
				Some(hole_at) => hole_at < window_end,
				None => true,
			}
		};
		if !has_hole {
			return Ok(());
		}

		let data = self.fetch_extent_or_fill(extent_tag)?;
		let guard = self.scratch.acquire();
		guard.write_at_full(&data, extent_tag)?;
		Ok(())
	}

	fn fetch_extent_or_fill(&self, extent_tag: u64) -> Result<Vec<u8>, EngineError> {
		let uri = extent_object_name(&self.config.blockdir, extent_tag);
		match self.vfs.open(&uri, OpenMode::Read) {
			Ok(mut handle) => {
				let mut buf = vec![0u8; EXTENT_SIZE as usize];
				let n = read_full(&mut *handle, &mut buf)?;
				handle.close()?;
				if n < buf.len() {
					buf[n..].fill(FILL_BYTE);
				}
				Ok(buf)
			}
			Err(VfsError::NotFound(_)) => Ok(vec![FILL_BYTE; EXTENT_SIZE as usize]),
			Err(err) => Err(EngineError::Vfs(err)),
		}
	}

	/// Flushes one extent, writing it to the remote store if dirty and
	/// optionally punching it out of the scratch file. Always takes the
	/// exclusive extent lock first; on error the extent is left dirty.
	pub fn storage_flush(&self, extent_tag: u64, should_remove: bool) -> Result<(), EngineError> {
		self.locks.spin_lock(extent_tag, true);
		let result = self.storage_flush_locked(extent_tag, should_remove);
		self.locks.unlock(extent_tag, true, result.is_ok());
		result
	}

	fn storage_flush_locked(&self, extent_tag: u64, should_remove: bool) -> Result<(), EngineError> {
		if self.locks.is_clean(extent_tag) {
			if should_remove {
				let guard = self.scratch.acquire();
				guard.punch_hole(extent_tag, EXTENT_SIZE)?;
			}
			return Ok(());
		}

		let mut buf = vec![0u8; EXTENT_SIZE as usize];
		{
			let guard = self.scratch.acquire();
			guard.read_at_full(&mut buf, extent_tag)?;
		}

		let uri = extent_object_name(&self.config.blockdir, extent_tag);
		let mut handle = self.vfs.open(&uri, OpenMode::Write)?;
		write_full(&mut *handle, &buf)?;
		handle.flush()?;
		handle.close()?;

		if should_remove {
			let guard = self.scratch.acquire();
			guard.punch_hole(extent_tag, EXTENT_SIZE)?;
		}
		Ok(())
	}

	/// Synchronously drains every currently-dirty, unreferenced extent.
	/// Used by the mount shim's `flush`/`fsync` callbacks, which block until
	/// durable rather than merely enqueuing.
	pub fn storage_flush_all(&self) -> Result<(), EngineError> {
		loop {
			match self.locks.first_dirty_unreferenced(0) {
				Some((tag, _)) => self.storage_flush(tag, false)?,
				None => return Ok(()),
			}
		}
	}

	pub fn device_size(&self) -> u64 {
		self.config.device_size
	}
}

pub struct WorkerHandles {
	continue_flag: Arc<AtomicBool>,
	sync_handle: Option<JoinHandle<()>>,
	drain_handle: Option<JoinHandle<()>>,
}

impl WorkerHandles {
	pub fn shutdown(mut self) {
		self.continue_flag.store(false, Ordering::Release);
		if let Some(h) = self.sync_handle.take() {
			let _ = h.join();
		}
		if let Some(h) = self.drain_handle.take() {
			let _ = h.join();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Backend;
	use std::path::PathBuf;

	fn test_config(tmp: &std::path::Path, cache_extents: u64) -> Arc<Config> {
		Arc::new(Config {
			blockdir: tmp.join("store").to_string_lossy().into_owned(),
			mountpoint: PathBuf::from("/mnt/unused"),
			readonly: false,
			backend: Backend::Local,
			device_size: 64 * crate::units::MiB as u64,
			allow_other: false,
			debug: false,
			cache_bytes: cache_extents * EXTENT_SIZE,
			keep_scratch_file: false,
			scratch_dir: tmp.to_path_buf(),
			sync_interval_secs: 1,
		})
	}

	#[test]
	fn empty_read_is_fill_byte() {
		let tmp = tempfile::tempdir().unwrap();
		let engine = Engine::new(test_config(tmp.path(), 4)).unwrap();

		let mut buf = [0u8; 8];
		let n = engine.storage_read(0, &mut buf).unwrap();
		assert_eq!(n, 8);
		assert_eq!(buf, [FILL_BYTE; 8]);
	}

	#[test]
	fn aligned_round_trip_and_flush() {
		let tmp = tempfile::tempdir().unwrap();
		let engine = Engine::new(test_config(tmp.path(), 4)).unwrap();

		let offset = 0x400000u64;
		let write_buf = vec![0xAAu8; PAGE_SIZE as usize];
		engine.storage_write(offset, &write_buf).unwrap();

		let mut read_buf = vec![0u8; PAGE_SIZE as usize];
		engine.storage_read(offset, &mut read_buf).unwrap();
		assert_eq!(read_buf, write_buf);

		engine.storage_flush_all().unwrap();

		let mut read_buf_after = vec![0u8; PAGE_SIZE as usize];
		engine.storage_read(offset, &mut read_buf_after).unwrap();
		assert_eq!(read_buf_after, write_buf);
	}

	#[test]
	fn unaligned_write_preserves_neighbors() {
		let tmp = tempfile::tempdir().unwrap();
		let engine = Engine::new(test_config(tmp.path(), 4)).unwrap();

		let base = 0x400000u64;
		engine.storage_write(base, &vec![0xBBu8; PAGE_SIZE as usize]).unwrap();
		engine.storage_write(base + 0x21, &[0xCC; 3]).unwrap();

		let mut buf = vec![0u8; PAGE_SIZE as usize];
		engine.storage_read(base, &mut buf).unwrap();

		assert!(buf[0..0x21].iter().all(|&b| b == 0xBB));
		assert_eq!(&buf[0x21..0x24], &[0xCC, 0xCC, 0xCC]);
		assert!(buf[0x24..].iter().all(|&b| b == 0xBB));
	}

	#[test]
	fn cross_page_unaligned_read() {
		let tmp = tempfile::tempdir().unwrap();
		let engine = Engine::new(test_config(tmp.path(), 4)).unwrap();

		let base = 0x500000u64;
		engine.storage_write(base, &vec![0xDDu8; 8192]).unwrap();

		let mut buf = vec![0u8; 4103];
		engine.storage_read(0x500FFA, &mut buf).unwrap();
		assert!(buf.iter().all(|&b| b == 0xDD));
	}

	#[test]
	fn eviction_flushes_and_punches_hole() {
		let tmp = tempfile::tempdir().unwrap();
		let engine = Engine::new(test_config(tmp.path(), 2)).unwrap();

		let extent_a = 0u64;
		let extent_b = EXTENT_SIZE;
		let extent_c = 2 * EXTENT_SIZE;

		engine.storage_write(extent_a, &vec![0x11; PAGE_SIZE as usize]).unwrap();
		engine.storage_write(extent_b, &vec![0x22; PAGE_SIZE as usize]).unwrap();
		engine.storage_write(extent_c, &vec![0x33; PAGE_SIZE as usize]).unwrap();

		// No background workers are running in this test; drain the flush
		// queue the eviction callback populated by hand.
		while let Some((tag, should_remove)) = engine.flush_queue.pop() {
			engine.storage_flush(tag, should_remove).unwrap();
		}

		let uri = extent_object_name(&engine.config.blockdir, extent_a);
		assert!(engine.vfs.stat(&uri).unwrap().exists);
		assert!(engine.locks.is_clean(extent_a));
	}

	#[test]
	fn remote_open_failure_during_flush_leaves_extent_dirty() {
		use crate::vfs::MockVfsBackend;

		let tmp = tempfile::tempdir().unwrap();
		let config = test_config(tmp.path(), 4);

		let mut mock = MockVfsBackend::new();
		mock.expect_open()
			.returning(|uri, _mode| Err(crate::error::VfsError::Io(std::io::Error::new(
				std::io::ErrorKind::Other,
				format!("simulated remote outage for {uri}"),
			))));
		mock.expect_stat().returning(|_| Ok(crate::vfs::Stat { exists: false }));

		let engine = Engine::with_vfs(config, Box::new(mock)).unwrap();

		let tag = 0x400000u64;
		engine.storage_write(tag, &vec![0xEE; PAGE_SIZE as usize]).unwrap();
		assert!(engine.locks.is_dirty(tag));

		let err = engine.storage_flush(tag, false).unwrap_err();
		assert!(matches!(err, EngineError::Vfs(VfsError::Io(_))));
		assert!(engine.locks.is_dirty(tag), "failed flush must leave the extent dirty");
	}

	#[test]
	fn concurrent_readers_exclude_writer() {
		use std::sync::{mpsc, Mutex};

		let tmp = tempfile::tempdir().unwrap();
		let engine = Engine::new(test_config(tmp.path(), 4)).unwrap();
		let tag = 0u64;

		// Two reader threads take and hold the shared lock, signaling once
		// held; a writer thread spins on try_lock and must not succeed until
		// both readers have released.
		let (reader_ready_tx, reader_ready_rx) = mpsc::channel();
		let (release_readers_tx, release_readers_rx) = mpsc::channel::<()>();
		let release_readers_rx = Arc::new(Mutex::new(release_readers_rx));

		let reader_handles: Vec<_> = (0..2)
			.map(|_| {
				let engine = engine.clone();
				let ready_tx = reader_ready_tx.clone();
				let release_rx = release_readers_rx.clone();
				thread::spawn(move || {
					assert!(engine.locks.try_lock(tag, false));
					ready_tx.send(()).unwrap();
					release_rx.lock().unwrap().recv().unwrap();
					engine.locks.unlock(tag, false, false);
				})
			})
			.collect();

		reader_ready_rx.recv().unwrap();
		reader_ready_rx.recv().unwrap();

		// Both readers confirmed held: an exclusive attempt must fail while
		// either is still outstanding.
		assert!(!engine.locks.try_lock(tag, true));

		let (writer_done_tx, writer_done_rx) = mpsc::channel();
		let writer_engine = engine.clone();
		let writer_handle = thread::spawn(move || {
			writer_engine.locks.spin_lock(tag, true);
			writer_done_tx.send(()).unwrap();
			writer_engine.locks.unlock(tag, true, true);
		});

		// The writer must still be blocked: readers have not released yet.
		assert!(writer_done_rx.try_recv().is_err());

		release_readers_tx.send(()).unwrap();
		release_readers_tx.send(()).unwrap();

		for h in reader_handles {
			h.join().unwrap();
		}
		writer_done_rx.recv().unwrap();
		writer_handle.join().unwrap();
	}
}
