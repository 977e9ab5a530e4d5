//! Scratch descriptor pool: a fixed set of file descriptors onto one sparse
//! scratch file, each guarded by its own mutex. `acquire()` never blocks on
//! a specific descriptor — it scans the pool with non-blocking `try_lock`
//! and may spin across the whole pool before one comes free.
//!
//! Presence is represented by data (not holes) at a page's offset in this
//! file; callers query that via `lseek(..., SEEK_DATA/SEEK_HOLE)` and
//! reclaim space via `fallocate(PUNCH_HOLE|KEEP_SIZE)`, so the engine never
//! needs an in-memory presence bitmap.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{fallocate, FallocateFlags};
use parking_lot::{Mutex, MutexGuard};

// Linux lseek(2) whence values; not universally exposed by every libc target
// tier, so named locally rather than relying on `libc::SEEK_DATA` being
// present for the build target.
const SEEK_DATA: i32 = 3;
const SEEK_HOLE: i32 = 4;

pub struct ScratchPool {
	descriptors: Vec<Mutex<File>>,
	path: PathBuf,
}

impl ScratchPool {
	/// Creates (or reopens) the scratch file at `{scratch_dir}/s3bd.{pid}`,
	/// sizes it to `device_size`, opens `num_descriptors` independent
	/// descriptors onto it, and unlinks the path unless `keep` is set. The
	/// already-open descriptors keep the backing inode alive regardless.
	pub fn create(
		scratch_dir: &Path,
		device_size: u64,
		keep: bool,
		num_descriptors: usize,
	) -> io::Result<Self> {
		let pid = std::process::id();
		let path = scratch_dir.join(format!("s3bd.{pid}"));

		let mut descriptors = Vec::with_capacity(num_descriptors);
		for _ in 0..num_descriptors {
			let file = OpenOptions::new()
				.read(true)
				.write(true)
				.create(true)
				.open(&path)?;
			file.set_len(device_size)?;
			descriptors.push(Mutex::new(file));
		}

		if !keep {
			std::fs::remove_file(&path)?;
		}

		Ok(Self { descriptors, path })
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn len(&self) -> usize {
		self.descriptors.len()
	}

	pub fn is_empty(&self) -> bool {
		self.descriptors.is_empty()
	}

	/// Scans the pool for a free descriptor without blocking on any single
	/// one; spins (yielding) across the whole pool until one is available.
	pub fn acquire(&self) -> ScratchGuard<'_> {
		loop {
			for descriptor in &self.descriptors {
				if let Some(file) = descriptor.try_lock() {
					return ScratchGuard { file };
				}
			}
			std::thread::yield_now();
		}
	}
}

static_assertions::assert_impl_all!(ScratchPool: Send, Sync);

pub struct ScratchGuard<'a> {
	file: MutexGuard<'a, File>,
}

impl<'a> ScratchGuard<'a> {
	pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
		self.file.read_at(buf, offset)
	}

	pub fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
		self.file.write_at(buf, offset)
	}

	/// Loops `read_at` over short returns until `buf` is full or the file
	/// reports EOF at `offset` (a zero-length read).
	pub fn read_at_full(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
		let mut total = 0;
		while total < buf.len() {
			let n = self.read_at(&mut buf[total..], offset + total as u64)?;
			if n == 0 {
				break;
			}
			total += n;
		}
		Ok(total)
	}

	/// Loops `write_at` over short returns until all of `buf` is accepted.
	pub fn write_at_full(&self, buf: &[u8], offset: u64) -> io::Result<()> {
		let mut total = 0;
		while total < buf.len() {
			let n = self.write_at(&buf[total..], offset + total as u64)?;
			if n == 0 {
				return Err(io::Error::new(io::ErrorKind::WriteZero, "scratch file accepted zero bytes"));
			}
			total += n;
		}
		Ok(())
	}

	/// `lseek(fd, offset, SEEK_DATA)`: the offset of the next data region at
	/// or after `offset`, or `None` if everything from `offset` to EOF is a
	/// hole.
	pub fn seek_data(&self, offset: u64) -> io::Result<Option<u64>> {
		self.raw_seek(offset, SEEK_DATA)
	}

	/// `lseek(fd, offset, SEEK_HOLE)`: the offset of the next hole at or
	/// after `offset` (a file always has a conceptual hole at EOF, so this
	/// should not return `None` in practice).
	pub fn seek_hole(&self, offset: u64) -> io::Result<Option<u64>> {
		self.raw_seek(offset, SEEK_HOLE)
	}

	fn raw_seek(&self, offset: u64, whence: i32) -> io::Result<Option<u64>> {
		let fd = self.file.as_raw_fd();
		// Safety: `fd` is a valid, open descriptor for the lifetime of this
		// call, owned by the `File` this guard holds locked.
		let result = unsafe { libc::lseek(fd, offset as libc::off_t, whence) };
		if result < 0 {
			let err = io::Error::last_os_error();
			if err.raw_os_error() == Some(libc::ENXIO) {
				return Ok(None);
			}
			return Err(err);
		}
		Ok(Some(result as u64))
	}

	/// `fallocate(fd, PUNCH_HOLE|KEEP_SIZE, offset, len)`.
	pub fn punch_hole(&self, offset: u64, len: u64) -> io::Result<()> {
		fallocate(
			self.file.as_raw_fd(),
			FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE,
			offset as libc::off_t,
			len as libc::off_t,
		)
		.map_err(|errno| io::Error::from_raw_os_error(errno as i32))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::consts::{EXTENT_SIZE, PAGE_SIZE};

	#[test]
	fn create_sizes_and_unlinks_by_default() {
		let dir = tempfile::tempdir().unwrap();
		let pool = ScratchPool::create(dir.path(), 4 * EXTENT_SIZE, false, 4).unwrap();
		assert_eq!(pool.len(), 4);
		assert!(!pool.path().exists());
	}

	#[test]
	fn keep_flag_leaves_file_on_disk() {
		let dir = tempfile::tempdir().unwrap();
		let pool = ScratchPool::create(dir.path(), EXTENT_SIZE, true, 2).unwrap();
		assert!(pool.path().exists());
	}

	#[test]
	fn fresh_file_is_entirely_a_hole() {
		let dir = tempfile::tempdir().unwrap();
		let pool = ScratchPool::create(dir.path(), EXTENT_SIZE, true, 2).unwrap();
		let guard = pool.acquire();
		assert_eq!(guard.seek_data(0).unwrap(), None);
	}

	#[test]
	fn write_then_seek_data_finds_it_and_punch_hole_clears_it() {
		let dir = tempfile::tempdir().unwrap();
		let pool = ScratchPool::create(dir.path(), EXTENT_SIZE, true, 2).unwrap();
		let guard = pool.acquire();

		guard.write_at(&[0xAA; PAGE_SIZE as usize], 0).unwrap();
		assert_eq!(guard.seek_data(0).unwrap(), Some(0));

		guard.punch_hole(0, PAGE_SIZE).unwrap();
		assert_eq!(guard.seek_data(0).unwrap(), None);
	}

	#[test]
	fn acquire_never_blocks_on_a_single_busy_descriptor() {
		let dir = tempfile::tempdir().unwrap();
		let pool = ScratchPool::create(dir.path(), EXTENT_SIZE, true, 2).unwrap();
		let _first = pool.acquire();
		let _second = pool.acquire();
		// With only two descriptors, both are now held; this test merely
		// documents that acquiring both does not deadlock on itself.
	}
}
