//! `fuser::Filesystem` shim. Maps the two inodes this mount ever exposes
//! (the root directory and `/blocks`) onto `Engine::storage_read` /
//! `storage_write` / `storage_flush_all`, and refuses every metadata
//! mutation the way `original_source`'s `callbacks.c` does.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
	FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
	ReplyEntry, ReplyStatfs, ReplyWrite, Request,
};

use crate::consts::PAGE_SIZE;
use crate::engine::Engine;

const ROOT_INO: u64 = 1;
const BLOCKS_INO: u64 = 2;
const BLOCKS_NAME: &str = "blocks";

// Attribute cache TTL handed back to the kernel; the mount's attributes
// never change, so any value would do, but zero discourages stale caching
// across mounts in tests.
const TTL: Duration = Duration::from_secs(0);

pub struct BlocksFs {
	engine: Arc<Engine>,
	readonly: bool,
}

impl BlocksFs {
	pub fn new(engine: Arc<Engine>, readonly: bool) -> Self {
		Self { engine, readonly }
	}

	fn root_attr(&self) -> FileAttr {
		FileAttr {
			ino: ROOT_INO,
			size: 0,
			blocks: 0,
			atime: UNIX_EPOCH,
			mtime: UNIX_EPOCH,
			ctime: UNIX_EPOCH,
			crtime: UNIX_EPOCH,
			kind: FileType::Directory,
			perm: 0o755,
			nlink: 2,
			uid: unsafe { libc::getuid() },
			gid: unsafe { libc::getgid() },
			rdev: 0,
			blksize: PAGE_SIZE as u32,
			flags: 0,
		}
	}

	fn blocks_attr(&self) -> FileAttr {
		let device_size = self.engine.device_size();
		FileAttr {
			ino: BLOCKS_INO,
			size: device_size,
			blocks: device_size.div_ceil(PAGE_SIZE),
			atime: UNIX_EPOCH,
			mtime: UNIX_EPOCH,
			ctime: UNIX_EPOCH,
			crtime: UNIX_EPOCH,
			kind: FileType::RegularFile,
			perm: if self.readonly { 0o400 } else { 0o600 },
			nlink: 1,
			uid: unsafe { libc::getuid() },
			gid: unsafe { libc::getgid() },
			rdev: 0,
			blksize: PAGE_SIZE as u32,
			flags: 0,
		}
	}
}

impl Filesystem for BlocksFs {
	fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
		if parent == ROOT_INO && name == BLOCKS_NAME {
			reply.entry(&TTL, &self.blocks_attr(), 0);
		} else {
			reply.error(libc::ENOENT);
		}
	}

	fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
		match ino {
			ROOT_INO => reply.attr(&TTL, &self.root_attr()),
			BLOCKS_INO => reply.attr(&TTL, &self.blocks_attr()),
			_ => reply.error(libc::ENOENT),
		}
	}

	fn readdir(
		&mut self,
		_req: &Request,
		ino: u64,
		_fh: u64,
		offset: i64,
		mut reply: ReplyDirectory,
	) {
		if ino != ROOT_INO {
			reply.error(libc::ENOENT);
			return;
		}
		let entries = [
			(ROOT_INO, FileType::Directory, "."),
			(ROOT_INO, FileType::Directory, ".."),
			(BLOCKS_INO, FileType::RegularFile, BLOCKS_NAME),
		];
		for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
			if reply.add(ino, (i + 1) as i64, kind, name) {
				break;
			}
		}
		reply.ok();
	}

	fn open(&mut self, _req: &Request, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
		if ino == BLOCKS_INO {
			reply.opened(0, 0);
		} else {
			reply.error(libc::ENOENT);
		}
	}

	fn read(
		&mut self,
		_req: &Request,
		ino: u64,
		_fh: u64,
		offset: i64,
		size: u32,
		_flags: i32,
		_lock_owner: Option<u64>,
		reply: ReplyData,
	) {
		if ino != BLOCKS_INO {
			reply.error(libc::ENOENT);
			return;
		}
		let mut buf = vec![0u8; size as usize];
		match self.engine.storage_read(offset as u64, &mut buf) {
			Ok(n) => reply.data(&buf[..n]),
			Err(err) => reply.error(err.to_errno()),
		}
	}

	fn write(
		&mut self,
		_req: &Request,
		ino: u64,
		_fh: u64,
		offset: i64,
		data: &[u8],
		_write_flags: u32,
		_flags: i32,
		_lock_owner: Option<u64>,
		reply: ReplyWrite,
	) {
		if ino != BLOCKS_INO {
			reply.error(libc::ENOENT);
			return;
		}
		if self.readonly {
			reply.error(libc::EPERM);
			return;
		}
		match self.engine.storage_write(offset as u64, data) {
			Ok(n) => reply.written(n as u32),
			Err(err) => reply.error(err.to_errno()),
		}
	}

	fn flush(&mut self, _req: &Request, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
		if ino != BLOCKS_INO {
			reply.error(libc::ENOENT);
			return;
		}
		match self.engine.storage_flush_all() {
			Ok(()) => reply.ok(),
			Err(err) => reply.error(err.to_errno()),
		}
	}

	fn fsync(&mut self, _req: &Request, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
		if ino != BLOCKS_INO {
			reply.error(libc::ENOENT);
			return;
		}
		match self.engine.storage_flush_all() {
			Ok(()) => reply.ok(),
			Err(err) => reply.error(err.to_errno()),
		}
	}

	fn setattr(
		&mut self,
		_req: &Request,
		ino: u64,
		_mode: Option<u32>,
		_uid: Option<u32>,
		_gid: Option<u32>,
		_size: Option<u64>,
		_atime: Option<fuser::TimeOrNow>,
		_mtime: Option<fuser::TimeOrNow>,
		_ctime: Option<SystemTime>,
		_fh: Option<u64>,
		_crtime: Option<SystemTime>,
		_chgtime: Option<SystemTime>,
		_bkuptime: Option<SystemTime>,
		_flags: Option<u32>,
		reply: ReplyAttr,
	) {
		if ino != BLOCKS_INO && ino != ROOT_INO {
			reply.error(libc::ENOENT);
			return;
		}
		// chmod / chown / truncate / utimens are all refused the same way.
		reply.error(libc::EPERM);
	}

	fn getxattr(
		&mut self,
		_req: &Request,
		_ino: u64,
		_name: &OsStr,
		_size: u32,
		reply: fuser::ReplyXattr,
	) {
		reply.error(libc::ENOTSUP);
	}

	fn setxattr(
		&mut self,
		_req: &Request,
		_ino: u64,
		_name: &OsStr,
		_value: &[u8],
		_flags: i32,
		_position: u32,
		reply: ReplyEmpty,
	) {
		reply.error(libc::ENOTSUP);
	}

	fn listxattr(&mut self, _req: &Request, _ino: u64, _size: u32, reply: fuser::ReplyXattr) {
		reply.error(libc::ENOTSUP);
	}

	fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
		let device_size = self.engine.device_size();
		let blocks = device_size.div_ceil(PAGE_SIZE);
		reply.statfs(
			blocks, // blocks
			0,      // bfree
			0,      // bavail
			1,      // files
			1,      // ffree
			PAGE_SIZE as u32,
			255, // namelen
			PAGE_SIZE as u32,
		);
	}
}
