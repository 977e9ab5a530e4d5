use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::VfsError;

use super::{OpenMode, Stat, VfsBackend, VfsHandle, Whence};

/// An in-memory VFS backend for tests: objects are `Vec<u8>`s keyed by URI
/// in a single shared map. A write handle publishes its buffer back to the
/// map on `close`, matching an object store's write-then-visible-on-close
/// semantics rather than a local file's incremental visibility.
#[derive(Default)]
pub struct InMemoryVfs {
	objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemoryVfs {
	pub fn new() -> Self {
		Self::default()
	}
}

impl VfsBackend for InMemoryVfs {
	fn open(&self, uri: &str, mode: OpenMode) -> Result<Box<dyn VfsHandle>, VfsError> {
		match mode {
			OpenMode::Read => {
				let objects = self.objects.lock();
				let data = objects
					.get(uri)
					.cloned()
					.ok_or_else(|| VfsError::NotFound(uri.to_string()))?;
				Ok(Box::new(MemoryHandle {
					uri: uri.to_string(),
					objects: self.objects.clone(),
					data,
					pos: 0,
					writable: false,
				}))
			}
			OpenMode::Write => Ok(Box::new(MemoryHandle {
				uri: uri.to_string(),
				objects: self.objects.clone(),
				data: Vec::new(),
				pos: 0,
				writable: true,
			})),
		}
	}

	fn stat(&self, uri: &str) -> Result<Stat, VfsError> {
		Ok(Stat {
			exists: self.objects.lock().contains_key(uri),
		})
	}
}

struct MemoryHandle {
	uri: String,
	objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
	data: Vec<u8>,
	pos: usize,
	writable: bool,
}

impl VfsHandle for MemoryHandle {
	fn read(&mut self, buf: &mut [u8]) -> Result<usize, VfsError> {
		let remaining = self.data.len().saturating_sub(self.pos);
		let n = remaining.min(buf.len());
		buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
		self.pos += n;
		Ok(n)
	}

	fn write(&mut self, buf: &[u8]) -> Result<usize, VfsError> {
		if !self.writable {
			return Err(VfsError::Permission(self.uri.clone()));
		}
		let end = self.pos + buf.len();
		if self.data.len() < end {
			self.data.resize(end, 0);
		}
		self.data[self.pos..end].copy_from_slice(buf);
		self.pos = end;
		Ok(buf.len())
	}

	fn seek(&mut self, offset: u64, whence: Whence) -> Result<u64, VfsError> {
		let base = match whence {
			Whence::Start => 0,
			Whence::Current => self.pos as i64,
			Whence::End => self.data.len() as i64,
		};
		let new_pos = base + offset as i64;
		if new_pos < 0 {
			return Err(VfsError::Unseekable);
		}
		self.pos = new_pos as usize;
		Ok(self.pos as u64)
	}

	fn flush(&mut self) -> Result<(), VfsError> {
		if self.writable {
			self.objects.lock().insert(self.uri.clone(), self.data.clone());
		}
		Ok(())
	}

	fn close(self: Box<Self>) -> Result<(), VfsError> {
		if self.writable {
			self.objects.lock().insert(self.uri, self.data);
		}
		Ok(())
	}
}
