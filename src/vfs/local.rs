use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::VfsError;

use super::{OpenMode, Stat, VfsBackend, VfsHandle, Whence};

/// A VFS backend rooted at a directory on the local filesystem. URIs are
/// plain paths, joined onto `root` if relative.
pub struct LocalDiskVfs {
	root: PathBuf,
}

impl LocalDiskVfs {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	fn resolve(&self, uri: &str) -> PathBuf {
		let path = Path::new(uri);
		if path.is_absolute() {
			path.to_path_buf()
		} else {
			self.root.join(path)
		}
	}
}

impl VfsBackend for LocalDiskVfs {
	fn open(&self, uri: &str, mode: OpenMode) -> Result<Box<dyn VfsHandle>, VfsError> {
		let path = self.resolve(uri);
		let file = match mode {
			OpenMode::Read => File::open(&path).map_err(|e| {
				if e.kind() == std::io::ErrorKind::NotFound {
					VfsError::NotFound(uri.to_string())
				} else {
					VfsError::Io(e)
				}
			})?,
			OpenMode::Write => {
				if let Some(parent) = path.parent() {
					fs::create_dir_all(parent)?;
				}
				OpenOptions::new()
					.create(true)
					.write(true)
					.truncate(true)
					.open(&path)?
			}
		};
		Ok(Box::new(LocalHandle { file }))
	}

	fn stat(&self, uri: &str) -> Result<Stat, VfsError> {
		Ok(Stat {
			exists: self.resolve(uri).exists(),
		})
	}
}

struct LocalHandle {
	file: File,
}

impl VfsHandle for LocalHandle {
	fn read(&mut self, buf: &mut [u8]) -> Result<usize, VfsError> {
		Ok(self.file.read(buf)?)
	}

	fn write(&mut self, buf: &[u8]) -> Result<usize, VfsError> {
		Ok(self.file.write(buf)?)
	}

	fn seek(&mut self, offset: u64, whence: Whence) -> Result<u64, VfsError> {
		let pos = match whence {
			Whence::Start => SeekFrom::Start(offset),
			Whence::Current => SeekFrom::Current(offset as i64),
			Whence::End => SeekFrom::End(offset as i64),
		};
		Ok(self.file.seek(pos)?)
	}

	fn flush(&mut self) -> Result<(), VfsError> {
		Ok(self.file.flush()?)
	}

	fn close(self: Box<Self>) -> Result<(), VfsError> {
		Ok(())
	}
}
