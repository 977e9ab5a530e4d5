//! Error taxonomy shared by the VFS adapter, the storage engine and the mount shim.
//!
//! Each layer gets its own `thiserror` enum; conversions compose upward so a
//! remote-store failure surfaces through the engine without the engine
//! needing to know which backend produced it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VfsError {
	#[error("object not found: {0}")]
	NotFound(String),

	#[error("permission denied: {0}")]
	Permission(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error("backend does not support seeking after a write")]
	Unseekable,
}

#[derive(Debug, Error)]
pub enum EngineError {
	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Vfs(#[from] VfsError),

	#[error("invariant violated: {0}")]
	Invariant(String),
}

impl EngineError {
	/// Maps a recoverable engine failure to the errno the mount shim reports.
	/// `Absent` never reaches here: it is resolved to fill bytes before an
	/// error would otherwise be raised.
	pub fn to_errno(&self) -> libc::c_int {
		match self {
			EngineError::Io(_) => libc::EIO,
			EngineError::Vfs(VfsError::Io(_)) => libc::EIO,
			EngineError::Vfs(VfsError::Unseekable) => libc::EIO,
			EngineError::Vfs(VfsError::NotFound(_)) => libc::EIO,
			EngineError::Vfs(VfsError::Permission(_)) => libc::EPERM,
			EngineError::Invariant(_) => libc::EIO,
		}
	}
}

#[derive(Debug, Error)]
pub enum MountError {
	#[error(transparent)]
	Engine(#[from] EngineError),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error("invalid configuration: {0}")]
	Config(String),
}
