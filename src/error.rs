//! Error type for the storage engine.
//!
//! The engine never deals in raw, negated errno integers internally: operations return
//! `Result<_, FsError>` and the conversion to an errno happens only at the dispatcher boundary,
//! where a `fuser` reply is built.

use std::fmt;

/// An error produced by the storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
	/// No inode exists at the given path.
	NotFound,
	/// An inode already exists at the given path.
	Exists,
	/// The operation requires a regular file, but the inode is a directory.
	IsDir,
	/// The operation requires a directory, but the inode is a regular file.
	NotDir,
	/// The given path is too long to be stored (255 bytes max, NUL excluded).
	NameTooLong,
	/// No free block or inode slot is available.
	OutOfSpace,
	/// A block pointer lookup returned an out-of-range index; indicates image corruption.
	Io,
}

impl fmt::Display for FsError {
	fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
		let msg = match self {
			Self::NotFound => "no such file or directory",
			Self::Exists => "file exists",
			Self::IsDir => "is a directory",
			Self::NotDir => "not a directory",
			Self::NameTooLong => "file name too long",
			Self::OutOfSpace => "no space left on device",
			Self::Io => "input/output error",
		};
		write!(fmt, "{msg}")
	}
}

impl std::error::Error for FsError {}

impl From<FsError> for libc::c_int {
	fn from(err: FsError) -> Self {
		match err {
			FsError::NotFound => libc::ENOENT,
			FsError::Exists => libc::EEXIST,
			FsError::IsDir => libc::EISDIR,
			FsError::NotDir => libc::ENOTDIR,
			FsError::NameTooLong => libc::ENAMETOOLONG,
			FsError::OutOfSpace => libc::ENOSPC,
			FsError::Io => libc::EIO,
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn errno_mapping() {
		assert_eq!(libc::c_int::from(FsError::NotFound), libc::ENOENT);
		assert_eq!(libc::c_int::from(FsError::Exists), libc::EEXIST);
		assert_eq!(libc::c_int::from(FsError::IsDir), libc::EISDIR);
		assert_eq!(libc::c_int::from(FsError::NotDir), libc::ENOTDIR);
		assert_eq!(libc::c_int::from(FsError::NameTooLong), libc::ENAMETOOLONG);
		assert_eq!(libc::c_int::from(FsError::OutOfSpace), libc::ENOSPC);
		assert_eq!(libc::c_int::from(FsError::Io), libc::EIO);
	}
}
