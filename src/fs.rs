//! The storage engine: ties the block device, the inode table, and the directory model together
//! into the operations a kernel bridge dispatches (`access`, `getattr`, `readdir`, `mknod`,
//! `mkdir`, `unlink`, `rename`, `read`, `write`).

use crate::blocks::bytes_to_blocks;
use crate::blocks::BlockDevice;
use crate::blocks::BLOCK_SIZE;
use crate::directory::is_direct_child;
use crate::directory::leaf_name;
use crate::error::FsError;
use crate::inode::normalize_path;
use crate::inode::Inode;
use crate::inode::InodeTable;
use std::io;
use std::path::Path;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Stat-like attributes returned by [`Filesystem::getattr`], decoupled from any particular
/// kernel-bridge crate's reply type; the dispatcher converts this into the bridge's own shape.
#[derive(Debug, Clone, Copy)]
pub struct Attr {
	/// POSIX mode bits.
	pub mode: u32,
	/// File size in bytes.
	pub size: u64,
	/// Hard link count: 2 for directories, 1 otherwise (no hard link support).
	pub nlink: u32,
	/// Seconds since the epoch of the last access.
	pub atime: i64,
	/// Seconds since the epoch of the last content modification.
	pub mtime: i64,
	/// Seconds since the epoch of the last metadata change.
	pub ctime: i64,
	/// Number of `B`-byte blocks the file occupies, rounded up (`⌈size/B⌉`).
	pub blocks: u64,
	/// The preferred I/O block size.
	pub blksize: u32,
}

fn current_time() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs() as i64)
		.unwrap_or(0)
}

/// The storage engine instance for one mount.
///
/// Owns the memory-mapped image and the in-memory inode table; both are loaded at [`Filesystem::mount`]
/// and released when the value is dropped (the block device's `Drop` impl unmaps and closes the
/// image).
pub struct Filesystem {
	dev: BlockDevice,
	inodes: InodeTable,
}

impl Filesystem {
	/// Opens the image at `path`, loads the inode table, and ensures the root directory exists.
	pub fn mount(path: &Path) -> io::Result<Self> {
		let mut dev = BlockDevice::open(path)?;
		let mut inodes = InodeTable::load(&mut dev)
			.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

		if inodes.lookup("/").is_none() {
			inodes
				.create(&mut dev, "/", libc::S_IFDIR as u32 | 0o755)
				.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
		}

		Ok(Self { dev, inodes })
	}

	/// Returns the inode at the given live-prefix slot index, if any.
	pub fn inode(&self, idx: usize) -> Option<&Inode> {
		self.inodes.get(idx)
	}

	/// Returns the live-prefix slot index for `path`, if it exists.
	pub fn index_of(&self, path: &str) -> Option<usize> {
		self.inodes.index_of(path)
	}

	/// Checks that an inode exists at `path`. Permissions are never enforced.
	pub fn access(&self, path: &str) -> Result<(), FsError> {
		self.inodes.lookup(path).map(|_| ()).ok_or(FsError::NotFound)
	}

	/// Returns the attributes of the inode at `path`.
	pub fn getattr(&self, path: &str) -> Result<Attr, FsError> {
		let node = self.inodes.lookup(path).ok_or(FsError::NotFound)?;
		Ok(Self::attr_of(node))
	}

	/// Returns the attributes of the inode at slot `idx`.
	pub fn getattr_idx(&self, idx: usize) -> Result<Attr, FsError> {
		let node = self.inodes.get(idx).ok_or(FsError::NotFound)?;
		Ok(Self::attr_of(node))
	}

	fn attr_of(node: &Inode) -> Attr {
		Attr {
			mode: node.mode,
			size: node.size as u64,
			nlink: if node.is_dir() { 2 } else { 1 },
			atime: node.atime,
			mtime: node.mtime,
			ctime: node.ctime,
			blocks: bytes_to_blocks(node.size as usize) as u64,
			blksize: BLOCK_SIZE as u32,
		}
	}

	/// Lists the direct children of directory `path`, returning each child's leaf name and slot
	/// index (the caller is expected to prepend `.` and `..` itself, since those carry no inode).
	pub fn readdir(&self, path: &str) -> Result<Vec<(String, usize)>, FsError> {
		let path = normalize_path(path);
		let dir = self.inodes.lookup(path).ok_or(FsError::NotFound)?;
		if !dir.is_dir() {
			return Err(FsError::NotDir);
		}

		let entries = self
			.inodes
			.iter()
			.filter(|(_, node)| is_direct_child(path, node.path()))
			.map(|(idx, node)| (leaf_name(node.path()).to_owned(), idx))
			.collect();
		Ok(entries)
	}

	/// Creates a regular file at `path`. `mode` is ORed with the regular-file type bit if the
	/// caller didn't set a file-type bit.
	pub fn mknod(&mut self, path: &str, mode: u32) -> Result<usize, FsError> {
		if self.inodes.lookup(path).is_some() {
			return Err(FsError::Exists);
		}
		let mode = if mode & libc::S_IFMT as u32 == 0 {
			mode | libc::S_IFREG as u32
		} else {
			mode
		};
		self.inodes.create(&mut self.dev, path, mode)
	}

	/// Creates a directory at `path`.
	pub fn mkdir(&mut self, path: &str, mode: u32) -> Result<usize, FsError> {
		if self.inodes.lookup(path).is_some() {
			return Err(FsError::Exists);
		}
		self.inodes.create(&mut self.dev, path, mode | libc::S_IFDIR as u32)
	}

	/// Removes the regular file at `path`.
	pub fn unlink(&mut self, path: &str) -> Result<(), FsError> {
		let idx = self.inodes.index_of(path).ok_or(FsError::NotFound)?;
		self.inodes.unlink(&mut self.dev, idx)
	}

	/// Renames `from` to `to`.
	pub fn rename(&mut self, from: &str, to: &str) -> Result<(), FsError> {
		self.inodes.rename(&mut self.dev, from, to)
	}

	/// Writes `buf` to the file at `path` starting at byte `offset`, allocating blocks on demand.
	///
	/// Returns the number of bytes written. A short write (less than `buf.len()`) is returned,
	/// not an error, whenever at least one byte was written before an allocation failure.
	pub fn write(&mut self, path: &str, buf: &[u8], offset: u64) -> Result<u32, FsError> {
		let idx = self.inodes.index_of(path).ok_or(FsError::NotFound)?;
		{
			let node = self.inodes.get(idx).ok_or(FsError::NotFound)?;
			if !node.is_regular() {
				return Err(FsError::IsDir);
			}
		}

		let offset = offset as usize;
		let mut written = 0usize;
		while written < buf.len() {
			let block_index = (offset + written) / BLOCK_SIZE;
			let block_offset = (offset + written) % BLOCK_SIZE;
			let chunk = (BLOCK_SIZE - block_offset).min(buf.len() - written);

			let block_count = self.inodes.get(idx).ok_or(FsError::NotFound)?.block_count as usize;
			let block_num = if block_index >= block_count {
				match self.inodes.add_block(&mut self.dev, idx) {
					Ok(b) => b,
					Err(e) => {
						return if written > 0 {
							Ok(written as u32)
						} else {
							Err(e)
						};
					}
				}
			} else {
				self.inodes.get(idx).ok_or(FsError::NotFound)?.blocks[block_index] as usize
			};

			let block = self.dev.block_ptr_mut(block_num)?;
			block[block_offset..block_offset + chunk]
				.copy_from_slice(&buf[written..written + chunk]);
			written += chunk;
		}

		let node = self.inodes.get_mut(idx).ok_or(FsError::NotFound)?;
		let end = (offset + written) as u32;
		if end > node.size {
			node.size = end;
		}
		let now = current_time();
		node.mtime = now;
		node.ctime = now;
		self.inodes.save(&mut self.dev)?;

		Ok(written as u32)
	}

	/// Reads up to `buf.len()` bytes from the file at `path` starting at byte `offset`.
	///
	/// Returns the number of bytes actually read (0 past end-of-file).
	pub fn read(&mut self, path: &str, buf: &mut [u8], offset: u64) -> Result<u32, FsError> {
		let idx = self.inodes.index_of(path).ok_or(FsError::NotFound)?;
		let node = self.inodes.get(idx).ok_or(FsError::NotFound)?;
		if !node.is_regular() {
			return Err(FsError::IsDir);
		}

		let offset = offset as usize;
		let file_size = node.size as usize;
		if offset >= file_size {
			return Ok(0);
		}
		let size = buf.len().min(file_size - offset);
		let block_count = node.block_count as usize;

		let mut read = 0usize;
		while read < size {
			let block_index = (offset + read) / BLOCK_SIZE;
			let block_offset = (offset + read) % BLOCK_SIZE;
			let chunk = (BLOCK_SIZE - block_offset).min(size - read);

			if block_index >= block_count {
				break;
			}

			let block_num = self.inodes.get(idx).ok_or(FsError::NotFound)?.blocks[block_index] as usize;
			let block = self.dev.block_ptr(block_num)?;
			buf[read..read + chunk].copy_from_slice(&block[block_offset..block_offset + chunk]);
			read += chunk;
		}

		let node = self.inodes.get_mut(idx).ok_or(FsError::NotFound)?;
		node.atime = current_time();
		self.inodes.save(&mut self.dev)?;

		Ok(read as u32)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use tempfile::NamedTempFile;

	fn mounted() -> (NamedTempFile, Filesystem) {
		let tmp = NamedTempFile::new().unwrap();
		let fs = Filesystem::mount(tmp.path()).unwrap();
		(tmp, fs)
	}

	#[test]
	fn fresh_mount_has_root_directory() {
		let (_tmp, fs) = mounted();
		let attr = fs.getattr("/").unwrap();
		assert!(attr.mode & libc::S_IFDIR as u32 != 0);
		assert_eq!(attr.mode & 0o777, 0o755);

		let entries = fs.readdir("/").unwrap();
		assert!(entries.is_empty());
	}

	#[test]
	fn mknod_write_read_round_trip() {
		let (_tmp, mut fs) = mounted();
		fs.mknod("/a.txt", libc::S_IFREG as u32 | 0o644).unwrap();
		assert_eq!(fs.getattr("/a.txt").unwrap().size, 0);

		let n = fs.write("/a.txt", b"hello", 0).unwrap();
		assert_eq!(n, 5);

		let mut buf = [0u8; 5];
		let n = fs.read("/a.txt", &mut buf, 0).unwrap();
		assert_eq!(n, 5);
		assert_eq!(&buf, b"hello");
	}

	#[test]
	fn large_write_spans_two_blocks() {
		let (_tmp, mut fs) = mounted();
		fs.mknod("/big", libc::S_IFREG as u32 | 0o644).unwrap();
		let data = vec![0x41u8; 8192];
		let n = fs.write("/big", &data, 0).unwrap();
		assert_eq!(n, 8192);

		let idx = fs.index_of("/big").unwrap();
		assert_eq!(fs.inode(idx).unwrap().block_count, 2);
		assert_eq!(fs.getattr("/big").unwrap().size, 8192);
	}

	#[test]
	fn rename_updates_namespace() {
		let (_tmp, mut fs) = mounted();
		fs.mknod("/a.txt", libc::S_IFREG as u32 | 0o644).unwrap();
		fs.rename("/a.txt", "/b.txt").unwrap();
		assert_eq!(fs.getattr("/a.txt"), Err(FsError::NotFound));
		assert!(fs.getattr("/b.txt").is_ok());

		let entries = fs.readdir("/").unwrap();
		assert!(entries.iter().any(|(name, _)| name == "b.txt"));
		assert!(!entries.iter().any(|(name, _)| name == "a.txt"));
	}

	#[test]
	fn unlink_clears_bitmap_bits_and_shrinks_table() {
		let (_tmp, mut fs) = mounted();
		fs.mknod("/big", libc::S_IFREG as u32 | 0o644).unwrap();
		let data = vec![0x41u8; 8192];
		fs.write("/big", &data, 0).unwrap();

		let idx = fs.index_of("/big").unwrap();
		let blocks: Vec<u32> = fs.inode(idx).unwrap().blocks[..2].to_vec();

		fs.unlink("/big").unwrap();
		assert_eq!(fs.getattr("/big"), Err(FsError::NotFound));
		for b in blocks {
			assert_eq!(crate::bitmap::get(fs_bitmap(&mut fs), b as usize), 0);
		}
	}

	fn fs_bitmap(fs: &mut Filesystem) -> &mut [u8] {
		fs.dev.data_bitmap_mut()
	}

	#[test]
	fn mkdir_and_nested_readdir() {
		let (_tmp, mut fs) = mounted();
		fs.mkdir("/d", 0o755).unwrap();
		fs.mknod("/d/x", libc::S_IFREG as u32 | 0o644).unwrap();

		let root_entries = fs.readdir("/").unwrap();
		assert_eq!(root_entries.len(), 1);
		assert_eq!(root_entries[0].0, "d");

		let dir_entries = fs.readdir("/d").unwrap();
		assert_eq!(dir_entries.len(), 1);
		assert_eq!(dir_entries[0].0, "x");
	}

	#[test]
	fn write_past_eof_extends_with_zero_fill() {
		let (_tmp, mut fs) = mounted();
		fs.mknod("/a.txt", libc::S_IFREG as u32 | 0o644).unwrap();
		fs.write("/a.txt", b"hi", 0).unwrap();
		fs.write("/a.txt", b"!", 4).unwrap();

		let mut buf = [0u8; 5];
		let n = fs.read("/a.txt", &mut buf, 0).unwrap();
		assert_eq!(n, 5);
		assert_eq!(&buf, b"hi\0\0!");
	}

	#[test]
	fn read_past_eof_returns_zero() {
		let (_tmp, mut fs) = mounted();
		fs.mknod("/a.txt", libc::S_IFREG as u32 | 0o644).unwrap();
		fs.write("/a.txt", b"hi", 0).unwrap();
		let mut buf = [0u8; 8];
		assert_eq!(fs.read("/a.txt", &mut buf, 100).unwrap(), 0);
	}

	#[test]
	fn mkdir_rejects_existing_path() {
		let (_tmp, mut fs) = mounted();
		fs.mkdir("/d", 0o755).unwrap();
		assert_eq!(fs.mkdir("/d", 0o755), Err(FsError::Exists));
	}

	#[test]
	fn write_to_directory_is_rejected() {
		let (_tmp, mut fs) = mounted();
		fs.mkdir("/d", 0o755).unwrap();
		assert_eq!(fs.write("/d", b"x", 0), Err(FsError::IsDir));
	}

	#[test]
	fn mount_is_idempotent() {
		let tmp = NamedTempFile::new().unwrap();
		let path = tmp.path().to_path_buf();
		{
			let mut fs = Filesystem::mount(&path).unwrap();
			fs.mknod("/a.txt", libc::S_IFREG as u32 | 0o644).unwrap();
			fs.write("/a.txt", b"persisted", 0).unwrap();
		}
		{
			let mut fs = Filesystem::mount(&path).unwrap();
			let mut buf = [0u8; 9];
			let n = fs.read("/a.txt", &mut buf, 0).unwrap();
			assert_eq!(n, 9);
			assert_eq!(&buf, b"persisted");
		}
	}
}
