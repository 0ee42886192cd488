//! Represents metadata and block mapping for files and directories, and the in-memory inode
//! table mirrored to the dedicated inode region of the disk image.

use crate::blocks::BlockDevice;
use crate::blocks::FIRST_INODE_BLOCK;
use crate::blocks::INODE_META_BLOCK;
use crate::blocks::LAST_INODE_BLOCK;
use crate::error::FsError;
use std::mem::size_of;
use std::slice;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Maximum number of inodes/files supported.
pub const MAX_FILES: usize = 128;
/// Maximum number of data blocks per file.
pub const MAX_BLOCKS_PER_FILE: usize = 128;
/// Maximum length of a stored path, NUL excluded.
pub const MAX_PATH_LEN: usize = 255;

/// Number of inode records packed per inode block.
pub const fn inodes_per_block(block_size: usize) -> usize {
	block_size / size_of::<Inode>()
}

/// Returns the current time as seconds since the Unix epoch.
fn current_time() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs() as i64)
		.unwrap_or(0)
}

/// Normalizes a path by trimming trailing slashes, except for the root which stays `/`.
pub fn normalize_path(path: &str) -> &str {
	let trimmed = path.trim_end_matches('/');
	if trimmed.is_empty() {
		"/"
	} else {
		trimmed
	}
}

/// Fixed-layout on-disk (and in-memory) inode record describing one file or directory.
///
/// Byte-identical in memory and on disk: no enums, no padding beyond what natural field
/// alignment requires, so the disk mirror in [`InodeTable::save`]/[`InodeTable::load`] is a
/// byte-exact copy in both directions.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Inode {
	/// Absolute path from the filesystem root, NUL-terminated, NUL-padded.
	path: [u8; 256],
	/// Byte length of the file's content (0 for directories).
	pub size: u32,
	/// Indices of the live data blocks, in order, starting at index 0.
	pub blocks: [u32; MAX_BLOCKS_PER_FILE],
	/// Number of live entries in `blocks`.
	pub block_count: u32,
	/// POSIX mode bits (file-type bits and permission bits).
	pub mode: u32,
	/// Seconds since the epoch of the last access.
	pub atime: i64,
	/// Seconds since the epoch of the last content modification.
	pub mtime: i64,
	/// Seconds since the epoch of the last metadata change.
	pub ctime: i64,
}

impl Inode {
	/// Returns a zeroed inode, representing an empty (unused) table slot.
	const fn zeroed() -> Self {
		Self {
			path: [0; 256],
			size: 0,
			blocks: [0; MAX_BLOCKS_PER_FILE],
			block_count: 0,
			mode: 0,
			atime: 0,
			mtime: 0,
			ctime: 0,
		}
	}

	/// Returns the stored path as a `&str`.
	///
	/// The buffer always holds valid UTF-8 written by [`Self::set_path`]; a decoding failure
	/// indicates image corruption and falls back to an empty string rather than panicking.
	pub fn path(&self) -> &str {
		let end = self.path.iter().position(|&b| b == 0).unwrap_or(self.path.len());
		std::str::from_utf8(&self.path[..end]).unwrap_or("")
	}

	/// Overwrites the stored path. The caller must have already checked the path's length.
	fn set_path(&mut self, path: &str) {
		self.path = [0; 256];
		let bytes = path.as_bytes();
		let len = bytes.len().min(MAX_PATH_LEN);
		self.path[..len].copy_from_slice(&bytes[..len]);
	}

	/// Tells whether this slot is in use.
	fn is_live(&self) -> bool {
		self.path[0] != 0
	}

	/// Tells whether this inode is a directory.
	pub fn is_dir(&self) -> bool {
		(self.mode & libc::S_IFMT as u32) == libc::S_IFDIR as u32
	}

	/// Tells whether this inode is a regular file.
	pub fn is_regular(&self) -> bool {
		(self.mode & libc::S_IFMT as u32) == libc::S_IFREG as u32
	}
}

/// The in-memory inode table: a fixed-capacity array of [`Inode`] records with a live prefix of
/// length `inode_count`, mirrored to blocks `FIRST_INODE_BLOCK..=LAST_INODE_BLOCK` of the image.
pub struct InodeTable {
	inodes: Box<[Inode; MAX_FILES]>,
	inode_count: usize,
}

impl InodeTable {
	/// Returns an empty table (no saves performed).
	fn empty() -> Self {
		Self {
			inodes: Box::new([Inode::zeroed(); MAX_FILES]),
			inode_count: 0,
		}
	}

	/// Loads the inode table from the image: reads the live count from the meta block, then that
	/// many records from the inode blocks. The count on disk is authoritative.
	pub fn load(dev: &mut BlockDevice) -> Result<Self, FsError> {
		let mut table = Self::empty();

		let meta = dev.block_ptr(INODE_META_BLOCK)?;
		let count = u32::from_ne_bytes(meta[0..4].try_into().unwrap()) as usize;
		table.inode_count = count.min(MAX_FILES);

		let per_block = inodes_per_block(crate::blocks::BLOCK_SIZE);
		let mut read = 0;
		let mut block_num = FIRST_INODE_BLOCK;
		while read < table.inode_count && block_num <= LAST_INODE_BLOCK {
			let chunk = (table.inode_count - read).min(per_block);
			let block = dev.block_ptr(block_num)?;
			let src = unsafe {
				slice::from_raw_parts(block.as_ptr() as *const Inode, chunk)
			};
			table.inodes[read..read + chunk].copy_from_slice(src);
			read += chunk;
			block_num += 1;
		}

		Ok(table)
	}

	/// Writes the live inode table back to the image and issues a synchronous flush.
	pub fn save(&self, dev: &mut BlockDevice) -> Result<(), FsError> {
		{
			let meta = dev.block_ptr_mut(INODE_META_BLOCK)?;
			meta[0..4].copy_from_slice(&(self.inode_count as u32).to_ne_bytes());
		}

		let per_block = inodes_per_block(crate::blocks::BLOCK_SIZE);
		let mut written = 0;
		let mut block_num = FIRST_INODE_BLOCK;
		while written < self.inode_count && block_num <= LAST_INODE_BLOCK {
			let chunk = (self.inode_count - written).min(per_block);
			let block = dev.block_ptr_mut(block_num)?;
			let dst = unsafe {
				slice::from_raw_parts_mut(block.as_mut_ptr() as *mut Inode, chunk)
			};
			dst.copy_from_slice(&self.inodes[written..written + chunk]);
			written += chunk;
			block_num += 1;
		}

		dev.flush();
		Ok(())
	}

	/// Returns the number of live inodes.
	pub fn len(&self) -> usize {
		self.inode_count
	}

	/// Returns the live inodes as slots indexed `0..len()`.
	pub fn iter(&self) -> impl Iterator<Item = (usize, &Inode)> {
		self.inodes[..self.inode_count].iter().enumerate()
	}

	/// Looks up an inode by path, returning its slot index.
	pub fn index_of(&self, path: &str) -> Option<usize> {
		let path = normalize_path(path);
		self.inodes[..self.inode_count]
			.iter()
			.position(|n| n.path() == path)
	}

	/// Returns the inode at `idx`, if live.
	pub fn get(&self, idx: usize) -> Option<&Inode> {
		if idx < self.inode_count {
			Some(&self.inodes[idx])
		} else {
			None
		}
	}

	/// Returns a mutable reference to the inode at `idx`, if live.
	pub fn get_mut(&mut self, idx: usize) -> Option<&mut Inode> {
		if idx < self.inode_count {
			Some(&mut self.inodes[idx])
		} else {
			None
		}
	}

	/// Looks up an inode by path.
	pub fn lookup(&self, path: &str) -> Option<&Inode> {
		self.index_of(path).map(|i| &self.inodes[i])
	}

	/// Creates a new inode at `path` with the given mode and appends it to the live prefix.
	///
	/// Fails with [`FsError::OutOfSpace`] if the table is full, or [`FsError::NameTooLong`] if
	/// the normalized path is 255 bytes or longer.
	pub fn create(&mut self, dev: &mut BlockDevice, path: &str, mode: u32) -> Result<usize, FsError> {
		let path = normalize_path(path);
		if path.len() > MAX_PATH_LEN {
			return Err(FsError::NameTooLong);
		}
		if self.inode_count >= MAX_FILES {
			return Err(FsError::OutOfSpace);
		}

		let idx = self.inode_count;
		let node = &mut self.inodes[idx];
		*node = Inode::zeroed();
		node.set_path(path);
		node.mode = mode;
		let now = current_time();
		node.atime = now;
		node.mtime = now;
		node.ctime = now;
		self.inode_count += 1;

		self.save(dev)?;
		Ok(idx)
	}

	/// Allocates a new block and appends it to the inode's block list.
	///
	/// Fails with [`FsError::OutOfSpace`] if the inode already holds `MAX_BLOCKS_PER_FILE` blocks
	/// or if no free block is available.
	pub fn add_block(&mut self, dev: &mut BlockDevice, idx: usize) -> Result<usize, FsError> {
		{
			let node = self.get(idx).ok_or(FsError::NotFound)?;
			if node.block_count as usize >= MAX_BLOCKS_PER_FILE {
				return Err(FsError::OutOfSpace);
			}
		}

		let block = dev.alloc_block()?;

		let node = self.get_mut(idx).ok_or(FsError::NotFound)?;
		node.blocks[node.block_count as usize] = block as u32;
		node.block_count += 1;

		self.save(dev)?;
		Ok(block)
	}

	/// Renames the inode at path `from` to `to`.
	///
	/// Directory renames are rejected with [`FsError::IsDir`] (see design notes: rewriting every
	/// descendant's stored path is not attempted, and an orphaning rename is worse than a
	/// rejected one).
	pub fn rename(&mut self, dev: &mut BlockDevice, from: &str, to: &str) -> Result<(), FsError> {
		let to = normalize_path(to);
		if to.len() > MAX_PATH_LEN {
			return Err(FsError::NameTooLong);
		}

		let idx = self.index_of(from).ok_or(FsError::NotFound)?;
		if self.inodes[idx].is_dir() {
			return Err(FsError::IsDir);
		}
		if self.index_of(to).is_some() {
			return Err(FsError::Exists);
		}

		let node = &mut self.inodes[idx];
		node.set_path(to);
		let now = current_time();
		node.mtime = now;
		node.ctime = now;

		self.save(dev)
	}

	/// Removes the inode at `idx`, freeing its data blocks and shifting successors left to keep
	/// the live prefix contiguous.
	///
	/// Fails with [`FsError::IsDir`] for directory inodes.
	pub fn unlink(&mut self, dev: &mut BlockDevice, idx: usize) -> Result<(), FsError> {
		let node = self.get(idx).ok_or(FsError::NotFound)?;
		if node.is_dir() {
			return Err(FsError::IsDir);
		}

		let block_count = node.block_count as usize;
		for i in 0..block_count {
			let b = self.inodes[idx].blocks[i] as usize;
			dev.free_block(b);
		}

		for i in idx..self.inode_count - 1 {
			self.inodes[i] = self.inodes[i + 1];
		}
		self.inodes[self.inode_count - 1] = Inode::zeroed();
		self.inode_count -= 1;

		self.save(dev)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use tempfile::NamedTempFile;

	fn fresh_table() -> (BlockDevice, InodeTable) {
		let tmp = NamedTempFile::new().unwrap();
		let mut dev = BlockDevice::open(tmp.path()).unwrap();
		let table = InodeTable::load(&mut dev).unwrap();
		(dev, table)
	}

	#[test]
	fn normalize_trims_trailing_slashes_but_keeps_root() {
		assert_eq!(normalize_path("/"), "/");
		assert_eq!(normalize_path("/a/"), "/a");
		assert_eq!(normalize_path("/a//"), "/a/");
		assert_eq!(normalize_path("/a"), "/a");
	}

	#[test]
	fn create_then_lookup() {
		let (mut dev, mut table) = fresh_table();
		let idx = table.create(&mut dev, "/a.txt", libc::S_IFREG as u32 | 0o644).unwrap();
		assert_eq!(table.len(), 1);
		assert_eq!(table.get(idx).unwrap().path(), "/a.txt");
		assert!(table.lookup("/a.txt").is_some());
		assert!(table.lookup("/missing").is_none());
	}

	#[test]
	fn table_full_reports_out_of_space() {
		let (mut dev, mut table) = fresh_table();
		for i in 0..MAX_FILES {
			let path = format!("/f{i}");
			table.create(&mut dev, &path, libc::S_IFREG as u32 | 0o644).unwrap();
		}
		assert_eq!(
			table.create(&mut dev, "/overflow", libc::S_IFREG as u32),
			Err(FsError::OutOfSpace)
		);
	}

	#[test]
	fn name_too_long_is_rejected() {
		let (mut dev, mut table) = fresh_table();
		let long = format!("/{}", "a".repeat(300));
		assert_eq!(
			table.create(&mut dev, &long, libc::S_IFREG as u32),
			Err(FsError::NameTooLong)
		);
	}

	#[test]
	fn add_block_up_to_limit() {
		let (mut dev, mut table) = fresh_table();
		let idx = table.create(&mut dev, "/big", libc::S_IFREG as u32).unwrap();
		for _ in 0..MAX_BLOCKS_PER_FILE {
			table.add_block(&mut dev, idx).unwrap();
		}
		assert_eq!(table.add_block(&mut dev, idx), Err(FsError::OutOfSpace));
	}

	#[test]
	fn rename_rejects_existing_target() {
		let (mut dev, mut table) = fresh_table();
		table.create(&mut dev, "/a.txt", libc::S_IFREG as u32).unwrap();
		table.create(&mut dev, "/b.txt", libc::S_IFREG as u32).unwrap();
		assert_eq!(
			table.rename(&mut dev, "/a.txt", "/b.txt"),
			Err(FsError::Exists)
		);
		assert!(table.lookup("/a.txt").is_some());
		assert!(table.lookup("/b.txt").is_some());
	}

	#[test]
	fn rename_moves_path() {
		let (mut dev, mut table) = fresh_table();
		table.create(&mut dev, "/a.txt", libc::S_IFREG as u32).unwrap();
		table.rename(&mut dev, "/a.txt", "/b.txt").unwrap();
		assert!(table.lookup("/a.txt").is_none());
		assert!(table.lookup("/b.txt").is_some());
	}

	#[test]
	fn rename_directory_is_rejected() {
		let (mut dev, mut table) = fresh_table();
		table.create(&mut dev, "/d", libc::S_IFDIR as u32 | 0o755).unwrap();
		assert_eq!(table.rename(&mut dev, "/d", "/e"), Err(FsError::IsDir));
	}

	#[test]
	fn unlink_frees_blocks_and_removes_slot() {
		let (mut dev, mut table) = fresh_table();
		let idx = table.create(&mut dev, "/big", libc::S_IFREG as u32).unwrap();
		let b0 = table.add_block(&mut dev, idx).unwrap();
		let b1 = table.add_block(&mut dev, idx).unwrap();

		table.unlink(&mut dev, idx).unwrap();

		assert_eq!(table.len(), 0);
		assert_eq!(bitmap_bit(&mut dev, b0), 0);
		assert_eq!(bitmap_bit(&mut dev, b1), 0);
	}

	#[test]
	fn unlink_directory_is_rejected() {
		let (mut dev, mut table) = fresh_table();
		let idx = table.create(&mut dev, "/d", libc::S_IFDIR as u32 | 0o755).unwrap();
		assert_eq!(table.unlink(&mut dev, idx), Err(FsError::IsDir));
	}

	fn bitmap_bit(dev: &mut BlockDevice, b: usize) -> u8 {
		crate::bitmap::get(dev.data_bitmap_mut(), b)
	}

	#[test]
	fn load_after_save_round_trips() {
		let tmp = NamedTempFile::new().unwrap();
		let path = tmp.path().to_path_buf();
		{
			let mut dev = BlockDevice::open(&path).unwrap();
			let mut table = InodeTable::load(&mut dev).unwrap();
			table.create(&mut dev, "/a.txt", libc::S_IFREG as u32 | 0o644).unwrap();
			table.create(&mut dev, "/d", libc::S_IFDIR as u32 | 0o755).unwrap();
		}
		{
			let mut dev = BlockDevice::open(&path).unwrap();
			let table = InodeTable::load(&mut dev).unwrap();
			assert_eq!(table.len(), 2);
			assert!(table.lookup("/a.txt").is_some());
			assert!(table.lookup("/d").unwrap().is_dir());
		}
	}
}
