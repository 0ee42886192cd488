//! This module manages a disk image by providing functions for block allocation, deallocation,
//! and access. It implements a block-based storage system backed by a fixed-size file, memory
//! mapped for the lifetime of the mount.

use crate::bitmap;
use crate::error::FsError;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::ptr;
use std::slice;

/// The number of blocks in the image.
pub const BLOCK_COUNT: usize = 256;
/// The size of a block in bytes.
pub const BLOCK_SIZE: usize = 4096;
/// The total size of the image in bytes.
pub const IMAGE_SIZE: u64 = (BLOCK_COUNT * BLOCK_SIZE) as u64;

/// The size in bytes of each of the two bitmaps packed into block 0.
pub const BITMAP_BYTES: usize = BLOCK_COUNT.div_ceil(8);

/// The block storing the live inode count.
pub const INODE_META_BLOCK: usize = 1;
/// The first block holding packed inode records.
pub const FIRST_INODE_BLOCK: usize = 2;
/// The last block holding packed inode records.
pub const LAST_INODE_BLOCK: usize = 27;
/// The first block available for file data; nothing below this index is ever handed out by
/// `alloc_block`.
pub const FIRST_DATA_BLOCK: usize = 28;

/// Computes the number of blocks needed to store the given number of bytes.
pub fn bytes_to_blocks(bytes: usize) -> usize {
	bytes.div_ceil(BLOCK_SIZE)
}

/// A fixed-size disk image, memory-mapped read/write for the lifetime of the mount.
///
/// Block 0 holds the data-block bitmap followed by the (reserved, unused) inode bitmap. Blocks
/// `[FIRST_INODE_BLOCK, LAST_INODE_BLOCK]` hold the packed inode table. Everything from
/// `FIRST_DATA_BLOCK` onward is handed out by the allocator.
pub struct BlockDevice {
	/// The open image file. Kept alive so the mapping stays valid and so the descriptor closes
	/// automatically on drop.
	file: File,
	/// Base address of the memory mapping.
	base: *mut u8,
}

impl BlockDevice {
	/// Opens (creating if necessary) the image at `path` and maps it into memory.
	///
	/// If the file did not already exist, block 0's bit for itself is set in the data-block
	/// bitmap, since block 0 is never a free data block.
	pub fn open(path: &Path) -> io::Result<Self> {
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.open(path)?;

		let prev_len = file.metadata()?.len();
		if prev_len != IMAGE_SIZE {
			file.set_len(IMAGE_SIZE)?;
		}
		let fresh = prev_len == 0;

		let base = unsafe {
			libc::mmap(
				ptr::null_mut(),
				IMAGE_SIZE as usize,
				libc::PROT_READ | libc::PROT_WRITE,
				libc::MAP_SHARED,
				file.as_raw_fd(),
				0,
			)
		};
		if base == libc::MAP_FAILED {
			return Err(io::Error::last_os_error());
		}

		let mut dev = Self {
			file,
			base: base as *mut u8,
		};
		if fresh {
			bitmap::put(dev.data_bitmap_mut(), 0, 1);
		}
		Ok(dev)
	}

	/// Returns the data-block allocation bitmap.
	pub fn data_bitmap_mut(&mut self) -> &mut [u8] {
		unsafe { slice::from_raw_parts_mut(self.base, BITMAP_BYTES) }
	}

	/// Returns the reserved inode bitmap (see design notes; not consulted by the allocator).
	pub fn inode_bitmap_mut(&mut self) -> &mut [u8] {
		unsafe { slice::from_raw_parts_mut(self.base.add(BITMAP_BYTES), BITMAP_BYTES) }
	}

	/// Returns a read-only view of block `b`.
	pub fn block_ptr(&self, b: usize) -> Result<&[u8], FsError> {
		if b >= BLOCK_COUNT {
			return Err(FsError::Io);
		}
		Ok(unsafe { slice::from_raw_parts(self.base.add(b * BLOCK_SIZE), BLOCK_SIZE) })
	}

	/// Returns a mutable view of block `b`.
	pub fn block_ptr_mut(&mut self, b: usize) -> Result<&mut [u8], FsError> {
		if b >= BLOCK_COUNT {
			return Err(FsError::Io);
		}
		Ok(unsafe { slice::from_raw_parts_mut(self.base.add(b * BLOCK_SIZE), BLOCK_SIZE) })
	}

	/// Allocates a new data block: scans the data-block bitmap for the lowest-indexed free bit at
	/// or above `FIRST_DATA_BLOCK`, marks it allocated, zeroes its contents, and returns its
	/// index.
	pub fn alloc_block(&mut self) -> Result<usize, FsError> {
		for i in FIRST_DATA_BLOCK..BLOCK_COUNT {
			if bitmap::get(self.data_bitmap_mut(), i) == 0 {
				bitmap::put(self.data_bitmap_mut(), i, 1);
				let block = self.block_ptr_mut(i)?;
				block.fill(0);
				return Ok(i);
			}
		}
		Err(FsError::OutOfSpace)
	}

	/// Frees the data block at index `b`, clearing its bitmap bit and zeroing its contents.
	///
	/// A double free is non-fatal: it is reported to stderr and otherwise ignored.
	pub fn free_block(&mut self, b: usize) {
		if !(FIRST_DATA_BLOCK..BLOCK_COUNT).contains(&b) {
			eprintln!("free_block: invalid block number {b}");
			return;
		}
		if bitmap::get(self.data_bitmap_mut(), b) != 0 {
			bitmap::put(self.data_bitmap_mut(), b, 0);
			if let Ok(block) = self.block_ptr_mut(b) {
				block.fill(0);
			}
		} else {
			eprintln!("free_block: block {b} is already free");
		}
	}

	/// Issues a synchronous flush of the whole mapped region to disk.
	pub fn flush(&self) {
		let ret = unsafe { libc::msync(self.base as *mut libc::c_void, IMAGE_SIZE as usize, libc::MS_SYNC) };
		if ret != 0 {
			eprintln!("blocks: msync failed: {}", io::Error::last_os_error());
		}
	}
}

impl Drop for BlockDevice {
	fn drop(&mut self) {
		if !self.base.is_null() {
			unsafe {
				libc::munmap(self.base as *mut libc::c_void, IMAGE_SIZE as usize);
			}
			self.base = ptr::null_mut();
		}
		// `self.file` closes the descriptor when dropped.
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use tempfile::NamedTempFile;

	#[test]
	fn bytes_to_blocks_rounds_up() {
		assert_eq!(bytes_to_blocks(0), 0);
		assert_eq!(bytes_to_blocks(1), 1);
		assert_eq!(bytes_to_blocks(BLOCK_SIZE), 1);
		assert_eq!(bytes_to_blocks(BLOCK_SIZE + 1), 2);
		assert_eq!(bytes_to_blocks(BLOCK_SIZE * 2), 2);
	}

	#[test]
	fn fresh_image_reserves_block_zero() {
		let tmp = NamedTempFile::new().unwrap();
		let mut dev = BlockDevice::open(tmp.path()).unwrap();
		assert_eq!(bitmap::get(dev.data_bitmap_mut(), 0), 1);
	}

	#[test]
	fn alloc_scans_ascending_and_skips_metadata() {
		let tmp = NamedTempFile::new().unwrap();
		let mut dev = BlockDevice::open(tmp.path()).unwrap();
		let a = dev.alloc_block().unwrap();
		let b = dev.alloc_block().unwrap();
		assert_eq!(a, FIRST_DATA_BLOCK);
		assert_eq!(b, FIRST_DATA_BLOCK + 1);
	}

	#[test]
	fn alloc_exhaustion_reports_out_of_space() {
		let tmp = NamedTempFile::new().unwrap();
		let mut dev = BlockDevice::open(tmp.path()).unwrap();
		let available = BLOCK_COUNT - FIRST_DATA_BLOCK;
		for _ in 0..available {
			dev.alloc_block().unwrap();
		}
		assert_eq!(dev.alloc_block(), Err(FsError::OutOfSpace));
	}

	#[test]
	fn free_clears_bit_and_zeroes_block() {
		let tmp = NamedTempFile::new().unwrap();
		let mut dev = BlockDevice::open(tmp.path()).unwrap();
		let b = dev.alloc_block().unwrap();
		dev.block_ptr_mut(b).unwrap().fill(0x41);
		dev.free_block(b);
		assert_eq!(bitmap::get(dev.data_bitmap_mut(), b), 0);
		assert!(dev.block_ptr(b).unwrap().iter().all(|&byte| byte == 0));
	}

	#[test]
	fn double_free_is_non_fatal() {
		let tmp = NamedTempFile::new().unwrap();
		let mut dev = BlockDevice::open(tmp.path()).unwrap();
		let b = dev.alloc_block().unwrap();
		dev.free_block(b);
		dev.free_block(b);
		assert_eq!(bitmap::get(dev.data_bitmap_mut(), b), 0);
	}

	#[test]
	fn out_of_range_block_ptr_is_io_error() {
		let tmp = NamedTempFile::new().unwrap();
		let dev = BlockDevice::open(tmp.path()).unwrap();
		assert_eq!(dev.block_ptr(BLOCK_COUNT), Err(FsError::Io));
	}
}
