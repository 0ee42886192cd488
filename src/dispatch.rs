//! Binds the storage engine to the `fuser::Filesystem` trait: translates kernel callbacks into
//! engine calls over paths, and engine results back into kernel replies over inode numbers.
//!
//! There being no on-disk directory entries, the inode number the kernel sees is derived straight
//! from an inode's live slot index in the table (`ino = index + 1`, so the table's first entry,
//! always the root directory, lands on `fuser::FUSE_ROOT_ID`). A slot index is only stable for as
//! long as the inode stays live; `unlink`'s shift-left reuses a freed slot's number for whatever
//! inode moves into it next, which is fine since a vanished inode's ino going stale is exactly
//! what the kernel expects after a successful unlink.

use crate::error::FsError;
use crate::fs::Attr;
use crate::fs::Filesystem;
use fuser::FileAttr;
use fuser::FileType;
use fuser::Filesystem as FuserFilesystem;
use fuser::KernelConfig;
use fuser::ReplyAttr;
use fuser::ReplyData;
use fuser::ReplyDirectory;
use fuser::ReplyEmpty;
use fuser::ReplyEntry;
use fuser::ReplyOpen;
use fuser::ReplyWrite;
use fuser::Request;
use fuser::FUSE_ROOT_ID;
use libc::c_int;
use std::ffi::OsStr;
use std::time::Duration;
use std::time::UNIX_EPOCH;

const TTL: Duration = Duration::from_secs(1);

/// Adapts [`Filesystem`] to `fuser::Filesystem`, printing one diagnostic line per callback.
pub struct Nufs {
	fs: Filesystem,
}

impl Nufs {
	pub fn new(fs: Filesystem) -> Self {
		Self { fs }
	}

	fn path_of(&self, ino: u64) -> Option<String> {
		if ino == FUSE_ROOT_ID {
			return Some("/".to_owned());
		}
		let idx = (ino - 1) as usize;
		self.fs.inode(idx).map(|node| node.path().to_owned())
	}

	fn child_path(parent: &str, name: &OsStr) -> Option<String> {
		let name = name.to_str()?;
		if parent == "/" {
			Some(format!("/{name}"))
		} else {
			Some(format!("{parent}/{name}"))
		}
	}

	fn attr(&self, idx: usize, uid: u32, gid: u32) -> Option<FileAttr> {
		self.fs
			.getattr_idx(idx)
			.ok()
			.map(|a| to_file_attr((idx + 1) as u64, &a, uid, gid))
	}
}

fn to_file_attr(ino: u64, attr: &Attr, uid: u32, gid: u32) -> FileAttr {
	let is_dir = attr.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32;
	FileAttr {
		ino,
		size: attr.size,
		blocks: attr.blocks,
		atime: UNIX_EPOCH + Duration::from_secs(attr.atime.max(0) as u64),
		mtime: UNIX_EPOCH + Duration::from_secs(attr.mtime.max(0) as u64),
		ctime: UNIX_EPOCH + Duration::from_secs(attr.ctime.max(0) as u64),
		crtime: UNIX_EPOCH + Duration::from_secs(attr.ctime.max(0) as u64),
		kind: if is_dir { FileType::Directory } else { FileType::RegularFile },
		perm: (attr.mode & 0o7777) as u16,
		nlink: attr.nlink,
		uid,
		gid,
		rdev: 0,
		blksize: attr.blksize,
		flags: 0,
	}
}

fn errno(err: FsError) -> c_int {
	c_int::from(err)
}

impl FuserFilesystem for Nufs {
	fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
		println!("init");
		Ok(())
	}

	fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
		let Some(parent_path) = self.path_of(parent) else {
			println!("lookup({parent}, {name:?}): ENOENT (bad parent)");
			reply.error(libc::ENOENT);
			return;
		};
		let Some(path) = Self::child_path(&parent_path, name) else {
			reply.error(libc::ENOENT);
			return;
		};

		println!("lookup({parent}, {name:?}) -> {path}");
		match self.fs.index_of(&path) {
			Some(idx) => match self.attr(idx, req.uid(), req.gid()) {
				Some(attr) => reply.entry(&TTL, &attr, 0),
				None => reply.error(libc::ENOENT),
			},
			None => reply.error(libc::ENOENT),
		}
	}

	fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
		println!("getattr({ino})");
		let idx = (ino.max(1) - 1) as usize;
		match self.attr(idx, req.uid(), req.gid()) {
			Some(attr) => reply.attr(&TTL, &attr),
			None => reply.error(libc::ENOENT),
		}
	}

	fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
		println!("access({ino})");
		match self.path_of(ino) {
			Some(path) => match self.fs.access(&path) {
				Ok(()) => reply.ok(),
				Err(e) => reply.error(errno(e)),
			},
			None => reply.error(libc::ENOENT),
		}
	}

	fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
		println!("open({ino})");
		match self.path_of(ino) {
			Some(path) => match self.fs.access(&path) {
				Ok(()) => reply.opened(0, 0),
				Err(e) => reply.error(errno(e)),
			},
			None => reply.error(libc::ENOENT),
		}
	}

	fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
		println!("readdir({ino})");
		let Some(path) = self.path_of(ino) else {
			reply.error(libc::ENOENT);
			return;
		};

		let entries = match self.fs.readdir(&path) {
			Ok(entries) => entries,
			Err(e) => {
				reply.error(errno(e));
				return;
			}
		};

		let mut all = vec![
			(ino, FileType::Directory, ".".to_owned()),
			(ino, FileType::Directory, "..".to_owned()),
		];
		for (name, idx) in entries {
			let kind = match self.fs.inode(idx) {
				Some(n) if n.is_dir() => FileType::Directory,
				_ => FileType::RegularFile,
			};
			all.push(((idx + 1) as u64, kind, name));
		}

		for (i, (entry_ino, kind, name)) in all.into_iter().enumerate().skip(offset as usize) {
			if reply.add(entry_ino, (i + 1) as i64, kind, name) {
				break;
			}
		}
		reply.ok();
	}

	fn mknod(
		&mut self,
		req: &Request<'_>,
		parent: u64,
		name: &OsStr,
		mode: u32,
		_umask: u32,
		_rdev: u32,
		reply: ReplyEntry,
	) {
		let Some(parent_path) = self.path_of(parent) else {
			reply.error(libc::ENOENT);
			return;
		};
		let Some(path) = Self::child_path(&parent_path, name) else {
			reply.error(libc::ENOENT);
			return;
		};

		println!("mknod({path})");
		match self.fs.mknod(&path, mode) {
			Ok(idx) => match self.attr(idx, req.uid(), req.gid()) {
				Some(attr) => reply.entry(&TTL, &attr, 0),
				None => reply.error(libc::EIO),
			},
			Err(e) => reply.error(errno(e)),
		}
	}

	fn mkdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
		let Some(parent_path) = self.path_of(parent) else {
			reply.error(libc::ENOENT);
			return;
		};
		let Some(path) = Self::child_path(&parent_path, name) else {
			reply.error(libc::ENOENT);
			return;
		};

		println!("mkdir({path})");
		match self.fs.mkdir(&path, mode) {
			Ok(idx) => match self.attr(idx, req.uid(), req.gid()) {
				Some(attr) => reply.entry(&TTL, &attr, 0),
				None => reply.error(libc::EIO),
			},
			Err(e) => reply.error(errno(e)),
		}
	}

	fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
		let Some(parent_path) = self.path_of(parent) else {
			reply.error(libc::ENOENT);
			return;
		};
		let Some(path) = Self::child_path(&parent_path, name) else {
			reply.error(libc::ENOENT);
			return;
		};

		println!("unlink({path})");
		match self.fs.unlink(&path) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(errno(e)),
		}
	}

	fn rename(
		&mut self,
		_req: &Request<'_>,
		parent: u64,
		name: &OsStr,
		newparent: u64,
		newname: &OsStr,
		_flags: u32,
		reply: ReplyEmpty,
	) {
		let (Some(parent_path), Some(new_parent_path)) = (self.path_of(parent), self.path_of(newparent)) else {
			reply.error(libc::ENOENT);
			return;
		};
		let (Some(from), Some(to)) = (
			Self::child_path(&parent_path, name),
			Self::child_path(&new_parent_path, newname),
		) else {
			reply.error(libc::ENOENT);
			return;
		};

		println!("rename({from} -> {to})");
		match self.fs.rename(&from, &to) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(errno(e)),
		}
	}

	fn read(
		&mut self,
		_req: &Request<'_>,
		ino: u64,
		_fh: u64,
		offset: i64,
		size: u32,
		_flags: i32,
		_lock_owner: Option<u64>,
		reply: ReplyData,
	) {
		println!("read({ino}, offset={offset}, size={size})");
		let Some(path) = self.path_of(ino) else {
			reply.error(libc::ENOENT);
			return;
		};

		let mut buf = vec![0u8; size as usize];
		match self.fs.read(&path, &mut buf, offset.max(0) as u64) {
			Ok(n) => reply.data(&buf[..n as usize]),
			Err(e) => reply.error(errno(e)),
		}
	}

	fn write(
		&mut self,
		_req: &Request<'_>,
		ino: u64,
		_fh: u64,
		offset: i64,
		data: &[u8],
		_write_flags: u32,
		_flags: i32,
		_lock_owner: Option<u64>,
		reply: ReplyWrite,
	) {
		println!("write({ino}, offset={offset}, len={})", data.len());
		let Some(path) = self.path_of(ino) else {
			reply.error(libc::ENOENT);
			return;
		};

		match self.fs.write(&path, data, offset.max(0) as u64) {
			Ok(n) => reply.written(n),
			Err(e) => reply.error(errno(e)),
		}
	}
}
