//! Library surface for the `nufs` storage engine, exposed mainly so its modules can be
//! exercised independently of the `fuser` dispatch loop in `main.rs`.

pub mod bitmap;
pub mod blocks;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod fs;
pub mod inode;
