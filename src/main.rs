//! Entry point: mounts a disk image as a FUSE filesystem.

use fuser::MountOption;
use nufs::dispatch::Nufs;
use nufs::fs::Filesystem;
use std::env;
use std::path::Path;
use std::process::exit;

/// Prints the command's usage.
///
/// `bin` is the name of the current binary.
fn print_usage(bin: &str) {
	eprintln!("Usage:");
	eprintln!(" {bin} [-o option[,option...]] <mountpoint> <image>");
	eprintln!();
	eprintln!("Options:");
	eprintln!(" -o:\tcomma-separated list of fuser mount options (e.g. ro,allow_other)");
	eprintln!(" mountpoint:\tdirectory on which the filesystem is mounted");
	eprintln!(" image:\tpath to the disk image backing the filesystem");
}

fn parse_options(spec: &str) -> Vec<MountOption> {
	spec.split(',')
		.filter(|s| !s.is_empty())
		.filter_map(|s| match s {
			"ro" => Some(MountOption::RO),
			"rw" => Some(MountOption::RW),
			"suid" => Some(MountOption::Suid),
			"nosuid" => Some(MountOption::NoSuid),
			"dev" => Some(MountOption::Dev),
			"nodev" => Some(MountOption::NoDev),
			"exec" => Some(MountOption::Exec),
			"noexec" => Some(MountOption::NoExec),
			"atime" => Some(MountOption::Atime),
			"noatime" => Some(MountOption::NoAtime),
			"dirsync" => Some(MountOption::DirSync),
			"sync" => Some(MountOption::Sync),
			"async" => Some(MountOption::Async),
			"allow_other" => Some(MountOption::AllowOther),
			"allow_root" => Some(MountOption::AllowRoot),
			"auto_unmount" => Some(MountOption::AutoUnmount),
			"default_permissions" => Some(MountOption::DefaultPermissions),
			_ => {
				eprintln!("nufs: ignoring unknown mount option `{s}`");
				None
			}
		})
		.collect()
}

fn main() {
	let args: Vec<String> = env::args().collect();
	let bin = args.first().map(String::as_str).unwrap_or("nufs");
	let a: Vec<&str> = args.iter().map(String::as_str).collect();

	let (mountpoint, image, mut options) = match a[1..] {
		["-h"] => {
			print_usage(bin);
			exit(0);
		}

		["-o", opts, mountpoint, image] => (mountpoint, image, parse_options(opts)),

		[mountpoint, image] => (mountpoint, image, Vec::new()),

		_ => {
			print_usage(bin);
			exit(1);
		}
	};

	options.push(MountOption::FSName("nufs".to_owned()));

	let fs = Filesystem::mount(Path::new(image)).unwrap_or_else(|e| {
		eprintln!("{bin}: {image}: {e}");
		exit(1);
	});

	fuser::mount2(Nufs::new(fs), mountpoint, &options).unwrap_or_else(|e| {
		eprintln!("{bin}: {mountpoint}: {e}");
		exit(1);
	});
}
