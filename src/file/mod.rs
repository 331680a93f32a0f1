/*
 * Copyright 2026 Mimic contributors
 *
 * This file is part of Mimic.
 *
 * Mimic is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Mimic is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Mimic. If not, see <https://www.gnu.org/licenses/>.
 */

//! Guest files.
//!
//! Open-flag constants here are the guest's (x86-64 Linux numbering);
//! host flags come from `libc` and the two must never be mixed without
//! translation.
//!
//! A [`File`] dispatches its operations through a [`FileOps`] capability
//! record chosen when the descriptor is created, so descriptors backed by
//! host files, pipes or emulator-internal objects share one table.

pub mod fd;

use crate::{
	errno,
	errno::{from_host, host_errno, EResult},
};
use std::sync::Arc;

/// Open for reading only.
pub const O_RDONLY: i32 = 0o0;
/// Open for writing only.
pub const O_WRONLY: i32 = 0o1;
/// Open for reading and writing.
pub const O_RDWR: i32 = 0o2;
/// Mask of the access mode bits.
pub const O_ACCMODE: i32 = 0o3;
/// Create the file if it does not exist.
pub const O_CREAT: i32 = 0o100;
/// Fail if the file exists.
pub const O_EXCL: i32 = 0o200;
/// Do not make the terminal the controlling terminal.
pub const O_NOCTTY: i32 = 0o400;
/// Truncate the file to zero length.
pub const O_TRUNC: i32 = 0o1000;
/// Append on each write.
pub const O_APPEND: i32 = 0o2000;
/// Non-blocking I/O.
pub const O_NONBLOCK: i32 = 0o4000;
/// Historical alias of [`O_NONBLOCK`].
pub const O_NDELAY: i32 = O_NONBLOCK;
/// Fail unless the path is a directory.
pub const O_DIRECTORY: i32 = 0o200000;
/// Fail when the trailing component is a symbolic link.
pub const O_NOFOLLOW: i32 = 0o400000;
/// Ignored; 64-bit offsets are the only kind here.
pub const O_LARGEFILE: i32 = 0o100000;
/// Close the descriptor on `execve`.
pub const O_CLOEXEC: i32 = 0o2000000;
/// Create an unnamed file in the directory named by the path.
pub const O_TMPFILE: i32 = 0o20200000;

/// Operations a file dispatches through, selected when the descriptor is
/// created.
pub trait FileOps: Send + Sync {
	fn read(&self, file: &File, buf: &mut [u8]) -> EResult<usize>;
	fn write(&self, file: &File, buf: &[u8]) -> EResult<usize>;
	/// Releases the backing object. Called exactly once, from the file's
	/// drop.
	fn close(&self, file: &File);
}

/// Operations backed one-to-one by a host file descriptor.
pub struct HostFileOps;

impl FileOps for HostFileOps {
	fn read(&self, file: &File, buf: &mut [u8]) -> EResult<usize> {
		loop {
			let r = unsafe { libc::read(file.host_fd, buf.as_mut_ptr().cast(), buf.len()) };
			if r >= 0 {
				return Ok(r as usize);
			}
			let e = host_errno();
			if e != libc::EINTR {
				return Err(from_host(e));
			}
		}
	}

	fn write(&self, file: &File, buf: &[u8]) -> EResult<usize> {
		loop {
			let r = unsafe { libc::write(file.host_fd, buf.as_ptr().cast(), buf.len()) };
			if r >= 0 {
				return Ok(r as usize);
			}
			let e = host_errno();
			if e != libc::EINTR {
				return Err(from_host(e));
			}
		}
	}

	fn close(&self, file: &File) {
		unsafe {
			libc::close(file.host_fd);
		}
	}
}

/// An open file description.
pub struct File {
	/// The host descriptor backing this file, or `-1`.
	pub host_fd: i32,
	/// Guest open flags, access mode included.
	pub oflags: i32,
	ops: Arc<dyn FileOps>,
}

impl std::fmt::Debug for File {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("File")
			.field("host_fd", &self.host_fd)
			.field("oflags", &self.oflags)
			.finish()
	}
}

impl File {
	/// Wraps a host file descriptor. The file owns `host_fd` from here
	/// on.
	pub fn host(host_fd: i32, oflags: i32) -> Self {
		Self {
			host_fd,
			oflags,
			ops: Arc::new(HostFileOps),
		}
	}

	/// Creates a file with custom operations.
	pub fn with_ops(oflags: i32, ops: Arc<dyn FileOps>) -> Self {
		Self {
			host_fd: -1,
			oflags,
			ops,
		}
	}

	pub fn read(&self, buf: &mut [u8]) -> EResult<usize> {
		if self.oflags & O_ACCMODE == O_WRONLY {
			return Err(errno!(EBADF));
		}
		self.ops.read(self, buf)
	}

	pub fn write(&self, buf: &[u8]) -> EResult<usize> {
		if self.oflags & O_ACCMODE == O_RDONLY {
			return Err(errno!(EBADF));
		}
		self.ops.write(self, buf)
	}
}

impl Drop for File {
	fn drop(&mut self) {
		let ops = self.ops.clone();
		ops.close(self);
	}
}
