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

//! Guest-visible errno values.
//!
//! The guest runs against the x86-64 Linux ABI, so the numeric values here
//! are Linux's, regardless of what the host libc uses. Host errors crossing
//! into the guest must be translated to these values first.

use core::fmt;

/// Operation not permitted.
pub const EPERM: i32 = 1;
/// No such file or directory.
pub const ENOENT: i32 = 2;
/// No such process.
pub const ESRCH: i32 = 3;
/// Interrupted system call.
pub const EINTR: i32 = 4;
/// I/O error.
pub const EIO: i32 = 5;
/// Argument list too long.
pub const E2BIG: i32 = 7;
/// Bad file descriptor.
pub const EBADF: i32 = 9;
/// No child processes.
pub const ECHILD: i32 = 10;
/// Resource temporarily unavailable.
pub const EAGAIN: i32 = 11;
/// Out of memory.
pub const ENOMEM: i32 = 12;
/// Permission denied.
pub const EACCES: i32 = 13;
/// Bad address.
pub const EFAULT: i32 = 14;
/// Device or resource busy.
pub const EBUSY: i32 = 16;
/// File exists.
pub const EEXIST: i32 = 17;
/// No such device.
pub const ENODEV: i32 = 19;
/// Not a directory.
pub const ENOTDIR: i32 = 20;
/// Is a directory.
pub const EISDIR: i32 = 21;
/// Invalid argument.
pub const EINVAL: i32 = 22;
/// Too many open files in system.
pub const ENFILE: i32 = 23;
/// Too many open files.
pub const EMFILE: i32 = 24;
/// No space left on device.
pub const ENOSPC: i32 = 28;
/// Illegal seek.
pub const ESPIPE: i32 = 29;
/// Too many links.
pub const EMLINK: i32 = 31;
/// Function not implemented.
pub const ENOSYS: i32 = 38;
/// Too many levels of symbolic links.
pub const ELOOP: i32 = 40;
/// Operation not supported.
pub const ENOTSUP: i32 = 95;

/// A guest-visible error number.
///
/// Syscall shims return `-errno` to the guest; inside the crate errors are
/// propagated as `Err(Errno)` through [`EResult`].
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Errno(pub i32);

impl Errno {
	/// Returns the value as a negative 64-bit syscall return.
	pub fn to_ret(self) -> i64 {
		-(self.0 as i64)
	}
}

impl fmt::Debug for Errno {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "errno {}", self.0)
	}
}

impl fmt::Display for Errno {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

/// Result type for operations that can fail with a guest errno.
pub type EResult<T> = Result<T, Errno>;

/// Builds an [`Errno`] from one of the constants in this module.
#[macro_export]
macro_rules! errno {
	($name:ident) => {
		$crate::errno::Errno($crate::errno::$name)
	};
}

/// Translates a host errno into the guest's numbering.
///
/// Values the core produces itself are covered explicitly; anything else
/// degrades to `EIO` rather than leaking a host-specific number.
pub fn from_host(host: i32) -> Errno {
	let e = match host {
		libc::EPERM => EPERM,
		libc::ENOENT => ENOENT,
		libc::EINTR => EINTR,
		libc::EIO => EIO,
		libc::EBADF => EBADF,
		libc::EAGAIN => EAGAIN,
		libc::ENOMEM => ENOMEM,
		libc::EACCES => EACCES,
		libc::EFAULT => EFAULT,
		libc::EBUSY => EBUSY,
		libc::EEXIST => EEXIST,
		libc::ENODEV => ENODEV,
		libc::ENOTDIR => ENOTDIR,
		libc::EISDIR => EISDIR,
		libc::EINVAL => EINVAL,
		libc::ENFILE => ENFILE,
		libc::EMFILE => EMFILE,
		libc::ENOSPC => ENOSPC,
		libc::ESPIPE => ESPIPE,
		libc::EMLINK => EMLINK,
		libc::ELOOP => ELOOP,
		_ => EIO,
	};
	Errno(e)
}

/// Returns the host's current errno.
pub fn host_errno() -> i32 {
	std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn syscall_return() {
		assert_eq!(errno!(EINVAL).to_ret(), -22);
		assert_eq!(errno!(ENOMEM).to_ret(), -12);
	}

	#[test]
	fn host_translation() {
		assert_eq!(from_host(libc::ENOMEM), errno!(ENOMEM));
		assert_eq!(from_host(libc::ELOOP), errno!(ELOOP));
	}
}
