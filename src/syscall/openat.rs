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

//! The `openat` system call opens a file relative to a directory
//! descriptor.
//!
//! The path arriving here has already been resolved by the overlay layer;
//! this shim owns flag translation, the `O_TMPFILE` emulation and the
//! normalization of host quirks back to Linux semantics.

use super::resolve_dirfd;
use crate::{
	errno,
	errno::{from_host, host_errno, EResult},
	file,
	file::{fd::FD_CLOEXEC, File},
	process::System,
};
use std::ffi::CString;

/// Guest open flags this shim understands.
const KNOWN_FLAGS: i32 = file::O_ACCMODE
	| file::O_CREAT
	| file::O_EXCL
	| file::O_NOCTTY
	| file::O_TRUNC
	| file::O_APPEND
	| file::O_NONBLOCK
	| file::O_DIRECTORY
	| file::O_NOFOLLOW
	| file::O_LARGEFILE
	| file::O_CLOEXEC
	| file::O_TMPFILE;

/// Translates guest open flags to host open flags.
fn xlat_flags(guest: i32) -> EResult<i32> {
	if guest & !KNOWN_FLAGS != 0 {
		return Err(errno!(EINVAL));
	}
	let mut host = match guest & file::O_ACCMODE {
		file::O_RDONLY => libc::O_RDONLY,
		file::O_WRONLY => libc::O_WRONLY,
		file::O_RDWR => libc::O_RDWR,
		_ => return Err(errno!(EINVAL)),
	};
	for (g, h) in [
		(file::O_CREAT, libc::O_CREAT),
		(file::O_EXCL, libc::O_EXCL),
		(file::O_NOCTTY, libc::O_NOCTTY),
		(file::O_TRUNC, libc::O_TRUNC),
		(file::O_APPEND, libc::O_APPEND),
		(file::O_NONBLOCK, libc::O_NONBLOCK),
		(file::O_DIRECTORY, libc::O_DIRECTORY),
		(file::O_NOFOLLOW, libc::O_NOFOLLOW),
		(file::O_CLOEXEC, libc::O_CLOEXEC),
	] {
		if guest & g != 0 {
			host |= h;
		}
	}
	Ok(host)
}

cfg_if::cfg_if! {
	if #[cfg(any(
		target_os = "freebsd",
		target_os = "netbsd",
		target_os = "openbsd",
		target_os = "macos"
	))] {
		/// BSD kernels report a symlink stopped by `O_NOFOLLOW` as
		/// `EMLINK` or `EFTYPE`; POSIX says `ELOOP`.
		fn nofollow_diverged(e: i32) -> bool {
			e == libc::EMLINK || e == libc::EFTYPE
		}
	} else {
		fn nofollow_diverged(_e: i32) -> bool {
			false
		}
	}
}

/// Characters used in randomized temporary names.
const NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

fn random_name() -> [u8; 12] {
	let mut raw = [0u8; 12];
	let r = unsafe { libc::getentropy(raw.as_mut_ptr().cast(), raw.len()) };
	if r != 0 {
		// Entropy exhaustion here is survivable; O_EXCL catches
		// collisions anyway
		let mut seed = std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.map(|d| d.as_nanos() as u64)
			.unwrap_or(0) ^ (unsafe { libc::getpid() } as u64).rotate_left(32);
		for b in raw.iter_mut() {
			seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
			*b = (seed >> 33) as u8;
		}
	}
	let mut name = [0u8; 12];
	for (dst, src) in name.iter_mut().zip(raw) {
		*dst = NAME_ALPHABET[src as usize % NAME_ALPHABET.len()];
	}
	name
}

/// Opens an anonymous file in the directory `path`, the way Linux
/// `O_TMPFILE` would: create a randomized name, open it exclusively,
/// unlink it, keep the descriptor.
///
/// All host signals are blocked around the sequence so a handler can
/// never observe the transient named file.
fn open_tmpfile(dirfd: i32, path: &str, host_flags: i32, mode: u32) -> EResult<i32> {
	let mut all: libc::sigset_t = unsafe { core::mem::zeroed() };
	let mut old: libc::sigset_t = unsafe { core::mem::zeroed() };
	unsafe {
		libc::sigfillset(&mut all);
		libc::pthread_sigmask(libc::SIG_SETMASK, &all, &mut old);
	}
	let result = (|| {
		loop {
			let name = random_name();
			let joined = format!("{}/{}", path, core::str::from_utf8(&name).unwrap());
			let cpath = CString::new(joined).map_err(|_| errno!(EINVAL))?;
			let fd = unsafe {
				libc::openat(
					dirfd,
					cpath.as_ptr(),
					(host_flags & !libc::O_DIRECTORY) | libc::O_CREAT | libc::O_EXCL,
					mode,
				)
			};
			if fd < 0 {
				let e = host_errno();
				match e {
					libc::EINTR => continue,
					// Somebody raced us to the name; roll a new one
					libc::EEXIST => continue,
					_ => return Err(from_host(e)),
				}
			}
			let r = unsafe { libc::unlinkat(dirfd, cpath.as_ptr(), 0) };
			if r != 0 {
				let e = host_errno();
				unsafe {
					libc::close(fd);
				}
				return Err(from_host(e));
			}
			return Ok(fd);
		}
	})();
	unsafe {
		libc::pthread_sigmask(libc::SIG_SETMASK, &old, core::ptr::null_mut());
	}
	result
}

/// Opens `path` relative to the guest directory descriptor `dirfd` and
/// inserts the result into the descriptor table.
///
/// Arguments:
/// - `flags` is the guest open flags
/// - `mode` is the permission bits for created files
///
/// Returns the new guest descriptor.
pub fn openat(system: &System, dirfd: i32, path: &str, flags: i32, mode: u32) -> EResult<i32> {
	let host_dirfd = resolve_dirfd(system, dirfd)?;
	let host_flags = xlat_flags(flags & !file::O_TMPFILE)?;
	let host_fd = if flags & file::O_TMPFILE == file::O_TMPFILE {
		open_tmpfile(host_dirfd, path, host_flags, mode)?
	} else {
		let cpath = CString::new(path).map_err(|_| errno!(EINVAL))?;
		loop {
			let fd = unsafe { libc::openat(host_dirfd, cpath.as_ptr(), host_flags, mode) };
			if fd >= 0 {
				break fd;
			}
			let e = host_errno();
			if e == libc::EINTR {
				continue;
			}
			if flags & file::O_NOFOLLOW != 0 && nofollow_diverged(e) {
				return Err(errno!(ELOOP));
			}
			return Err(from_host(e));
		}
	};
	let fd_flags = if flags & file::O_CLOEXEC != 0 { FD_CLOEXEC } else { 0 };
	// On failure the file is dropped here, which closes the host fd
	let guest_fd = system.fds.add_fd(fd_flags, File::host(host_fd, flags))?;
	Ok(guest_fd as i32)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn flag_translation() {
		assert!(xlat_flags(file::O_RDWR | file::O_CREAT | file::O_CLOEXEC).is_ok());
		assert_eq!(xlat_flags(file::O_ACCMODE), Err(errno!(EINVAL)));
		assert_eq!(xlat_flags(0o17770000000), Err(errno!(EINVAL)));
	}

	#[test]
	fn random_names_differ() {
		let a = random_name();
		let b = random_name();
		assert_ne!(a, b);
		assert!(a.iter().all(|c| NAME_ALPHABET.contains(c)));
	}
}
