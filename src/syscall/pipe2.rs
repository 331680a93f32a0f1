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

//! The `pipe2` system call creates a pipe with the given flags.

use crate::{
	errno,
	errno::{from_host, host_errno, EResult},
	file,
	file::{fd::FD_CLOEXEC, File},
	memory::VirtAddr,
	process::System,
};

/// Creates a pipe and writes the two guest descriptors as little-endian
/// 32-bit values at `addr`.
///
/// Accepted flags are `O_CLOEXEC` and `O_NDELAY`; anything else is
/// `EINVAL`. The read end is inserted as `O_RDONLY | flags`, the write
/// end as `O_WRONLY | flags`, and both carry the host-side `FD_CLOEXEC`
/// and `O_NDELAY` state a Linux kernel would give them.
pub fn pipe2(system: &System, addr: VirtAddr, flags: i32) -> EResult<i32> {
	if flags & !(file::O_CLOEXEC | file::O_NDELAY) != 0 {
		return Err(errno!(EINVAL));
	}
	// Flagged creation must not race an execve sweeping cloexec
	let _exec = (flags != 0).then(|| system.exec_guard());
	let mut host_fds = [0 as libc::c_int; 2];
	if unsafe { libc::pipe(host_fds.as_mut_ptr()) } != 0 {
		return Err(from_host(host_errno()));
	}
	for fd in host_fds {
		unsafe {
			if flags & file::O_CLOEXEC != 0 {
				libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
			}
			if flags & file::O_NDELAY != 0 {
				let fl = libc::fcntl(fd, libc::F_GETFL);
				libc::fcntl(fd, libc::F_SETFL, fl | libc::O_NONBLOCK);
			}
		}
	}
	let fd_flags = if flags & file::O_CLOEXEC != 0 { FD_CLOEXEC } else { 0 };
	let (read_fd, write_fd) = system.fds.add_fd_pair(
		fd_flags,
		File::host(host_fds[0], file::O_RDONLY | flags),
		File::host(host_fds[1], file::O_WRONLY | flags),
	)?;
	let mut out = [0u8; 8];
	out[..4].copy_from_slice(&read_fd.to_le_bytes());
	out[4..].copy_from_slice(&write_fd.to_le_bytes());
	if let Err(e) = system.mem.copy_to_guest(addr, &out) {
		// The guest never saw the descriptors; take them back
		let _ = system.fds.close_fd(write_fd);
		let _ = system.fds.close_fd(read_fd);
		return Err(e);
	}
	Ok(0)
}
