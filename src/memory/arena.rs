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

//! The big arena sources page-aligned, contiguously addressed host regions
//! from the precious window `[PRECIOUS_START, PRECIOUS_END)`.
//!
//! The window is reserved away from the host libc heap so that guest
//! memory keeps a high-bit-stable relationship to host addresses, which is
//! what lets emitted code reach it with displacement-limited addressing.
//!
//! The arena is process-global and survives any [`crate::process::System`]:
//! its cursor only ever advances, and every region it hands out is returned
//! to the host by an `atexit` hook installed on first use.

use crate::{
	errno,
	errno::{from_host, host_errno, EResult},
	limits::{PRECIOUS_END, PRECIOUS_START},
	memory::host_page_size,
};
use core::{
	ffi::c_void,
	ptr::NonNull,
	sync::atomic::{AtomicUsize, Ordering},
};
use std::sync::{Mutex, Once};

/// The arena cursor: host address of the next free byte in the precious
/// window. Zero until first use.
static BRK: AtomicUsize = AtomicUsize::new(0);

/// Every region handed out, for the teardown hook.
static REGIONS: Mutex<Vec<(usize, usize)>> = Mutex::new(Vec::new());

static INIT: Once = Once::new();

/// Returns all arena regions to the host. Registered with `atexit` on
/// first allocation.
extern "C" fn teardown() {
	let regions = match REGIONS.lock() {
		Ok(r) => r,
		Err(e) => e.into_inner(),
	};
	for &(addr, len) in regions.iter() {
		unsafe {
			libc::munmap(addr as *mut c_void, len);
		}
	}
}

fn init() {
	INIT.call_once(|| {
		BRK.store(PRECIOUS_START, Ordering::Relaxed);
		unsafe {
			libc::atexit(teardown);
		}
	});
}

/// Outcome of one attempt to map at a demanded address.
enum Attempt {
	Mapped(NonNull<u8>),
	/// The host refused to place the mapping at the demanded address.
	Denied,
	Failed(i32),
}

cfg_if::cfg_if! {
	if #[cfg(target_os = "linux")] {
		/// Maps `[addr, addr+len)`, demanding that exact placement.
		fn demand_map(
			addr: usize,
			len: usize,
			prot: i32,
			flags: i32,
			fd: i32,
			off: i64,
		) -> Attempt {
			let p = unsafe {
				libc::mmap(
					addr as *mut c_void,
					len,
					prot,
					flags | libc::MAP_FIXED_NOREPLACE,
					fd,
					off as libc::off_t,
				)
			};
			if p == libc::MAP_FAILED {
				let e = host_errno();
				// An occupied target reports EEXIST; older kernels that
				// ignore the flag hand back a different address instead
				return if e == libc::EEXIST { Attempt::Denied } else { Attempt::Failed(e) };
			}
			if p as usize != addr {
				unsafe {
					libc::munmap(p, len);
				}
				return Attempt::Denied;
			}
			Attempt::Mapped(unsafe { NonNull::new_unchecked(p.cast()) })
		}
	} else if #[cfg(target_os = "emscripten")] {
		// No control over placement at all; take what we are given. Linear
		// mode is unusable on such hosts.
		fn demand_map(
			_addr: usize,
			len: usize,
			prot: i32,
			flags: i32,
			fd: i32,
			off: i64,
		) -> Attempt {
			let p = unsafe {
				libc::mmap(core::ptr::null_mut(), len, prot, flags, fd, off as libc::off_t)
			};
			if p == libc::MAP_FAILED {
				return Attempt::Failed(host_errno());
			}
			Attempt::Mapped(unsafe { NonNull::new_unchecked(p.cast()) })
		}
	} else {
		// Hosts without MAP_FIXED_NOREPLACE: pass the address as a hint
		// and check what came back.
		fn demand_map(
			addr: usize,
			len: usize,
			prot: i32,
			flags: i32,
			fd: i32,
			off: i64,
		) -> Attempt {
			let p = unsafe {
				libc::mmap(addr as *mut c_void, len, prot, flags, fd, off as libc::off_t)
			};
			if p == libc::MAP_FAILED {
				return Attempt::Failed(host_errno());
			}
			if p as usize != addr {
				unsafe {
					libc::munmap(p, len);
				}
				return Attempt::Denied;
			}
			Attempt::Mapped(unsafe { NonNull::new_unchecked(p.cast()) })
		}
	}
}

/// Allocates a host region of at least `len` bytes from the precious
/// window, rounded up to the host page size.
///
/// Arguments:
/// - `prot` is the host protection of the new region
/// - `flags` is the host mapping flags (sharing and anonymity; placement
///   flags are the arena's business)
/// - `fd` is the host file descriptor to map, or `-1`
/// - `off` is the offset in `fd`, which must be host-page-aligned
///
/// On a denied placement the cursor has already advanced, so the next
/// attempt probes fresh addresses; the window filling up is `ENOMEM`.
pub fn alloc_big(len: usize, prot: i32, flags: i32, fd: i32, off: i64) -> EResult<NonNull<u8>> {
	init();
	let host_page = host_page_size();
	let len = len
		.checked_add(host_page - 1)
		.ok_or(errno!(ENOMEM))? & !(host_page - 1);
	loop {
		let brk = BRK.fetch_add(len, Ordering::Relaxed);
		let end = brk.checked_add(len).ok_or(errno!(ENOMEM))?;
		if end > PRECIOUS_END {
			log::error!("precious window exhausted at {brk:#x} (+{len:#x})");
			return Err(errno!(ENOMEM));
		}
		match demand_map(brk, len, prot, flags, fd, off) {
			Attempt::Mapped(p) => {
				let mut regions = REGIONS.lock().unwrap();
				regions.push((p.as_ptr() as usize, len));
				return Ok(p);
			}
			Attempt::Denied => {
				log::debug!("host denied arena mapping at {brk:#x}, retrying");
			}
			Attempt::Failed(e) => {
				log::error!("arena mmap at {brk:#x} failed: host errno {e}");
				return Err(from_host(e));
			}
		}
	}
}

/// Maps `[addr, addr+len)` at exactly that host address, demanding the
/// placement, for linear-mode guest mappings outside the arena's own
/// window.
///
/// A denied placement is `ENOMEM` here: unlike [`alloc_big`] there is no
/// other address that would do.
pub(crate) fn demand_at(
	addr: usize,
	len: usize,
	prot: i32,
	flags: i32,
	fd: i32,
	off: i64,
) -> EResult<()> {
	match demand_map(addr, len, prot, flags, fd, off) {
		Attempt::Mapped(_) => Ok(()),
		Attempt::Denied => Err(errno!(ENOMEM)),
		Attempt::Failed(e) => Err(from_host(e)),
	}
}

/// Tells whether the host range `[addr, addr+len)` overlaps the precious
/// window.
pub fn overlaps_precious(addr: usize, len: usize) -> bool {
	let end = addr.saturating_add(len);
	addr < PRECIOUS_END && end > PRECIOUS_START
}

/// Writes a diagnostic for an unrecoverable host mapping failure and exits.
///
/// Past the point of no return in a linear-mode replacement, the host
/// address space no longer matches the page tables; continuing would turn
/// a reporting problem into silent corruption.
pub fn panic_due_to_mmap(what: &str) -> ! {
	let e = host_errno();
	log::error!("unrecoverable mmap failure while {what}: host errno {e}");
	eprintln!(
		"mimic: fatal: host {what} failed (errno {e}); \
the guest address space is unrecoverable. \
Try disabling linear mode (-m) or relinking the guest at a higher image base."
	);
	std::process::exit(250);
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn precious_overlap() {
		assert!(overlaps_precious(PRECIOUS_START, 1));
		assert!(overlaps_precious(PRECIOUS_START - 1, 2));
		assert!(!overlaps_precious(PRECIOUS_START - 1, 1));
		assert!(!overlaps_precious(PRECIOUS_END, 1));
		assert!(overlaps_precious(0, usize::MAX));
	}

	#[test]
	fn anonymous_allocation() {
		let p = alloc_big(
			crate::limits::PAGE_SIZE,
			libc::PROT_READ | libc::PROT_WRITE,
			libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
			-1,
			0,
		)
		.unwrap();
		let addr = p.as_ptr() as usize;
		assert!((PRECIOUS_START..PRECIOUS_END).contains(&addr));
		// Fresh anonymous memory is zeroed and writable
		unsafe {
			assert_eq!(*p.as_ptr(), 0);
			*p.as_ptr() = 0xa5;
			assert_eq!(*p.as_ptr(), 0xa5);
		}
	}

	#[test]
	fn distinct_regions() {
		let a = alloc_big(
			crate::limits::PAGE_SIZE,
			libc::PROT_READ | libc::PROT_WRITE,
			libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
			-1,
			0,
		)
		.unwrap();
		let b = alloc_big(
			crate::limits::PAGE_SIZE,
			libc::PROT_READ | libc::PROT_WRITE,
			libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
			-1,
			0,
		)
		.unwrap();
		assert_ne!(a.as_ptr(), b.as_ptr());
	}
}
