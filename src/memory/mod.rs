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

//! Host-side memory plumbing for the guest address space.
//!
//! The guest sees a 48-bit virtual address space; the host sees whatever
//! its kernel gives us. Three layers bridge the two:
//! - [`arena`]: page-aligned, contiguously addressed host regions carved
//!   from a reserved window
//! - [`pool`]: a recycling free list of 4 KiB anonymous pages on top of the
//!   arena
//! - [`vmem`]: the four-level page table mapping guest pages to host
//!   storage

pub mod arena;
pub mod pool;
pub mod stats;
pub mod vmem;

use crate::limits::{PAGE_SIZE, SKEW};
use core::{
	fmt,
	ops::{Add, Sub},
	sync::atomic::{AtomicUsize, Ordering},
};

/// A guest virtual address.
///
/// Guest addresses are signed: the canonical range is `[-2^47, 2^47)`, and
/// negative addresses index the top half of the page table through their
/// sign-extended bit pattern.
#[repr(transparent)]
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VirtAddr(pub i64);

impl VirtAddr {
	/// Tells whether the address is aligned to `n`. `n` must be a power of
	/// two.
	pub fn is_aligned_to(self, n: usize) -> bool {
		self.0 & (n as i64 - 1) == 0
	}

	/// Rounds the address down to a multiple of `n`. `n` must be a power
	/// of two.
	pub fn align_down(self, n: usize) -> Self {
		Self(self.0 & !(n as i64 - 1))
	}

	/// Returns the index of the guest page holding the address.
	pub fn page(self) -> i64 {
		self.0 >> crate::limits::PAGE_SHIFT
	}
}

impl Add<usize> for VirtAddr {
	type Output = Self;

	fn add(self, rhs: usize) -> Self {
		Self(self.0.wrapping_add(rhs as i64))
	}
}

impl Sub<VirtAddr> for VirtAddr {
	type Output = i64;

	fn sub(self, rhs: VirtAddr) -> i64 {
		self.0.wrapping_sub(rhs.0)
	}
}

impl fmt::Debug for VirtAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:#x}", self.0)
	}
}

/// Returns the host image of a guest address in linear mode.
pub fn to_host(addr: VirtAddr) -> usize {
	addr.0.wrapping_add(SKEW) as usize
}

/// Returns the guest address whose linear host image is `host`.
pub fn to_guest(host: usize) -> VirtAddr {
	VirtAddr((host as i64).wrapping_sub(SKEW))
}

/// Returns the host's page size in bytes.
///
/// Guest pages are always 4 KiB; when the host's pages are larger, shared
/// and file mappings fall back to individually mapped "mug" pages.
pub fn host_page_size() -> usize {
	static CACHE: AtomicUsize = AtomicUsize::new(0);
	let cached = CACHE.load(Ordering::Relaxed);
	if cached != 0 {
		return cached;
	}
	let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
	let size = if size <= 0 { PAGE_SIZE } else { size as usize };
	CACHE.store(size, Ordering::Relaxed);
	size
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn alignment() {
		assert!(VirtAddr(0x1000).is_aligned_to(PAGE_SIZE));
		assert!(!VirtAddr(0x1001).is_aligned_to(PAGE_SIZE));
		assert_eq!(VirtAddr(0x1fff).align_down(PAGE_SIZE), VirtAddr(0x1000));
		assert_eq!(VirtAddr(-1).align_down(PAGE_SIZE), VirtAddr(-4096));
	}

	#[test]
	fn host_round_trip() {
		let v = VirtAddr(0x2_0000_0000);
		assert_eq!(to_guest(to_host(v)), v);
	}

	#[test]
	fn host_page_size_sane() {
		let size = host_page_size();
		assert!(size >= PAGE_SIZE);
		assert!(size.is_power_of_two());
	}
}
