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

//! Guest memory access.
//!
//! Every access to guest memory goes through page-table inspection: the
//! attribute bits are the guest's protection, regardless of what the host
//! mapping allows. A denied access is the guest's `EFAULT`, never a host
//! fault.
//!
//! Accessing a reserved-but-uncommitted page commits it here: anonymous
//! pages get a pool page swapped in, mug pages just shed their reserved
//! bit. This is the demand paging the reservation paths defer to.

use super::{AddrSpace, MemSpace};
use crate::{
	errno,
	errno::EResult,
	limits::{PAGE_SIZE, REAL_SIZE},
	memory::{
		pool,
		vmem,
		vmem::{
			Entry, Walk, PAGE_EOF, PAGE_HOST, PAGE_KEY, PAGE_MAP, PAGE_MUG, PAGE_RSRV, PAGE_RW,
			PAGE_TA, PAGE_U, PAGE_V,
		},
		VirtAddr,
	},
};
use core::sync::atomic::{AtomicU64, Ordering};

/// Commits a reserved leaf, returning the committed entry.
fn commit(st: &mut AddrSpace, slot: &AtomicU64, entry: Entry) -> EResult<Entry> {
	debug_assert_ne!(entry & PAGE_RSRV, 0);
	let new = if entry & PAGE_HOST != 0 {
		// Mug pages already have their backing; they were only not
		// counted resident yet
		entry & !PAGE_RSRV
	} else {
		let page = pool::alloc_page(&mut st.usage)?;
		(page & (PAGE_TA | PAGE_HOST))
			| (entry & (PAGE_KEY | PAGE_MAP | PAGE_MUG | PAGE_EOF))
			| PAGE_V
	};
	slot.store(new, Ordering::Release);
	st.usage.reserved -= 1;
	st.usage.rss += 1;
	Ok(new)
}

impl MemSpace {
	/// Resolves one guest byte to a host pointer, committing the page if
	/// needed. The returned pointer is valid for the rest of the page.
	fn resolve_locked(&self, st: &mut AddrSpace, addr: VirtAddr, write: bool) -> EResult<*mut u8> {
		if let Some(real) = self.real {
			// Real mode addresses the buffer directly
			if addr.0 < 0 || addr.0 as usize >= REAL_SIZE {
				return Err(errno!(EFAULT));
			}
			return Ok((real + addr.0 as usize) as *mut u8);
		}
		let page = addr.align_down(PAGE_SIZE);
		let Walk::Leaf(slot) = vmem::walk(st.root, page) else {
			return Err(errno!(EFAULT));
		};
		let mut entry = slot.load(Ordering::Acquire);
		if entry & PAGE_V == 0 || entry & PAGE_U == 0 {
			return Err(errno!(EFAULT));
		}
		if write && entry & PAGE_RW == 0 {
			return Err(errno!(EFAULT));
		}
		if entry & PAGE_RSRV != 0 {
			entry = commit(st, slot, entry)?;
		}
		if entry & PAGE_HOST != 0 {
			let off = (addr - page) as usize;
			return Ok(((entry & PAGE_TA) as usize + off) as *mut u8);
		}
		// Long-mode systems can alias low memory into the real buffer
		let ta = (entry & PAGE_TA) as usize;
		match self.real {
			Some(real) if ta < REAL_SIZE => Ok((real + ta + (addr - page) as usize) as *mut u8),
			_ => Err(errno!(EFAULT)),
		}
	}

	/// Copies `buf` into guest memory at `addr`.
	///
	/// Fails with `EFAULT` when any touched page is unmapped, not guest
	/// readable, or not guest writable.
	pub fn copy_to_guest(&self, addr: VirtAddr, buf: &[u8]) -> EResult<()> {
		let mut st = self.state.lock().unwrap();
		let mut done = 0;
		while done < buf.len() {
			let cur = addr + done;
			let host = self.resolve_locked(&mut st, cur, true)?;
			let in_page = PAGE_SIZE - (cur.0 as usize & (PAGE_SIZE - 1));
			let n = in_page.min(buf.len() - done);
			unsafe {
				core::ptr::copy_nonoverlapping(buf[done..].as_ptr(), host, n);
			}
			done += n;
		}
		Ok(())
	}

	/// Copies guest memory at `addr` into `buf`.
	pub fn copy_from_guest(&self, buf: &mut [u8], addr: VirtAddr) -> EResult<()> {
		let mut st = self.state.lock().unwrap();
		let mut done = 0;
		while done < buf.len() {
			let cur = addr + done;
			let host = self.resolve_locked(&mut st, cur, false)?;
			let in_page = PAGE_SIZE - (cur.0 as usize & (PAGE_SIZE - 1));
			let n = in_page.min(buf.len() - done);
			unsafe {
				core::ptr::copy_nonoverlapping(host as *const u8, buf[done..].as_mut_ptr(), n);
			}
			done += n;
		}
		Ok(())
	}

	/// Tells whether `[addr, addr + len)` is guest accessible, without
	/// committing anything.
	pub fn is_valid_memory(&self, addr: VirtAddr, len: usize, write: bool) -> bool {
		if len == 0 {
			return true;
		}
		if self.real.is_some() {
			return addr.0 >= 0 && (addr.0 as usize).saturating_add(len) <= REAL_SIZE;
		}
		let st = self.state.lock().unwrap();
		let first = addr.align_down(PAGE_SIZE);
		let pages = ((addr - first) as u64 + len as u64).div_ceil(PAGE_SIZE as u64);
		for i in 0..pages {
			let page = first + (i as usize * PAGE_SIZE);
			let Some(entry) = vmem::lookup(st.root, page) else {
				return false;
			};
			if entry & PAGE_U == 0 || (write && entry & PAGE_RW == 0) {
				return false;
			}
		}
		true
	}
}

#[cfg(test)]
mod test {
	use super::super::{PROT_READ, PROT_WRITE};
	use super::*;

	#[test]
	fn round_trip_and_lazy_commit() {
		let s = MemSpace::new(false, false).unwrap();
		let virt = VirtAddr(0x10000);
		s.reserve(virt, 0x4000, PROT_READ | PROT_WRITE, -1, 0, false).unwrap();
		assert_eq!(s.usage().rss, 0);
		let pattern: Vec<u8> = (0..0x2000u32).map(|i| i as u8).collect();
		s.copy_to_guest(virt + 0x800, &pattern).unwrap();
		// Touching three of the four pages committed exactly those
		assert_eq!(s.usage().rss, 3);
		assert_eq!(s.usage().reserved, 1);
		let mut back = vec![0u8; pattern.len()];
		s.copy_from_guest(&mut back, virt + 0x800).unwrap();
		assert_eq!(back, pattern);
	}

	#[test]
	fn unmapped_access_faults() {
		let s = MemSpace::new(false, false).unwrap();
		let mut buf = [0u8; 4];
		assert_eq!(s.copy_from_guest(&mut buf, VirtAddr(0x10000)), Err(errno!(EFAULT)));
	}

	#[test]
	fn write_denied_by_page_bits() {
		let s = MemSpace::new(false, false).unwrap();
		let virt = VirtAddr(0x10000);
		s.reserve(virt, 0x1000, PROT_READ, -1, 0, false).unwrap();
		assert_eq!(s.copy_to_guest(virt, &[1, 2, 3]), Err(errno!(EFAULT)));
		// Readable though
		let mut buf = [0u8; 3];
		s.copy_from_guest(&mut buf, virt).unwrap();
		assert_eq!(buf, [0, 0, 0]);
	}

	#[test]
	fn validity_probe() {
		let s = MemSpace::new(false, false).unwrap();
		let virt = VirtAddr(0x10000);
		s.reserve(virt, 0x2000, PROT_READ, -1, 0, false).unwrap();
		assert!(s.is_valid_memory(virt, 0x2000, false));
		assert!(s.is_valid_memory(virt + 0xfff, 2, false));
		assert!(!s.is_valid_memory(virt, 1, true));
		assert!(!s.is_valid_memory(virt + 0x1fff, 2, false));
		// Probing must not commit
		assert_eq!(s.usage().rss, 0);
	}

	#[test]
	fn real_mode_buffer() {
		let s = MemSpace::new(false, true).unwrap();
		s.copy_to_guest(VirtAddr(0x7c00), b"boot").unwrap();
		let mut buf = [0u8; 4];
		s.copy_from_guest(&mut buf, VirtAddr(0x7c00)).unwrap();
		assert_eq!(&buf, b"boot");
		assert!(!s.is_valid_memory(VirtAddr(REAL_SIZE as i64 - 1), 2, false));
	}
}
