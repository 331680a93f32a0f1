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

//! The page pool recycles 4 KiB anonymous host pages carved from the big
//! arena.
//!
//! Pages are interchangeable and hot in the CPU cache when reused, so the
//! pool never returns them to the host kernel; it zero-fills on free and
//! hands the same storage back out. Batch refills amortize the arena's
//! mmap cost. The pool is process-global and outlives any single
//! [`crate::process::System`]; the arena's teardown hook releases the
//! backing at process end.

use crate::{
	errno::EResult,
	limits::{PAGE_SIZE, POOL_BATCH},
	memory::{
		arena,
		stats::MemUsage,
		vmem::{Entry, PAGE_HOST, PAGE_RW, PAGE_TA, PAGE_U, PAGE_V},
	},
};
use std::sync::Mutex;

/// Free list of host page addresses not currently mapped to any guest
/// page.
static FREE: Mutex<Vec<usize>> = Mutex::new(Vec::new());

/// Allocates one zeroed 4 KiB host page and returns it as a leaf
/// page-table entry: host address plus `HOST | U | RW | V`.
///
/// Pops the free list when possible; otherwise pulls a batch of
/// [`POOL_BATCH`] pages from the arena, keeps one and stocks the rest.
pub fn alloc_page(usage: &mut MemUsage) -> EResult<Entry> {
	let recycled = FREE.lock().unwrap().pop();
	let host = match recycled {
		Some(host) => {
			usage.reclaimed += 1;
			host
		}
		None => {
			let base = arena::alloc_big(
				POOL_BATCH * PAGE_SIZE,
				libc::PROT_READ | libc::PROT_WRITE,
				libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
				-1,
				0,
			)?
			.as_ptr() as usize;
			usage.allocated += POOL_BATCH as u64;
			let mut free = FREE.lock().unwrap();
			for i in 1..POOL_BATCH {
				free.push(base + i * PAGE_SIZE);
			}
			base
		}
	};
	usage.committed += 1;
	Ok(host as Entry | PAGE_HOST | PAGE_U | PAGE_RW | PAGE_V)
}

/// Returns an anonymous page to the pool, zero-filling it first so the
/// next guest to receive it cannot read stale data.
pub fn free_anonymous_page(usage: &mut MemUsage, entry: Entry) {
	let host = (entry & PAGE_TA) as usize;
	unsafe {
		core::ptr::write_bytes(host as *mut u8, 0, PAGE_SIZE);
	}
	FREE.lock().unwrap().push(host);
	usage.freed += 1;
}

/// Allocates a zeroed page to hold a page-table level.
///
/// Same as [`alloc_page`] minus the guest-readable bit: interior tables
/// are the emulator's, not the guest's.
pub fn alloc_page_table(usage: &mut MemUsage) -> EResult<Entry> {
	let entry = alloc_page(usage)?;
	usage.tables += 1;
	Ok(entry & !PAGE_U)
}

/// Returns a collapsed page-table page to the pool.
pub fn free_page_table(usage: &mut MemUsage, host: usize) {
	FREE.lock().unwrap().push(host);
	usage.tables -= 1;
	usage.freed += 1;
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn leaf_shape() {
		let mut usage = MemUsage::default();
		let entry = alloc_page(&mut usage).unwrap();
		assert_ne!(entry & PAGE_TA, 0);
		assert_eq!(entry & (PAGE_HOST | PAGE_U | PAGE_RW | PAGE_V), PAGE_HOST | PAGE_U | PAGE_RW | PAGE_V);
		assert_eq!(usage.committed, 1);
		free_anonymous_page(&mut usage, entry);
	}

	#[test]
	fn recycled_pages_are_zeroed() {
		let mut usage = MemUsage::default();
		let entry = alloc_page(&mut usage).unwrap();
		let host = (entry & PAGE_TA) as usize as *mut u8;
		unsafe {
			core::ptr::write_bytes(host, 0x5a, PAGE_SIZE);
		}
		free_anonymous_page(&mut usage, entry);
		assert_eq!(usage.freed, 1);
		// Whatever the pool hands out next, recycled or fresh, must read
		// as zeros
		let next = alloc_page(&mut usage).unwrap();
		let page = unsafe {
			core::slice::from_raw_parts((next & PAGE_TA) as usize as *const u8, PAGE_SIZE)
		};
		assert!(page.iter().all(|&b| b == 0));
		free_anonymous_page(&mut usage, next);
	}

	#[test]
	fn table_pages_not_guest_readable() {
		let mut usage = MemUsage::default();
		let entry = alloc_page_table(&mut usage).unwrap();
		assert_eq!(entry & PAGE_U, 0);
		assert_eq!(usage.tables, 1);
		free_page_table(&mut usage, (entry & PAGE_TA) as usize);
		assert_eq!(usage.tables, 0);
	}
}
