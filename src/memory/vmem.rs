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

//! The guest page table: a four-level radix tree over the 48-bit guest
//! virtual address space.
//!
//! Each element is a 4 KiB page of 512 little-endian 64-bit entries. The
//! position of an entry in the tree determines the guest address it maps:
//! a guest address is split at bits 39, 30, 21 and 12, nine bits per
//! level; the level-12 table holds the leaves.
//!
//! A leaf entry packs a host address (its page-aligned part, masked by
//! [`PAGE_TA`]) together with attribute bits. Addresses are page-aligned,
//! so the low 12 bits are free for attributes, and host user addresses
//! never reach the top bits, freeing those too. Interior entries carry
//! only [`PAGE_V`] plus the host address of the child table.
//!
//! The emulator is the sole walker: guest privilege checks happen against
//! these attribute bits in software, never in host hardware. Entries are
//! read and written with acquire/release atomics so a concurrent reader
//! observes either the old or the new entry, never tearing.

use crate::{
	errno::EResult,
	memory::{pool, stats::MemUsage, VirtAddr},
};
use core::sync::atomic::{AtomicU64, Ordering};

/// A page-table entry.
pub type Entry = u64;

/// **Page flag**: the entry is populated.
pub const PAGE_V: Entry = 1 << 0;
/// **Page flag**: the page is guest-writable.
pub const PAGE_RW: Entry = 1 << 1;
/// **Page flag**: the page is guest-readable (present to the guest).
pub const PAGE_U: Entry = 1 << 2;
/// **Page flag**: the host address stored in this entry is directly
/// usable.
pub const PAGE_HOST: Entry = 1 << 9;
/// **Page flag**: backed by a host mapping (file or shared anonymous).
pub const PAGE_MAP: Entry = 1 << 10;
/// **Page flag**: "mugged" — individually host-mmap'd, not part of the
/// linear arena. Used when the host page size exceeds 4 KiB, and for
/// fd/shared mappings in non-linear mode.
pub const PAGE_MUG: Entry = 1 << 11;
/// **Page flag**: reserved only, not yet committed.
pub const PAGE_RSRV: Entry = 1 << 52;
/// **Page flag**: the file-backed mapping ends in this page.
pub const PAGE_EOF: Entry = 1 << 53;
/// **Page flag**: execution of instructions from this page is disabled.
pub const PAGE_XD: Entry = 1 << 63;

/// Mask of the host-address bits in an entry.
pub const PAGE_TA: Entry = 0x000f_ffff_ffff_f000;

/// Mask of the guest protection key bits.
pub const PAGE_KEY: Entry = PAGE_U | PAGE_RW | PAGE_XD;

/// The number of entries in a table.
pub const TABLE_ENTRIES: usize = 512;

/// Bit positions splitting a guest address into per-level indices, top
/// level first.
pub const LEVEL_SHIFTS: [u32; 4] = [39, 30, 21, 12];

/// Returns the index of the element corresponding to the guest address
/// `addr` in the table at the level selecting bits `shift..shift+9`.
#[inline]
pub fn table_index(addr: VirtAddr, shift: u32) -> usize {
	((addr.0 as u64) >> shift) as usize & (TABLE_ENTRIES - 1)
}

/// Returns the host address packed in an entry.
#[inline]
pub fn entry_host(entry: Entry) -> usize {
	(entry & PAGE_TA) as usize
}

/// Returns the table stored at host address `host`.
///
/// # Safety
///
/// `host` must be the `PAGE_TA` part of a populated table entry (the root
/// included): a pool page that holds a live table. This is the crate's
/// only boundary turning packed entry integers back into memory.
#[inline]
pub unsafe fn table<'a>(host: usize) -> &'a [AtomicU64; TABLE_ENTRIES] {
	debug_assert_eq!(host & (crate::limits::PAGE_SIZE - 1), 0);
	&*(host as *const [AtomicU64; TABLE_ENTRIES])
}

/// Result of walking the tree toward one guest page.
pub enum Walk<'a> {
	/// The slot holding the page's leaf entry. The entry itself may still
	/// be zero.
	Leaf(&'a AtomicU64),
	/// No table exists on the path; the returned shift identifies the
	/// first missing level, i.e. the whole aligned `1 << shift` span
	/// around the address is unpopulated.
	Missing(u32),
}

/// Walks from the table rooted at `root` toward the leaf slot for `addr`,
/// without allocating.
pub fn walk(root: usize, addr: VirtAddr) -> Walk<'static> {
	let mut table_host = root;
	for (i, &shift) in LEVEL_SHIFTS.iter().enumerate() {
		let t = unsafe { table(table_host) };
		let slot = &t[table_index(addr, shift)];
		if i == LEVEL_SHIFTS.len() - 1 {
			return Walk::Leaf(slot);
		}
		let entry = slot.load(Ordering::Acquire);
		if entry & PAGE_V == 0 {
			return Walk::Missing(shift);
		}
		table_host = entry_host(entry);
	}
	unreachable!();
}

/// Returns the leaf entry for `addr`, or `None` when any level on the
/// path is unpopulated.
pub fn lookup(root: usize, addr: VirtAddr) -> Option<Entry> {
	match walk(root, addr) {
		Walk::Leaf(slot) => {
			let entry = slot.load(Ordering::Acquire);
			(entry & PAGE_V != 0).then_some(entry)
		}
		Walk::Missing(_) => None,
	}
}

/// Walks toward the leaf table covering `addr`, materializing missing
/// interior tables from the pool.
///
/// Returns the level-12 table; the caller indexes it with
/// [`table_index`]`(addr, 12)` and may fill consecutive slots until the
/// table runs out. Only reservation allocates tables; every other
/// operation treats a missing level as "unmapped".
pub fn walk_create(
	root: usize,
	addr: VirtAddr,
	usage: &mut MemUsage,
) -> EResult<&'static [AtomicU64; TABLE_ENTRIES]> {
	let mut table_host = root;
	for &shift in &LEVEL_SHIFTS[..LEVEL_SHIFTS.len() - 1] {
		let t = unsafe { table(table_host) };
		let slot = &t[table_index(addr, shift)];
		let entry = slot.load(Ordering::Acquire);
		table_host = if entry & PAGE_V == 0 {
			let child = pool::alloc_page_table(usage)?;
			slot.store((child & PAGE_TA) | PAGE_V, Ordering::Release);
			entry_host(child)
		} else {
			entry_host(entry)
		};
	}
	Ok(unsafe { table(table_host) })
}

/// Allocates an empty root table.
pub fn alloc_root(usage: &mut MemUsage) -> EResult<usize> {
	Ok(entry_host(pool::alloc_page_table(usage)?))
}

fn collapse_level(table_host: usize, depth: usize, usage: &mut MemUsage) -> bool {
	let t = unsafe { table(table_host) };
	let mut empty = true;
	for slot in t.iter() {
		let entry = slot.load(Ordering::Acquire);
		if entry == 0 {
			continue;
		}
		if depth + 1 < LEVEL_SHIFTS.len() {
			let child = entry_host(entry);
			if collapse_level(child, depth + 1, usage) {
				slot.store(0, Ordering::Release);
				pool::free_page_table(usage, child);
			} else {
				empty = false;
			}
		} else {
			// A populated leaf pins its whole path
			empty = false;
		}
	}
	empty
}

/// Post-order traversal reclaiming every interior table whose 512 slots
/// are all zero. The root itself is never reclaimed.
pub fn free_page_tables(root: usize, usage: &mut MemUsage) {
	collapse_level(root, 0, usage);
}

/// Tears the whole tree down, root included. The address space must
/// already be empty of host-backed leaves.
pub fn free_root(root: usize, usage: &mut MemUsage) {
	let t = unsafe { table(root) };
	for slot in t.iter() {
		let entry = slot.swap(0, Ordering::AcqRel);
		if entry & PAGE_V != 0 {
			free_subtree(entry_host(entry), 1, usage);
		}
	}
	pool::free_page_table(usage, root);
}

fn free_subtree(table_host: usize, depth: usize, usage: &mut MemUsage) {
	if depth + 1 < LEVEL_SHIFTS.len() {
		let t = unsafe { table(table_host) };
		for slot in t.iter() {
			let entry = slot.swap(0, Ordering::AcqRel);
			if entry & PAGE_V != 0 {
				free_subtree(entry_host(entry), depth + 1, usage);
			}
		}
	} else {
		// Leaf tables: the slots are page entries, not child tables; the
		// caller has already released their backing
		let t = unsafe { table(table_host) };
		for slot in t.iter() {
			slot.store(0, Ordering::Release);
		}
	}
	pool::free_page_table(usage, table_host);
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::limits::PAGE_SIZE;

	#[test]
	fn index_extraction() {
		let addr = VirtAddr(0x7fff_ffff_f000);
		assert_eq!(table_index(addr, 39), 255);
		assert_eq!(table_index(addr, 30), 511);
		assert_eq!(table_index(addr, 21), 511);
		assert_eq!(table_index(addr, 12), 511);
		// Sign extension lands negative addresses in the top half
		assert!(table_index(VirtAddr(-4096), 39) >= TABLE_ENTRIES / 2);
	}

	#[test]
	fn create_then_lookup() {
		let mut usage = MemUsage::default();
		let root = alloc_root(&mut usage).unwrap();
		let addr = VirtAddr(0x10_0000);
		assert!(lookup(root, addr).is_none());
		let t = walk_create(root, addr, &mut usage).unwrap();
		let slot = &t[table_index(addr, 12)];
		slot.store(0xdead_b000 | PAGE_V | PAGE_U, Ordering::Release);
		assert_eq!(lookup(root, addr).unwrap() & PAGE_TA, 0xdead_b000);
		// A neighbor in the same leaf table resolves to its own slot
		assert!(lookup(root, addr + PAGE_SIZE).is_none());
		slot.store(0, Ordering::Release);
		free_root(root, &mut usage);
	}

	#[test]
	fn missing_levels_report_their_span() {
		let mut usage = MemUsage::default();
		let root = alloc_root(&mut usage).unwrap();
		match walk(root, VirtAddr(0x10_0000)) {
			Walk::Missing(shift) => assert_eq!(shift, 39),
			Walk::Leaf(_) => panic!("expected missing level"),
		}
		walk_create(root, VirtAddr(0x10_0000), &mut usage).unwrap();
		match walk(root, VirtAddr(0x10_0000)) {
			Walk::Leaf(_) => {}
			Walk::Missing(_) => panic!("expected leaf slot"),
		}
		// A distant address still misses at the top
		match walk(root, VirtAddr(0x80_0000_0000)) {
			Walk::Missing(shift) => assert_eq!(shift, 39),
			Walk::Leaf(_) => panic!("expected missing level"),
		}
		free_root(root, &mut usage);
	}

	#[test]
	fn collapse_reclaims_empty_paths() {
		let mut usage = MemUsage::default();
		let root = alloc_root(&mut usage).unwrap();
		let addr = VirtAddr(0x10_0000);
		let t = walk_create(root, addr, &mut usage).unwrap();
		let slot = &t[table_index(addr, 12)];
		slot.store(0x1000 | PAGE_V, Ordering::Release);
		let tables_before = usage.tables;
		// A populated leaf pins the path
		free_page_tables(root, &mut usage);
		assert_eq!(usage.tables, tables_before);
		assert!(lookup(root, addr).is_some());
		// Clearing the leaf lets the whole path collapse
		slot.store(0, Ordering::Release);
		free_page_tables(root, &mut usage);
		assert_eq!(usage.tables, 1);
		assert!(lookup(root, addr).is_none());
		free_root(root, &mut usage);
		assert_eq!(usage.tables, 0);
	}
}
