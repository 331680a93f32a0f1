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

//! A memory space is the guest-visible virtual address space of one guest
//! process. It owns the page-table root and implements the interval
//! operations the mmap family of guest syscalls is built on.
//!
//! Two addressing regimes exist:
//! - **Linear**: guest virtual addresses are a fixed offset from host
//!   addresses (`to_host(v) = v + SKEW`), so guest memory can be touched
//!   with native loads. Reservations become real host mappings at the
//!   skewed address.
//! - **Non-linear**: guest pages are backed by pool pages committed on
//!   first access, or by individually mapped "mug" pages for shared and
//!   file mappings. Nothing about a guest address predicts its host
//!   address.
//!
//! Guest protection is enforced in software against the page-table
//! attribute bits, never by host hardware: the host never receives
//! `PROT_EXEC`, and host-side protection may be wider than what the guest
//! sees.

pub mod copy;

use crate::{
	errno,
	errno::{from_host, host_errno, EResult},
	limits::{GUEST_END, MAX_VIRTUAL, PAGE_SHIFT, PAGE_SIZE, REAL_SIZE},
	memory::{
		arena, host_page_size, pool,
		stats::MemUsage,
		to_host,
		vmem,
		vmem::{
			Entry, Walk, PAGE_EOF, PAGE_HOST, PAGE_KEY, PAGE_MAP, PAGE_MUG, PAGE_RSRV, PAGE_RW,
			PAGE_TA, PAGE_U, PAGE_V, PAGE_XD, TABLE_ENTRIES,
		},
		VirtAddr,
	},
};
use core::{cmp::min, ffi::c_void, sync::atomic::Ordering};
use std::sync::Mutex;

/// Page can be read.
pub const PROT_READ: i32 = 0x1;
/// Page can be written.
pub const PROT_WRITE: i32 = 0x2;
/// Page can be executed.
pub const PROT_EXEC: i32 = 0x4;

/// Schedule the writeback and return.
pub const MS_ASYNC: i32 = 0x1;
/// Invalidate other mappings of the same file.
pub const MS_INVALIDATE: i32 = 0x2;
/// Wait for the writeback to finish.
pub const MS_SYNC: i32 = 0x4;

/// Inner state of the memory space: the page-table root and the usage
/// counters derived from it.
struct AddrSpace {
	/// Host address of the top-level page table.
	root: usize,
	/// Usage counters. `vss`/`rss` mirror the leaf population.
	usage: MemUsage,
	/// Upper bound on `vss`, in bytes. Clamped against `RLIMIT_AS`.
	max_virtual: u64,
	/// Where [`MemSpace::find`] starts scanning when the caller has no
	/// preference.
	automap_hint: VirtAddr,
}

/// The guest's virtual address space.
pub struct MemSpace {
	state: Mutex<AddrSpace>,
	/// Linear addressing; fixed at creation. Forced off when the host
	/// page size is not 4 KiB, since the linear image cannot then be
	/// carved at guest-page granularity.
	linear: bool,
	/// Base of the direct-addressed real-mode buffer, if this space
	/// belongs to a real-mode system.
	real: Option<usize>,
}

/// Translates guest protection bits into page-table key bits.
///
/// Absence of `PROT_EXEC` *sets* the execute-disable bit.
fn prot_to_key(prot: i32) -> Entry {
	let mut key = 0;
	if prot & PROT_READ != 0 {
		key |= PAGE_U;
	}
	if prot & PROT_WRITE != 0 {
		key |= PAGE_RW;
	}
	if prot & PROT_EXEC == 0 {
		key |= PAGE_XD;
	}
	key
}

/// Translates guest protection into host protection.
///
/// The host never gets `PROT_EXEC`: the emulator does not execute guest
/// memory natively, and W^X hosts would reject it.
fn host_prot(prot: i32) -> i32 {
	let mut hp = 0;
	if prot & PROT_READ != 0 {
		hp |= libc::PROT_READ;
	}
	if prot & PROT_WRITE != 0 {
		hp |= libc::PROT_WRITE;
	}
	hp
}

/// Number of pages from `addr` to the end of the aligned `1 << shift`
/// span containing it.
fn span_pages(addr: VirtAddr, shift: u32) -> u64 {
	let span = 1i64 << shift;
	((span - (addr.0 & (span - 1))) >> PAGE_SHIFT) as u64
}

/// Appends `[start, start+len)` to `ranges`, merging with the previous
/// range when contiguous, so per-leaf host actions batch into one call.
fn push_range(ranges: &mut Vec<(usize, usize)>, start: usize, len: usize) {
	if let Some(last) = ranges.last_mut() {
		if last.0 + last.1 == start {
			last.1 += len;
			return;
		}
	}
	ranges.push((start, len));
}

/// Host extent of a mug leaf: the mug's own mapping starts at the host
/// page below the stored address and covers one guest page past it.
fn mug_extent(entry: Entry) -> (usize, usize) {
	let ta = (entry & PAGE_TA) as usize;
	let start = ta & !(host_page_size() - 1);
	(start, (ta - start) + PAGE_SIZE)
}

impl MemSpace {
	/// Creates an empty memory space.
	///
	/// Arguments:
	/// - `linear` requests linear addressing
	/// - `real` allocates the page-aligned real-mode buffer for direct
	///   16-bit addressing
	pub fn new(linear: bool, real: bool) -> EResult<Self> {
		let mut usage = MemUsage::default();
		let root = vmem::alloc_root(&mut usage)?;
		let real = real
			.then(|| {
				arena::alloc_big(
					REAL_SIZE,
					libc::PROT_READ | libc::PROT_WRITE,
					libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
					-1,
					0,
				)
			})
			.transpose()?
			.map(|p| p.as_ptr() as usize);
		let linear = linear && host_page_size() == PAGE_SIZE;
		Ok(Self {
			state: Mutex::new(AddrSpace {
				root,
				usage,
				max_virtual: MAX_VIRTUAL,
				automap_hint: VirtAddr(PAGE_SIZE as i64 * 16),
			}),
			linear,
			real,
		})
	}

	/// Tells whether this space uses linear addressing.
	pub fn is_linear(&self) -> bool {
		self.linear
	}

	/// Returns a snapshot of the usage counters.
	pub fn usage(&self) -> MemUsage {
		self.state.lock().unwrap().usage
	}

	/// Clamps the virtual set size, in bytes. Called when the guest
	/// adjusts `RLIMIT_AS`.
	pub fn set_max_virtual(&self, bytes: u64) {
		self.state.lock().unwrap().max_virtual = min(bytes, MAX_VIRTUAL);
	}

	/// Returns the hint [`Self::find`] will use next.
	pub fn automap_hint(&self) -> VirtAddr {
		self.state.lock().unwrap().automap_hint
	}

	/// Validates a guest interval and returns its length in pages.
	///
	/// `host_align` additionally requires host-page alignment of the base
	/// (and of `off`), which linear file mappings need.
	fn valid_interval(&self, virt: VirtAddr, size: u64, off: i64, host_align: bool) -> EResult<u64> {
		if size == 0 || !virt.is_aligned_to(PAGE_SIZE) {
			return Err(errno!(EINVAL));
		}
		if virt.0 < -GUEST_END {
			return Err(errno!(EINVAL));
		}
		let end = virt.0.checked_add(size as i64).ok_or(errno!(EINVAL))?;
		if end > GUEST_END {
			return Err(errno!(EINVAL));
		}
		if self.linear {
			if virt.0 <= 0 {
				return Err(errno!(ENOTSUP));
			}
			let host_page = host_page_size();
			if host_align && (!virt.is_aligned_to(host_page) || off & (host_page as i64 - 1) != 0)
			{
				return Err(errno!(EINVAL));
			}
			if arena::overlaps_precious(to_host(virt), size as usize) {
				return Err(errno!(ENOMEM));
			}
		}
		Ok(size.div_ceil(PAGE_SIZE as u64))
	}

	/// Unpopulates `[virt, virt + pages * 4096)`.
	///
	/// Anonymous pool pages go back to the pool and mug pages back to the
	/// host immediately; linear map leaves only accumulate their host
	/// ranges into `ranges` so the caller can batch (or atomically
	/// replace) the host-side unmapping.
	///
	/// Returns `true` when every page of the interval was populated by a
	/// linear map leaf, i.e. the interval can be replaced by one
	/// `MAP_FIXED` call.
	fn remove(st: &mut AddrSpace, virt: VirtAddr, pages: u64, ranges: &mut Vec<(usize, usize)>) -> bool {
		let mut all_linear = true;
		let mut i = 0;
		while i < pages {
			let addr = virt + (i as usize * PAGE_SIZE);
			let slot = match vmem::walk(st.root, addr) {
				Walk::Missing(shift) => {
					all_linear = false;
					i += span_pages(addr, shift);
					continue;
				}
				Walk::Leaf(slot) => slot,
			};
			let entry = slot.load(Ordering::Acquire);
			i += 1;
			if entry & PAGE_V == 0 {
				all_linear = false;
				continue;
			}
			slot.store(0, Ordering::Release);
			st.usage.vss -= 1;
			if entry & PAGE_RSRV != 0 {
				st.usage.reserved -= 1;
			} else {
				st.usage.rss -= 1;
			}
			st.usage.memchurn += 1;
			if entry & PAGE_MUG != 0 {
				let (start, len) = mug_extent(entry);
				unsafe {
					libc::munmap(start as *mut c_void, len);
				}
				st.usage.freed += 1;
				all_linear = false;
			} else if entry & (PAGE_HOST | PAGE_MAP) == PAGE_HOST | PAGE_MAP {
				push_range(ranges, (entry & PAGE_TA) as usize, PAGE_SIZE);
				st.usage.freed += 1;
			} else if entry & PAGE_HOST != 0 {
				pool::free_anonymous_page(&mut st.usage, entry);
				all_linear = false;
			} else {
				// Bare reservation, or real-mode backing: nothing held on
				// the host side
				all_linear = false;
			}
		}
		all_linear
	}

	/// Installs leaves for `[virt, virt + pages * 4096)`, filling
	/// consecutive slots of each level-12 table in one descent.
	fn insert_leaves<F>(st: &mut AddrSpace, virt: VirtAddr, pages: u64, mut make: F) -> EResult<()>
	where
		F: FnMut(u64, &mut MemUsage) -> EResult<Entry>,
	{
		let mut i = 0;
		while i < pages {
			let addr = virt + (i as usize * PAGE_SIZE);
			let table = vmem::walk_create(st.root, addr, &mut st.usage)?;
			let index = vmem::table_index(addr, 12);
			let run = min((TABLE_ENTRIES - index) as u64, pages - i);
			for k in 0..run {
				let entry = make(i + k, &mut st.usage)?;
				table[index + k as usize].store(entry, Ordering::Release);
				st.usage.vss += 1;
			}
			i += run;
		}
		Ok(())
	}

	/// Maps `[virt, virt + size)` in the guest.
	///
	/// Arguments:
	/// - `prot` is the guest protection
	/// - `fd` is the host file descriptor backing the mapping, or `-1`
	/// - `off` is the offset in `fd`
	/// - `shared` makes stores visible through the backing object
	///
	/// Any previous mapping over the interval is replaced, the way Linux
	/// `MAP_FIXED` replaces. In linear mode the replacement is atomic
	/// when the old interval was one contiguous linear mapping; otherwise
	/// the old host ranges must be unmapped first, and a host failure
	/// after that point is unrecoverable.
	pub fn reserve(
		&self,
		virt: VirtAddr,
		size: u64,
		prot: i32,
		fd: i32,
		off: i64,
		shared: bool,
	) -> EResult<()> {
		let pages = self.valid_interval(virt, size, off, fd >= 0)?;
		let key = prot_to_key(prot);
		let mut st = self.state.lock().unwrap();
		if (st.usage.vss + pages).saturating_mul(PAGE_SIZE as u64) > st.max_virtual {
			return Err(errno!(ENOMEM));
		}
		let mut ranges = Vec::new();
		let all_linear = Self::remove(&mut st, virt, pages, &mut ranges);
		if self.linear {
			let host = to_host(virt);
			let len = pages as usize * PAGE_SIZE;
			let mut flags = if shared { libc::MAP_SHARED } else { libc::MAP_PRIVATE };
			if fd < 0 {
				flags |= libc::MAP_ANONYMOUS;
			}
			if all_linear && ranges.len() == 1 && ranges[0] == (host, len) {
				// The whole interval was one linear mapping: let the host
				// kernel replace it atomically
				let p = unsafe {
					libc::mmap(
						host as *mut c_void,
						len,
						host_prot(prot),
						flags | libc::MAP_FIXED,
						fd,
						off as libc::off_t,
					)
				};
				if p == libc::MAP_FAILED {
					return Err(from_host(host_errno()));
				}
			} else {
				// Holes or foreign pages: clear what we hold, then demand
				// the interval as greenfield. Once the first munmap lands
				// the host address space no longer matches the page
				// tables, so failure past that is fatal.
				let mut past_no_return = false;
				for (start, rlen) in ranges.drain(..) {
					let r = unsafe { libc::munmap(start as *mut c_void, rlen) };
					if r != 0 {
						arena::panic_due_to_mmap("munmap of linear range");
					}
					past_no_return = true;
				}
				match arena::demand_at(host, len, host_prot(prot), flags, fd, off) {
					Ok(()) => {}
					Err(_) if past_no_return => {
						arena::panic_due_to_mmap("linear replacement mapping");
					}
					Err(e) => return Err(e),
				}
			}
			Self::insert_leaves(&mut st, virt, pages, |i, usage| {
				usage.rss += 1;
				let page_host = host + i as usize * PAGE_SIZE;
				let mut entry = (page_host as Entry & PAGE_TA) | PAGE_HOST | PAGE_MAP | key | PAGE_V;
				if fd >= 0 && i == pages - 1 {
					entry |= PAGE_EOF;
				}
				Ok(entry)
			})?;
		} else if fd >= 0 || shared {
			// Shared or file-backed pages each get their own host mapping
			let host_page = host_page_size();
			let mut flags = if shared { libc::MAP_SHARED } else { libc::MAP_PRIVATE };
			if fd < 0 {
				flags |= libc::MAP_ANONYMOUS;
			}
			Self::insert_leaves(&mut st, virt, pages, |i, usage| {
				let foff = off + (i as i64) * PAGE_SIZE as i64;
				let off_rounded = foff & !(host_page as i64 - 1);
				let skew = (foff - off_rounded) as usize;
				let mug = arena::alloc_big(PAGE_SIZE + skew, host_prot(prot), flags, fd, off_rounded)?;
				usage.reserved += 1;
				let ta = (mug.as_ptr() as usize + skew) as Entry & PAGE_TA;
				let mut entry = ta | PAGE_HOST | PAGE_MAP | PAGE_MUG | key | PAGE_V | PAGE_RSRV;
				if fd >= 0 && i == pages - 1 {
					entry |= PAGE_EOF;
				}
				Ok(entry)
			})?;
		} else {
			// Anonymous private: record the intent, commit on first access
			Self::insert_leaves(&mut st, virt, pages, |_, usage| {
				usage.reserved += 1;
				Ok(key | PAGE_V | PAGE_RSRV)
			})?;
		}
		log::trace!("reserve {virt:?}+{size:#x} prot={prot:#x} fd={fd} -> vss={}", st.usage.vss);
		Self::maybe_cleanse(&mut st);
		Ok(())
	}

	/// Unmaps `[virt, virt + size)` in the guest.
	pub fn free(&self, virt: VirtAddr, size: u64) -> EResult<()> {
		let pages = self.valid_interval(virt, size, 0, false)?;
		let mut st = self.state.lock().unwrap();
		let mut ranges = Vec::new();
		Self::remove(&mut st, virt, pages, &mut ranges);
		for (start, len) in ranges {
			unsafe {
				libc::munmap(start as *mut c_void, len);
			}
		}
		log::trace!("free {virt:?}+{size:#x} -> vss={}", st.usage.vss);
		Self::maybe_cleanse(&mut st);
		Ok(())
	}

	/// Changes guest protection over `[virt, virt + size)`.
	///
	/// The whole interval must be mapped. Host-side protection follows
	/// for host-backed leaves, widened to read/write when the interval is
	/// not host-page-exact so a foreign page is never clamped; the guest's
	/// logical protection still takes effect through the attribute bits.
	pub fn protect(&self, virt: VirtAddr, size: u64, prot: i32) -> EResult<()> {
		let pages = self.valid_interval(virt, size, 0, false)?;
		let key = prot_to_key(prot);
		let mut st = self.state.lock().unwrap();
		if !Self::fully_mapped_locked(&st, virt, pages) {
			return Err(errno!(ENOMEM));
		}
		let host_page = host_page_size();
		let mut hp = host_prot(prot);
		if self.linear && (!virt.is_aligned_to(host_page) || size & (host_page as u64 - 1) != 0) {
			hp = libc::PROT_READ | libc::PROT_WRITE;
		}
		let mut first_err = None;
		let mut ranges = Vec::new();
		for i in 0..pages {
			let addr = virt + (i as usize * PAGE_SIZE);
			let Walk::Leaf(slot) = vmem::walk(st.root, addr) else {
				unreachable!();
			};
			let entry = slot.load(Ordering::Acquire);
			debug_assert_ne!(entry & PAGE_V, 0);
			if entry & PAGE_MUG != 0 {
				let (start, len) = mug_extent(entry);
				let r = unsafe { libc::mprotect(start as *mut c_void, len, hp) };
				if r != 0 && first_err.is_none() {
					first_err = Some(host_errno());
				}
			} else if entry & (PAGE_HOST | PAGE_MAP) == PAGE_HOST | PAGE_MAP {
				push_range(&mut ranges, (entry & PAGE_TA) as usize, PAGE_SIZE);
			}
			slot.store((entry & !PAGE_KEY) | key, Ordering::Release);
		}
		for (start, len) in ranges {
			let r = unsafe { libc::mprotect(start as *mut c_void, len, hp) };
			if r != 0 && first_err.is_none() {
				first_err = Some(host_errno());
			}
		}
		match first_err {
			Some(e) => Err(from_host(e)),
			None => Ok(()),
		}
	}

	/// Writes file-backed pages of `[virt, virt + size)` back to their
	/// files.
	pub fn sync(&self, virt: VirtAddr, size: u64, flags: i32) -> EResult<()> {
		if flags & !(MS_ASYNC | MS_INVALIDATE | MS_SYNC) != 0
			|| flags & (MS_ASYNC | MS_SYNC) == MS_ASYNC | MS_SYNC
		{
			return Err(errno!(EINVAL));
		}
		let mut hflags = 0;
		if flags & MS_ASYNC != 0 {
			hflags |= libc::MS_ASYNC;
		}
		if flags & MS_INVALIDATE != 0 {
			hflags |= libc::MS_INVALIDATE;
		}
		if flags & MS_SYNC != 0 {
			hflags |= libc::MS_SYNC;
		}
		// In linear mode the host call wants host-page granularity; widen
		// the interval rather than failing
		let (virt, size) = if self.linear {
			let host_page = host_page_size();
			let down = virt.align_down(host_page);
			(down, size + (virt - down) as u64)
		} else {
			(virt, size)
		};
		let pages = self.valid_interval(virt, size, 0, false)?;
		let st = self.state.lock().unwrap();
		if !Self::fully_mapped_locked(&st, virt, pages) {
			return Err(errno!(ENOMEM));
		}
		let mut first_err = None;
		let mut ranges = Vec::new();
		for i in 0..pages {
			let addr = virt + (i as usize * PAGE_SIZE);
			let Some(entry) = vmem::lookup(st.root, addr) else {
				unreachable!();
			};
			if entry & PAGE_MUG != 0 {
				let (start, len) = mug_extent(entry);
				let r = unsafe { libc::msync(start as *mut c_void, len, hflags) };
				if r != 0 && first_err.is_none() {
					first_err = Some(host_errno());
				}
			} else if entry & (PAGE_HOST | PAGE_MAP) == PAGE_HOST | PAGE_MAP {
				push_range(&mut ranges, (entry & PAGE_TA) as usize, PAGE_SIZE);
			}
		}
		for (start, len) in ranges {
			let r = unsafe { libc::msync(start as *mut c_void, len, hflags) };
			if r != 0 && first_err.is_none() {
				first_err = Some(host_errno());
			}
		}
		match first_err {
			Some(e) => Err(from_host(e)),
			None => Ok(()),
		}
	}

	/// Finds a hole of at least `size` bytes, scanning upward from
	/// `hint`.
	///
	/// Walking an unpopulated level skips its whole subtree, so the scan
	/// is proportional to the number of mappings, not the address range.
	pub fn find(&self, hint: VirtAddr, size: u64) -> EResult<VirtAddr> {
		if size == 0 {
			return Err(errno!(EINVAL));
		}
		let pages = size.div_ceil(PAGE_SIZE as u64);
		let len = pages * PAGE_SIZE as u64;
		let mut st = self.state.lock().unwrap();
		let floor = if hint.0 > PAGE_SIZE as i64 { hint.0 } else { PAGE_SIZE as i64 };
		let mut virt = VirtAddr(floor).align_down(PAGE_SIZE);
		if virt.0 < floor {
			virt = virt + PAGE_SIZE;
		}
		loop {
			let end = virt.0.checked_add(len as i64).ok_or(errno!(ENOMEM))?;
			if end > GUEST_END {
				return Err(errno!(ENOMEM));
			}
			if self.linear && arena::overlaps_precious(to_host(virt), len as usize) {
				virt = crate::memory::to_guest(crate::limits::PRECIOUS_END);
				continue;
			}
			let mut got = 0;
			let blocked = loop {
				if got >= pages {
					break None;
				}
				let addr = virt + (got as usize * PAGE_SIZE);
				match vmem::walk(st.root, addr) {
					Walk::Missing(shift) => got += span_pages(addr, shift),
					Walk::Leaf(slot) => {
						if slot.load(Ordering::Acquire) & PAGE_V == 0 {
							got += 1;
						} else {
							break Some(got);
						}
					}
				}
			};
			match blocked {
				None => {
					st.automap_hint = virt + len as usize;
					return Ok(virt);
				}
				Some(got) => {
					virt = virt + ((got as usize + 1) * PAGE_SIZE);
				}
			}
		}
	}

	fn fully_mapped_locked(st: &AddrSpace, virt: VirtAddr, pages: u64) -> bool {
		for i in 0..pages {
			let addr = virt + (i as usize * PAGE_SIZE);
			if vmem::lookup(st.root, addr).is_none() {
				return false;
			}
		}
		true
	}

	/// Tells whether every page of `[virt, virt + size)` is populated.
	pub fn is_fully_mapped(&self, virt: VirtAddr, size: u64) -> bool {
		let Ok(pages) = self.valid_interval(virt, size, 0, false) else {
			return false;
		};
		let st = self.state.lock().unwrap();
		Self::fully_mapped_locked(&st, virt, pages)
	}

	/// Tells whether no page of `[virt, virt + size)` is populated.
	///
	/// In linear mode, intervals overlapping the precious window count as
	/// occupied: the arena owns that part of the host address space.
	pub fn is_fully_unmapped(&self, virt: VirtAddr, size: u64) -> bool {
		if size == 0 || virt.0 < -GUEST_END || virt.0.checked_add(size as i64).is_none() {
			return false;
		}
		if self.linear && arena::overlaps_precious(to_host(virt), size as usize) {
			return false;
		}
		let pages = size.div_ceil(PAGE_SIZE as u64);
		let st = self.state.lock().unwrap();
		let mut i = 0;
		while i < pages {
			let addr = virt + (i as usize * PAGE_SIZE);
			match vmem::walk(st.root, addr) {
				Walk::Missing(shift) => i += span_pages(addr, shift),
				Walk::Leaf(slot) => {
					if slot.load(Ordering::Acquire) & PAGE_V != 0 {
						return false;
					}
					i += 1;
				}
			}
		}
		true
	}

	/// Returns deferred anonymous pages to the pool. Machine teardown
	/// drains its free-later list through this.
	pub fn free_deferred(&self, entries: &[Entry]) {
		if entries.is_empty() {
			return;
		}
		let mut st = self.state.lock().unwrap();
		for &entry in entries {
			pool::free_anonymous_page(&mut st.usage, entry);
		}
	}

	fn maybe_cleanse(st: &mut AddrSpace) {
		if st.usage.memchurn != 0 && st.usage.memchurn * 2 >= st.usage.rss {
			vmem::free_page_tables(st.root, &mut st.usage);
			st.usage.memchurn = 0;
		}
	}

	/// Collapses empty page-table levels when unmap churn has built up.
	pub fn cleanse(&self) {
		let mut st = self.state.lock().unwrap();
		Self::maybe_cleanse(&mut st);
	}
}

impl Drop for MemSpace {
	fn drop(&mut self) {
		let mut st = self.state.lock().unwrap();
		let mut ranges = Vec::new();
		let pages = MAX_VIRTUAL >> PAGE_SHIFT;
		Self::remove(&mut st, VirtAddr(-GUEST_END), pages, &mut ranges);
		for (start, len) in ranges {
			unsafe {
				libc::munmap(start as *mut c_void, len);
			}
		}
		vmem::free_root(st.root, &mut st.usage);
		// The real-mode buffer and the pool pages stay with the arena,
		// whose atexit hook releases them
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn space() -> MemSpace {
		MemSpace::new(false, false).unwrap()
	}

	#[test]
	fn validation() {
		let s = space();
		assert_eq!(s.reserve(VirtAddr(0x1001), 0x1000, PROT_READ, -1, 0, false), Err(errno!(EINVAL)));
		assert_eq!(s.reserve(VirtAddr(0x1000), 0, PROT_READ, -1, 0, false), Err(errno!(EINVAL)));
		assert_eq!(
			s.reserve(VirtAddr(GUEST_END - 0x1000), 0x2000, PROT_READ, -1, 0, false),
			Err(errno!(EINVAL))
		);
	}

	#[test]
	fn reserve_then_predicates() {
		let s = space();
		let virt = VirtAddr(0x10000);
		s.reserve(virt, 0x4000, PROT_READ | PROT_WRITE, -1, 0, false).unwrap();
		assert!(s.is_fully_mapped(virt, 0x4000));
		assert!(!s.is_fully_unmapped(virt, 0x4000));
		assert!(!s.is_fully_mapped(virt, 0x5000));
		s.free(virt, 0x4000).unwrap();
		assert!(s.is_fully_unmapped(virt, 0x4000));
		assert!(!s.is_fully_mapped(virt, 0x4000));
	}

	#[test]
	fn anonymous_reservation_is_lazy() {
		let s = space();
		let virt = VirtAddr(0x10000);
		s.reserve(virt, 0x4000, PROT_READ | PROT_WRITE, -1, 0, false).unwrap();
		let usage = s.usage();
		assert_eq!(usage.vss, 4);
		assert_eq!(usage.rss, 0);
		assert_eq!(usage.reserved, 4);
	}

	#[test]
	fn counters_track_leaves() {
		let s = space();
		s.reserve(VirtAddr(0x10000), 0x4000, PROT_READ | PROT_WRITE, -1, 0, false).unwrap();
		s.reserve(VirtAddr(0x40000), 0x2000, PROT_READ, -1, 0, false).unwrap();
		assert_eq!(s.usage().vss, 6);
		s.free(VirtAddr(0x10000), 0x2000).unwrap();
		assert_eq!(s.usage().vss, 4);
	}

	#[test]
	fn overlap_replaces() {
		let s = space();
		s.reserve(VirtAddr(0x20000), 0x8000, PROT_READ | PROT_WRITE, -1, 0, false).unwrap();
		// Re-reserving an inner window must not leak or double-count
		s.reserve(VirtAddr(0x22000), 0x2000, PROT_READ, -1, 0, false).unwrap();
		let usage = s.usage();
		assert_eq!(usage.vss, 8);
		// Protection of the inner window changed, the rest kept
		let key_inner = prot_to_key(PROT_READ);
		let key_outer = prot_to_key(PROT_READ | PROT_WRITE);
		let st = s.state.lock().unwrap();
		for (page, key) in [(0x20, key_outer), (0x21, key_outer), (0x22, key_inner), (0x23, key_inner), (0x24, key_outer)] {
			let entry = vmem::lookup(st.root, VirtAddr(page << 12)).unwrap();
			assert_eq!(entry & PAGE_KEY, key, "page {page:#x}");
		}
	}

	#[test]
	fn reserve_is_idempotent_on_counters() {
		let s = space();
		let virt = VirtAddr(0x30000);
		s.reserve(virt, 0x10000, PROT_READ | PROT_WRITE, -1, 0, false).unwrap();
		let first = s.usage();
		s.reserve(virt, 0x10000, PROT_READ | PROT_WRITE, -1, 0, false).unwrap();
		let second = s.usage();
		assert_eq!(first.vss, second.vss);
		assert_eq!(first.rss, second.rss);
		assert_eq!(first.reserved, second.reserved);
	}

	#[test]
	fn protect_rewrites_keys() {
		let s = space();
		let virt = VirtAddr(0x10000);
		s.reserve(virt, 0x4000, PROT_READ | PROT_WRITE, -1, 0, false).unwrap();
		s.protect(virt, 0x4000, PROT_READ).unwrap();
		let st = s.state.lock().unwrap();
		for i in 0..4 {
			let entry = vmem::lookup(st.root, virt + i * PAGE_SIZE).unwrap();
			assert_eq!(entry & PAGE_U, PAGE_U);
			assert_eq!(entry & PAGE_RW, 0);
			assert_eq!(entry & PAGE_XD, PAGE_XD);
		}
	}

	#[test]
	fn protect_requires_full_mapping() {
		let s = space();
		s.reserve(VirtAddr(0x10000), 0x2000, PROT_READ, -1, 0, false).unwrap();
		assert_eq!(s.protect(VirtAddr(0x10000), 0x4000, PROT_READ), Err(errno!(ENOMEM)));
	}

	#[test]
	fn find_returns_unmapped_hole() {
		let s = space();
		s.reserve(VirtAddr(0x10000), 0x4000, PROT_READ, -1, 0, false).unwrap();
		let hole = s.find(VirtAddr(0x10000), 0x4000).unwrap();
		assert!(hole.0 >= 0x10000);
		assert!(s.is_fully_unmapped(hole, 0x4000));
	}

	#[test]
	fn find_skips_existing_mappings() {
		let s = space();
		// Map two pages with a two-page hole between them
		s.reserve(VirtAddr(0x10000), 0x1000, PROT_READ, -1, 0, false).unwrap();
		s.reserve(VirtAddr(0x13000), 0x1000, PROT_READ, -1, 0, false).unwrap();
		let hole = s.find(VirtAddr(0x10000), 0x2000).unwrap();
		assert_eq!(hole, VirtAddr(0x11000));
		// A larger request must skip past both
		let hole = s.find(VirtAddr(0x10000), 0x3000).unwrap();
		assert!(hole.0 >= 0x14000);
	}

	#[test]
	fn churn_triggers_table_collapse() {
		let s = space();
		let virt = VirtAddr(0x100000);
		s.reserve(virt, 0x40000, PROT_READ | PROT_WRITE, -1, 0, false).unwrap();
		let tables_mapped = s.usage().tables;
		s.free(virt, 0x40000).unwrap();
		// Everything was unmapped, so the cleanse pass runs and the
		// interior tables collapse back to just the root
		assert!(s.usage().tables < tables_mapped);
		assert_eq!(s.usage().memchurn, 0);
	}
}
