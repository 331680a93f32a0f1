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

//! Compile-time constants of the emulated machine and its host layout.

/// Size in bytes of a guest page.
pub const PAGE_SIZE: usize = 4096;
/// Number of low bits selecting a byte within a guest page.
pub const PAGE_SHIFT: u32 = 12;

/// Number of significant bits in a guest virtual address.
pub const VIRTUAL_BITS: u32 = 48;
/// Size in bytes of the guest virtual address space.
pub const MAX_VIRTUAL: u64 = 1 << VIRTUAL_BITS;
/// Exclusive upper bound of a canonical positive guest address.
pub const GUEST_END: i64 = 1 << (VIRTUAL_BITS - 1);

/// Start of the precious host virtual-address window the big arena carves
/// regions from.
///
/// The window is chosen far from the emulator's own `.bss` and libc heap,
/// yet low enough that emitted code can reach guest memory with
/// displacement-limited addressing.
pub const PRECIOUS_START: usize = 0x0100_0000_0000;
/// Exclusive end of the precious window.
pub const PRECIOUS_END: usize = 0x0200_0000_0000;

/// Offset between a guest virtual address and its host image in linear
/// mode: `to_host(v) = v + SKEW`.
///
/// Zero on hosts that let us map low addresses; hosts that reserve the low
/// part of the address space for themselves get a nonzero skew instead.
pub const SKEW: i64 = 0;

/// Size in bytes of the direct-addressed real-mode buffer.
pub const REAL_SIZE: usize = 0x100_0000;

/// Lowest thread id handed to cloned guest threads.
pub const MIN_THREAD_ID: i32 = 0x40_0000;
/// Number of thread ids available to cloned guest threads. Power of two so
/// the allocator can mask instead of dividing.
pub const MAX_THREAD_IDS: u32 = 1 << 20;

/// Size in bytes of the System V ABI redzone below the guest stack
/// pointer. Signal frames must not clobber it.
pub const REDZONE_SIZE: usize = 128;

/// Number of pages the page pool requests from the arena at once.
pub const POOL_BATCH: usize = 64;

/// Number of signals in the guest ABI.
pub const SIGNAL_COUNT: usize = 64;

/// One greater than the highest file descriptor the guest may hold open.
pub const OPEN_MAX: u32 = 1024;

/// Number of guest resource limits (x86-64 Linux `RLIM_NLIMITS`).
pub const RLIM_NLIMITS: usize = 16;
/// Index of the address-space size limit.
pub const RLIMIT_AS: usize = 9;
/// Value meaning "no limit".
pub const RLIM_INFINITY: u64 = u64::MAX;
