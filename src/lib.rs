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

//! Mimic runs x86-64 Linux programs on arbitrary host operating systems by
//! exposing a virtual address space to the guest and translating guest
//! accesses to host memory.
//!
//! This crate is the guest memory and process model:
//! - A four-level page table mapping 48-bit guest virtual addresses to
//!   host-accessible storage ([`memory::vmem`])
//! - A page arena sourcing 4096-byte pages from a contiguous host region
//!   ([`memory::arena`], [`memory::pool`])
//! - The system/machine lifecycle: one [`process::System`] per guest
//!   process, one [`process::Machine`] per guest thread ([`process`])
//! - Signal delivery: pending masks, handler dispatch, frame construction
//!   and sigreturn ([`process::signal`])
//!
//! The instruction decoder, the JIT and the overlay filesystem are external
//! collaborators; this crate only carries the state they poll (TLB and
//! opcode-cache invalidation flags).

pub mod errno;
pub mod file;
pub mod limits;
pub mod memory;
pub mod process;
pub mod syscall;
