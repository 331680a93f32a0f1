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

//! The guest register file.

use core::mem;

/// Reserved bit 1 of RFLAGS, always set.
const RFLAGS_RESERVED: u64 = 1 << 1;
/// Interrupt enable flag.
const RFLAGS_IF: u64 = 1 << 9;

/// General-purpose registers of a guest thread.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Regs {
	pub rax: u64,
	pub rbx: u64,
	pub rcx: u64,
	pub rdx: u64,
	pub rsi: u64,
	pub rdi: u64,
	pub rbp: u64,
	pub rsp: u64,
	pub r8: u64,
	pub r9: u64,
	pub r10: u64,
	pub r11: u64,
	pub r12: u64,
	pub r13: u64,
	pub r14: u64,
	pub r15: u64,
	/// Instruction pointer.
	pub rip: u64,
	/// Flags register.
	pub rflags: u64,
}

impl Regs {
	/// Register state after CPU reset.
	pub fn reset() -> Self {
		Self {
			rflags: RFLAGS_RESERVED | RFLAGS_IF,
			..Default::default()
		}
	}
}

/// One x87 register slot in the FXSAVE area.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FpReg {
	pub significand: [u16; 4],
	pub exponent: u16,
	reserved: [u16; 3],
}

/// One XMM register in the FXSAVE area.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct XmmReg {
	pub element: [u32; 4],
}

/// FPU, MMX and SSE state of a guest thread, in the 512-byte FXSAVE
/// layout the guest ABI exchanges in signal frames.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FpState {
	/// x87 control word.
	pub cwd: u16,
	/// x87 status word.
	pub swd: u16,
	/// x87 tag word.
	pub ftw: u16,
	/// Last x87 opcode.
	pub fop: u16,
	pub rip: u64,
	pub rdp: u64,
	/// SSE control and status.
	pub mxcsr: u32,
	pub mxcr_mask: u32,
	pub st: [FpReg; 8],
	pub xmm: [XmmReg; 16],
	reserved: [u32; 24],
}

impl Default for FpState {
	fn default() -> Self {
		// FPU state after FNINIT, SSE state after reset
		let mut state: Self = unsafe { mem::zeroed() };
		state.cwd = 0x37f;
		state.mxcsr = 0x1f80;
		state
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn fxsave_layout() {
		assert_eq!(mem::size_of::<FpState>(), 512);
		assert_eq!(mem::size_of::<FpReg>(), 16);
		assert_eq!(mem::size_of::<XmmReg>(), 16);
	}

	#[test]
	fn reset_state() {
		let regs = Regs::reset();
		assert_eq!(regs.rip, 0);
		assert_ne!(regs.rflags & RFLAGS_RESERVED, 0);
		let fpu = FpState::default();
		assert_eq!(fpu.cwd, 0x37f);
		assert_eq!(fpu.mxcsr, 0x1f80);
	}
}
