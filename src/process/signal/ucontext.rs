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

//! Guest-ABI signal context structures.
//!
//! These are laid out bit-exactly the way an x86-64 Linux guest expects to
//! find them on its stack when a handler runs. Pointers inside them are
//! guest addresses stored as `u64`.

use crate::process::regs::{FpState, Regs};

/// Index of `r8` in [`MContext::gregs`].
pub const REG_R8: usize = 0;
pub const REG_R9: usize = 1;
pub const REG_R10: usize = 2;
pub const REG_R11: usize = 3;
pub const REG_R12: usize = 4;
pub const REG_R13: usize = 5;
pub const REG_R14: usize = 6;
pub const REG_R15: usize = 7;
pub const REG_RDI: usize = 8;
pub const REG_RSI: usize = 9;
pub const REG_RBP: usize = 10;
pub const REG_RBX: usize = 11;
pub const REG_RDX: usize = 12;
pub const REG_RAX: usize = 13;
pub const REG_RCX: usize = 14;
pub const REG_RSP: usize = 15;
pub const REG_RIP: usize = 16;
pub const REG_EFL: usize = 17;
pub const REG_CSGSFS: usize = 18;
pub const REG_ERR: usize = 19;
pub const REG_TRAPNO: usize = 20;
pub const REG_OLDMASK: usize = 21;
pub const REG_CR2: usize = 22;

/// Description of a signal stack.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Stack {
	/// Guest base address of the stack.
	pub ss_sp: u64,
	pub ss_flags: i32,
	pub ss_size: u64,
}

/// Machine register state.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct MContext {
	pub gregs: [u64; 23],
	/// Guest address of the FPU state, normally the `fpstate` member of
	/// the enclosing [`UContext`].
	pub fpregs: u64,
	reserved: [u64; 8],
}

impl Default for MContext {
	fn default() -> Self {
		Self {
			gregs: [0; 23],
			fpregs: 0,
			reserved: [0; 8],
		}
	}
}

impl MContext {
	/// Captures the general registers.
	pub fn capture(regs: &Regs) -> Self {
		let mut ctx = Self::default();
		ctx.gregs[REG_R8] = regs.r8;
		ctx.gregs[REG_R9] = regs.r9;
		ctx.gregs[REG_R10] = regs.r10;
		ctx.gregs[REG_R11] = regs.r11;
		ctx.gregs[REG_R12] = regs.r12;
		ctx.gregs[REG_R13] = regs.r13;
		ctx.gregs[REG_R14] = regs.r14;
		ctx.gregs[REG_R15] = regs.r15;
		ctx.gregs[REG_RDI] = regs.rdi;
		ctx.gregs[REG_RSI] = regs.rsi;
		ctx.gregs[REG_RBP] = regs.rbp;
		ctx.gregs[REG_RBX] = regs.rbx;
		ctx.gregs[REG_RDX] = regs.rdx;
		ctx.gregs[REG_RAX] = regs.rax;
		ctx.gregs[REG_RCX] = regs.rcx;
		ctx.gregs[REG_RSP] = regs.rsp;
		ctx.gregs[REG_RIP] = regs.rip;
		ctx.gregs[REG_EFL] = regs.rflags;
		ctx
	}

	/// Restores the general registers.
	pub fn restore(&self, regs: &mut Regs) {
		regs.r8 = self.gregs[REG_R8];
		regs.r9 = self.gregs[REG_R9];
		regs.r10 = self.gregs[REG_R10];
		regs.r11 = self.gregs[REG_R11];
		regs.r12 = self.gregs[REG_R12];
		regs.r13 = self.gregs[REG_R13];
		regs.r14 = self.gregs[REG_R14];
		regs.r15 = self.gregs[REG_R15];
		regs.rdi = self.gregs[REG_RDI];
		regs.rsi = self.gregs[REG_RSI];
		regs.rbp = self.gregs[REG_RBP];
		regs.rbx = self.gregs[REG_RBX];
		regs.rdx = self.gregs[REG_RDX];
		regs.rax = self.gregs[REG_RAX];
		regs.rcx = self.gregs[REG_RCX];
		regs.rsp = self.gregs[REG_RSP];
		regs.rip = self.gregs[REG_RIP];
		regs.rflags = self.gregs[REG_EFL];
	}
}

/// Userspace signal context.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UContext {
	pub uc_flags: u64,
	/// Guest address of a linked context, unused here.
	pub uc_link: u64,
	pub uc_stack: Stack,
	pub uc_mcontext: MContext,
	pub uc_sigmask: u64,
	/// In-frame storage for the FPU state `uc_mcontext.fpregs` points at.
	pub fpstate: FpState,
}

/// Signal information delivered alongside the context.
///
/// The guest ABI reserves 128 bytes; only the leading fields carry
/// meaning here.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SigInfo {
	pub si_signo: i32,
	pub si_errno: i32,
	pub si_code: i32,
	pad: i32,
	fields: [u64; 14],
}

impl Default for SigInfo {
	fn default() -> Self {
		Self {
			si_signo: 0,
			si_errno: 0,
			si_code: 0,
			pad: 0,
			fields: [0; 14],
		}
	}
}

/// The frame pushed onto the guest stack for a signal handler: the
/// restorer trampoline pointer the handler returns into, then the context
/// and the signal information.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SignalFrame {
	pub restorer: u64,
	pub uc: UContext,
	pub info: SigInfo,
}

/// Guest-relative offset of the context within a frame at `sp`.
pub const FRAME_UC_OFFSET: usize = 8;

/// Guest-relative offset of the signal information within a frame at
/// `sp`.
pub const FRAME_INFO_OFFSET: usize = 8 + core::mem::size_of::<UContext>();

/// Guest-relative offset of the FPU state within a frame at `sp`.
pub const FRAME_FPSTATE_OFFSET: usize =
	FRAME_UC_OFFSET + core::mem::offset_of!(UContext, fpstate);
