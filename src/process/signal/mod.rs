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

//! Guest signal delivery.
//!
//! Host signal handlers and other machines mark bits in a machine's
//! pending set; the interpreter loop polls [`consume_signal`] at safe
//! points. Delivery is never suspended mid-frame: once a handler is
//! chosen, the frame lands on the guest stack and the register file is
//! redirected before the interpreter resumes.

pub mod ucontext;

use crate::{
	errno::EResult,
	limits::{REDZONE_SIZE, SIGNAL_COUNT},
	memory::VirtAddr,
	process::Machine,
};
use core::{mem, sync::atomic::Ordering};
use ucontext::{MContext, SignalFrame, Stack, FRAME_FPSTATE_OFFSET, FRAME_INFO_OFFSET, FRAME_UC_OFFSET};

/// Guest handler value executing the default action.
pub const SIG_DFL: u64 = 0;
/// Guest handler value ignoring the signal.
pub const SIG_IGN: u64 = 1;

/// `SigAction` flag: deliver a three-argument handler with siginfo.
pub const SA_SIGINFO: u64 = 0x00000004;
/// `SigAction` flag: the action carries a restorer trampoline.
pub const SA_RESTORER: u64 = 0x04000000;
/// `SigAction` flag: run the handler on the alternate stack.
pub const SA_ONSTACK: u64 = 0x08000000;
/// `SigAction` flag: restart interrupted system calls.
pub const SA_RESTART: u64 = 0x10000000;
/// `SigAction` flag: do not mask the signal inside its own handler.
pub const SA_NODEFER: u64 = 0x40000000;
/// `SigAction` flag: reset the handler to default on delivery.
pub const SA_RESETHAND: u64 = 0x80000000;

/// Alt-stack flag: the thread is executing on the alternate stack.
pub const SS_ONSTACK: i32 = 1;
/// Alt-stack flag: the alternate stack is disabled.
pub const SS_DISABLE: i32 = 2;
/// Alt-stack flag: disarm the alternate stack on delivery.
pub const SS_AUTODISARM: i32 = 1 << 31;

/// An action installed for one signal, in the guest's `rt_sigaction`
/// layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SigAction {
	/// Guest address of the handler, or [`SIG_DFL`]/[`SIG_IGN`].
	pub handler: u64,
	pub flags: u64,
	/// Guest address of the sigreturn trampoline.
	pub restorer: u64,
	/// Signals blocked while the handler runs.
	pub mask: u64,
}

/// Alternate signal stack descriptor of one machine.
#[derive(Clone, Copy, Debug)]
pub struct SigAltStack {
	/// Guest base address.
	pub sp: u64,
	pub flags: i32,
	pub size: u64,
}

impl Default for SigAltStack {
	fn default() -> Self {
		Self {
			sp: 0,
			flags: SS_DISABLE,
			size: 0,
		}
	}
}

/// Enumeration of the named guest signals.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Signal {
	SIGHUP,
	SIGINT,
	SIGQUIT,
	SIGILL,
	SIGTRAP,
	SIGABRT,
	SIGBUS,
	SIGFPE,
	SIGKILL,
	SIGUSR1,
	SIGSEGV,
	SIGUSR2,
	SIGPIPE,
	SIGALRM,
	SIGTERM,
	SIGSTKFLT,
	SIGCHLD,
	SIGCONT,
	SIGSTOP,
	SIGTSTP,
	SIGTTIN,
	SIGTTOU,
	SIGURG,
	SIGXCPU,
	SIGXFSZ,
	SIGVTALRM,
	SIGPROF,
	SIGWINCH,
	SIGPOLL,
	SIGPWR,
	SIGSYS,
}

impl Signal {
	/// Returns the signal's guest number.
	pub const fn id(self) -> u8 {
		match self {
			Self::SIGHUP => 1,
			Self::SIGINT => 2,
			Self::SIGQUIT => 3,
			Self::SIGILL => 4,
			Self::SIGTRAP => 5,
			Self::SIGABRT => 6,
			Self::SIGBUS => 7,
			Self::SIGFPE => 8,
			Self::SIGKILL => 9,
			Self::SIGUSR1 => 10,
			Self::SIGSEGV => 11,
			Self::SIGUSR2 => 12,
			Self::SIGPIPE => 13,
			Self::SIGALRM => 14,
			Self::SIGTERM => 15,
			Self::SIGSTKFLT => 16,
			Self::SIGCHLD => 17,
			Self::SIGCONT => 18,
			Self::SIGSTOP => 19,
			Self::SIGTSTP => 20,
			Self::SIGTTIN => 21,
			Self::SIGTTOU => 22,
			Self::SIGURG => 23,
			Self::SIGXCPU => 24,
			Self::SIGXFSZ => 25,
			Self::SIGVTALRM => 26,
			Self::SIGPROF => 27,
			Self::SIGWINCH => 28,
			Self::SIGPOLL => 29,
			Self::SIGPWR => 30,
			Self::SIGSYS => 31,
		}
	}

	/// Returns the bit of the signal in a pending or blocked set.
	pub const fn bit(self) -> u64 {
		1 << (self.id() - 1)
	}
}

/// Tells whether the default action of `sig` is to ignore it.
///
/// The emulator has no job control, so the stop/continue family reduces
/// to continue-is-ignored and stop-terminates like the other defaults.
fn default_ignored(sig: u8) -> bool {
	matches!(
		sig,
		s if s == Signal::SIGURG.id()
			|| s == Signal::SIGCONT.id()
			|| s == Signal::SIGCHLD.id()
			|| s == Signal::SIGWINCH.id()
	)
}

/// Tells whether `sig` reports a synchronous fault that cannot be
/// deferred or dropped: ignoring it would re-execute the faulting
/// instruction forever.
fn too_dangerous(sig: u8) -> bool {
	sig == Signal::SIGFPE.id() || sig == Signal::SIGILL.id() || sig == Signal::SIGSEGV.id()
}

/// Marks `sig` pending on the machine. Out-of-range signal numbers are
/// ignored.
///
/// Safe to call from host signal handlers and from other threads: the
/// pending set is a lock-free bitset.
pub fn enqueue_signal(m: &Machine, sig: u8) {
	if (1..=SIGNAL_COUNT as u8).contains(&sig) {
		m.signals.fetch_or(1 << (sig - 1), Ordering::Release);
	}
}

/// What [`consume_signal`] decided.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Consumed {
	/// Nothing deliverable is pending.
	Idle,
	/// A handler frame was pushed; the interpreter resumes at the
	/// handler. `restart` reports `SA_RESTART` so an interrupted syscall
	/// can be re-issued after the handler returns.
	Delivered { sig: u8, restart: bool },
	/// The signal terminates the guest; the caller owns the funeral.
	Terminate(u8),
}

/// Consumes at most one pending signal, highest number first.
///
/// Masked signals stay pending, except the synchronous faults
/// ([`too_dangerous`]) which cannot wait and terminate the guest instead.
pub fn consume_signal(m: &Machine) -> Consumed {
	let system = m.system();
	let mut handlers = system.signals.lock().unwrap();
	let pending = m.signals.load(Ordering::Acquire);
	if pending == 0 {
		return Consumed::Idle;
	}
	let mask = m.cpu().sigmask;
	for bit in (0..SIGNAL_COUNT as u8).rev() {
		if pending & (1 << bit) == 0 {
			continue;
		}
		let sig = bit + 1;
		let masked = mask & (1 << bit) != 0;
		if masked && !too_dangerous(sig) {
			continue;
		}
		m.signals.fetch_and(!(1 << bit), Ordering::AcqRel);
		if masked {
			// A masked synchronous fault cannot be deferred
			return Consumed::Terminate(sig);
		}
		let action = handlers[bit as usize];
		match action.handler {
			SIG_DFL => {
				if default_ignored(sig) {
					continue;
				}
				return Consumed::Terminate(sig);
			}
			SIG_IGN => {
				if too_dangerous(sig) {
					return Consumed::Terminate(sig);
				}
				continue;
			}
			_ => {
				if action.flags & SA_RESETHAND != 0 {
					handlers[bit as usize] = SigAction::default();
				}
				return match deliver_signal(m, sig, action) {
					Ok(()) => Consumed::Delivered {
						sig,
						restart: action.flags & SA_RESTART != 0,
					},
					// The frame would not fit in guest memory
					Err(_) => Consumed::Terminate(Signal::SIGSEGV.id()),
				};
			}
		}
	}
	Consumed::Idle
}

/// Pushes a [`SignalFrame`] onto the guest stack and redirects the
/// machine into the handler.
fn deliver_signal(m: &Machine, sig: u8, action: SigAction) -> EResult<()> {
	let mut cpu = m.cpu();
	// Choose the stack
	let on_alt = action.flags & SA_ONSTACK != 0 && cpu.altstack.flags & SS_DISABLE == 0;
	let old_stack = Stack {
		ss_sp: cpu.altstack.sp,
		ss_flags: cpu.altstack.flags,
		ss_size: cpu.altstack.size,
	};
	let top = if on_alt {
		if cpu.altstack.flags & SS_AUTODISARM != 0 {
			cpu.altstack = SigAltStack::default();
		}
		old_stack.ss_sp + old_stack.ss_size
	} else {
		cpu.regs.rsp - REDZONE_SIZE as u64
	};
	let mut frame: SignalFrame = unsafe { mem::zeroed() };
	frame.restorer = action.restorer;
	frame.uc.uc_stack = old_stack;
	frame.uc.uc_mcontext = MContext::capture(&cpu.regs);
	frame.uc.uc_sigmask = cpu.sigmask;
	frame.uc.fpstate = cpu.fpu;
	frame.info.si_signo = sig as i32;
	// The trampoline return must push the stack back to 16-byte
	// alignment, so the frame lands at sp with (sp & 15) == 8
	let mut sp = (top - mem::size_of::<SignalFrame>() as u64) & !15;
	sp -= 8;
	debug_assert_eq!(sp & 15, 8);
	frame.uc.uc_mcontext.fpregs = sp + FRAME_FPSTATE_OFFSET as u64;
	let bytes = unsafe {
		core::slice::from_raw_parts(
			(&frame as *const SignalFrame).cast::<u8>(),
			mem::size_of::<SignalFrame>(),
		)
	};
	m.system().mem.copy_to_guest(VirtAddr(sp as i64), bytes)?;
	// Enter the handler
	cpu.regs.rsp = sp;
	cpu.regs.rdi = sig as u64;
	cpu.regs.rsi = sp + FRAME_INFO_OFFSET as u64;
	cpu.regs.rdx = sp + FRAME_UC_OFFSET as u64;
	cpu.regs.rip = action.handler;
	cpu.sigmask |= action.mask;
	if action.flags & SA_NODEFER == 0 {
		cpu.sigmask |= 1 << (sig - 1);
	}
	log::trace!("delivered signal {sig} to tid {} at {:#x}", m.tid(), action.handler);
	Ok(())
}

/// Restores the machine from the frame its handler just returned
/// through.
///
/// Called when the guest executes `rt_sigreturn` from the restorer
/// trampoline: the trampoline return popped the restorer pointer, so the
/// frame starts 8 bytes below the current stack pointer.
pub fn sig_restore(m: &Machine) -> EResult<()> {
	let mut cpu = m.cpu();
	let sp = cpu.regs.rsp - 8;
	let mut frame: SignalFrame = unsafe { mem::zeroed() };
	let bytes = unsafe {
		core::slice::from_raw_parts_mut(
			(&mut frame as *mut SignalFrame).cast::<u8>(),
			mem::size_of::<SignalFrame>(),
		)
	};
	m.system().mem.copy_from_guest(bytes, VirtAddr(sp as i64))?;
	frame.uc.uc_mcontext.restore(&mut cpu.regs);
	cpu.sigmask = frame.uc.uc_sigmask;
	cpu.altstack = SigAltStack {
		sp: frame.uc.uc_stack.ss_sp,
		flags: frame.uc.uc_stack.ss_flags,
		size: frame.uc.uc_stack.ss_size,
	};
	// The handler may have pointed fpregs somewhere else
	let fpptr = frame.uc.uc_mcontext.fpregs;
	if fpptr != 0 && fpptr != sp + FRAME_FPSTATE_OFFSET as u64 {
		let mut fpu = cpu.fpu;
		let fbytes = unsafe {
			core::slice::from_raw_parts_mut(
				(&mut fpu as *mut crate::process::regs::FpState).cast::<u8>(),
				mem::size_of::<crate::process::regs::FpState>(),
			)
		};
		m.system().mem.copy_from_guest(fbytes, VirtAddr(fpptr as i64))?;
		cpu.fpu = fpu;
	} else {
		cpu.fpu = frame.uc.fpstate;
	}
	m.restored.store(true, Ordering::Release);
	Ok(())
}
