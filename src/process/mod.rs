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

//! The guest process and thread model.
//!
//! A [`System`] is the process-wide state of one emulated guest: its
//! address space, descriptor table, signal dispositions and resource
//! limits. A [`Machine`] is one guest thread, carried by one host
//! thread: registers, signal mask, pending signals and the per-thread
//! flags the interpreter polls between instructions.
//!
//! Machines are owned by the system's thread list; the back-pointer from
//! machine to system is reference-counted but the cycle is broken
//! deterministically when [`System::free_machine`] unlinks the machine.
//! When the last machine goes and the last reference drops, the system
//! tears down with it.

pub mod mem_space;
pub mod regs;
pub mod signal;

use crate::{
	errno,
	errno::EResult,
	limits::{MAX_THREAD_IDS, MIN_THREAD_ID, RLIMIT_AS, RLIM_INFINITY, RLIM_NLIMITS, SIGNAL_COUNT},
	memory::{vmem::Entry, VirtAddr},
};
use core::{
	mem,
	sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};
use mem_space::MemSpace;
use regs::{FpState, Regs};
use signal::{SigAction, SigAltStack, Signal};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// CPU mode a system runs its guest in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
	/// 16-bit mode with direct buffer addressing.
	Real,
	/// 32-bit protected mode.
	Legacy,
	/// 64-bit long mode; the only mode where the page-table root is
	/// meaningful.
	Long,
}

/// Creation options for a [`System`].
#[derive(Clone, Copy, Debug)]
pub struct SystemOptions {
	/// Linear addressing. Only takes effect in long mode, and only when
	/// the host allows it.
	pub linear: bool,
}

impl Default for SystemOptions {
	fn default() -> Self {
		Self {
			linear: true,
		}
	}
}

/// One guest resource limit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Rlimit {
	pub cur: u64,
	pub max: u64,
}

/// Process-wide state of one emulated guest.
pub struct System {
	mode: Mode,
	/// The guest address space.
	pub mem: MemSpace,
	/// The guest file descriptor table.
	pub fds: crate::file::fd::FdTable,
	/// Signal dispositions, indexed by signal number minus one.
	pub(crate) signals: Mutex<[SigAction; SIGNAL_COUNT]>,
	/// Signals the emulator intercepts on the host for its own operation;
	/// guest handlers for these require interpreter cooperation.
	reserved_signals: u64,
	/// The thread list.
	machines: Mutex<Vec<Arc<Machine>>>,
	/// Signalled whenever a machine leaves the list.
	machines_cond: Condvar,
	/// Serializes execve against descriptor creation racing on cloexec.
	exec_lock: Mutex<()>,
	rlimits: Mutex<[Rlimit; RLIM_NLIMITS]>,
	/// Counter feeding thread-id assignment for cloned machines.
	next_tid: AtomicU32,
}

impl System {
	/// Creates a system in the given CPU mode.
	pub fn new(mode: Mode, opts: SystemOptions) -> EResult<Arc<Self>> {
		let linear = opts.linear && mode == Mode::Long;
		let mem = MemSpace::new(linear, mode == Mode::Real)?;
		let reserved_signals = Signal::SIGSYS.bit()
			| Signal::SIGILL.bit()
			| Signal::SIGFPE.bit()
			| Signal::SIGSEGV.bit()
			| Signal::SIGTRAP.bit();
		Ok(Arc::new(Self {
			mode,
			mem,
			fds: Default::default(),
			signals: Mutex::new([SigAction::default(); SIGNAL_COUNT]),
			reserved_signals,
			machines: Mutex::new(Vec::new()),
			machines_cond: Condvar::new(),
			exec_lock: Mutex::new(()),
			rlimits: Mutex::new(
				[Rlimit {
					cur: RLIM_INFINITY,
					max: RLIM_INFINITY,
				}; RLIM_NLIMITS],
			),
			next_tid: AtomicU32::new(0),
		}))
	}

	/// Returns the CPU mode.
	pub fn mode(&self) -> Mode {
		self.mode
	}

	/// Returns the mask of signals the emulator intercepts for itself.
	pub fn reserved_signals(&self) -> u64 {
		self.reserved_signals
	}

	/// Reads, and optionally replaces, the disposition of `sig`.
	///
	/// `SIGKILL` and `SIGSTOP` cannot be given dispositions.
	pub fn sigaction(&self, sig: u8, new: Option<SigAction>) -> EResult<SigAction> {
		if !(1..=SIGNAL_COUNT as u8).contains(&sig) {
			return Err(errno!(EINVAL));
		}
		let mut handlers = self.signals.lock().unwrap();
		let old = handlers[sig as usize - 1];
		if let Some(new) = new {
			if sig == Signal::SIGKILL.id() || sig == Signal::SIGSTOP.id() {
				return Err(errno!(EINVAL));
			}
			handlers[sig as usize - 1] = new;
		}
		Ok(old)
	}

	/// Returns one resource limit.
	pub fn getrlimit(&self, resource: usize) -> EResult<Rlimit> {
		if resource >= RLIM_NLIMITS {
			return Err(errno!(EINVAL));
		}
		Ok(self.rlimits.lock().unwrap()[resource])
	}

	/// Replaces one resource limit. `RLIMIT_AS` clamps the address
	/// space immediately.
	pub fn setrlimit(&self, resource: usize, rlimit: Rlimit) -> EResult<()> {
		if resource >= RLIM_NLIMITS || rlimit.cur > rlimit.max {
			return Err(errno!(EINVAL));
		}
		self.rlimits.lock().unwrap()[resource] = rlimit;
		if resource == RLIMIT_AS {
			self.mem.set_max_virtual(rlimit.cur);
		}
		Ok(())
	}

	/// Serializes against `execve`. Descriptor creation that must not
	/// race an exec on cloexec holds this.
	pub fn exec_guard(&self) -> MutexGuard<'_, ()> {
		self.exec_lock.lock().unwrap()
	}

	/// Unlinks a machine from the thread list and runs its deferred
	/// frees.
	///
	/// Remaining machines waiting on the thread list (in
	/// [`Self::kill_other_threads`]) are woken. When the unlinked machine
	/// was the last one, the system itself dies with its last reference.
	pub fn free_machine(&self, tid: i32) {
		let removed = {
			let mut machines = self.machines.lock().unwrap();
			let Some(pos) = machines.iter().position(|m| m.tid == tid) else {
				return;
			};
			let removed = machines.remove(pos);
			if !machines.is_empty() {
				self.machines_cond.notify_all();
			}
			removed
		};
		let deferred = mem::take(&mut *removed.free_later.lock().unwrap());
		self.mem.free_deferred(&deferred);
		log::debug!("machine tid {tid} freed");
	}

	/// Tells whether `tid` is the only machine left.
	pub fn is_orphan(&self, tid: i32) -> bool {
		let machines = self.machines.lock().unwrap();
		machines.len() == 1 && machines[0].tid == tid
	}

	/// Returns the machine with the given thread id.
	pub fn find_machine(&self, tid: i32) -> Option<Arc<Machine>> {
		self.machines.lock().unwrap().iter().find(|m| m.tid == tid).cloned()
	}

	/// Returns the number of machines.
	pub fn machine_count(&self) -> usize {
		self.machines.lock().unwrap().len()
	}

	/// Flags every sibling of `tid` as killed, then waits until they have
	/// all unlinked themselves.
	///
	/// Siblings observe the flag at their next poll point, terminate and
	/// signal the thread-list condition; the wait ends when `tid` is an
	/// orphan. Called at `exit` and before `execve` replaces the system.
	pub fn kill_other_threads(&self, tid: i32) {
		let mut machines = self.machines.lock().unwrap();
		loop {
			let mut orphan = true;
			for machine in machines.iter() {
				if machine.tid != tid {
					machine.killed.store(true, Ordering::Release);
					orphan = false;
				}
			}
			if orphan {
				break;
			}
			machines = self.machines_cond.wait(machines).unwrap();
		}
	}

	/// Unlinks every machine except `tid`, without waiting.
	///
	/// For after `execve`, once the sibling host threads are known to be
	/// gone.
	pub fn remove_other_threads(&self, tid: i32) {
		let removed: Vec<Arc<Machine>> = {
			let mut machines = self.machines.lock().unwrap();
			let mut removed = Vec::new();
			machines.retain(|m| {
				if m.tid == tid {
					true
				} else {
					removed.push(m.clone());
					false
				}
			});
			removed
		};
		for machine in removed {
			let deferred = mem::take(&mut *machine.free_later.lock().unwrap());
			self.mem.free_deferred(&deferred);
		}
	}

	/// Flags every machine's TLB and/or opcode cache as stale.
	///
	/// Must be called after any address-space mutation and after
	/// self-modifying-code events; machines notice at their next poll and
	/// flush before their next guest load.
	pub fn invalidate(&self, tlb: bool, icache: bool) {
		let machines = self.machines.lock().unwrap();
		for machine in machines.iter() {
			if tlb {
				machine.invalidated.store(true, Ordering::Release);
			}
			if icache {
				machine.opcache_invalidated.store(true, Ordering::Release);
			}
		}
	}

	/// Maps `[virt, virt + size)` in the guest and broadcasts the TLB
	/// invalidation.
	pub fn reserve_virtual(
		&self,
		virt: VirtAddr,
		size: u64,
		prot: i32,
		fd: i32,
		off: i64,
		shared: bool,
	) -> EResult<()> {
		let r = self.mem.reserve(virt, size, prot, fd, off, shared);
		self.invalidate(true, false);
		r
	}

	/// Unmaps `[virt, virt + size)` in the guest and broadcasts the TLB
	/// invalidation.
	pub fn free_virtual(&self, virt: VirtAddr, size: u64) -> EResult<()> {
		let r = self.mem.free(virt, size);
		self.invalidate(true, false);
		r
	}

	/// Changes guest protection and broadcasts the TLB invalidation.
	pub fn protect_virtual(&self, virt: VirtAddr, size: u64, prot: i32) -> EResult<()> {
		let r = self.mem.protect(virt, size, prot);
		self.invalidate(true, false);
		r
	}

	/// Writes file-backed guest pages back to their files. No
	/// invalidation: nothing the TLB caches changes.
	pub fn sync_virtual(&self, virt: VirtAddr, size: u64, flags: i32) -> EResult<()> {
		self.mem.sync(virt, size, flags)
	}

	/// Finds a free guest interval of `size` bytes at or above `hint`.
	pub fn find_virtual(&self, hint: VirtAddr, size: u64) -> EResult<VirtAddr> {
		self.mem.find(hint, size)
	}
}

/// CPU state of one guest thread.
#[derive(Clone, Debug)]
pub struct Cpu {
	pub regs: Regs,
	pub fpu: FpState,
	/// Signals the guest currently blocks.
	pub sigmask: u64,
	pub altstack: SigAltStack,
}

impl Cpu {
	/// State after CPU reset.
	pub fn reset() -> Self {
		Self {
			regs: Regs::reset(),
			fpu: FpState::default(),
			sigmask: 0,
			altstack: SigAltStack::default(),
		}
	}
}

/// One guest thread.
pub struct Machine {
	system: Arc<System>,
	tid: i32,
	pub(crate) cpu: Mutex<Cpu>,
	/// Pending signal bitset, written lock-free by senders.
	pub(crate) signals: AtomicU64,
	/// Set by [`System::kill_other_threads`]; polled at interpreter safe
	/// points.
	killed: AtomicBool,
	/// The TLB is stale.
	invalidated: AtomicBool,
	/// The opcode cache is stale.
	opcache_invalidated: AtomicBool,
	/// A sigreturn just executed; the interpreter must reload its view of
	/// the register file.
	pub(crate) restored: AtomicBool,
	/// Pages whose release is deferred to teardown.
	free_later: Mutex<Vec<Entry>>,
}

impl Machine {
	/// Creates a machine on `system`, cloning `parent`'s CPU when given,
	/// and appends it to the system's thread list.
	///
	/// JIT path state and the free-later list are never inherited. The
	/// root machine takes the host process id as its thread id; cloned
	/// machines draw from the emulator's own id space.
	pub fn new(system: &Arc<System>, parent: Option<&Machine>) -> Arc<Machine> {
		let cpu = match parent {
			Some(parent) => parent.cpu().clone(),
			None => Cpu::reset(),
		};
		let tid = match parent {
			None => unsafe { libc::getpid() },
			Some(_) => {
				let n = system.next_tid.fetch_add(1, Ordering::Relaxed);
				((n & (MAX_THREAD_IDS - 1)) + MIN_THREAD_ID as u32) as i32
			}
		};
		let machine = Arc::new(Machine {
			system: system.clone(),
			tid,
			cpu: Mutex::new(cpu),
			signals: AtomicU64::new(0),
			killed: AtomicBool::new(false),
			invalidated: AtomicBool::new(false),
			opcache_invalidated: AtomicBool::new(false),
			restored: AtomicBool::new(false),
			free_later: Mutex::new(Vec::new()),
		});
		system.machines.lock().unwrap().push(machine.clone());
		log::debug!("machine tid {tid} created");
		machine
	}

	/// Returns the owning system.
	pub fn system(&self) -> &Arc<System> {
		&self.system
	}

	/// Returns the thread id.
	pub fn tid(&self) -> i32 {
		self.tid
	}

	/// Locks the CPU state.
	pub fn cpu(&self) -> MutexGuard<'_, Cpu> {
		self.cpu.lock().unwrap()
	}

	/// Returns the pending signal bitset.
	pub fn pending_signals(&self) -> u64 {
		self.signals.load(Ordering::Acquire)
	}

	/// Flags this machine as killed.
	pub fn kill(&self) {
		self.killed.store(true, Ordering::Release);
	}

	/// Polled at interpreter safe points.
	pub fn is_killed(&self) -> bool {
		self.killed.load(Ordering::Relaxed)
	}

	/// Consumes the TLB-stale flag.
	pub fn take_invalidated(&self) -> bool {
		self.invalidated.swap(false, Ordering::AcqRel)
	}

	/// Consumes the opcode-cache-stale flag.
	pub fn take_opcache_invalidated(&self) -> bool {
		self.opcache_invalidated.swap(false, Ordering::AcqRel)
	}

	/// Consumes the just-sigreturned flag.
	pub fn take_restored(&self) -> bool {
		self.restored.swap(false, Ordering::AcqRel)
	}

	/// Defers releasing an anonymous page to this machine's teardown.
	pub fn defer_free_page(&self, entry: Entry) {
		self.free_later.lock().unwrap().push(entry);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::limits::PAGE_SIZE;
	use super::mem_space::PROT_READ;

	fn system() -> Arc<System> {
		System::new(
			Mode::Long,
			SystemOptions {
				linear: false,
			},
		)
		.unwrap()
	}

	#[test]
	fn thread_ids() {
		let s = system();
		let root = Machine::new(&s, None);
		assert_eq!(root.tid(), unsafe { libc::getpid() });
		let a = Machine::new(&s, Some(&root));
		let b = Machine::new(&s, Some(&root));
		assert_eq!(a.tid(), MIN_THREAD_ID);
		assert_eq!(b.tid(), MIN_THREAD_ID + 1);
		assert_eq!(s.machine_count(), 3);
		assert!(s.find_machine(a.tid()).is_some());
	}

	#[test]
	fn clone_inherits_registers_not_flags() {
		let s = system();
		let root = Machine::new(&s, None);
		root.cpu().regs.rax = 0x42;
		root.kill();
		let child = Machine::new(&s, Some(&root));
		assert_eq!(child.cpu().regs.rax, 0x42);
		assert!(!child.is_killed());
	}

	#[test]
	fn orphan_detection() {
		let s = system();
		let root = Machine::new(&s, None);
		assert!(s.is_orphan(root.tid()));
		let child = Machine::new(&s, Some(&root));
		assert!(!s.is_orphan(root.tid()));
		s.free_machine(child.tid());
		assert!(s.is_orphan(root.tid()));
	}

	#[test]
	fn kill_other_threads_waits_for_siblings() {
		let s = system();
		let root = Machine::new(&s, None);
		let mut workers = Vec::new();
		for _ in 0..4 {
			let sibling = Machine::new(&s, Some(&root));
			workers.push(std::thread::spawn(move || {
				// The interpreter poll loop, reduced to its essence
				while !sibling.is_killed() {
					std::thread::yield_now();
				}
				sibling.system().free_machine(sibling.tid());
			}));
		}
		s.kill_other_threads(root.tid());
		assert!(s.is_orphan(root.tid()));
		for w in workers {
			w.join().unwrap();
		}
	}

	#[test]
	fn invalidation_broadcast() {
		let s = system();
		let root = Machine::new(&s, None);
		let child = Machine::new(&s, Some(&root));
		assert!(!root.take_invalidated());
		s.reserve_virtual(VirtAddr(0x10000), PAGE_SIZE as u64, PROT_READ, -1, 0, false).unwrap();
		assert!(root.take_invalidated());
		assert!(child.take_invalidated());
		assert!(!child.take_invalidated());
		assert!(!child.take_opcache_invalidated());
		s.invalidate(false, true);
		assert!(child.take_opcache_invalidated());
	}

	#[test]
	fn rlimit_clamps_address_space() {
		let s = system();
		s.setrlimit(
			RLIMIT_AS,
			Rlimit {
				cur: 4 * PAGE_SIZE as u64,
				max: RLIM_INFINITY,
			},
		)
		.unwrap();
		assert!(s.reserve_virtual(VirtAddr(0x10000), 4 * PAGE_SIZE as u64, PROT_READ, -1, 0, false).is_ok());
		assert_eq!(
			s.reserve_virtual(VirtAddr(0x40000), PAGE_SIZE as u64, PROT_READ, -1, 0, false),
			Err(errno!(ENOMEM))
		);
	}

	#[test]
	fn sigaction_guards() {
		let s = system();
		let act = SigAction {
			handler: 0x1000,
			..Default::default()
		};
		assert_eq!(s.sigaction(0, None), Err(errno!(EINVAL)));
		assert_eq!(s.sigaction(65, None), Err(errno!(EINVAL)));
		assert_eq!(s.sigaction(Signal::SIGKILL.id(), Some(act)), Err(errno!(EINVAL)));
		assert_eq!(s.sigaction(Signal::SIGUSR1.id(), Some(act)).unwrap(), SigAction::default());
		assert_eq!(s.sigaction(Signal::SIGUSR1.id(), None).unwrap(), act);
	}

	#[test]
	fn reserved_signals_preset() {
		let s = system();
		let reserved = s.reserved_signals();
		for sig in [Signal::SIGSYS, Signal::SIGILL, Signal::SIGFPE, Signal::SIGSEGV, Signal::SIGTRAP] {
			assert_ne!(reserved & sig.bit(), 0);
		}
		assert_eq!(reserved & Signal::SIGUSR1.bit(), 0);
	}
}
