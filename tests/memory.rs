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

//! End-to-end address-space scenarios.

use mimic::{
	errno::{Errno, EFAULT, ENOMEM},
	memory::VirtAddr,
	process::{
		mem_space::{PROT_READ, PROT_WRITE},
		Mode, System, SystemOptions,
	},
};
use std::sync::Arc;

const PAGE: u64 = 4096;

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
fn write_then_downgrade_to_read_only() {
	let s = system();
	let virt = VirtAddr(0x10000);
	s.reserve_virtual(virt, 4 * PAGE, PROT_READ | PROT_WRITE, -1, 0, false).unwrap();
	assert!(s.mem.is_fully_mapped(virt, 4 * PAGE));
	let pattern: Vec<u8> = (0..4 * PAGE as u32).map(|i| (i * 7) as u8).collect();
	s.mem.copy_to_guest(virt, &pattern).unwrap();
	s.protect_virtual(virt, 4 * PAGE, PROT_READ).unwrap();
	// The emulator observes "not writable" in the page table; no host
	// fault is involved
	assert_eq!(s.mem.copy_to_guest(virt, &[0u8]), Err(Errno(EFAULT)));
	assert!(!s.mem.is_valid_memory(virt, 1, true));
	// The data survived the protection change
	let mut back = vec![0u8; pattern.len()];
	s.mem.copy_from_guest(&mut back, virt).unwrap();
	assert_eq!(back, pattern);
}

#[test]
fn overlapping_reservation_splits_protection() {
	let s = system();
	s.reserve_virtual(VirtAddr(0x20000), 8 * PAGE, PROT_READ | PROT_WRITE, -1, 0, false)
		.unwrap();
	s.reserve_virtual(VirtAddr(0x22000), 2 * PAGE, PROT_READ, -1, 0, false).unwrap();
	assert!(s.mem.is_valid_memory(VirtAddr(0x20000), 2 * PAGE as usize, true));
	assert!(s.mem.is_valid_memory(VirtAddr(0x22000), 2 * PAGE as usize, false));
	assert!(!s.mem.is_valid_memory(VirtAddr(0x22000), 1, true));
	assert!(!s.mem.is_valid_memory(VirtAddr(0x23fff), 1, true));
	assert!(s.mem.is_valid_memory(VirtAddr(0x24000), 4 * PAGE as usize, true));
}

#[test]
fn rss_nets_out_across_overlap() {
	let s = system();
	let base = VirtAddr(0x100000);
	// 256 KiB, all committed by writing through it
	s.reserve_virtual(base, 0x40000, PROT_READ | PROT_WRITE, -1, 0, false).unwrap();
	let dirty = vec![0xabu8; 0x40000];
	s.mem.copy_to_guest(base, &dirty).unwrap();
	assert_eq!(s.mem.usage().rss, 64);
	assert_eq!(s.mem.usage().vss, 64);
	// Free 64 KiB out of the middle
	s.free_virtual(VirtAddr(0x110000), 0x10000).unwrap();
	assert!(s.mem.is_fully_unmapped(VirtAddr(0x110000), 0x10000));
	assert_eq!(s.mem.usage().rss, 48);
	assert_eq!(s.mem.usage().vss, 48);
	// Re-reserve 128 KiB straddling hole and live pages: the 96 KiB of
	// live overlap is replaced by fresh uncommitted reservations
	s.reserve_virtual(VirtAddr(0x118000), 0x20000, PROT_READ | PROT_WRITE, -1, 0, false)
		.unwrap();
	let usage = s.mem.usage();
	assert_eq!(usage.vss, 48 - 24 + 32);
	assert_eq!(usage.rss, 48 - 24);
	assert_eq!(usage.reserved, 32);
	assert!(s.mem.is_fully_mapped(VirtAddr(0x118000), 0x20000));
}

#[test]
fn freed_pages_come_back_zeroed() {
	let s = system();
	let virt = VirtAddr(0x30000);
	s.reserve_virtual(virt, PAGE, PROT_READ | PROT_WRITE, -1, 0, false).unwrap();
	s.mem.copy_to_guest(virt, &[0xffu8; 4096]).unwrap();
	s.free_virtual(virt, PAGE).unwrap();
	s.reserve_virtual(virt, PAGE, PROT_READ | PROT_WRITE, -1, 0, false).unwrap();
	let mut back = [0xa5u8; 4096];
	s.mem.copy_from_guest(&mut back, virt).unwrap();
	assert!(back.iter().all(|&b| b == 0));
}

#[test]
fn find_honours_hint_and_holes() {
	let s = system();
	s.reserve_virtual(VirtAddr(0x40000), 4 * PAGE, PROT_READ, -1, 0, false).unwrap();
	let hole = s.find_virtual(VirtAddr(0x40000), 8 * PAGE).unwrap();
	assert!(hole.0 >= 0x40000);
	assert!(s.mem.is_fully_unmapped(hole, 8 * PAGE));
	// The hole is actually usable
	s.reserve_virtual(hole, 8 * PAGE, PROT_READ, -1, 0, false).unwrap();
	assert!(s.mem.is_fully_mapped(hole, 8 * PAGE));
}

#[test]
fn exhausted_address_space_is_enomem() {
	let s = system();
	let near_top = VirtAddr((1 << 47) - 2 * PAGE as i64);
	s.reserve_virtual(near_top, 2 * PAGE, PROT_READ, -1, 0, false).unwrap();
	assert_eq!(s.find_virtual(near_top, 4 * PAGE), Err(Errno(ENOMEM)));
}

#[test]
fn file_backed_pages_read_through() {
	use std::io::Write;
	let mut tmp = tempfile_in_tmp();
	let content = b"mimic file mapping".repeat(512);
	tmp.write_all(&content).unwrap();
	tmp.flush().unwrap();
	let host_fd = std::os::fd::AsRawFd::as_raw_fd(&tmp);
	let s = system();
	let virt = VirtAddr(0x50000);
	s.reserve_virtual(virt, 2 * PAGE, PROT_READ, host_fd, 0, false).unwrap();
	let mut back = vec![0u8; 64];
	s.mem.copy_from_guest(&mut back, virt).unwrap();
	assert_eq!(&back, &content[..64]);
	// Mug pages commit on first touch
	assert!(s.mem.usage().rss >= 1);
	s.free_virtual(virt, 2 * PAGE).unwrap();
}

#[cfg(target_os = "linux")]
#[test]
fn linear_mode_pins_host_addresses() {
	let s = System::new(
		Mode::Long,
		SystemOptions {
			linear: true,
		},
	)
	.unwrap();
	if !s.mem.is_linear() {
		// Host page size ruled linear mode out; nothing to verify here
		return;
	}
	// High enough that the host image cannot collide with the test
	// runner's own mappings
	let virt = VirtAddr(0x20_0000_0000);
	s.reserve_virtual(virt, 2 * PAGE, PROT_READ | PROT_WRITE, -1, 0, false).unwrap();
	// Linear reservations are resident immediately
	assert_eq!(s.mem.usage().rss, 2);
	s.mem.copy_to_guest(virt, b"linear").unwrap();
	// The defining property: the guest byte is visible at the skewed
	// host address through a native load
	let host = mimic::memory::to_host(virt) as *const u8;
	let direct = unsafe { std::slice::from_raw_parts(host, 6) };
	assert_eq!(direct, b"linear");
	// Re-reserving the same interval atomically replaces it
	s.reserve_virtual(virt, 2 * PAGE, PROT_READ | PROT_WRITE, -1, 0, false).unwrap();
	let mut back = [0u8; 6];
	s.mem.copy_from_guest(&mut back, virt).unwrap();
	assert_eq!(&back, b"\0\0\0\0\0\0");
	s.free_virtual(virt, 2 * PAGE).unwrap();
	assert!(s.mem.is_fully_unmapped(virt, 2 * PAGE));
}

#[cfg(target_os = "linux")]
#[test]
fn linear_mode_rejects_nonpositive_bases() {
	use mimic::errno::ENOTSUP;
	let s = System::new(
		Mode::Long,
		SystemOptions {
			linear: true,
		},
	)
	.unwrap();
	if !s.mem.is_linear() {
		return;
	}
	assert_eq!(
		s.reserve_virtual(VirtAddr(-0x2000), PAGE, PROT_READ, -1, 0, false),
		Err(Errno(ENOTSUP))
	);
	assert_eq!(s.reserve_virtual(VirtAddr(0), PAGE, PROT_READ, -1, 0, false), Err(Errno(ENOTSUP)));
}

/// An unlinked scratch file, without pulling a crate in for it.
fn tempfile_in_tmp() -> std::fs::File {
	use std::os::fd::FromRawFd;
	let template = c"/tmp/mimic-test-XXXXXX".to_owned();
	let mut buf: Vec<u8> = template.into_bytes_with_nul();
	let fd = unsafe { libc::mkstemp(buf.as_mut_ptr().cast()) };
	assert!(fd >= 0);
	unsafe {
		libc::unlink(buf.as_ptr().cast());
		std::fs::File::from_raw_fd(fd)
	}
}
