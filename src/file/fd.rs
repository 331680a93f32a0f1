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

//! The guest file descriptor table.
//!
//! A file descriptor is a guest-visible ID pointing at an open file
//! description. Allocation always takes the lowest free slot, the way
//! Linux does.

use crate::{errno, errno::EResult, file::File, limits::OPEN_MAX};
use std::sync::{Arc, Mutex};

/// Descriptor flag: close the descriptor on successful `execve`.
pub const FD_CLOEXEC: i32 = 1;

/// A file descriptor entry.
#[derive(Clone)]
pub struct FileDescriptor {
	/// Descriptor flags, distinct from the file's open flags.
	pub flags: i32,
	/// The open file description.
	pub file: Arc<Mutex<File>>,
}

/// A table of file descriptors.
#[derive(Default)]
pub struct FdTable(Mutex<Vec<Option<FileDescriptor>>>);

impl FdTable {
	/// Returns the lowest free descriptor ID of at least `min`.
	fn lowest_free(table: &[Option<FileDescriptor>], min: u32) -> EResult<u32> {
		let min = min as usize;
		let found = table
			.iter()
			.enumerate()
			.skip(min)
			.find(|(_, fd)| fd.is_none())
			.map(|(i, _)| i as u32);
		match found {
			Some(id) => Ok(id),
			None => {
				let id = table.len().max(min) as u32;
				if id < OPEN_MAX {
					Ok(id)
				} else {
					Err(errno!(EMFILE))
				}
			}
		}
	}

	fn insert(table: &mut Vec<Option<FileDescriptor>>, id: u32, fd: FileDescriptor) {
		if id as usize >= table.len() {
			table.resize_with(id as usize + 1, || None);
		}
		table[id as usize] = Some(fd);
	}

	/// Adds a file to the table.
	///
	/// Arguments:
	/// - `flags` is the descriptor flags ([`FD_CLOEXEC`])
	/// - `file` is the open file description
	///
	/// Returns the new guest descriptor ID.
	pub fn add_fd(&self, flags: i32, file: File) -> EResult<u32> {
		let mut table = self.0.lock().unwrap();
		let id = Self::lowest_free(&table, 0)?;
		Self::insert(
			&mut table,
			id,
			FileDescriptor {
				flags,
				file: Arc::new(Mutex::new(file)),
			},
		);
		Ok(id)
	}

	/// Adds two files at once, for pipe-like syscalls: either both
	/// descriptors are created or neither is.
	pub fn add_fd_pair(&self, flags: i32, file0: File, file1: File) -> EResult<(u32, u32)> {
		let mut table = self.0.lock().unwrap();
		let id0 = Self::lowest_free(&table, 0)?;
		let id1 = Self::lowest_free(&table, id0 + 1)?;
		Self::insert(
			&mut table,
			id0,
			FileDescriptor {
				flags,
				file: Arc::new(Mutex::new(file0)),
			},
		);
		Self::insert(
			&mut table,
			id1,
			FileDescriptor {
				flags,
				file: Arc::new(Mutex::new(file1)),
			},
		);
		Ok((id0, id1))
	}

	/// Returns the open file behind a guest descriptor.
	pub fn get_fd(&self, id: u32) -> EResult<Arc<Mutex<File>>> {
		let table = self.0.lock().unwrap();
		table
			.get(id as usize)
			.and_then(|fd| fd.as_ref())
			.map(|fd| fd.file.clone())
			.ok_or(errno!(EBADF))
	}

	/// Returns the descriptor flags of a guest descriptor.
	pub fn get_fd_flags(&self, id: u32) -> EResult<i32> {
		let table = self.0.lock().unwrap();
		table
			.get(id as usize)
			.and_then(|fd| fd.as_ref())
			.map(|fd| fd.flags)
			.ok_or(errno!(EBADF))
	}

	/// Closes a guest descriptor. The backing object is released when
	/// the last reference to the open file goes.
	pub fn close_fd(&self, id: u32) -> EResult<()> {
		let mut table = self.0.lock().unwrap();
		table
			.get_mut(id as usize)
			.and_then(|fd| fd.take())
			.map(|_| ())
			.ok_or(errno!(EBADF))
	}

	/// Closes every descriptor carrying [`FD_CLOEXEC`]. Called on
	/// `execve`.
	pub fn close_on_exec(&self) {
		let mut table = self.0.lock().unwrap();
		for slot in table.iter_mut() {
			if slot.as_ref().is_some_and(|fd| fd.flags & FD_CLOEXEC != 0) {
				*slot = None;
			}
		}
	}
}
