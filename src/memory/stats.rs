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

//! Statistics about guest memory usage. Each count is in 4 KiB pages.

use core::{
	fmt,
	fmt::{Display, Formatter},
};

/// Memory usage counters of one guest address space.
///
/// `vss` counts every populated leaf; `rss` counts the committed ones
/// (leaves without the reserved bit). `memchurn` counts unmap operations
/// since the last page-table compaction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MemUsage {
	/// Pages obtained from the big arena.
	pub allocated: u64,
	/// Pages handed to the guest with committed backing.
	pub committed: u64,
	/// Pages reserved but not yet committed.
	pub reserved: u64,
	/// Pages released by the guest.
	pub freed: u64,
	/// Pages recycled through the pool free list.
	pub reclaimed: u64,
	/// Pages holding page-table levels.
	pub tables: u64,
	/// Virtual set size.
	pub vss: u64,
	/// Resident set size.
	pub rss: u64,
	/// Unmap operations since the last cleanse.
	pub memchurn: u64,
}

impl Display for MemUsage {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		writeln!(
			f,
			"VmSize: {} kB
VmRSS: {} kB
Tables: {} kB
Churn: {} pages",
			self.vss * 4,
			self.rss * 4,
			self.tables * 4,
			self.memchurn,
		)
	}
}
