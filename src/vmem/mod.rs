/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of Petmem.
 *
 * Petmem is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Petmem is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Petmem. If not, see <https://www.gnu.org/licenses/>.
 */

//! A virtual memory context holds the page table tree of one address space.
//!
//! The root table is plain host memory owned by the context: the address
//! space exists before any physical memory is donated, and the root must
//! survive every eviction. Interior tables and mapped pages live in frames
//! taken from the donated pools, so the tree below the root is built lazily
//! and torn down bottom-up as pages go away.

pub mod x86;

use crate::{
	memory::{buddy::FrameAllocator, PhysAddr, VirtAddr, PAGE_SIZE},
	swap::SwapSpace,
};
use core::ptr::NonNull;
use log::trace;
use x86::{
	entry_addr, entry_swap_slot, invalidate_page, is_empty, is_swapped, table_index, unwrap_entry,
	Entry, Table, FLAG_PRESENT, LEVELS,
};

/// A virtual memory context.
pub struct VMem {
	/// The root (PML4) table.
	root: Box<Table>,
}

impl VMem {
	/// Creates a new, empty virtual memory context.
	pub fn new() -> Self {
		Self {
			root: Box::new(Table::zeroed()),
		}
	}

	/// Returns a mutable reference to the root table.
	pub fn root_mut(&mut self) -> &mut Table {
		&mut self.root
	}

	/// Returns the leaf entry for the given virtual address, if every level
	/// on the way down is present.
	///
	/// The returned pointer stays valid as long as the tables on the path are
	/// not torn down.
	pub fn walk(&self, addr: VirtAddr) -> Option<NonNull<Entry>> {
		let mut table = NonNull::from(self.root.as_ref());
		for level in (1..LEVELS).rev() {
			let entry = unsafe { table.as_ref() }[table_index(addr, level)];
			if entry & FLAG_PRESENT == 0 {
				return None;
			}
			table = unsafe { unwrap_entry(entry) };
		}
		let index = table_index(addr, 0);
		NonNull::new(unsafe { table.as_ptr().cast::<Entry>().add(index) })
	}

	/// Translates the given virtual address to the corresponding physical
	/// address.
	///
	/// If the address is not mapped, the function returns `None`.
	pub fn translate(&self, addr: VirtAddr) -> Option<PhysAddr> {
		let pte = self.walk(addr)?;
		let entry = unsafe { *pte.as_ref() };
		if entry & FLAG_PRESENT == 0 {
			return None;
		}
		Some(PhysAddr(entry_addr(entry).0 | (addr.0 & (PAGE_SIZE - 1))))
	}

	/// Releases the physical backing of the page at the given address.
	///
	/// The data frame (or the swap slot of an evicted page) is returned to
	/// its owner, the leaf entry is cleared and invalidated, then every
	/// interior table left without a present entry is freed bottom-up,
	/// invalidating the address that names the table. The root is never
	/// freed.
	pub fn release_page(
		&mut self,
		addr: VirtAddr,
		allocator: &mut FrameAllocator,
		swap: &mut SwapSpace,
	) {
		let addr = addr.down_align_to(PAGE_SIZE);
		// Remember the path down so emptied tables can be freed afterwards.
		// `tables[i]` is indexed by `table_index(addr, i)`.
		let mut tables = [NonNull::from(self.root.as_mut()); LEVELS];
		for level in (1..LEVELS).rev() {
			let entry = unsafe { tables[level].as_ref() }[table_index(addr, level)];
			if entry & FLAG_PRESENT == 0 {
				// The page never materialized
				return;
			}
			tables[level - 1] = unsafe { unwrap_entry(entry) };
		}
		// Drop the leaf
		let leaf = unsafe { &mut tables[0].as_mut()[table_index(addr, 0)] };
		if *leaf & FLAG_PRESENT != 0 {
			allocator.free_pages(entry_addr(*leaf), 1);
			*leaf = 0;
			invalidate_page(addr);
		} else if is_swapped(*leaf) {
			swap.release(entry_swap_slot(*leaf));
			*leaf = 0;
		} else {
			return;
		}
		trace!("released page at {addr:?}");
		// Free emptied interior tables, bottom-up
		for level in 0..LEVELS - 1 {
			if !is_empty(unsafe { tables[level].as_ref() }) {
				break;
			}
			let table_addr = PhysAddr(tables[level].as_ptr() as usize);
			unsafe {
				tables[level + 1].as_mut()[table_index(addr, level + 1)] = 0;
			}
			allocator.free_pages(table_addr, 1);
			invalidate_page(VirtAddr(table_addr.0));
		}
	}
}

impl Default for VMem {
	fn default() -> Self {
		Self::new()
	}
}
