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

//! x86_64-style virtual memory works with a tree structure. Each element is
//! an array of sub-elements. The position of the elements in the arrays
//! allows to tell the virtual address for the mapping.
//!
//! The tree has four levels. From the root down: PML4, PDP, PD and PT, each
//! an array of 512 entries of 64 bits. A leaf entry maps a 4096 bytes page.
//!
//! Each entry contains the physical address of the element/page and some
//! flags. The flags can be stored with the address in the entry because
//! addresses have to be page-aligned, freeing the low 12 bits.
//!
//! One non-architectural extension: an entry with [`FLAG_PRESENT`] clear and
//! [`FLAG_DIRTY`] set names a swap slot instead of a frame. The slot index
//! lives in the page base field.

use crate::memory::{PhysAddr, VirtAddr, PAGE_SHIFT, PAGE_SIZE};
use core::{
	mem::size_of,
	ops::{Deref, DerefMut},
	ptr::NonNull,
};
use log::trace;
use static_assertions::const_assert_eq;

/// Paging entry.
pub type Entry = u64;

/// **Paging flag**: Indicates that the page has been written.
///
/// On a non-present entry, the flag marks a page living in the swap space.
pub const FLAG_DIRTY: Entry = 0b001000000;
/// **Paging flag**: Set if the page has been read or written.
pub const FLAG_ACCESSED: Entry = 0b000100000;
/// **Paging flag**: If set, the page can be accessed by the client.
pub const FLAG_USER: Entry = 0b000000100;
/// **Paging flag**: If set, the page can be written.
pub const FLAG_WRITE: Entry = 0b000000010;
/// **Paging flag**: If set, the page is present.
pub const FLAG_PRESENT: Entry = 0b000000001;

/// Flags mask in a paging entry.
pub const FLAGS_MASK: Entry = 0xfff;
/// Address mask in a paging entry. The address doesn't need every bit since
/// it must be page-aligned, and the hardware layout caps it at 40 bits.
pub const ADDR_MASK: Entry = 0x000ffffffffff000;

/// Page fault flag. If set, the page was present.
pub const PAGE_FAULT_PRESENT: u32 = 0b001;
/// Page fault flag. If set, the fault was caused by a write operation, else
/// by a read operation.
pub const PAGE_FAULT_WRITE: u32 = 0b010;
/// Page fault flag. If set, the fault was caused by the client.
pub const PAGE_FAULT_USER: u32 = 0b100;

/// The number of entries in a table.
pub const ENTRIES_PER_TABLE: usize = 512;
/// The number of levels in the table tree.
pub const LEVELS: usize = 4;

/// Paging table.
#[repr(C, align(4096))]
pub struct Table(pub [Entry; ENTRIES_PER_TABLE]);

const_assert_eq!(size_of::<Table>(), PAGE_SIZE);

impl Table {
	/// Creates an empty table.
	pub fn zeroed() -> Self {
		Self([0; ENTRIES_PER_TABLE])
	}
}

impl Deref for Table {
	type Target = [Entry; ENTRIES_PER_TABLE];

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl DerefMut for Table {
	fn deref_mut(&mut self) -> &mut Self::Target {
		&mut self.0
	}
}

/// Returns the index of the element corresponding to the given virtual
/// address `addr` for the element at level `level` in the tree.
///
/// The level represents the depth in the tree. `0` is the deepest (the page
/// table), `3` is the root (the PML4).
#[inline]
pub fn table_index(addr: VirtAddr, level: usize) -> usize {
	(addr.0 >> (PAGE_SHIFT + level * 9)) & 0x1ff
}

/// Turns the given frame/flags pair into a present entry.
///
/// Invalid flags are ignored and the [`FLAG_PRESENT`] flag is inserted
/// automatically.
#[inline]
pub fn to_entry(addr: PhysAddr, flags: Entry) -> Entry {
	// Address alignment guarantees the address does not overlap flags
	(addr.0 as Entry & ADDR_MASK) | (flags & FLAGS_MASK) | FLAG_PRESENT
}

/// Returns the physical address stored in the given entry.
#[inline]
pub fn entry_addr(entry: Entry) -> PhysAddr {
	PhysAddr((entry & ADDR_MASK) as usize)
}

/// Turns the given swap slot index into a non-present entry remembering it.
#[inline]
pub fn to_swapped_entry(slot: u32) -> Entry {
	(((slot as Entry) << PAGE_SHIFT) & ADDR_MASK) | FLAG_DIRTY
}

/// Returns the swap slot index stored in the given non-present entry.
#[inline]
pub fn entry_swap_slot(entry: Entry) -> u32 {
	debug_assert!(is_swapped(entry));
	((entry & ADDR_MASK) >> PAGE_SHIFT) as u32
}

/// Tells whether the given entry names a swapped-out page.
#[inline]
pub fn is_swapped(entry: Entry) -> bool {
	entry & FLAG_PRESENT == 0 && entry & FLAG_DIRTY != 0
}

/// Turns an entry back into a reference to the table it points to.
///
/// # Safety
///
/// If the address in the entry does not name a live table frame, the
/// behaviour is undefined.
#[inline]
pub unsafe fn unwrap_entry(entry: Entry) -> NonNull<Table> {
	debug_assert!(entry & FLAG_PRESENT != 0);
	NonNull::new(entry_addr(entry).as_ptr()).unwrap()
}

/// Tells whether the given table has no present entry.
pub fn is_empty(table: &Table) -> bool {
	table.iter().all(|e| e & FLAG_PRESENT == 0)
}

/// Invalidate the translation cached for the page at the given address.
///
/// Mappings are resolved in software on every access, so no hardware TLB
/// shadows the tables: the hook keeps the call sites of an invalidation at
/// the places the ordering rules require, and traces them.
#[inline]
pub fn invalidate_page(addr: VirtAddr) {
	trace!("invalidate page at {addr:?}");
}
