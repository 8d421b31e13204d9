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

//! A memory space is the virtual memory handler for one client. It hands out
//! lazily-backed regions of the managed virtual range and binds physical
//! frames to them on demand, one page fault at a time.
//!
//! The memory space contains:
//! - The region list: which parts of the range are handed out
//! - The page table tree: which pages currently own a frame
//! - The resident queue: the eviction order over those pages
//! - The swap space: where evicted pages go
//!
//! Nothing is backed at allocation time. The first touch of a page faults,
//! the handler builds the missing levels of the table tree, takes a frame
//! and binds it. When no frame is left, a resident page is evicted to swap
//! and its frame reused; a later touch of the evicted page faults it back in.

pub mod region;
pub mod residence;

use crate::{
	memory::{
		buddy::FrameAllocator, Page, PhysAddr, VirtAddr, PAGE_SIZE, REGION_BEGIN, REGION_END,
	},
	swap::{SwapError, SwapSpace},
	vmem::{
		x86::{
			entry_addr, entry_swap_slot, is_swapped, table_index, to_entry, to_swapped_entry,
			unwrap_entry, Entry, FLAG_DIRTY, FLAG_PRESENT, FLAG_USER, FLAG_WRITE,
			PAGE_FAULT_PRESENT, LEVELS,
		},
		VMem,
	},
};
use core::{cmp::min, fmt, ptr, ptr::NonNull};
use log::{debug, info, trace, warn};
use region::{RegionList, Status};
use residence::{Policy, ResidentQueue};
use std::{
	path::Path,
	sync::{Arc, Mutex},
};
use thiserror::Error;

/// An error occurring while handling a page fault.
#[derive(Debug, Error)]
pub enum FaultError {
	/// The faulting address is outside any allocated region.
	#[error("address is outside any allocated region")]
	BadAddress,
	/// The access violates the permissions of a present mapping.
	#[error("access violates the mapping's permissions")]
	Permission,
	/// No frame could be obtained, even after attempting replacement.
	#[error("out of physical memory")]
	OutOfMemory,
	/// The swap space failed.
	#[error(transparent)]
	Swap(#[from] SwapError),
}

/// A virtual memory space, bound to one client.
pub struct MemSpace {
	/// The region list over the managed virtual range.
	regions: RegionList,
	/// The resident data pages, in eviction order.
	residents: ResidentQueue,
	/// The page table tree.
	vmem: VMem,
	/// The swap space receiving evicted pages.
	swap: SwapSpace,

	/// The shared frame pool registry.
	allocator: Arc<Mutex<FrameAllocator>>,
	/// The replacement policy.
	policy: Policy,
}

impl MemSpace {
	/// Creates a new, empty memory space.
	///
	/// Arguments:
	/// - `allocator` is the shared frame pool registry.
	/// - `swap_path` is the path to the pre-created swap file.
	pub fn new<P: AsRef<Path>>(
		allocator: Arc<Mutex<FrameAllocator>>,
		swap_path: P,
	) -> Result<Self, SwapError> {
		info!("new memory space over {REGION_BEGIN:?}..{REGION_END:?}");
		Ok(Self {
			regions: RegionList::new(REGION_BEGIN, REGION_END),
			residents: ResidentQueue::new(),
			vmem: VMem::new(),
			swap: SwapSpace::open(swap_path)?,
			allocator,
			policy: Policy::default(),
		})
	}

	/// Returns the current replacement policy.
	pub fn policy(&self) -> Policy {
		self.policy
	}

	/// Sets the replacement policy for future evictions.
	pub fn set_policy(&mut self, policy: Policy) {
		info!("replacement policy set to {policy:?}");
		self.policy = policy;
	}

	/// Allocates a lazily-backed region of at least `size` bytes, rounded up
	/// to whole pages, and returns the address of its beginning.
	///
	/// No physical memory is bound until the region is touched.
	pub fn alloc(&mut self, size: usize) -> Option<VirtAddr> {
		if size == 0 {
			return None;
		}
		let pages = size.div_ceil(PAGE_SIZE);
		let addr = self.regions.allocate(pages)?;
		debug!("allocated {pages} pages at {addr:?}");
		Some(addr)
	}

	/// Frees the region beginning exactly at the given address, returning
	/// every bound frame and swap slot.
	///
	/// An address that is not the beginning of an allocated region is
	/// ignored.
	pub fn free(&mut self, addr: VirtAddr) {
		let Some((begin, pages)) = self.regions.allocated_at(addr) else {
			warn!("freeing {addr:?}, which begins no allocated region");
			return;
		};
		debug!("freeing {pages} pages at {begin:?}");
		self.release_backing(begin, pages);
		self.regions.release(begin);
	}

	/// Releases the physical backing of `pages` pages beginning at `begin`
	/// and drops the matching resident queue entries.
	fn release_backing(&mut self, begin: VirtAddr, pages: usize) {
		let mut allocator = self.allocator.lock().unwrap();
		for i in 0..pages {
			self.vmem
				.release_page(begin + i * PAGE_SIZE, &mut allocator, &mut self.swap);
		}
		drop(allocator);
		self.residents.remove_range(begin, pages);
	}

	/// Handles a page fault at the given address.
	///
	/// Arguments:
	/// - `addr` is the faulting address.
	/// - `code` is the fault error code ([`crate::vmem::x86::PAGE_FAULT_WRITE`]
	///   and friends).
	///
	/// A fault outside any allocated region, or on a present mapping (a
	/// permission violation: rights are never upgraded), is fatal. Otherwise
	/// the page is bound to a zeroed frame on first touch, or read back from
	/// swap if it was evicted.
	pub fn handle_page_fault(&mut self, addr: VirtAddr, code: u32) -> Result<(), FaultError> {
		trace!("page fault at {addr:?}, code {code:#x}");
		if !self.regions.check_address(addr) {
			return Err(FaultError::BadAddress);
		}
		if code & PAGE_FAULT_PRESENT != 0 {
			return Err(FaultError::Permission);
		}
		let page = addr.down_align_to(PAGE_SIZE);
		let pte = self.walk_or_build(page)?;
		let entry = unsafe { *pte.as_ref() };
		if entry & FLAG_PRESENT != 0 {
			// Another fault on the same page already resolved it
			return Ok(());
		}
		if !is_swapped(entry) {
			// First touch: bind a zeroed frame
			let frame = self.alloc_data_frame(page)?;
			unsafe {
				ptr::write_bytes(frame.as_ptr::<u8>(), 0, PAGE_SIZE);
				pte.as_ptr().write(to_entry(frame, FLAG_WRITE | FLAG_USER));
			}
			debug!("bound frame {frame:?} to {page:?}");
		} else {
			// The page lives in swap: read it back, then bind it
			let slot = entry_swap_slot(entry);
			let mut buf: Box<Page> = Box::new([0; PAGE_SIZE]);
			self.swap.swap_in(slot, &mut buf)?;
			let frame = self.alloc_data_frame(page)?;
			unsafe {
				ptr::copy_nonoverlapping(buf.as_ptr(), frame.as_ptr::<u8>(), PAGE_SIZE);
				pte.as_ptr().write(to_entry(frame, FLAG_WRITE | FLAG_USER));
			}
			debug!("swapped {page:?} back in from slot {slot}");
		}
		Ok(())
	}

	/// Returns the leaf entry for the given page, building missing levels of
	/// the table tree on the way down.
	///
	/// Frames for new tables come from the pools, with one replacement retry
	/// on exhaustion. Table frames never enter the resident queue.
	fn walk_or_build(&mut self, page: VirtAddr) -> Result<NonNull<Entry>, FaultError> {
		let mut table = NonNull::from(self.vmem.root_mut());
		for level in (1..LEVELS).rev() {
			let index = table_index(page, level);
			let mut entry = unsafe { table.as_ref() }[index];
			if entry & FLAG_PRESENT == 0 {
				let frame = self.alloc_table_frame()?;
				unsafe {
					ptr::write_bytes(frame.as_ptr::<u8>(), 0, PAGE_SIZE);
				}
				entry = to_entry(frame, FLAG_WRITE | FLAG_USER);
				unsafe {
					table.as_mut()[index] = entry;
				}
				trace!("built level {level} table at {frame:?}");
			}
			table = unsafe { unwrap_entry(entry) };
		}
		let index = table_index(page, 0);
		Ok(unsafe { NonNull::new_unchecked(table.as_ptr().cast::<Entry>().add(index)) })
	}

	/// Allocates a frame for a data page, registering the page in the
	/// resident queue.
	///
	/// On exhaustion, a resident page is evicted and its queue slot rebound
	/// to `page`; the allocation is retried once.
	fn alloc_data_frame(&mut self, page: VirtAddr) -> Result<PhysAddr, FaultError> {
		if let Some(frame) = self.allocator.lock().unwrap().alloc_pages(1) {
			self.residents.push(page);
			return Ok(frame);
		}
		self.reclaim_frame(Some(page))?;
		self.allocator
			.lock()
			.unwrap()
			.alloc_pages(1)
			.ok_or(FaultError::OutOfMemory)
	}

	/// Allocates a frame for an interior table.
	///
	/// Same exhaustion handling as [`Self::alloc_data_frame`], but nothing is
	/// registered: tables are not eviction candidates.
	fn alloc_table_frame(&mut self) -> Result<PhysAddr, FaultError> {
		if let Some(frame) = self.allocator.lock().unwrap().alloc_pages(1) {
			return Ok(frame);
		}
		self.reclaim_frame(None)?;
		self.allocator
			.lock()
			.unwrap()
			.alloc_pages(1)
			.ok_or(FaultError::OutOfMemory)
	}

	/// Evicts one resident page to swap and returns its frame to the pools.
	///
	/// The sequencing is part of the contract: the victim's mapping goes
	/// away and is invalidated before the frame contents are written out,
	/// and the slot index is recorded in the victim's leaf entry last.
	fn reclaim_frame(&mut self, replacement: Option<VirtAddr>) -> Result<(), FaultError> {
		let (victim, pte) = self
			.residents
			.select_victim(self.policy, &self.vmem, replacement)
			.ok_or(FaultError::OutOfMemory)?;
		let entry = unsafe { *pte.as_ref() };
		debug_assert!(entry & FLAG_PRESENT != 0);
		let frame = entry_addr(entry);
		unsafe {
			pte.as_ptr().write(FLAG_DIRTY);
		}
		crate::vmem::x86::invalidate_page(victim);
		let slot = self.swap.swap_out(unsafe { &*frame.as_ptr::<Page>() })?;
		self.allocator.lock().unwrap().free_pages(frame, 1);
		unsafe {
			pte.as_ptr().write(to_swapped_entry(slot));
		}
		debug!("evicted {victim:?} to swap slot {slot}");
		Ok(())
	}

	/// Translates the given address to the physical address it is currently
	/// bound to, if any.
	pub fn translate(&self, addr: VirtAddr) -> Option<PhysAddr> {
		self.vmem.translate(addr)
	}

	/// Flushes any translation cached for the page at the given address.
	pub fn invalidate_page(&self, addr: VirtAddr) {
		crate::vmem::x86::invalidate_page(addr.down_align_to(PAGE_SIZE));
	}

	/// Logs the state of the memory space.
	pub fn dump_state(&self) {
		info!("{self:#?}");
	}

	/// Reads `buf.len()` bytes from the memory space at the given address.
	///
	/// Every page covered must currently be bound to a frame.
	pub fn read(&self, addr: VirtAddr, buf: &mut [u8]) -> Result<(), FaultError> {
		let mut off = 0;
		while off < buf.len() {
			let cur = addr + off;
			let phys = self.vmem.translate(cur).ok_or(FaultError::BadAddress)?;
			let len = min(buf.len() - off, PAGE_SIZE - (cur.0 & (PAGE_SIZE - 1)));
			unsafe {
				ptr::copy_nonoverlapping(phys.as_ptr::<u8>(), buf[off..].as_mut_ptr(), len);
			}
			off += len;
		}
		Ok(())
	}

	/// Writes `data` into the memory space at the given address.
	///
	/// Every page covered must currently be bound to a frame.
	pub fn write(&self, addr: VirtAddr, data: &[u8]) -> Result<(), FaultError> {
		let mut off = 0;
		while off < data.len() {
			let cur = addr + off;
			let phys = self.vmem.translate(cur).ok_or(FaultError::BadAddress)?;
			let len = min(data.len() - off, PAGE_SIZE - (cur.0 & (PAGE_SIZE - 1)));
			unsafe {
				ptr::copy_nonoverlapping(data[off..].as_ptr(), phys.as_ptr::<u8>(), len);
			}
			off += len;
		}
		Ok(())
	}
}

impl fmt::Debug for MemSpace {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MemSpace")
			.field("regions", &self.regions)
			.field("residents", &self.residents)
			.field("policy", &self.policy)
			.field("swap_slots_used", &self.swap.used_slots())
			.finish()
	}
}

impl Drop for MemSpace {
	fn drop(&mut self) {
		// Return every bound frame and swap slot before the swap file closes
		let spans: Vec<(VirtAddr, usize)> = self
			.regions
			.iter()
			.filter(|r| r.status() == Status::Allocated)
			.map(|r| (r.begin(), r.size()))
			.collect();
		for (begin, pages) in spans {
			self.release_backing(begin, pages);
		}
		self.residents.clear();
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::memory::test_utils::Arena;
	use crate::vmem::x86::{FLAG_ACCESSED, PAGE_FAULT_USER, PAGE_FAULT_WRITE};
	use tempfile::NamedTempFile;

	/// A client write fault on a non-present page.
	const ERR_WRITE: u32 = PAGE_FAULT_USER | PAGE_FAULT_WRITE;

	struct TestEnv {
		space: MemSpace,
		allocator: Arc<Mutex<FrameAllocator>>,
		_arena: Arena,
		_swap: NamedTempFile,
	}

	/// Builds a memory space over `pool_pages` donated pages and a swap file
	/// of `swap_slots` slots.
	fn env(pool_pages: usize, swap_slots: u32) -> TestEnv {
		let _ = env_logger::builder().is_test(true).try_init();
		let arena = Arena::new(pool_pages);
		let mut allocator = FrameAllocator::new();
		unsafe {
			allocator.add_memory(arena.base(), pool_pages);
		}
		let allocator = Arc::new(Mutex::new(allocator));
		let swap = NamedTempFile::new().unwrap();
		swap.as_file()
			.set_len(swap_slots as u64 * PAGE_SIZE as u64)
			.unwrap();
		let space = MemSpace::new(allocator.clone(), swap.path()).unwrap();
		TestEnv {
			space,
			allocator,
			_arena: arena,
			_swap: swap,
		}
	}

	/// Returns the leaf entry for `page`, which must exist.
	fn leaf(space: &MemSpace, page: VirtAddr) -> Entry {
		unsafe { *space.vmem.walk(page).unwrap().as_ref() }
	}

	#[test]
	fn compulsory_fault_reads_zeroes() {
		let mut env = env(8, 4);
		let addr = env.space.alloc(PAGE_SIZE).unwrap();
		assert_eq!(addr, REGION_BEGIN);
		// Fault on the very first address of the region
		env.space.handle_page_fault(addr, ERR_WRITE).unwrap();
		assert_eq!(env.space.residents.len(), 1);
		let mut buf = [0xffu8; PAGE_SIZE];
		env.space.read(addr, &mut buf).unwrap();
		assert!(buf.iter().all(|&b| b == 0));
	}

	#[test]
	fn fault_outside_region_is_fatal() {
		let mut env = env(8, 4);
		assert!(matches!(
			env.space.handle_page_fault(REGION_BEGIN, ERR_WRITE),
			Err(FaultError::BadAddress)
		));
		let addr = env.space.alloc(PAGE_SIZE).unwrap();
		// One past the end of the region is not covered
		assert!(matches!(
			env.space.handle_page_fault(addr + PAGE_SIZE, ERR_WRITE),
			Err(FaultError::BadAddress)
		));
		// The end itself minus one byte is
		env.space
			.handle_page_fault(addr + (PAGE_SIZE - 1), ERR_WRITE)
			.unwrap();
	}

	#[test]
	fn permission_fault_is_fatal() {
		let mut env = env(8, 4);
		let addr = env.space.alloc(PAGE_SIZE).unwrap();
		env.space.handle_page_fault(addr, ERR_WRITE).unwrap();
		assert!(matches!(
			env.space
				.handle_page_fault(addr, ERR_WRITE | PAGE_FAULT_PRESENT),
			Err(FaultError::Permission)
		));
	}

	#[test]
	fn repeated_fault_is_idempotent() {
		let mut env = env(8, 4);
		let addr = env.space.alloc(PAGE_SIZE).unwrap();
		env.space.handle_page_fault(addr, ERR_WRITE).unwrap();
		env.space.handle_page_fault(addr, ERR_WRITE).unwrap();
		// The page is not registered twice
		assert_eq!(env.space.residents.len(), 1);
	}

	#[test]
	fn fifo_eviction_and_swap_roundtrip() {
		// 5 donated pages: 3 become interior tables, leaving 2 data frames
		let mut env = env(5, 8);
		env.space.set_policy(Policy::Fifo);
		let addr = env.space.alloc(3 * PAGE_SIZE).unwrap();
		let p0 = addr;
		let p1 = addr + PAGE_SIZE;
		let p2 = addr + 2 * PAGE_SIZE;
		env.space.handle_page_fault(p0, ERR_WRITE).unwrap();
		let pattern = [0xabu8; PAGE_SIZE];
		env.space.write(p0, &pattern).unwrap();
		env.space.handle_page_fault(p1, ERR_WRITE).unwrap();
		// Third page: no frame left, the oldest resident (p0) is evicted
		env.space.handle_page_fault(p2, ERR_WRITE).unwrap();
		assert!(env.space.translate(p0).is_none());
		assert!(env.space.translate(p2).is_some());
		assert_eq!(env.space.residents.len(), 2);
		let entry = leaf(&env.space, p0);
		assert!(is_swapped(entry));
		assert_eq!(entry_swap_slot(entry), 0);
		// Touching p0 faults it back in, evicting p1 into the freed slot
		env.space.handle_page_fault(p0, ERR_WRITE).unwrap();
		let mut buf = [0u8; PAGE_SIZE];
		env.space.read(p0, &mut buf).unwrap();
		assert_eq!(buf, pattern);
		let entry = leaf(&env.space, p1);
		assert!(is_swapped(entry));
		assert_eq!(entry_swap_slot(entry), 0);
	}

	#[test]
	fn clock_second_chance() {
		let mut env = env(5, 8);
		assert_eq!(env.space.policy(), Policy::Clock);
		let addr = env.space.alloc(3 * PAGE_SIZE).unwrap();
		let p0 = addr;
		let p1 = addr + PAGE_SIZE;
		let p2 = addr + 2 * PAGE_SIZE;
		env.space.handle_page_fault(p0, ERR_WRITE).unwrap();
		env.space.handle_page_fault(p1, ERR_WRITE).unwrap();
		// Mark p0 referenced, as the hardware would on access
		unsafe {
			let pte = env.space.vmem.walk(p0).unwrap();
			pte.as_ptr().write(*pte.as_ref() | FLAG_ACCESSED);
		}
		env.space.handle_page_fault(p2, ERR_WRITE).unwrap();
		// p0 survived on its second chance, with the flag eaten; p1 went
		let entry = leaf(&env.space, p0);
		assert_ne!(entry & FLAG_PRESENT, 0);
		assert_eq!(entry & FLAG_ACCESSED, 0);
		assert!(is_swapped(leaf(&env.space, p1)));
		assert!(env.space.translate(p2).is_some());
	}

	#[test]
	fn table_exhaustion_is_fatal() {
		// Two donated pages cannot even hold the three interior tables
		let mut env = env(2, 4);
		let addr = env.space.alloc(PAGE_SIZE).unwrap();
		assert!(matches!(
			env.space.handle_page_fault(addr, ERR_WRITE),
			Err(FaultError::OutOfMemory)
		));
	}

	#[test]
	fn swap_exhaustion_is_fatal() {
		let mut env = env(5, 1);
		env.space.set_policy(Policy::Fifo);
		let addr = env.space.alloc(4 * PAGE_SIZE).unwrap();
		for i in 0..3 {
			env.space
				.handle_page_fault(addr + i * PAGE_SIZE, ERR_WRITE)
				.unwrap();
		}
		// The only slot now holds the first page; the next eviction fails
		assert!(matches!(
			env.space
				.handle_page_fault(addr + 3 * PAGE_SIZE, ERR_WRITE),
			Err(FaultError::Swap(SwapError::Full))
		));
	}

	#[test]
	fn free_returns_frames_and_tables() {
		let mut env = env(8, 4);
		let addr = env.space.alloc(2 * PAGE_SIZE).unwrap();
		env.space.handle_page_fault(addr, ERR_WRITE).unwrap();
		env.space
			.handle_page_fault(addr + PAGE_SIZE, ERR_WRITE)
			.unwrap();
		assert_eq!(env.allocator.lock().unwrap().allocated_pages(), 5);
		env.space.free(addr);
		// Data frames and the emptied interior tables are all back
		assert_eq!(env.allocator.lock().unwrap().allocated_pages(), 0);
		assert!(env.space.translate(addr).is_none());
		assert!(env.space.residents.is_empty());
		// The region can be allocated and used again
		let addr = env.space.alloc(2 * PAGE_SIZE).unwrap();
		env.space.handle_page_fault(addr, ERR_WRITE).unwrap();
	}

	#[test]
	fn free_releases_swap_slots() {
		let mut env = env(5, 4);
		env.space.set_policy(Policy::Fifo);
		let addr = env.space.alloc(3 * PAGE_SIZE).unwrap();
		for i in 0..3 {
			env.space
				.handle_page_fault(addr + i * PAGE_SIZE, ERR_WRITE)
				.unwrap();
		}
		assert_eq!(env.space.swap.used_slots(), 1);
		env.space.free(addr);
		assert_eq!(env.space.swap.used_slots(), 0);
		assert_eq!(env.allocator.lock().unwrap().allocated_pages(), 0);
	}

	#[test]
	fn teardown_on_drop() {
		let TestEnv {
			mut space,
			allocator,
			_arena,
			_swap,
		} = env(8, 4);
		let addr = space.alloc(2 * PAGE_SIZE).unwrap();
		space.handle_page_fault(addr, ERR_WRITE).unwrap();
		space
			.handle_page_fault(addr + PAGE_SIZE, ERR_WRITE)
			.unwrap();
		drop(space);
		assert_eq!(allocator.lock().unwrap().allocated_pages(), 0);
	}

	#[test]
	fn alloc_rounds_up_to_pages() {
		let mut env = env(8, 4);
		assert!(env.space.alloc(0).is_none());
		let a = env.space.alloc(1).unwrap();
		let b = env.space.alloc(PAGE_SIZE + 1).unwrap();
		// One byte consumed one page, so the next region begins right after
		assert_eq!(b, a + PAGE_SIZE);
		let c = env.space.alloc(PAGE_SIZE).unwrap();
		assert_eq!(c, b + 2 * PAGE_SIZE);
		// Larger than the whole managed range
		assert!(env
			.space
			.alloc(REGION_END.0 - REGION_BEGIN.0 + PAGE_SIZE)
			.is_none());
	}

	#[test]
	fn free_unknown_address_is_ignored() {
		let mut env = env(8, 4);
		let addr = env.space.alloc(2 * PAGE_SIZE).unwrap();
		env.space.free(VirtAddr(0x123000));
		// An address inside the region but not its beginning does nothing
		env.space.free(addr + PAGE_SIZE);
		assert!(env.space.regions.check_address(addr));
	}
}
