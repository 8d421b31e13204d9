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

//! Petmem is a demand-paged virtual memory manager running entirely in user
//! space.
//!
//! The host donates contiguous, page-aligned chunks of its own memory to a
//! shared [`memory::buddy::FrameAllocator`]. A client opens a
//! [`mem_space::MemSpace`] over a fixed virtual range and allocates
//! lazily-backed regions from it; nothing is bound until a page is touched.
//! Each touch is reported as a page fault, which the memory space resolves by
//! building the missing levels of a four-level page table tree and binding a
//! frame. When frames run out, a resident page is evicted to a file-backed
//! [`swap::SwapSpace`] under a CLOCK or FIFO policy, and faulted back in on
//! the next touch.
//!
//! The embedding program provides the outer plumbing: wiring faults (e.g.
//! from a `SIGSEGV` handler or a device ioctl) into
//! [`mem_space::MemSpace::handle_page_fault`], and donating memory it has
//! obtained out-of-band.

pub mod mem_space;
pub mod memory;
pub mod swap;
pub mod vmem;

pub use mem_space::{residence::Policy, FaultError, MemSpace};
pub use memory::{buddy::FrameAllocator, PhysAddr, VirtAddr, PAGE_SIZE};
pub use swap::{SwapError, SwapSpace};
