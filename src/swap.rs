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

//! The swap space stores evicted pages in a pre-created, fixed-size file.
//!
//! The file is an array of page-sized slots: slot `i` occupies bytes
//! `[i * PAGE_SIZE, (i + 1) * PAGE_SIZE)`. An in-memory bitmap tracks which
//! slots are in use. The bitmap always starts zeroed: the file carries no
//! metadata, so the operator provides a fresh, zero-filled file of the
//! desired size.

use crate::memory::{Page, PAGE_SIZE};
use log::{debug, info, warn};
use std::{
	fs::{File, OpenOptions},
	io,
	os::unix::fs::FileExt,
	path::Path,
};
use thiserror::Error;

/// An error occurring on swap space operations.
#[derive(Debug, Error)]
pub enum SwapError {
	/// Every slot of the swap space is in use.
	#[error("the swap space is full")]
	Full,
	/// The given slot index is out of the swap space's range.
	#[error("swap slot {0} is out of range")]
	BadSlot(u32),
	/// The underlying file could not be read or written.
	#[error("swap I/O failed: {0}")]
	Io(#[from] io::Error),
}

/// A fixed-size, file-backed store of evicted pages.
pub struct SwapSpace {
	/// The backing file.
	file: File,
	/// The number of slots in the file.
	slots: u32,
	/// The allocation bitmap, one bit per slot, `1` meaning in use.
	map: Vec<u8>,
}

impl SwapSpace {
	/// Opens the swap space backed by the pre-created file at `path`.
	///
	/// The number of slots is derived from the file's size.
	pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SwapError> {
		let file = OpenOptions::new().read(true).write(true).open(&path)?;
		let slots = (file.metadata()?.len() / PAGE_SIZE as u64) as u32;
		info!(
			"swap space at {} with {slots} slots",
			path.as_ref().display()
		);
		Ok(Self {
			file,
			slots,
			map: vec![0; (slots as usize).div_ceil(8)],
		})
	}

	/// Returns the total number of slots.
	#[inline]
	pub fn slots(&self) -> u32 {
		self.slots
	}

	/// Returns the number of slots currently in use.
	pub fn used_slots(&self) -> u32 {
		(0..self.slots).filter(|&slot| self.bit(slot)).count() as u32
	}

	/// Returns the state of the bit for the given slot.
	#[inline]
	fn bit(&self, slot: u32) -> bool {
		self.map[(slot / 8) as usize] & (1 << (slot % 8)) != 0
	}

	/// Sets the state of the bit for the given slot.
	#[inline]
	fn set_bit(&mut self, slot: u32, in_use: bool) {
		let byte = &mut self.map[(slot / 8) as usize];
		if in_use {
			*byte |= 1 << (slot % 8);
		} else {
			*byte &= !(1 << (slot % 8));
		}
	}

	/// Writes the given page to the first free slot and returns the slot's
	/// index.
	///
	/// If every slot is in use, the function returns [`SwapError::Full`].
	pub fn swap_out(&mut self, page: &Page) -> Result<u32, SwapError> {
		let slot = (0..self.slots)
			.find(|&slot| !self.bit(slot))
			.ok_or(SwapError::Full)?;
		self.file
			.write_all_at(page, slot as u64 * PAGE_SIZE as u64)?;
		self.set_bit(slot, true);
		debug!("page swapped out to slot {slot}");
		Ok(slot)
	}

	/// Reads the page stored in the given slot into `page`, releasing the
	/// slot.
	pub fn swap_in(&mut self, slot: u32, page: &mut Page) -> Result<(), SwapError> {
		if slot >= self.slots {
			return Err(SwapError::BadSlot(slot));
		}
		self.file
			.read_exact_at(page, slot as u64 * PAGE_SIZE as u64)?;
		self.set_bit(slot, false);
		debug!("page swapped in from slot {slot}");
		Ok(())
	}

	/// Releases the given slot without reading it back.
	///
	/// Used when the page that owned the slot is discarded.
	pub fn release(&mut self, slot: u32) {
		if slot >= self.slots {
			warn!("releasing out-of-range swap slot {slot}");
			return;
		}
		self.set_bit(slot, false);
	}
}
