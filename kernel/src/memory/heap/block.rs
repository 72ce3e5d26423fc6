// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The in-band block header every heap allocation sits behind.

use core::ptr::NonNull;

/// Stamped into every live header; a mismatch on traversal means the
/// heap's linked list has been corrupted, typically by a buffer
/// overrun in a previous allocation.
///
pub const MAGIC: u32 = 0x4865_6170; // b"Heap"

/// The header immediately preceding every block's payload.
///
/// Blocks form a doubly linked list in address order, threaded through
/// the heap's backing pages; `next`/`prev` are `None` at the ends of
/// the list, not sentinels.
///
#[repr(C)]
pub struct BlockHeader {
    pub magic: u32,
    pub size: usize,
    pub free: bool,
    pub next: Option<NonNull<BlockHeader>>,
    pub prev: Option<NonNull<BlockHeader>>,
}

impl BlockHeader {
    /// The address immediately after this block's payload — the
    /// address its right-hand neighbour must start at to be
    /// considered physically adjacent.
    ///
    pub fn end_addr(&self) -> usize {
        self as *const _ as usize + self.size
    }

    pub fn addr(&self) -> usize {
        self as *const _ as usize
    }

    /// Returns a pointer to this block's payload, immediately after
    /// its header.
    ///
    pub fn payload(&mut self) -> NonNull<u8> {
        unsafe {
            let ptr = (self as *mut BlockHeader as *mut u8).add(core::mem::size_of::<BlockHeader>());
            NonNull::new_unchecked(ptr)
        }
    }

    /// Recovers the header preceding `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must be a pointer previously returned by
    /// [`BlockHeader::payload`].
    ///
    pub unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<BlockHeader> {
        let ptr = payload.as_ptr().sub(core::mem::size_of::<BlockHeader>());
        NonNull::new_unchecked(ptr as *mut BlockHeader)
    }
}
