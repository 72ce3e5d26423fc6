// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! A byte-granular first-fit heap, built in-band over pages mapped by
//! [`virtmem`] and backed by frames from [`physmem`].
//!
//! Every block carries a magic number; a traversal that finds a
//! mismatched one reports [`Error::Corrupt`] rather than walking
//! further into what is likely stale or overwritten memory. Unlike the
//! physical frame allocator, the heap never gives pages back to the
//! frame allocator once [`Heap::expand`] has mapped them in.

#![no_std]
#![deny(clippy::wildcard_imports)]

extern crate alloc;

mod block;

use addr::{PhysAddr, VirtAddr, PAGE_SIZE};
use alloc::alloc::{GlobalAlloc, Layout};
use block::{BlockHeader, MAGIC};
use core::ptr::{self, NonNull};
use spin::Mutex;
use virtmem::PageTableFlags;

/// The smallest heap [`Heap::init`] will honour, regardless of the
/// size requested.
///
pub const MIN_HEAP_SIZE: u32 = 4 * PAGE_SIZE;

fn align_up_usize(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn align_up_u32(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// The ways a heap operation can fail.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// A traversed block's magic number did not match [`block::MAGIC`];
    /// the list is corrupt and cannot be trusted further.
    Corrupt,
    /// No physical frame was available, or [`virtmem`] could not map
    /// one, while growing the heap's backing pages.
    OutOfMemory,
}

/// Chooses how generously [`Heap::alloc`] splits a found block that is
/// larger than the request.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SplitPolicy {
    /// Split only if the remainder is at least a quarter of the found
    /// block's own size.
    ReclaimQuarter,
    /// Split only if the remainder is at least `0` bytes.
    FixedMinimum(usize),
}

impl SplitPolicy {
    fn worth_splitting(self, block_size: usize, remainder: usize) -> bool {
        match self {
            SplitPolicy::ReclaimQuarter => remainder >= block_size / 4,
            SplitPolicy::FixedMinimum(min) => remainder >= min,
        }
    }
}

/// A first-fit heap over a contiguous, page-mapped virtual range.
///
pub struct Heap {
    head: Option<NonNull<BlockHeader>>,
    start: VirtAddr,
    size: u32,
    split_policy: SplitPolicy,
}

unsafe impl Send for Heap {}

impl Heap {
    /// An uninitialised heap; [`init`](Heap::init) must run before any
    /// other method is called.
    ///
    pub const fn empty() -> Self {
        Heap {
            head: None,
            start: VirtAddr::new(0),
            size: 0,
            split_policy: SplitPolicy::ReclaimQuarter,
        }
    }

    /// Maps `size` bytes (rounded up to whole pages, and up to at
    /// least [`MIN_HEAP_SIZE`]) starting at `start` (rounded down to a
    /// page boundary), and installs one free block spanning the whole
    /// range.
    ///
    /// # Safety
    ///
    /// `start` must not overlap any existing mapping, and must remain
    /// reserved for the heap's exclusive use for as long as this
    /// `Heap` lives.
    ///
    pub unsafe fn init(&mut self, start: VirtAddr, size: u32, split_policy: SplitPolicy) -> Result<(), Error> {
        let aligned_start = start.align_down();
        let requested = size.max(MIN_HEAP_SIZE);
        let aligned_size = align_up_u32(requested, PAGE_SIZE);

        map_range(aligned_start, aligned_size)?;

        let head = aligned_start.as_mut_ptr() as *mut BlockHeader;
        ptr::write(
            head,
            BlockHeader {
                magic: MAGIC,
                size: aligned_size as usize,
                free: true,
                next: None,
                prev: None,
            },
        );

        self.head = NonNull::new(head);
        self.start = aligned_start;
        self.size = aligned_size;
        self.split_policy = split_policy;
        Ok(())
    }

    fn header_size() -> usize {
        core::mem::size_of::<BlockHeader>()
    }

    /// Allocates `requested` bytes, returning `None` if no block is
    /// large enough even after [`expand`](Heap::expand)ing once.
    ///
    pub fn alloc(&mut self, requested: usize) -> Result<Option<NonNull<u8>>, Error> {
        let needed = align_up_usize(requested + Self::header_size(), 4);

        if let Some(mut block) = self.find_free_block(needed)? {
            return Ok(Some(self.take_block(&mut block, needed)));
        }

        let expansion = needed.max(self.size as usize / 4) as u32;
        if !self.expand(expansion)? {
            return Ok(None);
        }

        match self.find_free_block(needed)? {
            Some(mut block) => Ok(Some(self.take_block(&mut block, needed))),
            None => Ok(None),
        }
    }

    fn take_block(&mut self, block: &mut NonNull<BlockHeader>, needed: usize) -> NonNull<u8> {
        unsafe {
            let block_size = block.as_ref().size;
            let remainder = block_size - needed;
            if self.split_policy.worth_splitting(block_size, remainder) {
                self.split(*block, needed);
            }
            block.as_mut().free = false;
            block.as_mut().payload()
        }
    }

    /// Splits `block` (of size `needed + remainder`) into a used block
    /// of exactly `needed` bytes and a new free block carrying the
    /// remainder, linked in on both sides.
    ///
    unsafe fn split(&mut self, mut block: NonNull<BlockHeader>, needed: usize) {
        let block_ref = block.as_mut();
        let remainder_size = block_ref.size - needed;
        let new_addr = block_ref.addr() + needed;
        let new_ptr = new_addr as *mut BlockHeader;

        ptr::write(
            new_ptr,
            BlockHeader {
                magic: MAGIC,
                size: remainder_size,
                free: true,
                next: block_ref.next,
                prev: Some(block),
            },
        );
        let mut new_block = NonNull::new_unchecked(new_ptr);

        if let Some(mut next) = block_ref.next {
            next.as_mut().prev = Some(new_block);
        }
        block_ref.next = Some(new_block);
        block_ref.size = needed;
        let _ = new_block.as_mut();
    }

    fn find_free_block(&self, needed: usize) -> Result<Option<NonNull<BlockHeader>>, Error> {
        let mut current = self.head;
        while let Some(block) = current {
            let block_ref = unsafe { block.as_ref() };
            if block_ref.magic != MAGIC {
                return Err(Error::Corrupt);
            }
            if block_ref.free && block_ref.size >= needed {
                return Ok(Some(block));
            }
            current = block_ref.next;
        }
        Ok(None)
    }

    /// Frees the block behind `payload`, coalescing with either
    /// physically adjacent neighbour that is also free.
    ///
    /// # Safety
    ///
    /// `payload` must be a live pointer returned by a previous
    /// [`Heap::alloc`] or [`Heap::realloc`] on this heap.
    ///
    pub unsafe fn free(&mut self, payload: NonNull<u8>) -> Result<(), Error> {
        let mut block = BlockHeader::from_payload(payload);
        if block.as_ref().magic != MAGIC {
            return Err(Error::Corrupt);
        }
        block.as_mut().free = true;

        // Coalesce forward.
        if let Some(next) = block.as_ref().next {
            if next.as_ref().free && block.as_ref().end_addr() == next.as_ref().addr() {
                let next_ref = next.as_ref();
                let next_size = next_ref.size;
                let next_next = next_ref.next;
                block.as_mut().size += next_size;
                block.as_mut().next = next_next;
                if let Some(mut next_next) = next_next {
                    next_next.as_mut().prev = Some(block);
                }
            }
        }

        // Coalesce backward.
        if let Some(mut prev) = block.as_ref().prev {
            if prev.as_ref().free && prev.as_ref().end_addr() == block.as_ref().addr() {
                let block_size = block.as_ref().size;
                let block_next = block.as_ref().next;
                prev.as_mut().size += block_size;
                prev.as_mut().next = block_next;
                if let Some(mut next) = block_next {
                    next.as_mut().prev = Some(prev);
                }
                if self.head == Some(block) {
                    self.head = Some(prev);
                }
            }
        }

        Ok(())
    }

    /// `ptr == None` behaves as [`alloc`](Heap::alloc); `size == 0`
    /// behaves as [`free`](Heap::free) and returns `None`; otherwise
    /// the block shrinks in place if it already fits, or a fresh block
    /// is allocated, `min(old_payload, size)` bytes are copied in, and
    /// the old block is freed.
    ///
    /// # Safety
    ///
    /// `ptr`, if present, must be a live pointer returned by a previous
    /// [`Heap::alloc`] or [`Heap::realloc`] on this heap.
    ///
    pub unsafe fn realloc(&mut self, ptr: Option<NonNull<u8>>, size: usize) -> Result<Option<NonNull<u8>>, Error> {
        let ptr = match ptr {
            None => return self.alloc(size),
            Some(ptr) => ptr,
        };
        if size == 0 {
            self.free(ptr)?;
            return Ok(None);
        }

        let block = BlockHeader::from_payload(ptr);
        if block.as_ref().magic != MAGIC {
            return Err(Error::Corrupt);
        }
        let old_payload = block.as_ref().size - Self::header_size();
        if size <= old_payload {
            return Ok(Some(ptr));
        }

        let new_ptr = self.alloc(size)?;
        if let Some(new_ptr) = new_ptr {
            ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_payload.min(size));
            self.free(ptr)?;
        }
        Ok(new_ptr)
    }

    /// Maps `additional` further bytes (rounded up to whole pages)
    /// immediately after the heap's current end, appends a new free
    /// block spanning them, and coalesces it into the previous last
    /// block if that block is free and adjacent.
    ///
    pub fn expand(&mut self, additional: u32) -> Result<bool, Error> {
        let expansion_size = align_up_u32(additional, PAGE_SIZE);
        let current_end = self.start + self.size;

        if map_range(current_end, expansion_size).is_err() {
            return Ok(false);
        }

        let mut last = self.head;
        while let Some(block) = last {
            match unsafe { block.as_ref().next } {
                Some(next) => last = Some(next),
                None => break,
            }
        }

        let new_ptr = current_end.as_mut_ptr() as *mut BlockHeader;
        unsafe {
            ptr::write(
                new_ptr,
                BlockHeader {
                    magic: MAGIC,
                    size: expansion_size as usize,
                    free: true,
                    next: None,
                    prev: last,
                },
            );
        }
        let mut new_block = NonNull::new(new_ptr).expect("current_end is never null");

        if let Some(mut last) = last {
            unsafe { last.as_mut().next = Some(new_block) };
        } else {
            self.head = Some(new_block);
        }

        self.size += expansion_size;

        if let Some(mut last) = last {
            unsafe {
                if last.as_ref().free && last.as_ref().end_addr() == new_block.as_ref().addr() {
                    let addition = new_block.as_ref().size;
                    last.as_mut().size += addition;
                    last.as_mut().next = None;
                    let _ = new_block.as_mut();
                }
            }
        }

        Ok(true)
    }

    /// The total number of bytes this heap currently spans.
    ///
    pub fn total_bytes(&self) -> u32 {
        self.size
    }

    /// The number of bytes currently handed out to callers.
    ///
    pub fn used_bytes(&self) -> usize {
        let mut used = 0;
        let mut current = self.head;
        while let Some(block) = current {
            let block_ref = unsafe { block.as_ref() };
            if !block_ref.free {
                used += block_ref.size;
            }
            current = block_ref.next;
        }
        used
    }

    /// The number of bytes currently free.
    ///
    pub fn free_bytes(&self) -> usize {
        self.size as usize - self.used_bytes()
    }
}

fn map_range(start: VirtAddr, size: u32) -> Result<(), Error> {
    let mut offset = 0;
    while offset < size {
        let frame: PhysAddr = physmem::alloc().ok_or(Error::OutOfMemory)?;
        virtmem::map_page(start + offset, frame, PageTableFlags::WRITABLE)
            .map_err(|_| Error::OutOfMemory)?;
        offset += PAGE_SIZE;
    }
    Ok(())
}

/// Wraps a heap in a [`spin::Mutex`] so [`GlobalAlloc`] can be
/// implemented on a shared, interior-mutable type.
///
struct Locked<A> {
    inner: Mutex<A>,
}

impl<A> Locked<A> {
    const fn new(inner: A) -> Self {
        Locked {
            inner: Mutex::new(inner),
        }
    }
}

/// Logs `message` and halts forever; reached only when the heap's own
/// bookkeeping is found to be corrupt, which nothing downstream of the
/// allocator can safely recover from.
///
fn fatal_halt(message: &str) -> ! {
    serial::println!("HEAP FATAL: {}", message);
    loop {
        cpu::halt();
    }
}

unsafe impl GlobalAlloc for Locked<Heap> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut heap = self.inner.lock();
        match heap.alloc(layout.size()) {
            Ok(Some(ptr)) => ptr.as_ptr(),
            Ok(None) => ptr::null_mut(),
            Err(Error::Corrupt) => fatal_halt("heap corruption detected during alloc"),
            Err(Error::OutOfMemory) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let ptr = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => return,
        };
        let mut heap = self.inner.lock();
        if let Err(Error::Corrupt) = heap.free(ptr) {
            fatal_halt("heap corruption detected during dealloc");
        }
    }
}

#[global_allocator]
static ALLOCATOR: Locked<Heap> = Locked::new(Heap::empty());

/// Initialises the global allocator over `size` bytes starting at
/// `start`, using `split_policy` for [`Heap::alloc`]'s block-splitting
/// decision.
///
/// # Safety
///
/// See [`Heap::init`]. Must be called exactly once, after
/// [`virtmem::init`].
///
pub unsafe fn init(start: VirtAddr, size: u32, split_policy: SplitPolicy) -> Result<(), Error> {
    ALLOCATOR.inner.lock().init(start, size, split_policy)
}

/// The total number of bytes the global heap currently spans.
///
pub fn total_bytes() -> u32 {
    ALLOCATOR.inner.lock().total_bytes()
}

/// The number of bytes of the global heap currently handed out.
///
pub fn used_bytes() -> usize {
    ALLOCATOR.inner.lock().used_bytes()
}

/// The number of bytes of the global heap currently free.
///
pub fn free_bytes() -> usize {
    ALLOCATOR.inner.lock().free_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Backed by a static array rather than a fresh frame: init()'s
    // frame and page-mapping calls require a running CPU, so these
    // tests build the block list directly instead, exercising the
    // same split/coalesce logic init() would otherwise set up.
    static mut BACKING: [u8; PAGE_SIZE as usize] = [0; PAGE_SIZE as usize];

    fn backing_heap() -> (Heap, *mut u8) {
        let memory = unsafe { BACKING.as_mut_ptr() };
        let mut heap = Heap::empty();
        heap.start = VirtAddr::new(memory as u32);
        heap.size = PAGE_SIZE;
        heap.split_policy = SplitPolicy::ReclaimQuarter;
        unsafe {
            ptr::write(
                memory as *mut BlockHeader,
                BlockHeader {
                    magic: MAGIC,
                    size: heap.size as usize,
                    free: true,
                    next: None,
                    prev: None,
                },
            );
        }
        heap.head = NonNull::new(memory as *mut BlockHeader);
        (heap, memory)
    }

    #[test]
    fn alloc_then_free_reclaims_the_block() {
        let (mut heap, _memory) = backing_heap();
        let ptr = heap.alloc(64).unwrap().expect("allocation should succeed");
        assert_eq!(heap.used_bytes() > 0, true);
        unsafe { heap.free(ptr).unwrap() };
        assert_eq!(heap.used_bytes(), 0);
    }

    #[test]
    fn split_leaves_a_free_remainder() {
        let (mut heap, _memory) = backing_heap();
        let _ptr = heap.alloc(64).unwrap().unwrap();
        // The remainder of the page, after a 64-byte allocation plus
        // its header, is well over 25% of the original block, so a
        // split must have happened, leaving some bytes still free.
        assert!(heap.free_bytes() > 0);
    }

    #[test]
    fn corrupt_magic_is_detected() {
        let (mut heap, memory) = backing_heap();
        unsafe { (*(memory as *mut BlockHeader)).magic = 0 };
        assert_eq!(heap.alloc(16), Err(Error::Corrupt));
    }

    #[test]
    fn realloc_with_null_behaves_as_alloc() {
        let (mut heap, _memory) = backing_heap();
        let ptr = unsafe { heap.realloc(None, 32).unwrap() };
        assert!(ptr.is_some());
    }

    #[test]
    fn realloc_with_zero_size_frees_and_returns_none() {
        let (mut heap, _memory) = backing_heap();
        let ptr = heap.alloc(32).unwrap().unwrap();
        let result = unsafe { heap.realloc(Some(ptr), 0).unwrap() };
        assert!(result.is_none());
        assert_eq!(heap.used_bytes(), 0);
    }
}
