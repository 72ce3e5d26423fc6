// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Tracks every 4 KiB frame of physical RAM with a single dense bitmap
//! and hands them out first-fit.
//!
//! [`init`] runs before paging is enabled, so every address this crate
//! touches is still a bare physical address; the bitmap's own backing
//! storage is placed in a scrap of usable RAM found during init, and
//! addressed directly rather than through any mapping.

#![no_std]
#![deny(clippy::wildcard_imports)]

use addr::PhysAddr;
use bitmap_index::Bitmap;
use core::slice;
use pretty::Bytes;
use spin::Mutex;

/// Whether a region reported by the boot-time memory map is available
/// for the allocator to hand out.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegionKind {
    Usable,
    Reserved,
}

/// A single entry from the boot-time memory map, as the multiboot-info
/// parser reports it.
///
#[derive(Clone, Copy, Debug)]
pub struct MemoryRegion {
    pub base: PhysAddr,
    pub length: u32,
    pub kind: RegionKind,
}

/// The ways [`init`] or [`free`] can fail.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// No usable region was large enough to hold the bitmap itself.
    NoPlacement,
    /// [`free`] was called on a frame that is already free.
    DoubleFree,
}

struct Allocator {
    bitmap: Bitmap<'static>,
    max_blocks: u32,
    used_blocks: u32,
    bitmap_base: PhysAddr,
    bitmap_bytes: u32,
}

static ALLOCATOR: Mutex<Option<Allocator>> = Mutex::new(None);

fn align_up(addr: u32, align: u32) -> u32 {
    (addr + align - 1) & !(align - 1)
}

/// Builds the bitmap and marks every frame below `kernel_start`,
/// between `kernel_start` and `kernel_end`, and underneath the bitmap
/// itself, as used; every other frame described as [`RegionKind::Usable`]
/// in `regions`, at or above [`memlayout::LOW_MEMORY_BOUNDARY`] and
/// below the 4 GiB mark, starts free.
///
/// `total_memory_bytes` is the highest address span the platform
/// reports (typically the boot-time `mem_lower + mem_upper` fields,
/// converted to bytes), which may extend past the last entry in
/// `regions`.
///
/// # Safety
///
/// Must run exactly once, before paging is enabled and before any
/// other frame is handed out by an earlier bootstrap path. `regions`
/// must accurately describe the machine's physical memory: every frame
/// marked [`RegionKind::Usable`] must genuinely be free RAM.
///
pub unsafe fn init(
    regions: &[MemoryRegion],
    total_memory_bytes: u32,
    kernel_start: PhysAddr,
    kernel_end: PhysAddr,
) -> Result<(), Error> {
    let max_blocks = total_memory_bytes / addr::PAGE_SIZE;
    let bitmap_bytes = ((max_blocks as usize) + 7) / 8;
    let bitmap_words = (bitmap_bytes + 3) / 4;

    let mut placement = None;
    for region in regions.iter().filter(|r| r.kind == RegionKind::Usable) {
        let mut safe_start = align_up(kernel_end.as_u32(), addr::PAGE_SIZE);
        if region.base.as_u32() > safe_start {
            safe_start = region.base.as_u32();
        }
        let region_end = region.base.as_u32().saturating_add(region.length);
        if region_end > safe_start && (region_end - safe_start) as usize >= bitmap_bytes {
            placement = Some(safe_start);
            break;
        }
    }
    let placement_address = placement.ok_or(Error::NoPlacement)?;

    let words = slice::from_raw_parts_mut(placement_address as *mut u32, bitmap_words);
    let mut bitmap = Bitmap::new(words, max_blocks as usize);
    bitmap.set_all();

    for region in regions.iter().filter(|r| r.kind == RegionKind::Usable) {
        let mut frame_addr = region.base.as_u32().max(memlayout::LOW_MEMORY_BOUNDARY);
        let region_end = region.base.as_u32().saturating_add(region.length);
        while frame_addr as u64 + addr::PAGE_SIZE as u64 <= region_end as u64 {
            bitmap.clear((frame_addr / addr::PAGE_SIZE) as usize);
            frame_addr += addr::PAGE_SIZE;
        }
    }

    let kernel_start_frame = kernel_start.as_u32() / addr::PAGE_SIZE;
    let kernel_end_frame = align_up(kernel_end.as_u32(), addr::PAGE_SIZE) / addr::PAGE_SIZE;
    for frame in kernel_start_frame..=kernel_end_frame {
        bitmap.set(frame as usize);
    }

    let bitmap_start_frame = placement_address / addr::PAGE_SIZE;
    let bitmap_end_frame =
        align_up(placement_address + bitmap_bytes as u32, addr::PAGE_SIZE) / addr::PAGE_SIZE;
    for frame in bitmap_start_frame..=bitmap_end_frame {
        bitmap.set(frame as usize);
    }

    let mut used_blocks = 0;
    for i in 0..max_blocks as usize {
        if bitmap.test(i) {
            used_blocks += 1;
        }
    }

    *ALLOCATOR.lock() = Some(Allocator {
        bitmap,
        max_blocks,
        used_blocks,
        bitmap_base: PhysAddr::new(placement_address),
        bitmap_bytes: bitmap_bytes as u32,
    });

    Ok(())
}

/// Returns the next available physical frame, or `None` if every
/// tracked frame is in use.
///
pub fn alloc() -> Option<PhysAddr> {
    let mut guard = ALLOCATOR.lock();
    let allocator = guard.as_mut()?;
    let index = allocator.bitmap.next_clear()?;
    allocator.bitmap.set(index);
    allocator.used_blocks += 1;
    Some(PhysAddr::from_frame_index(index as u32))
}

/// Marks `frame` as free.
///
/// # Errors
///
/// Returns [`Error::DoubleFree`] if `frame` is already marked free;
/// the bitmap is left unchanged.
///
/// # Panics
///
/// Panics if called before [`init`].
///
pub fn free(frame: PhysAddr) -> Result<(), Error> {
    let mut guard = ALLOCATOR.lock();
    let allocator = guard.as_mut().expect("physmem::free called before init");
    let index = frame.frame_index() as usize;
    if !allocator.bitmap.test(index) {
        return Err(Error::DoubleFree);
    }
    allocator.bitmap.clear(index);
    allocator.used_blocks -= 1;
    Ok(())
}

/// The total number of 4 KiB frames the allocator tracks.
///
pub fn frames_total() -> u32 {
    ALLOCATOR.lock().as_ref().map_or(0, |a| a.max_blocks)
}

/// The number of frames currently allocated.
///
pub fn frames_used() -> u32 {
    ALLOCATOR.lock().as_ref().map_or(0, |a| a.used_blocks)
}

/// The number of frames currently free.
///
pub fn frames_free() -> u32 {
    let guard = ALLOCATOR.lock();
    guard.as_ref().map_or(0, |a| a.max_blocks - a.used_blocks)
}

/// Prints a one-line summary of the allocator's state.
///
pub fn debug() {
    let guard = ALLOCATOR.lock();
    match guard.as_ref() {
        None => serial::println!("Physical memory manager: not yet initialised."),
        Some(a) => serial::println!(
            "Physical memory manager: {}/{} frames free ({} used, bitmap at {:?}, {})",
            a.max_blocks - a.used_blocks,
            a.max_blocks,
            Bytes::from_u64((a.used_blocks as u64) * addr::PAGE_SIZE as u64),
            a.bitmap_base,
            Bytes::from_u64(a.bitmap_bytes as u64)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // init() writes directly to raw physical addresses and cannot run
    // in a hosted test binary; the bitmap's own first-fit behaviour is
    // covered directly in the bitmap_index crate. These tests cover
    // the parts of this crate that don't touch real memory.

    #[test]
    fn align_up_rounds_to_page_boundary() {
        assert_eq!(align_up(0x1001, addr::PAGE_SIZE), 0x2000);
        assert_eq!(align_up(0x1000, addr::PAGE_SIZE), 0x1000);
    }

    #[test]
    fn queries_before_init_are_zero() {
        // A fresh process-local `ALLOCATOR` (as in a unit test binary
        // that never calls `init`) reports an empty allocator rather
        // than panicking.
        assert_eq!(frames_total(), 0);
        assert_eq!(frames_used(), 0);
        assert_eq!(frames_free(), 0);
    }
}
