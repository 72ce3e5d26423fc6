// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Reads just enough of the Multiboot1 boot-information record to feed
//! [`physmem::init`] and [`virtmem::init`].
//!
//! This is the minimum shape a Multiboot-compliant bootloader's record
//! is guaranteed to have, not a general-purpose parser: the kernel
//! only ever reads it once, at start-up, before anything else touches
//! physical memory directly.

use addr::PhysAddr;
use physmem::{MemoryRegion, RegionKind};

/// The value the bootloader leaves in `EAX` on entry.
///
pub const MAGIC: u32 = 0x2BADB002;

const FLAG_MEM: u32 = 1 << 0;
const FLAG_MMAP: u32 = 1 << 6;

/// The maximum number of memory-map entries [`regions`] will read.
/// Comfortably larger than anything BIOS `int 0x15, eax=0xe820` or a
/// typical Multiboot loader reports.
///
const MAX_REGIONS: usize = 32;

#[repr(C, packed)]
struct RawInfo {
    flags: u32,
    mem_lower: u32,
    mem_upper: u32,
    boot_device: u32,
    cmdline: u32,
    mods_count: u32,
    mods_addr: u32,
    syms: [u32; 4],
    mmap_length: u32,
    mmap_addr: u32,
}

#[repr(C, packed)]
struct RawMmapEntry {
    size: u32,
    base_addr: u64,
    length: u64,
    entry_type: u32,
}

const MMAP_TYPE_AVAILABLE: u32 = 1;

/// A parsed view of the fields C1/C2 need from the boot-information
/// record at `info_ptr`.
///
pub struct BootInfo {
    pub total_memory_bytes: u32,
    pub region_count: usize,
    pub regions: [MemoryRegion; MAX_REGIONS],
}

/// Reads `info_ptr` as a Multiboot1 boot-information record.
///
/// # Safety
///
/// `magic` must be the value the bootloader left in `EAX`, and
/// `info_ptr` must be the untouched pointer it left in `EBX`: this
/// dereferences it directly, before paging is enabled.
///
pub unsafe fn read(magic: u32, info_ptr: u32) -> Option<BootInfo> {
    if magic != MAGIC {
        return None;
    }
    let info = &*(info_ptr as *const RawInfo);

    let total_memory_bytes = if info.flags & FLAG_MEM != 0 {
        (info.mem_lower + info.mem_upper) * 1024
    } else {
        return None;
    };

    let mut regions = [MemoryRegion {
        base: PhysAddr::new(0),
        length: 0,
        kind: RegionKind::Reserved,
    }; MAX_REGIONS];
    let mut region_count = 0;

    if info.flags & FLAG_MMAP != 0 {
        let mut cursor = info.mmap_addr;
        let end = info.mmap_addr + info.mmap_length;
        while cursor < end && region_count < MAX_REGIONS {
            let entry = &*(cursor as *const RawMmapEntry);
            regions[region_count] = MemoryRegion {
                base: PhysAddr::new(entry.base_addr as u32),
                length: entry.length as u32,
                kind: if entry.entry_type == MMAP_TYPE_AVAILABLE {
                    RegionKind::Usable
                } else {
                    RegionKind::Reserved
                },
            };
            region_count += 1;
            cursor += entry.size + core::mem::size_of::<u32>() as u32;
        }
    }

    Some(BootInfo {
        total_memory_bytes,
        region_count,
        regions,
    })
}

impl BootInfo {
    /// The parsed memory-map entries, in boot order.
    ///
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions[..self.region_count]
    }
}
