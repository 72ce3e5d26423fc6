// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Contains constants describing the virtual memory layout.
//!
//! Kernel address ranges occupy the upper quarter of the 4 GiB virtual
//! space, so that a single set of page-directory entries can be shared,
//! verbatim, by the kernel directory and every user address space. User
//! ranges occupy the remaining three quarters, private to each process.
//!
//! | Region               |           Start address |            Last address |          Size |
//! | -------------------- | -----------------------: | -----------------------: | -------------: |
//! | [`LOW_MEMORY_BOUNDARY`] |              `0x0` |              `0xf_ffff` |         1 MiB |
//! | [`USER_SPACE`]       |              `0x10_0000` |             `0xbfff_ffff` |       ~3 GiB |
//! | [`USER_CODE`]        |             `0xb000_0000` |             `0xb000_0fff` |         4 KiB |
//! | [`USER_STACK`]       |             `0xb000_1000` |             `0xb000_1fff` |         4 KiB |
//! | [`KERNEL_SPACE`]     |             `0xc000_0000` |             `0xffff_ffff` |         1 GiB |
//! | [`KERNEL_HEAP_START`]|             `0xd000_0000` |             `0xd00f_ffff` |         1 MiB |
//!
//! [`LOW_MEMORY_BOUNDARY`] marks a physical, not virtual, boundary (it
//! holds the real-mode IVT, BDA, and legacy BIOS structures, and is
//! never handed out by the physical frame allocator); it is named here
//! because [`USER_SPACE`] is defined relative to it.
//!
//! [`USER_CODE`] and [`USER_STACK`] sit in the top 256 MiB of
//! [`USER_SPACE`], well above where `virtmem`'s identity map of
//! physical RAM ever reaches on the machine sizes this kernel targets.
//! That gap matters: `virtmem::create_user_directory` shares every low
//! page-directory entry the kernel directory has populated (the kernel
//! image and the whole identity map) with every user directory it
//! builds, so that kernel code stays mapped no matter whose directory
//! is loaded. If a process's own private mappings landed in one of
//! those shared page-directory entries, mapping its code or stack
//! would overwrite a page table every other address space is still
//! relying on.

#![no_std]

use addr::VirtAddr;

/// A contiguous range of virtual addresses, inclusive of both ends.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VirtAddrRange {
    first: VirtAddr,
    last: VirtAddr,
}

impl VirtAddrRange {
    /// Returns a new range, from `start` to `end`, inclusive.
    ///
    pub const fn new(start: VirtAddr, end: VirtAddr) -> Self {
        VirtAddrRange {
            first: start,
            last: end,
        }
    }

    /// Returns the first address in the range.
    ///
    pub const fn start(&self) -> VirtAddr {
        self.first
    }

    /// Returns the last address in the range.
    ///
    pub const fn end(&self) -> VirtAddr {
        self.last
    }

    /// Returns whether `addr` falls within this range.
    ///
    pub const fn contains(&self, addr: VirtAddr) -> bool {
        self.first.as_u32() <= addr.as_u32() && addr.as_u32() <= self.last.as_u32()
    }
}

/// The legacy low-memory region (real-mode IVT, BIOS data area, and
/// similar); never handed out by the physical frame allocator.
///
pub const LOW_MEMORY_BOUNDARY: u32 = 0x10_0000;

/// The range of virtual addresses available to user processes.
///
pub const USER_SPACE: VirtAddrRange =
    VirtAddrRange::new(VirtAddr::new(LOW_MEMORY_BOUNDARY), VirtAddr::new(0xbfff_ffff));

/// The fixed virtual address a user process's code image is mapped at.
///
/// Chosen high in [`USER_SPACE`], clear of any address `virtmem::init`
/// would ever identity-map on this kernel's target machines; see the
/// module documentation.
///
pub const USER_CODE: VirtAddr = VirtAddr::new(0xb000_0000);

/// The fixed virtual address of the base of a user process's stack
/// page. The stack pointer starts at the top of this page, since the
/// stack grows down.
///
pub const USER_STACK: VirtAddr = VirtAddr::new(0xb000_1000);

/// The range of virtual addresses reserved for the kernel, identical
/// in every address space.
///
pub const KERNEL_SPACE: VirtAddrRange =
    VirtAddrRange::new(VirtAddr::new(0xc000_0000), VirtAddr::new(0xffff_ffff));

/// The region used for the kernel's heap.
///
pub const KERNEL_HEAP_START: VirtAddr = VirtAddr::new(0xd000_0000);

/// The size in bytes of the kernel heap's initial mapping.
///
pub const KERNEL_HEAP_SIZE: u32 = 0x10_0000; // 1 MiB.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_space_excludes_low_memory() {
        assert!(!USER_SPACE.contains(VirtAddr::new(0)));
        assert!(USER_SPACE.contains(VirtAddr::new(LOW_MEMORY_BOUNDARY)));
    }

    #[test]
    fn kernel_space_is_disjoint_from_user_space() {
        assert!(!USER_SPACE.contains(KERNEL_SPACE.start()));
        assert!(!KERNEL_SPACE.contains(USER_SPACE.end()));
    }
}
