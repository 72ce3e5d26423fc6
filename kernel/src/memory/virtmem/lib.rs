// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Builds and maintains the two-level i386 page tables.
//!
//! Every usable physical frame is identity-mapped once, at [`init`], and
//! stays mapped forever: this is what lets the rest of the kernel (the
//! heap's frame bookkeeping, a freshly allocated page table) dereference
//! a [`PhysAddr`] it just got from [`physmem`] without a separate
//! physical-memory window. [`memlayout::KERNEL_SPACE`] is a second,
//! non-identity region used for the kernel heap and anything else that
//! should appear at the same address in every process.
//!
//! A CPU trap does not switch `CR3`: whichever directory was loaded
//! when a process was dispatched stays loaded for every interrupt,
//! fault, and syscall serviced on its behalf, right up until the
//! scheduler dispatches someone else. That means the kernel's own
//! code, and everything it touches through the identity map while
//! handling such a trap, must resolve correctly no matter which
//! process's directory is active — not just the shared
//! [`memlayout::KERNEL_SPACE`] range. [`create_user_directory`]
//! therefore copies every populated low page-directory entry (the
//! kernel image and the whole identity map) verbatim, in addition to
//! the kernel-range entries, into every address space it builds; a
//! change to any of them is visible to all. [`memlayout::USER_CODE`]
//! and [`memlayout::USER_STACK`] are deliberately placed above where
//! that identity map ever reaches, so a process's own private mappings
//! never land on a page-directory entry the kernel or another process
//! is sharing.

#![no_std]
#![deny(clippy::wildcard_imports)]

use addr::{PhysAddr, VirtAddr};
use bitflags::bitflags;
use spin::Mutex;

bitflags! {
    /// The flag bits of an i386 page-directory or page-table entry.
    ///
    pub struct PageTableFlags: u32 {
        /// The entry refers to a mapped frame or table.
        const PRESENT = 1 << 0;
        /// The mapped frame may be written to.
        const WRITABLE = 1 << 1;
        /// The mapped frame is accessible from ring 3.
        const USER_ACCESSIBLE = 1 << 2;
        /// The mapped frame uses write-through, not write-back, caching.
        const WRITE_THROUGH = 1 << 3;
        /// The mapped frame is not cached.
        const CACHE_DISABLE = 1 << 4;
        /// Set by the CPU the first time the entry is used for a translation.
        const ACCESSED = 1 << 5;
        /// Set by the CPU the first time the mapped frame is written to.
        const DIRTY = 1 << 6;
        /// In a PDE, makes the entry map a 4 MiB page directly instead
        /// of pointing at a page table. Unused: this kernel never
        /// enables PSE, so no PDE this crate builds ever sets it.
        const PAGE_SIZE = 1 << 7;
    }
}

const FRAME_MASK: u32 = 0xffff_f000;
const ENTRIES_PER_TABLE: usize = 1024;

/// The ways a mapping operation can fail.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// No physical frame was available to back a new mapping or a new
    /// page table.
    OutOfMemory,
}

/// A single 4 KiB page directory or page table: 1024 32-bit entries.
///
#[repr(C, align(4096))]
struct Table {
    entries: [u32; ENTRIES_PER_TABLE],
}

impl Table {
    fn zero(&mut self) {
        self.entries = [0; ENTRIES_PER_TABLE];
    }

    fn is_present(&self, index: usize) -> bool {
        self.entries[index] & PageTableFlags::PRESENT.bits() != 0
    }

    fn frame(&self, index: usize) -> PhysAddr {
        PhysAddr::new(self.entries[index] & FRAME_MASK)
    }

    fn set(&mut self, index: usize, frame: PhysAddr, flags: PageTableFlags) {
        self.entries[index] = (frame.as_u32() & FRAME_MASK) | flags.bits();
    }

    fn clear(&mut self, index: usize) {
        self.entries[index] = 0;
    }
}

/// Returns the identity-mapped virtual address backing the frame at
/// `phys`.
///
/// Valid once [`init`] has run: every frame [`physmem::alloc`] can hand
/// out is within the range [`init`] identity-mapped.
///
fn table_at(phys: PhysAddr) -> &'static mut Table {
    unsafe { &mut *(phys.as_u32() as *mut Table) }
}

/// A process's own page directory: the kernel-range PDEs are shared
/// with every other address space, but the user range is private.
///
pub struct AddressSpace {
    directory: PhysAddr,
}

impl AddressSpace {
    /// The physical address of this address space's page directory,
    /// suitable for loading into CR3.
    ///
    pub fn directory(&self) -> PhysAddr {
        self.directory
    }
}

static KERNEL_DIRECTORY: Mutex<Option<PhysAddr>> = Mutex::new(None);

fn kernel_directory() -> PhysAddr {
    KERNEL_DIRECTORY
        .lock()
        .expect("virtmem used before init")
}

fn indices(virt: VirtAddr) -> (usize, usize) {
    (
        virt.page_directory_index() as usize,
        virt.page_table_index() as usize,
    )
}

/// Ensures a page table exists for `pd_index` in `directory`, creating
/// and zeroing one via [`physmem::alloc`] if necessary, and returns it.
///
fn table_for(directory: &mut Table, pd_index: usize, flags: PageTableFlags) -> Result<&'static mut Table, Error> {
    if !directory.is_present(pd_index) {
        let frame = physmem::alloc().ok_or(Error::OutOfMemory)?;
        let table = table_at(frame);
        table.zero();
        directory.set(
            pd_index,
            frame,
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | (flags & PageTableFlags::USER_ACCESSIBLE),
        );
    }
    Ok(table_at(directory.frame(pd_index)))
}

/// Builds the kernel's page directory, identity-maps every frame up to
/// `total_memory_bytes`, optionally identity-maps a linear framebuffer,
/// and enables paging.
///
/// # Safety
///
/// Must be called exactly once, after [`physmem::init`] and before
/// anything else in the kernel dereferences a pointer derived from a
/// physical address.
///
pub unsafe fn init(
    total_memory_bytes: u32,
    framebuffer: Option<(PhysAddr, u32)>,
) -> Result<(), Error> {
    let directory_frame = physmem::alloc().ok_or(Error::OutOfMemory)?;
    let directory = table_at(directory_frame);
    directory.zero();
    *KERNEL_DIRECTORY.lock() = Some(directory_frame);

    let total_frames = total_memory_bytes / addr::PAGE_SIZE;
    for index in 0..total_frames {
        identity_map_frame(directory, PhysAddr::from_frame_index(index))?;
    }

    if let Some((base, length)) = framebuffer {
        let start_frame = base.align_down().frame_index();
        let end_frame = (base + length).align_up().frame_index();
        for index in start_frame..end_frame {
            identity_map_frame(directory, PhysAddr::from_frame_index(index))?;
        }
    }

    cpu::load_page_directory(directory_frame);
    cpu::enable_paging();

    Ok(())
}

fn identity_map_frame(directory: &mut Table, frame: PhysAddr) -> Result<(), Error> {
    let virt = VirtAddr::new(frame.as_u32());
    let (pd_index, pt_index) = indices(virt);
    let table = table_for(directory, pd_index, PageTableFlags::empty())?;
    if !table.is_present(pt_index) {
        table.set(pt_index, frame, PageTableFlags::PRESENT | PageTableFlags::WRITABLE);
        cpu::invalidate_page(virt.as_u32());
    }
    Ok(())
}

/// Identity-maps `frame` in the kernel's own directory: `frame(phys) →
/// phys`, present and writable. A no-op if already mapped.
///
pub fn identity_map_page(phys: PhysAddr) -> Result<(), Error> {
    let directory = table_at(kernel_directory());
    identity_map_frame(directory, phys.align_down())
}

/// Maps `virt` to `phys` in the kernel's own directory with `flags`
/// (which is OR-ed with the implicit present bit).
///
pub fn map_page(virt: VirtAddr, phys: PhysAddr, flags: PageTableFlags) -> Result<(), Error> {
    map_in(&AddressSpace {
        directory: kernel_directory(),
    }, virt, phys, flags)
}

/// Clears the mapping for `virt` in the kernel's own directory.
///
/// Not having a covering page table, or not having `virt` mapped, is
/// not an error: both are treated as an already-unmapped page.
///
pub fn unmap_page(virt: VirtAddr) {
    let directory = table_at(kernel_directory());
    let (pd_index, pt_index) = indices(virt);
    if !directory.is_present(pd_index) {
        serial::println!("virtmem: unmap_page({:?}): no page table covers this address", virt);
        return;
    }
    let table = table_at(directory.frame(pd_index));
    if !table.is_present(pt_index) {
        serial::println!("virtmem: unmap_page({:?}): already unmapped", virt);
        return;
    }
    table.clear(pt_index);
    cpu::invalidate_page(virt.align_down().as_u32());
}

fn walk(directory: PhysAddr, virt: VirtAddr) -> Option<(PhysAddr, PageTableFlags)> {
    let directory = table_at(directory);
    let (pd_index, pt_index) = indices(virt);
    if !directory.is_present(pd_index) {
        return None;
    }
    let table = table_at(directory.frame(pd_index));
    if !table.is_present(pt_index) {
        return None;
    }
    let flags = PageTableFlags::from_bits_truncate(table.entries[pt_index]);
    Some((table.frame(pt_index) + virt.page_offset(), flags))
}

/// Walks the kernel's own directory, returning the physical address
/// `virt` currently resolves to, or `None` if either level is absent.
///
pub fn translate(virt: VirtAddr) -> Option<PhysAddr> {
    walk(kernel_directory(), virt).map(|(phys, _)| phys)
}

/// Walks whichever directory is currently loaded into CR3, returning
/// the physical address `virt` resolves to together with the flags on
/// its page-table entry, or `None` if either level is absent.
///
/// Used to validate a pointer handed in from ring 3: the directory
/// loaded at the time of the trap is the faulting process's own, so
/// this (unlike [`translate`]) reflects what that process can actually
/// address.
///
pub fn translate_active(virt: VirtAddr) -> Option<(PhysAddr, PageTableFlags)> {
    walk(cpu::current_page_directory(), virt)
}

/// Allocates a new directory, copies every populated entry from the
/// kernel's own directory verbatim, and leaves the rest of the user
/// range empty.
///
/// This covers both the shared [`memlayout::KERNEL_SPACE`] range and
/// the low entries backing the kernel image and the identity map: the
/// kernel keeps running under whichever directory is loaded for as
/// long as this process is current, so all of it — not just
/// [`memlayout::KERNEL_SPACE`] — must resolve identically in the
/// returned space and in the kernel's own. Only the user range, which
/// [`memlayout::USER_CODE`]/[`memlayout::USER_STACK`] are chosen to
/// keep clear of, is private to the new space.
///
pub fn create_user_directory() -> Result<AddressSpace, Error> {
    let frame = physmem::alloc().ok_or(Error::OutOfMemory)?;
    let new_directory = table_at(frame);
    new_directory.zero();

    let kernel_directory = table_at(kernel_directory());
    for index in 0..ENTRIES_PER_TABLE {
        new_directory.entries[index] = kernel_directory.entries[index];
    }

    Ok(AddressSpace { directory: frame })
}

/// Same contract as [`map_page`], but against `space` instead of the
/// kernel's own directory.
///
pub fn map_in(
    space: &AddressSpace,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PageTableFlags,
) -> Result<(), Error> {
    let directory = table_at(space.directory);
    let (pd_index, pt_index) = indices(virt);
    let table = table_for(directory, pd_index, flags)?;
    table.set(pt_index, phys, flags | PageTableFlags::PRESENT);
    cpu::invalidate_page(virt.align_down().as_u32());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_round_trip_through_raw_bits() {
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        assert_eq!(flags.bits(), 0b11);
        assert!(flags.contains(PageTableFlags::PRESENT));
        assert!(!flags.contains(PageTableFlags::USER_ACCESSIBLE));
    }

    #[test]
    fn frame_mask_strips_flag_bits() {
        let mut table = Table {
            entries: [0; ENTRIES_PER_TABLE],
        };
        table.set(0, PhysAddr::new(0x0040_3000), PageTableFlags::PRESENT | PageTableFlags::WRITABLE);
        assert_eq!(table.frame(0), PhysAddr::new(0x0040_3000));
        assert!(table.is_present(0));
    }
}
