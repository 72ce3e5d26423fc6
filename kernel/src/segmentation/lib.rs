// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Manages segmentation for the kernel: the [Global Descriptor Table]
//! (GDT) and the [Task State Segment] (TSS).
//!
//! The kernel runs a single CPU in 32-bit protected mode, so unlike a
//! long-mode kernel's GDT (which exists mostly to satisfy the CPU's
//! formalities, since long mode ignores most segment-limit checks),
//! every descriptor here does real work: limits are enforced, and the
//! TSS's `ss0`/`esp0` pair is what lets a ring-3 trap land on a safe,
//! process-local ring-0 stack.
//!
//! The GDT layout used is as follows:
//!
//! | Index | Selector | Descriptor    | Comment                             |
//! |-------|----------|---------------|--------------------------------------|
//! | 0     | —        | null          | Not usable                           |
//! | 1     | `0x08`   | `kernel_code` | Ring 0, all kernel code              |
//! | 2     | `0x10`   | `kernel_data` | Ring 0, kernel stacks and data       |
//! | 3     | `0x1b`   | `user_code`   | Ring 3, user code (RPL 3)            |
//! | 4     | `0x23`   | `user_data`   | Ring 3, user stacks and data (RPL 3) |
//! | 5     | `0x28`   | `task_state`  | The kernel's single TSS              |
//!
//! [Global Descriptor Table]: https://en.wikipedia.org/wiki/Global_Descriptor_Table
//! [Task State Segment]: https://en.wikipedia.org/wiki/Task_state_segment

#![no_std]

use cpu::GdtDescriptor;
use lazy_static::lazy_static;
use spin::Mutex;

/// The kernel code segment selector.
///
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
/// The kernel data segment selector.
///
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
/// The user code segment selector (already carries RPL 3).
///
pub const USER_CODE_SELECTOR: u16 = 0x1b;
/// The user data segment selector (already carries RPL 3).
///
pub const USER_DATA_SELECTOR: u16 = 0x23;
/// The TSS selector.
///
pub const TASK_STATE_SELECTOR: u16 = 0x28;

const NUM_ENTRIES: usize = 6;

/// A single raw GDT descriptor, in the i386 8-byte format.
///
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_middle: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
}

impl GdtEntry {
    const fn null() -> Self {
        GdtEntry {
            limit_low: 0,
            base_low: 0,
            base_middle: 0,
            access: 0,
            granularity: 0,
            base_high: 0,
        }
    }

    /// Builds a flat, 4 GiB descriptor with the given access and
    /// granularity bytes. `base` is always `0` for every descriptor
    /// this kernel uses other than the TSS, so only those two bytes
    /// vary between calls.
    ///
    const fn flat(access: u8, granularity: u8) -> Self {
        GdtEntry {
            limit_low: 0xffff,
            base_low: 0,
            base_middle: 0,
            access,
            granularity,
            base_high: 0,
        }
    }

    const fn at(base: u32, limit: u32, access: u8, granularity: u8) -> Self {
        GdtEntry {
            limit_low: (limit & 0xffff) as u16,
            base_low: (base & 0xffff) as u16,
            base_middle: ((base >> 16) & 0xff) as u8,
            access,
            granularity: (granularity & 0xf0) | (((limit >> 16) & 0x0f) as u8),
            base_high: ((base >> 24) & 0xff) as u8,
        }
    }
}

/// The i386 32-bit Task State Segment.
///
/// Only `ss0` and `esp0` are ever written after [`Tss::new`]; the rest
/// of the fields exist purely because the CPU expects the full
/// 104-byte structure to be present at the TSS's base address.
///
#[repr(C, packed)]
pub struct Tss {
    link: u16,
    _link_hi: u16,
    pub esp0: u32,
    pub ss0: u16,
    _ss0_hi: u16,
    esp1: u32,
    ss1: u16,
    _ss1_hi: u16,
    esp2: u32,
    ss2: u16,
    _ss2_hi: u16,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u16,
    _es_hi: u16,
    cs: u16,
    _cs_hi: u16,
    ss: u16,
    _ss_hi: u16,
    ds: u16,
    _ds_hi: u16,
    fs: u16,
    _fs_hi: u16,
    gs: u16,
    _gs_hi: u16,
    ldt: u16,
    _ldt_hi: u16,
    trap: u16,
    iomap_base: u16,
}

impl Tss {
    const fn new() -> Self {
        Tss {
            link: 0,
            _link_hi: 0,
            esp0: 0,
            ss0: KERNEL_DATA_SELECTOR,
            _ss0_hi: 0,
            esp1: 0,
            ss1: 0,
            _ss1_hi: 0,
            esp2: 0,
            ss2: 0,
            _ss2_hi: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            _es_hi: 0,
            cs: 0,
            _cs_hi: 0,
            ss: 0,
            _ss_hi: 0,
            ds: 0,
            _ds_hi: 0,
            fs: 0,
            _fs_hi: 0,
            gs: 0,
            _gs_hi: 0,
            ldt: 0,
            _ldt_hi: 0,
            trap: 0,
            iomap_base: core::mem::size_of::<Tss>() as u16,
        }
    }
}

struct SegmentData {
    gdt: [GdtEntry; NUM_ENTRIES],
    tss: Tss,
}

lazy_static! {
    static ref SEGMENTS: Mutex<SegmentData> = Mutex::new(SegmentData {
        gdt: [GdtEntry::null(); NUM_ENTRIES],
        tss: Tss::new(),
    });
}

/// Builds the GDT and TSS, loads them into the CPU, and reloads every
/// segment register so the kernel runs under its own descriptors
/// instead of whatever flat GDT the bootloader left behind.
///
/// # Safety
///
/// Must be called exactly once, early in boot, before any code relies
/// on the kernel's own selectors or on `esp0` being meaningful.
///
pub unsafe fn init() {
    let mut segments = SEGMENTS.lock();

    let tss_base = (&segments.tss as *const Tss) as u32;
    let tss_limit = (core::mem::size_of::<Tss>() - 1) as u32;

    segments.gdt[0] = GdtEntry::null();
    segments.gdt[1] = GdtEntry::flat(0x9a, 0xcf); // kernel code
    segments.gdt[2] = GdtEntry::flat(0x92, 0xcf); // kernel data
    segments.gdt[3] = GdtEntry::flat(0xfa, 0xcf); // user code (RPL 3)
    segments.gdt[4] = GdtEntry::flat(0xf2, 0xcf); // user data (RPL 3)
    segments.gdt[5] = GdtEntry::at(tss_base, tss_limit, 0x89, 0x00); // TSS, present, 32-bit, available

    let descriptor = GdtDescriptor {
        limit: (core::mem::size_of::<[GdtEntry; NUM_ENTRIES]>() - 1) as u16,
        base: segments.gdt.as_ptr() as u32,
    };

    cpu::lgdt(&descriptor);
    cpu::reload_code_segment(KERNEL_CODE_SELECTOR);
    cpu::reload_data_segments(KERNEL_DATA_SELECTOR);
    cpu::ltr(TASK_STATE_SELECTOR);
}

/// Updates the TSS so the next ring-3 to ring-0 trap lands on
/// `kernel_stack_top`, which must be the top of the new current
/// process's kernel stack.
///
/// Called by the scheduler on every context switch; `ss0` never
/// changes, since the kernel only ever runs with one data selector.
///
pub fn set_kernel_stack(kernel_stack_top: u32) {
    let mut segments = SEGMENTS.lock();
    segments.tss.esp0 = kernel_stack_top;
    segments.tss.ss0 = KERNEL_DATA_SELECTOR;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_match_gdt_indices() {
        assert_eq!(KERNEL_CODE_SELECTOR, 1 * 8);
        assert_eq!(KERNEL_DATA_SELECTOR, 2 * 8);
        assert_eq!(USER_CODE_SELECTOR, 3 * 8 + 3);
        assert_eq!(USER_DATA_SELECTOR, 4 * 8 + 3);
        assert_eq!(TASK_STATE_SELECTOR, 5 * 8);
    }

    #[test]
    fn tss_layout_is_104_bytes() {
        assert_eq!(core::mem::size_of::<Tss>(), 104);
    }
}
