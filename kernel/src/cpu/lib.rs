// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides the handful of i386 instructions the rest of the kernel
//! needs: port I/O, interrupt-flag control, and the table-loading and
//! TLB instructions used by [`segmentation`](../segmentation/index.html)
//! and [`virtmem`](../virtmem/index.html).
//!
//! This kernel targets a 32-bit protected-mode CPU with paging but no
//! long mode, so it does not build on the 64-bit-oriented instruction
//! wrappers used elsewhere in the wider Firefly codebase; the handful
//! of primitives below are hand-written instead.

#![no_std]
#![deny(clippy::wildcard_imports)]

use addr::{PhysAddr, VirtAddr};
use core::arch::asm;

pub mod port;

pub use port::Port;

/// Disables maskable interrupts (`cli`).
///
/// # Safety
///
/// Leaves interrupts disabled until a matching [`enable_interrupts`].
/// Callers should prefer [`without_interrupts`].
///
#[inline]
pub unsafe fn disable_interrupts() {
    asm!("cli", options(nomem, nostack));
}

/// Enables maskable interrupts (`sti`).
///
/// # Safety
///
/// Must only be called once the IDT, GDT and TSS are installed.
///
#[inline]
pub unsafe fn enable_interrupts() {
    asm!("sti", options(nomem, nostack));
}

/// Returns whether the interrupt flag is currently set, by reading
/// it out of `EFLAGS`.
///
#[inline]
pub fn interrupts_enabled() -> bool {
    let flags: u32;
    unsafe {
        asm!("pushfd", "pop {}", out(reg) flags, options(nomem, preserves_flags));
    }
    flags & (1 << 9) != 0
}

/// Runs `f` with interrupts disabled, restoring the previous
/// interrupt-enable state (not unconditionally re-enabling) once `f`
/// returns.
///
/// This is the typed counterpart of the CLI/STI pairing the kernel's
/// critical sections (process creation, log emission, descriptor-table
/// writes) are specified to use; a nested call from inside a handler
/// that is already running with interrupts disabled must not turn them
/// back on early.
///
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let was_enabled = interrupts_enabled();
    if was_enabled {
        unsafe { disable_interrupts() };
    }
    let result = f();
    if was_enabled {
        unsafe { enable_interrupts() };
    }
    result
}

/// Halts the CPU until the next interrupt (`hlt`).
///
/// Used by the idle process; an interrupt (typically the timer) will
/// always wake the CPU again, so this never blocks forever.
///
#[inline]
pub fn halt() {
    unsafe {
        asm!("hlt", options(nomem, nostack, preserves_flags));
    }
}

/// Loads the GDT pointed to by `base` with byte length `limit - 1`
/// already baked into the descriptor, via `lgdt`.
///
/// # Safety
///
/// `base` must point to a valid, live GDT for the remainder of its use.
///
#[inline]
pub unsafe fn lgdt(descriptor: &GdtDescriptor) {
    asm!("lgdt [{}]", in(reg) descriptor, options(readonly, nostack, preserves_flags));
}

/// Loads the IDT pointed to by `descriptor`, via `lidt`.
///
/// # Safety
///
/// `descriptor` must point to a valid, live IDT for the remainder of
/// its use.
///
#[inline]
pub unsafe fn lidt(descriptor: &GdtDescriptor) {
    asm!("lidt [{}]", in(reg) descriptor, options(readonly, nostack, preserves_flags));
}

/// The layout consumed by `lgdt`/`lidt`: a 16-bit table limit followed
/// by a 32-bit linear base address.
///
#[repr(C, packed)]
pub struct GdtDescriptor {
    pub limit: u16,
    pub base: u32,
}

/// Loads the task register with `selector`, via `ltr`.
///
/// # Safety
///
/// `selector` must reference a valid TSS descriptor in the current GDT.
/// `ltr` may only be called once per boot; the task register cannot be
/// reloaded with a different selector without first marking the old
/// TSS descriptor not-busy.
///
#[inline]
pub unsafe fn ltr(selector: u16) {
    asm!("ltr {:x}", in(reg) selector, options(nomem, nostack, preserves_flags));
}

/// Reloads the data segment registers (DS, ES, FS, GS, SS) with
/// `selector`.
///
/// # Safety
///
/// `selector` must reference a valid, present data-segment descriptor.
///
#[inline]
pub unsafe fn reload_data_segments(selector: u16) {
    asm!(
        "mov ds, {0:x}",
        "mov es, {0:x}",
        "mov fs, {0:x}",
        "mov gs, {0:x}",
        "mov ss, {0:x}",
        in(reg) selector,
        options(nostack, preserves_flags),
    );
}

/// Performs a far jump to reload CS with `selector`, used once after
/// the GDT carrying a new code-segment descriptor is loaded.
///
/// # Safety
///
/// `selector` must reference a valid, present code-segment descriptor,
/// and `target` must be the address of a valid label to resume at.
///
#[inline]
pub unsafe fn reload_code_segment(selector: u16) {
    asm!(
        "push {0:e}",
        "lea {1:e}, [1f]",
        "push {1:e}",
        "retf",
        "1:",
        in(reg) selector as u32,
        out(reg) _,
        options(preserves_flags),
    );
}

/// Loads `directory` into CR3, switching the active page directory.
///
/// # Safety
///
/// `directory` must be the physical address of a valid, fully
/// constructed page directory with the kernel range already mapped.
///
#[inline]
pub unsafe fn load_page_directory(directory: PhysAddr) {
    asm!("mov cr3, {}", in(reg) directory.as_u32(), options(nostack, preserves_flags));
}

/// Returns the physical address of the currently active page
/// directory, as stored in CR3.
///
#[inline]
pub fn current_page_directory() -> PhysAddr {
    let value: u32;
    unsafe {
        asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    PhysAddr::new(value)
}

/// Enables paging by setting the PG bit in CR0.
///
/// # Safety
///
/// A valid page directory identity-mapping the currently executing
/// code must already be loaded into CR3.
///
#[inline]
pub unsafe fn enable_paging() {
    asm!(
        "mov {0}, cr0",
        "or {0}, 0x80000000",
        "mov cr0, {0}",
        out(reg) _,
        options(nostack, preserves_flags),
    );
}

/// Invalidates the TLB entry for `addr` (`invlpg`).
///
/// Must follow any write to the page-table entry covering `addr` in
/// the currently active directory.
///
#[inline]
pub fn invalidate_page(addr: u32) {
    unsafe {
        asm!("invlpg [{}]", in(reg) addr, options(nostack, preserves_flags));
    }
}

/// Returns the faulting linear address left in CR2 by the most recent
/// page fault.
///
/// Only meaningful when called from inside a page-fault handler, before
/// any other page fault occurs.
///
#[inline]
pub fn faulting_address() -> VirtAddr {
    let value: u32;
    unsafe {
        asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    VirtAddr::new(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn without_interrupts_is_reentrant_safe() {
        // We can't toggle the real interrupt flag in a hosted test
        // binary, but the control flow (call f, return its value)
        // must hold regardless of the CPU's actual state.
        let result = without_interrupts(|| 1 + 1);
        assert_eq!(result, 2);
    }
}
