// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Handles CPU exceptions, hardware interrupts, and the system-call
//! gate, via the [Interrupt Descriptor Table] and the [8259 PIC].
//!
//! [`init`] builds and loads a 256-entry IDT covering the 32 CPU
//! exception vectors, the 16 remapped PIC lines, and the system-call
//! gate at vector `0x80`, then unmasks the PIC. Hardware interrupts are
//! otherwise dispatched through [`register_irq`]; exceptions are wired
//! up directly below. Every vector lands in Rust through one of the
//! hand-written trampolines in [`stubs`], which builds the
//! [`InterruptFrame`] the scheduler later reads and rewrites to switch
//! contexts.
//!
//! A general-protection fault or page fault that trapped from ring 3
//! is handed to [`set_fault_handler`]'s registrant instead of
//! panicking: only a fault from the kernel itself is fatal to the
//! whole machine.
//!
//! [Interrupt Descriptor Table]: https://wiki.osdev.org/Interrupt_Descriptor_Table
//! [8259 PIC]: https://wiki.osdev.org/8259_PIC

#![no_std]

mod irq;
mod stubs;

use core::mem::size_of;
use cpu::GdtDescriptor;
use lazy_static::lazy_static;
use spin::Mutex;

pub use irq::{register_irq, Irq, IrqHandler};

/// The exact register layout left on the stack by every ISR
/// trampoline in [`stubs`].
///
/// Field order matches the push order the assembly stubs use, not
/// declaration convenience: this struct is read and rewritten whole by
/// the scheduler's context switch, so its layout is load-bearing.
///
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct InterruptFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_unused: u32, // pusha's copy of the pre-pusha ESP; ignored
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub interrupt_number: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub useresp: u32,
    pub ss: u32,
}

/// A single 8-byte IDT gate descriptor.
///
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    flags: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        IdtEntry {
            offset_low: 0,
            selector: 0,
            zero: 0,
            flags: 0,
            offset_high: 0,
        }
    }

    fn new(handler: u32, selector: u16, flags: u8) -> Self {
        IdtEntry {
            offset_low: (handler & 0xffff) as u16,
            selector,
            zero: 0,
            flags,
            offset_high: ((handler >> 16) & 0xffff) as u16,
        }
    }
}

/// Gate flags for ring-0-only exception and IRQ handlers: present,
/// 32-bit interrupt gate, DPL 0.
///
const GATE_RING0: u8 = 0x8e;

/// Gate flags for the system-call vector: present, 32-bit interrupt
/// gate, DPL 3, so `int 0x80` is callable from ring 3.
///
const GATE_RING3: u8 = 0xef;

const IDT_ENTRIES: usize = 256;

lazy_static! {
    static ref IDT: Mutex<[IdtEntry; IDT_ENTRIES]> =
        Mutex::new([IdtEntry::missing(); IDT_ENTRIES]);
}

/// Builds and loads the IDT, and remaps and masks the PIC.
///
/// Every hardware IRQ line starts masked; registering a handler with
/// [`register_irq`] unmasks its line. Interrupts themselves are not
/// enabled here — the caller does that once the rest of boot has
/// finished, via [`cpu::enable_interrupts`].
///
/// # Safety
///
/// Must be called exactly once, after [`segmentation::init`].
///
pub unsafe fn init() {
    {
        let mut idt = IDT.lock();
        for &(vector, handler) in stubs::STUBS.iter() {
            let flags = if vector == 0x80 { GATE_RING3 } else { GATE_RING0 };
            idt[vector as usize] =
                IdtEntry::new(handler as usize as u32, segmentation::KERNEL_CODE_SELECTOR, flags);
        }

        let descriptor = GdtDescriptor {
            limit: (size_of::<[IdtEntry; IDT_ENTRIES]>() - 1) as u16,
            base: idt.as_ptr() as u32,
        };
        cpu::lidt(&descriptor);
    }

    irq::init();
}

static SYSCALL_HANDLER: Mutex<Option<fn(&mut InterruptFrame)>> = Mutex::new(None);

/// Registers the handler invoked for `int 0x80`.
///
/// Called once by the system-call gateway during its own init; no
/// default handler is installed, so an unclaimed `int 0x80` is a no-op
/// until one is.
///
pub fn set_syscall_handler(handler: fn(&mut InterruptFrame)) {
    *SYSCALL_HANDLER.lock() = Some(handler);
}

static FAULT_HANDLER: Mutex<Option<fn(&mut InterruptFrame)>> = Mutex::new(None);

/// Registers the handler invoked when a general-protection fault or
/// page fault traps from ring 3.
///
/// Called once, by the scheduler during its own init. A fault from ring
/// 0 always panics, regardless of whether this is registered; a fault
/// from ring 3 with no handler registered also panics, since there is
/// then no way to remove the offending process from the run queue.
///
pub fn set_fault_handler(handler: fn(&mut InterruptFrame)) {
    *FAULT_HANDLER.lock() = Some(handler);
}

/// True if `frame` trapped from ring 3, as opposed to from the kernel
/// itself.
///
fn from_user_mode(frame: &InterruptFrame) -> bool {
    frame.cs & 3 != 0
}

/// Hands `frame` to the registered fault handler, which is expected to
/// mark the offending process exited and dispatch away from it. Panics
/// if none is registered: a user-mode fault that cannot be turned into
/// a process termination is as unrecoverable as a supervisor fault.
///
fn terminate_faulting_process(frame: &mut InterruptFrame) -> ! {
    match *FAULT_HANDLER.lock() {
        Some(handler) => {
            handler(frame);
            unreachable!("fault handler returned instead of dispatching away")
        }
        None => panic!("user-mode fault before a fault handler was registered"),
    }
}

/// The common entry point every ISR trampoline calls into.
///
/// Exceptions are handled inline; hardware IRQs (vectors 32-47) are
/// forwarded to [`irq::dispatch`], which sends the End-Of-Interrupt
/// before running the registered handler; vector `0x80` is forwarded to
/// the registered system-call handler.
///
pub(crate) fn dispatch(frame: &mut InterruptFrame) {
    match frame.interrupt_number {
        0 => panic!("EXCEPTION: DIVIDE BY ZERO\n{:#?}", DebugFrame(frame)),
        3 => serial::println!("EXCEPTION: BREAKPOINT\n{:#?}", DebugFrame(frame)),
        6 => panic!("EXCEPTION: INVALID OPCODE\n{:#?}", DebugFrame(frame)),
        8 => panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", DebugFrame(frame)),
        10 => panic!(
            "EXCEPTION: INVALID TSS (selector index {})\n{:#?}",
            frame.error_code,
            DebugFrame(frame)
        ),
        11 => panic!(
            "EXCEPTION: SEGMENT NOT PRESENT (selector index {})\n{:#?}",
            frame.error_code,
            DebugFrame(frame)
        ),
        13 => {
            if from_user_mode(frame) {
                serial::println!(
                    "FAULT: GENERAL PROTECTION FAULT in user process (error code {:#x})\n{:#?}",
                    frame.error_code,
                    DebugFrame(frame)
                );
                terminate_faulting_process(frame);
            }
            panic!(
                "EXCEPTION: GENERAL PROTECTION FAULT (error code {:#x})\n{:#?}",
                frame.error_code,
                DebugFrame(frame)
            );
        }
        14 => {
            let fault_address = cpu::faulting_address();
            if from_user_mode(frame) {
                serial::println!(
                    "FAULT: PAGE FAULT in user process at {:?} (error code {:#x})\n{:#?}",
                    fault_address,
                    frame.error_code,
                    DebugFrame(frame)
                );
                terminate_faulting_process(frame);
            }
            panic!(
                "EXCEPTION: PAGE FAULT at {:?} (error code {:#x})\n{:#?}",
                fault_address,
                frame.error_code,
                DebugFrame(frame)
            );
        }
        32..=47 => irq::dispatch(frame, frame.interrupt_number as u8),
        0x80 => {
            if let Some(handler) = *SYSCALL_HANDLER.lock() {
                handler(frame);
            }
        }
        other => panic!("EXCEPTION: unhandled vector {}\n{:#?}", other, DebugFrame(frame)),
    }
}

struct DebugFrame<'a>(&'a InterruptFrame);

impl core::fmt::Debug for DebugFrame<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let frame = self.0;
        f.debug_struct("InterruptFrame")
            .field("eip", &format_args!("{:#x}", { frame.eip }))
            .field("cs", &{ frame.cs })
            .field("eflags", &format_args!("{:#x}", { frame.eflags }))
            .field("useresp", &format_args!("{:#x}", { frame.useresp }))
            .field("ss", &{ frame.ss })
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idt_entry_encodes_handler_address() {
        let entry = IdtEntry::new(0x1234_5678, 0x08, GATE_RING0);
        assert_eq!(entry.offset_low, 0x5678);
        assert_eq!(entry.offset_high, 0x1234);
        assert_eq!(entry.selector, 0x08);
        assert_eq!(entry.flags, GATE_RING0);
    }

    #[test]
    fn interrupt_frame_is_76_bytes() {
        assert_eq!(size_of::<InterruptFrame>(), 19 * 4);
    }

    fn frame_with_cs(cs: u32) -> InterruptFrame {
        InterruptFrame {
            edi: 0,
            esi: 0,
            ebp: 0,
            esp_unused: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
            interrupt_number: 0,
            error_code: 0,
            eip: 0,
            cs,
            eflags: 0,
            useresp: 0,
            ss: 0,
        }
    }

    #[test]
    fn ring3_selector_is_user_mode() {
        // Mirrors `segmentation::USER_CODE_SELECTOR` (0x1b), without
        // taking a dependency on that crate just for one constant.
        assert!(from_user_mode(&frame_with_cs(0x1b)));
    }

    #[test]
    fn ring0_selector_is_not_user_mode() {
        assert!(!from_user_mode(&frame_with_cs(0x08)));
    }
}
