// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Drives the [8259 Programmable Interrupt Controller] pair and lets
//! the rest of the kernel register IRQ handlers without touching the
//! PIC's I/O ports directly.
//!
//! [8259 Programmable Interrupt Controller]: https://wiki.osdev.org/8259_PIC

use crate::InterruptFrame;
use cpu::Port;
use spin::Mutex;

/// The IDT vector the first (master) PIC line is remapped to.
///
pub const PIC_1_OFFSET: u8 = 32;
/// The IDT vector the first slave PIC line is remapped to.
///
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
const ICW4_8086: u8 = 0x01;
const PIC_EOI: u8 = 0x20;

struct Pic {
    command: Port<u8>,
    data: Port<u8>,
}

struct ChainedPics {
    master: Pic,
    slave: Pic,
}

impl ChainedPics {
    const fn new() -> Self {
        ChainedPics {
            master: Pic {
                command: Port::new(0x20),
                data: Port::new(0x21),
            },
            slave: Pic {
                command: Port::new(0xA0),
                data: Port::new(0xA1),
            },
        }
    }

    /// Remaps the PICs so their vectors fall after the CPU's exception
    /// vectors, then masks every line (IRQs are enabled individually
    /// as handlers are registered, via [`register_irq`]).
    ///
    unsafe fn init(&mut self) {
        self.master.command.write(ICW1_INIT | ICW1_ICW4);
        self.slave.command.write(ICW1_INIT | ICW1_ICW4);

        self.master.data.write(PIC_1_OFFSET);
        self.slave.data.write(PIC_2_OFFSET);

        self.master.data.write(4); // slave is cascaded on IRQ2
        self.slave.data.write(2); // slave's own cascade identity

        self.master.data.write(ICW4_8086);
        self.slave.data.write(ICW4_8086);

        self.master.data.write(0xff);
        self.slave.data.write(0xff);
    }

    unsafe fn read_masks(&mut self) -> (u8, u8) {
        (self.master.data.read(), self.slave.data.read())
    }

    unsafe fn write_masks(&mut self, master: u8, slave: u8) {
        self.master.data.write(master);
        self.slave.data.write(slave);
    }

    /// Sends an End-Of-Interrupt to whichever PIC(s) own `vector`.
    ///
    unsafe fn notify_end_of_interrupt(&mut self, vector: u8) {
        if vector >= PIC_2_OFFSET {
            self.slave.command.write(PIC_EOI);
        }
        self.master.command.write(PIC_EOI);
    }
}

static PICS: Mutex<ChainedPics> = Mutex::new(ChainedPics::new());

/// Remaps and masks the PIC pair. Call once, before enabling
/// interrupts.
///
pub(crate) fn init() {
    unsafe { PICS.lock().init() };
}

/// An IRQ line, in the range `0..=15`.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Irq(u8);

impl Irq {
    /// Returns the IRQ numbered `irq`, or `None` if `irq` is greater
    /// than 15.
    ///
    pub const fn new(irq: u8) -> Option<Irq> {
        if irq <= 15 {
            Some(Irq(irq))
        } else {
            None
        }
    }

    /// Returns the IDT vector this IRQ is remapped to.
    ///
    pub const fn vector(&self) -> u8 {
        self.0 + PIC_1_OFFSET
    }
}

/// The signature every IRQ handler must have.
///
pub type IrqHandler = fn(&InterruptFrame, Irq);

static HANDLERS: Mutex<[Option<IrqHandler>; 16]> = Mutex::new([None; 16]);

/// Registers `handler` to run whenever `irq` fires, and unmasks the
/// line on the PIC.
///
/// The kernel sends the End-Of-Interrupt before `handler` runs (see
/// [`dispatch`](crate::dispatch)), so `handler` does not need to, and
/// must not, acknowledge the PIC itself.
///
/// # Panics
///
/// Panics if `irq` already has a handler registered.
///
pub fn register_irq(irq: Irq, handler: IrqHandler) {
    cpu::without_interrupts(|| {
        let mut handlers = HANDLERS.lock();
        if handlers[irq.0 as usize].is_some() {
            panic!("IRQ {} already has a handler registered", irq.0);
        }
        handlers[irq.0 as usize] = Some(handler);

        let mut pics = PICS.lock();
        let (mut master_mask, mut slave_mask) = unsafe { pics.read_masks() };
        if irq.0 < 8 {
            master_mask &= !(1 << irq.0);
        } else {
            slave_mask &= !(1 << (irq.0 - 8));
            master_mask &= !(1 << 2); // unmask the cascade line
        }
        unsafe { pics.write_masks(master_mask, slave_mask) };
    });
}

pub(crate) fn dispatch(frame: &InterruptFrame, vector: u8) {
    let irq = Irq(vector - PIC_1_OFFSET);

    // The redesign corrects the original kernel's ordering: EOI goes
    // out before the handler runs, not after, so a handler that
    // triggers a context switch (the timer, in particular) does not
    // leave the PIC waiting on an interrupt that will never return
    // through this stack frame.
    unsafe { PICS.lock().notify_end_of_interrupt(irq.vector()) };

    if let Some(handler) = HANDLERS.lock()[irq.0 as usize] {
        handler(frame, irq);
    }
}
