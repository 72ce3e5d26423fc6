// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Drives the 16550-compatible UARTs behind the legacy COM port
//! addresses.
//!
//! The UART's internal line discipline (baud rate, parity, flow
//! control) is not specified by the kernel's design beyond what is
//! needed to get a byte in or out; this module implements the minimum
//! register dance to satisfy that, not a complete 16550 driver.

#![no_std]
#![deny(clippy::wildcard_imports)]

use core::fmt;
use cpu::Port;
use lazy_static::lazy_static;
use spin::Mutex;

/// The legacy I/O port base address of COM1.
///
pub const COM1_BASE: u16 = 0x3F8;

/// The legacy I/O port base address of COM2.
///
pub const COM2_BASE: u16 = 0x2F8;

const LINE_ENABLE_DLAB: u8 = 0x80;
const LINE_8N1: u8 = 0x03;
const FIFO_ENABLE_CLEAR_14: u8 = 0xC7;
const MODEM_RTS_DSR: u8 = 0x0B;
const LINE_STATUS_OUTPUT_EMPTY: u8 = 0x20;
const LINE_STATUS_INPUT_FULL: u8 = 0x01;

/// A single 16550-compatible UART, addressed by its base I/O port.
///
pub struct ComPort {
    data: Port<u8>,
    interrupt_enable: Port<u8>,
    fifo_control: Port<u8>,
    line_control: Port<u8>,
    modem_control: Port<u8>,
    line_status: Port<u8>,
}

impl ComPort {
    /// Returns a port driver for the UART at `base`. Call
    /// [`init`](Self::init) before using it.
    ///
    pub const fn new(base: u16) -> Self {
        ComPort {
            data: Port::new(base),
            interrupt_enable: Port::new(base + 1),
            fifo_control: Port::new(base + 2),
            line_control: Port::new(base + 3),
            modem_control: Port::new(base + 4),
            line_status: Port::new(base + 5),
        }
    }

    /// Programs the UART for 38400 baud, 8 data bits, no parity, one
    /// stop bit, with the receive FIFO enabled.
    ///
    pub fn init(&mut self) {
        unsafe {
            self.interrupt_enable.write(0x00);
            self.line_control.write(LINE_ENABLE_DLAB);
            self.data.write(0x03); // divisor low byte: 38400 baud
            self.interrupt_enable.write(0x00); // divisor high byte
            self.line_control.write(LINE_8N1);
            self.fifo_control.write(FIFO_ENABLE_CLEAR_14);
            self.modem_control.write(MODEM_RTS_DSR);
        }
    }

    /// Writes a single byte, blocking until the transmit holding
    /// register is empty.
    ///
    pub fn write_byte(&mut self, byte: u8) {
        unsafe {
            while self.line_status.read() & LINE_STATUS_OUTPUT_EMPTY == 0 {}
            self.data.write(byte);
        }
    }

    /// Returns the next received byte, or `None` if the receive FIFO
    /// is currently empty.
    ///
    pub fn try_read_byte(&mut self) -> Option<u8> {
        unsafe {
            if self.line_status.read() & LINE_STATUS_INPUT_FULL != 0 {
                Some(self.data.read())
            } else {
                None
            }
        }
    }
}

impl fmt::Write for ComPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
        Ok(())
    }
}

lazy_static! {
    /// The COM1 port, used as the kernel's default log sink (and as
    /// a VFS node with path tag `"/dev/com1"`).
    ///
    pub static ref COM1: Mutex<ComPort> = {
        let mut port = ComPort::new(COM1_BASE);
        port.init();
        Mutex::new(port)
    };
    /// The COM2 port, exposed purely as a VFS node with path tag
    /// `"/dev/com2"`.
    ///
    pub static ref COM2: Mutex<ComPort> = {
        let mut port = ComPort::new(COM2_BASE);
        port.init();
        Mutex::new(port)
    };
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    cpu::without_interrupts(|| {
        COM1.lock().write_fmt(args).expect("write to COM1 failed");
    });
}

/// Prints to the kernel's serial log, without a trailing newline.
///
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::_print(format_args!($($arg)*))
    };
}

/// Prints to the kernel's serial log, with a trailing newline.
///
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
