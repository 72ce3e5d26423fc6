// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the kernel's start-up sequence, panic/fatal-error path,
//! and in-kernel test harness.
//!
//! Everything else lives in its own path-dependency crate, one per
//! subsystem:
//!
//! - [addr](::addr), [cpu](::cpu), [segmentation](::segmentation)
//! - [interrupts](::interrupts)
//! - [memory/memlayout](::memlayout), [memory/physmem](::physmem),
//!   [memory/virtmem](::virtmem), [memory/heap](::heap)
//! - [multitasking/thread](::thread)
//! - [syscalls](::syscalls), [filesystem](::filesystem)
//! - [time](::time)
//! - [drivers/serial](::serial)
//!
//! [`init`] runs once, from [`_start`](fn@crate) in `main.rs`, and
//! brings every one of those up in the dependency order C1-C6 require.

#![no_std]
#![cfg_attr(test, no_main)]
#![feature(custom_test_frameworks)]
#![test_runner(crate::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![deny(clippy::wildcard_imports)]

extern crate alloc;

mod multiboot;

use core::panic::PanicInfo;
use cpu::Port;

/// Brings up every kernel subsystem in the order C1-C6 depend on one
/// another.
///
/// `magic`/`info_ptr` are the raw values the bootloader left in
/// `EAX`/`EBX`; see [`multiboot`].
///
/// # Safety
///
/// Must be called exactly once, as the first thing the kernel does
/// after gaining control, with interrupts and paging still disabled.
///
pub unsafe fn init(magic: u32, info_ptr: u32) {
    segmentation::init();
    interrupts::init();

    let boot_info = multiboot::read(magic, info_ptr)
        .unwrap_or_else(|| fatal("multiboot: bootloader handshake failed"));

    extern "C" {
        static _kernel_start: u8;
        static _kernel_end: u8;
    }
    let kernel_start = addr::PhysAddr::new(&_kernel_start as *const u8 as u32);
    let kernel_end = addr::PhysAddr::new(&_kernel_end as *const u8 as u32);

    physmem::init(
        boot_info.regions(),
        boot_info.total_memory_bytes,
        kernel_start,
        kernel_end,
    )
    .unwrap_or_else(|err| fatal_debug("physmem::init failed", &err));

    virtmem::init(boot_info.total_memory_bytes, None)
        .unwrap_or_else(|err| fatal_debug("virtmem::init failed", &err));

    heap::init(
        memlayout::KERNEL_HEAP_START,
        memlayout::KERNEL_HEAP_SIZE,
        config::HEAP_SPLIT_POLICY,
    )
    .unwrap_or_else(|err| fatal_debug("heap::init failed", &err));

    thread::init();
    syscalls::register();

    cpu::enable_interrupts();
}

fn fatal_debug<E: core::fmt::Debug>(message: &str, err: &E) -> ! {
    serial::println!("FATAL: {}: {:?}", message, err);
    halt_loop();
}

fn fatal(message: &str) -> ! {
    serial::println!("FATAL: {}", message);
    halt_loop();
}

/// Halts the CPU with `hlt` in a loop. The kernel's only way to stop
/// without resetting: there is no unwinding target to return to.
///
pub fn halt_loop() -> ! {
    loop {
        cpu::halt();
    }
}

/// Wraps [`spin::Mutex`] so a type defined outside this crate (the
/// heap) can implement a trait (`GlobalAlloc`) that otherwise requires
/// the wrapped type to be local to this crate.
///
pub struct Locked<A> {
    inner: spin::Mutex<A>,
}

impl<A> Locked<A> {
    pub const fn new(inner: A) -> Self {
        Locked {
            inner: spin::Mutex::new(inner),
        }
    }

    pub fn lock(&self) -> spin::MutexGuard<A> {
        self.inner.lock()
    }
}

/// A function usable as a `#[test_case]` under the custom test
/// framework: runs itself, printing its own name and an `[ok]` marker
/// to the serial log on the way through.
///
pub trait Testable {
    fn run(&self);
}

impl<T> Testable for T
where
    T: Fn(),
{
    fn run(&self) {
        serial::print!("{}...\t", core::any::type_name::<T>());
        self();
        serial::println!("[ok]");
    }
}

/// Drives every `#[test_case]` function, then exits QEMU successfully.
/// Installed as `#![test_runner]` above.
///
pub fn test_runner(tests: &[&dyn Testable]) {
    serial::println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    exit_qemu(QemuExitCode::Success);
}

/// The panic handler used when the library crate itself is built as a
/// test binary (`cargo test -p kernel`); `main.rs`'s own
/// `#[panic_handler]` is used for the real kernel binary.
///
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial::println!("[failed]\n");
    serial::println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failed);
    halt_loop();
}

/// The two exit codes QEMU's `isa-debug-exit` device recognises.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Asks QEMU to exit with `exit_code`, via the `isa-debug-exit` device
/// at port `0xf4`.
///
pub fn exit_qemu(exit_code: QemuExitCode) {
    unsafe {
        let mut port: Port<u32> = Port::new(0xf4);
        port.write(exit_code as u32);
    }
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info)
}

#[cfg(test)]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    halt_loop();
}
