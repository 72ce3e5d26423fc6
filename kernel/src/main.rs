// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;

/// Entry point called from `boot.s`'s `_start`, with the Multiboot
/// magic value and boot-information pointer still in the registers the
/// bootloader left them in.
///
#[no_mangle]
pub extern "C" fn kmain(magic: u32, info_ptr: u32) -> ! {
    unsafe { kernel::init(magic, info_ptr) };

    #[cfg(test)]
    test_main();

    kernel::halt_loop();
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial::println!("{}", info);
    kernel::halt_loop();
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    kernel::test_panic_handler(info)
}
