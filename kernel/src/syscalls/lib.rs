// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The `int 0x80` gateway: decodes the trapped frame's register
//! convention into a [`firefly_syscalls::Syscall`], validates any
//! pointer argument against the calling process's own address space,
//! and delegates to [`thread`] for the actual effect.
//!
//! [`register`] installs [`dispatch`] as [`interrupts`]'s syscall
//! handler; nothing here runs before that.

#![no_std]
#![deny(clippy::wildcard_imports)]

extern crate alloc;

use addr::{VirtAddr, PAGE_SIZE};
use alloc::vec;
use firefly_syscalls::{Syscall, SyscallError};
use interrupts::InterruptFrame;
use virtmem::PageTableFlags;

/// Installs [`dispatch`] as the handler `int 0x80` calls into. Called
/// once, by kernel start-up.
///
pub fn register() {
    interrupts::set_syscall_handler(dispatch);
}

/// Decodes `frame`'s `EAX`/`EBX`/`ECX`/`EDX` as a syscall invocation,
/// carries it out, and writes the return value back into `frame.eax`.
///
/// An unrecognised syscall number is logged and answered with
/// [`SyscallError::BadSyscall`]; this never terminates the caller.
///
fn dispatch(frame: &mut InterruptFrame) {
    let result = match Syscall::from_u32(frame.eax) {
        Some(Syscall::Yield) => {
            thread::scheduler::dispatch(frame);
            0
        }
        Some(Syscall::Exit) => {
            thread::mark_current_exited();
            thread::scheduler::dispatch(frame);
            0
        }
        Some(Syscall::Pid) => thread::current_pid().as_u32() as i32,
        Some(Syscall::Write) => sys_write(frame.ebx, frame.ecx, frame.edx),
        None => {
            serial::println!("syscalls: unrecognised syscall number {}", frame.eax);
            SyscallError::BadSyscall.as_i32()
        }
    };
    frame.eax = result as u32;
}

fn sys_write(fd: u32, buf: u32, count: u32) -> i32 {
    let bytes = match copy_from_user(buf, count) {
        Some(bytes) => bytes,
        None => return SyscallError::BadPointer.as_i32(),
    };
    thread::write_fd(fd as usize, &bytes) as i32
}

/// Checks that every byte in `[ptr, ptr + len)` lies within the user
/// address range and is backed by a present, user-accessible page in
/// whichever directory is currently active.
///
/// An empty range (`len == 0`) is always valid.
///
fn validate_user_range(ptr: u32, len: u32) -> bool {
    if len == 0 {
        return true;
    }
    let last_byte = match ptr.checked_add(len - 1) {
        Some(addr) => addr,
        None => return false,
    };
    let start = VirtAddr::new(ptr);
    let end = VirtAddr::new(last_byte);
    if !memlayout::USER_SPACE.contains(start) || !memlayout::USER_SPACE.contains(end) {
        return false;
    }

    let last_page = end.align_down();
    let mut page = start.align_down();
    loop {
        let accessible = matches!(
            virtmem::translate_active(page),
            Some((_, flags))
                if flags.contains(PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE)
        );
        if !accessible {
            return false;
        }
        if page == last_page {
            return true;
        }
        page = page + PAGE_SIZE;
    }
}

/// Validates `[ptr, ptr + len)` and, if it checks out, copies it into
/// a freshly allocated kernel buffer so the rest of the dispatcher
/// never dereferences a ring-3 pointer directly.
///
fn copy_from_user(ptr: u32, len: u32) -> Option<alloc::vec::Vec<u8>> {
    if !validate_user_range(ptr, len) {
        return None;
    }
    let src = VirtAddr::new(ptr).as_ptr();
    let mut buf = vec![0u8; len as usize];
    unsafe {
        core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), len as usize);
    }
    Some(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_range_is_always_valid() {
        assert!(validate_user_range(0, 0));
        assert!(validate_user_range(0xffff_ffff, 0));
    }

    #[test]
    fn kernel_range_is_rejected() {
        assert!(!validate_user_range(memlayout::KERNEL_HEAP_START.as_u32(), 16));
    }

    #[test]
    fn range_overflowing_u32_is_rejected() {
        assert!(!validate_user_range(u32::MAX - 3, 16));
    }
}
