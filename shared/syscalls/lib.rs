// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides the list of syscalls implemented by the kernel.
//!
//! This crate is deliberately dependency-free and `#![no_std]` so it
//! can be linked into both the kernel and any user-mode program that
//! wants to issue `int 0x80` by number instead of by magic constant.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::panic)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]
#![forbid(unsafe_code)]

/// The set of syscalls implemented by the kernel.
///
/// Invocation convention: `EAX` holds the number below, `EBX`/`ECX`/
/// `EDX` hold up to three arguments in order, trapped via `int 0x80`.
/// The return value comes back in `EAX`.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Syscall {
    /// Give up the rest of the current quantum and let the scheduler
    /// pick the next runnable process. Takes no arguments.
    Yield = 50,

    /// Mark the calling process `Exited` and dispatch. Takes the exit
    /// status in `EBX`; never returns to the caller.
    Exit = 51,

    /// Return the calling process's pid. Takes no arguments.
    Pid = 55,

    /// Write `count` bytes from `buf` to the open file `fd`. Takes
    /// `fd` in `EBX`, `buf` in `ECX`, `count` in `EDX`.
    Write = 60,
    // Ensure new values are added to check_numerical_conversion below.
}

impl Syscall {
    /// Returns the syscall with the given numerical value, or `None`
    /// if it is not recognised.
    ///
    pub fn from_u32(num: u32) -> Option<Self> {
        match num {
            50 => Some(Self::Yield),
            51 => Some(Self::Exit),
            55 => Some(Self::Pid),
            60 => Some(Self::Write),
            _ => None,
        }
    }

    /// Returns the numerical value used for this syscall in `EAX`.
    ///
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// The set of possible error codes returned by a syscall, distinct
/// from the ordinary (non-negative) return values the table above
/// hands back.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SyscallError {
    /// The requested syscall number does not exist, or has not been
    /// implemented.
    BadSyscall = -1,

    /// A pointer argument failed validation: it did not lie entirely
    /// within the user address range, or the backing pages were not
    /// present and user-accessible in the calling process's address
    /// space.
    BadPointer = -2,

    /// A file descriptor argument did not refer to an open file.
    BadDescriptor = -3,
}

impl SyscallError {
    /// Returns the raw `EAX` value a syscall should return for this
    /// error.
    ///
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_numbers_round_trip() {
        let syscalls = [Syscall::Yield, Syscall::Exit, Syscall::Pid, Syscall::Write];

        for syscall in syscalls.iter().copied() {
            assert_eq!(Some(syscall), Syscall::from_u32(syscall.as_u32()));
        }
    }

    #[test]
    fn unrecognised_numbers_are_rejected() {
        assert_eq!(None, Syscall::from_u32(0));
        assert_eq!(None, Syscall::from_u32(61));
    }

    #[test]
    fn error_codes_are_negative() {
        assert!(SyscallError::BadSyscall.as_i32() < 0);
        assert!(SyscallError::BadPointer.as_i32() < 0);
        assert!(SyscallError::BadDescriptor.as_i32() < 0);
    }
}
