// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! A minimal virtual filesystem: just enough to give processes a
//! uniform `read`/`write` surface over a handful of built-in sinks.
//!
//! There is no directory tree, no inode table, and no real storage
//! backing any of this; a [`Node`] is nothing more than a pair of
//! function pointers and a path tag, constructed once at init time for
//! each sink this kernel knows about. A full filesystem (block
//! devices, a directory hierarchy, path lookup) is out of scope here.

#![no_std]

use spin::Mutex;

/// The number of file-descriptor slots in a process's open-file table.
///
pub const MAX_OPEN_FILES: usize = 8;

/// A VFS node: a read function, a write function, and the path it was
/// registered under.
///
/// Nodes are cheap to copy: every field is either a plain function
/// pointer or a `'static` string, which is exactly what lets a new
/// process inherit its parent's open-file table with a plain array
/// copy rather than any reference counting.
///
#[derive(Clone, Copy)]
pub struct Node {
    write: fn(&[u8]) -> isize,
    read: fn(&mut [u8]) -> isize,
    path: &'static str,
}

impl Node {
    /// Writes `buf` to the node, returning the number of bytes
    /// written, or a negative value on failure.
    ///
    pub fn write(&self, buf: &[u8]) -> isize {
        (self.write)(buf)
    }

    /// Reads into `buf` from the node, returning the number of bytes
    /// read, or a negative value on failure.
    ///
    pub fn read(&self, buf: &mut [u8]) -> isize {
        (self.read)(buf)
    }

    /// The path this node was registered under, such as `/dev/com1`.
    ///
    pub fn path(&self) -> &'static str {
        self.path
    }
}

/// A process's open-file table: a fixed number of slots, each either
/// empty or holding a node inherited or opened by that process.
///
pub type FdTable = [Option<Node>; MAX_OPEN_FILES];

/// The table a newly created process starts with: fd 0 unwired (no
/// stdin backend exists yet), fds 1 and 2 aliased to the terminal, and
/// fds 3 and 4 aliased to the two serial ports.
///
/// Every process created afterwards inherits a copy of whatever table
/// its parent holds at the time, so in practice only the very first
/// process ever calls this directly.
///
pub fn seed_root_fd_table() -> FdTable {
    let mut table: FdTable = [None; MAX_OPEN_FILES];
    table[1] = Some(terminal_node());
    table[2] = Some(terminal_node());
    table[3] = Some(com1_node());
    table[4] = Some(com2_node());
    table
}

/// A text console a process can be hooked up to.
///
/// The real console (VGA text mode, or a linear framebuffer) is a
/// driver concern outside this crate; this trait exists so that driver
/// can be plugged in at init time without the VFS needing to know
/// which one it is. Until one is installed, [`NullBackend`] swallows
/// everything written to it.
///
pub trait TerminalBackend: Sync {
    /// Writes `s` to the console.
    ///
    fn write_str(&self, s: &str);

    /// Clears the console.
    ///
    fn clear(&self);
}

/// A [`TerminalBackend`] that discards everything written to it.
///
/// Used as the default backend before a real one is installed, and as
/// a test double.
///
pub struct NullBackend;

impl TerminalBackend for NullBackend {
    fn write_str(&self, _s: &str) {}
    fn clear(&self) {}
}

static TERMINAL_BACKEND: Mutex<&'static dyn TerminalBackend> = Mutex::new(&NullBackend);

/// Installs the console driver that the terminal node's reads and
/// writes are forwarded to.
///
pub fn set_terminal_backend(backend: &'static dyn TerminalBackend) {
    *TERMINAL_BACKEND.lock() = backend;
}

fn terminal_write(buf: &[u8]) -> isize {
    match core::str::from_utf8(buf) {
        Ok(s) => {
            TERMINAL_BACKEND.lock().write_str(s);
            buf.len() as isize
        }
        Err(_) => -1,
    }
}

fn terminal_read(_buf: &mut [u8]) -> isize {
    // No input backend is wired up yet; a process reading from the
    // console just sees EOF.
    0
}

/// The console node, aliased onto both fd 1 and fd 2 of a fresh
/// process's open-file table.
///
pub fn terminal_node() -> Node {
    Node {
        write: terminal_write,
        read: terminal_read,
        path: "/dev/console",
    }
}

fn com1_write(buf: &[u8]) -> isize {
    cpu::without_interrupts(|| {
        let mut port = serial::COM1.lock();
        for &byte in buf {
            port.write_byte(byte);
        }
    });
    buf.len() as isize
}

fn com1_read(buf: &mut [u8]) -> isize {
    let mut port = serial::COM1.lock();
    let mut read = 0;
    for slot in buf.iter_mut() {
        match port.try_read_byte() {
            Some(byte) => {
                *slot = byte;
                read += 1;
            }
            None => break,
        }
    }
    read
}

/// The node for `/dev/com1`.
///
pub fn com1_node() -> Node {
    Node {
        write: com1_write,
        read: com1_read,
        path: "/dev/com1",
    }
}

fn com2_write(buf: &[u8]) -> isize {
    cpu::without_interrupts(|| {
        let mut port = serial::COM2.lock();
        for &byte in buf {
            port.write_byte(byte);
        }
    });
    buf.len() as isize
}

fn com2_read(buf: &mut [u8]) -> isize {
    let mut port = serial::COM2.lock();
    let mut read = 0;
    for slot in buf.iter_mut() {
        match port.try_read_byte() {
            Some(byte) => {
                *slot = byte;
                read += 1;
            }
            None => break,
        }
    }
    read
}

/// The node for `/dev/com2`.
///
pub fn com2_node() -> Node {
    Node {
        write: com2_write,
        read: com2_read,
        path: "/dev/com2",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingBackend {
        writes: AtomicUsize,
    }

    impl TerminalBackend for RecordingBackend {
        fn write_str(&self, _s: &str) {
            self.writes.fetch_add(1, Ordering::Relaxed);
        }

        fn clear(&self) {}
    }

    static RECORDING_BACKEND: RecordingBackend = RecordingBackend {
        writes: AtomicUsize::new(0),
    };

    #[test]
    fn null_backend_discards_everything() {
        let backend = NullBackend;
        backend.write_str("ignored");
        backend.clear();
    }

    #[test]
    fn terminal_node_forwards_to_installed_backend() {
        set_terminal_backend(&RECORDING_BACKEND);
        let before = RECORDING_BACKEND.writes.load(Ordering::Relaxed);
        let node = terminal_node();
        let written = node.write(b"hello");
        assert_eq!(written, 5);
        assert_eq!(RECORDING_BACKEND.writes.load(Ordering::Relaxed), before + 1);
        set_terminal_backend(&NullBackend);
    }

    #[test]
    fn terminal_write_rejects_invalid_utf8() {
        set_terminal_backend(&NullBackend);
        let node = terminal_node();
        assert_eq!(node.write(&[0xFF, 0xFE]), -1);
    }

    #[test]
    fn seed_root_fd_table_wires_the_expected_slots() {
        let table = seed_root_fd_table();
        assert!(table[0].is_none());
        assert_eq!(table[1].unwrap().path(), "/dev/console");
        assert_eq!(table[2].unwrap().path(), "/dev/console");
        assert_eq!(table[3].unwrap().path(), "/dev/com1");
        assert_eq!(table[4].unwrap().path(), "/dev/com2");
        for slot in &table[5..] {
            assert!(slot.is_none());
        }
    }
}
