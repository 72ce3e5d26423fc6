// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The process table and the mechanics of creating, running, and
//! tearing down processes.
//!
//! There is always a process in slot 0, the idle process: it exists
//! from [`init`] onward, inherits whatever stack the kernel booted on,
//! and is never removed from the table. Every other process is
//! created with [`create_kernel_process`] or [`create_user_process`],
//! starts in [`ProcessState::FirstRun`], and is handed its first slice
//! of CPU time the next time [`scheduler::dispatch`] runs.
//!
//! The table itself, and every field that is mutated while a process
//! other than the current one might also touch it, lives behind a
//! single `spin::Mutex`; critical sections that also run in IRQ
//! context take it inside [`cpu::without_interrupts`].

#![no_std]

extern crate alloc;

use addr::{PhysAddr, VirtAddr};
use alloc::alloc::{alloc, Layout};
use core::mem::size_of;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use cpu::without_interrupts;
use filesystem::FdTable;
use interrupts::InterruptFrame;
use virtmem::{AddressSpace, PageTableFlags};

pub mod scheduler;
mod switch;

/// The ways process creation can fail.
///
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Error {
    /// Every slot in the process table is in use.
    ProcessTableFull,
    /// No physical frame was available for a stack or a code/data page.
    OutOfMemory,
    /// Mapping a user page failed.
    Mapping(virtmem::Error),
}

/// Uniquely identifies a process. Monotonically assigned; never
/// reused, even after the process that held it is reclaimed.
///
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Pid(u32);

impl Pid {
    /// The idle process always occupies slot 0 and always holds this
    /// pid.
    ///
    pub const IDLE: Pid = Pid(0);

    fn next() -> Pid {
        static NEXT_PID: AtomicU32 = AtomicU32::new(1);
        Pid(NEXT_PID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the pid as a plain integer.
    ///
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// Whether a process runs in ring 0 with the kernel's own address
/// space, or in ring 3 with its own.
///
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ProcessKind {
    Kernel,
    User,
}

/// A process's position in its lifecycle.
///
/// `Paused` and `Killed` are reserved for future blocking-IO work and
/// are never assigned by anything in this crate today.
///
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ProcessState {
    Stopped,
    FirstRun,
    Running,
    Paused,
    Killed,
    Exited,
}

impl ProcessState {
    fn is_runnable(self) -> bool {
        matches!(self, ProcessState::Running | ProcessState::FirstRun)
    }
}

/// A single process's metadata.
///
/// The kernel stack and (for a user process) the address space are
/// exclusively owned, but deliberately never freed when the process
/// exits: reclaiming that memory is future work, not a bug in this
/// rewrite (see `Process::mark_exited`).
///
pub struct Process {
    pid: Pid,
    parent: Pid,
    kind: ProcessKind,
    state: ProcessState,
    kernel_stack_top: VirtAddr,
    /// Valid once this process has been switched out at least once;
    /// the currently running process's copy is stale.
    stack_pointer: u32,
    address_space: Option<AddressSpace>,
    files: FdTable,
}

impl Process {
    fn mark_exited(&mut self) {
        self.state = ProcessState::Exited;
    }
}

const INITIAL_EFLAGS: u32 = 0x202; // IF set, plus the always-set bit 1.

type ProcessTable = [Option<Process>; config::MAX_PROCESSES];

// `Process` is not `Copy`, but `None` is a constant, and a repeat
// expression `[CONST; N]` is evaluated once per slot rather than
// cloned — so this builds a fixed-size table with no `lazy_static`.
const EMPTY_SLOT: Option<Process> = None;

static PROCESS_TABLE: spin::Mutex<ProcessTable> = spin::Mutex::new([EMPTY_SLOT; config::MAX_PROCESSES]);

static CURRENT_SLOT: AtomicUsize = AtomicUsize::new(0);
static KERNEL_DIRECTORY: spin::Mutex<Option<PhysAddr>> = spin::Mutex::new(None);

/// Initializes the process table with the idle process occupying slot
/// 0, and records the kernel's own page directory for later use by
/// kernel-mode process creation.
///
/// # Panics
///
/// Panics if called more than once.
///
/// # Safety
///
/// Must be called after [`virtmem::init`] and [`segmentation::init`],
/// and before any interrupt that could invoke [`scheduler::dispatch`]
/// is unmasked.
///
pub unsafe fn init() {
    let directory = cpu::current_page_directory();
    *KERNEL_DIRECTORY.lock() = Some(directory);

    let mut table = PROCESS_TABLE.lock();
    table[0] = Some(Process {
        pid: Pid::IDLE,
        parent: Pid::IDLE,
        kind: ProcessKind::Kernel,
        state: ProcessState::Running,
        // The idle process inherits whatever stack the kernel booted
        // on; this value is never read until the first time it is
        // switched out, at which point `scheduler::dispatch` writes
        // the real stack pointer here.
        kernel_stack_top: VirtAddr::new(0),
        stack_pointer: 0,
        address_space: None,
        files: filesystem::seed_root_fd_table(),
    });

    scheduler::register_handlers();
}

fn allocate_kernel_stack() -> Result<VirtAddr, Error> {
    let layout = Layout::from_size_align(config::KERNEL_STACK_SIZE, 16).unwrap();
    let base = unsafe { alloc(layout) };
    if base.is_null() {
        return Err(Error::OutOfMemory);
    }
    Ok(VirtAddr::from_ptr(base) + config::KERNEL_STACK_SIZE as u32)
}

unsafe fn write_frame(stack_top: VirtAddr, frame: InterruptFrame) -> VirtAddr {
    let frame_addr = stack_top - size_of::<InterruptFrame>() as u32;
    (frame_addr.as_mut_ptr() as *mut InterruptFrame).write(frame);
    frame_addr
}

fn allocate_slot(table: &ProcessTable) -> Option<usize> {
    table.iter().position(|slot| slot.is_none())
}

fn current_slot() -> usize {
    CURRENT_SLOT.load(Ordering::Relaxed)
}

/// The physical address of the kernel's own page directory, recorded
/// at [`init`]. Every kernel-mode process shares it rather than owning
/// one.
///
pub(crate) fn kernel_directory() -> PhysAddr {
    KERNEL_DIRECTORY.lock().expect("thread used before init")
}

/// Returns the pid of the process currently executing.
///
pub fn current_pid() -> Pid {
    without_interrupts(|| {
        PROCESS_TABLE.lock()[current_slot()]
            .as_ref()
            .expect("current process slot is empty")
            .pid
    })
}

/// Marks the current process `Exited`; its slot is reclaimed the next
/// time the scheduler passes over it. Does not itself switch away —
/// callers invoke [`scheduler::dispatch`] next.
///
pub fn mark_current_exited() {
    without_interrupts(|| {
        let mut table = PROCESS_TABLE.lock();
        let slot = current_slot();
        if let Some(process) = table[slot].as_mut() {
            process.mark_exited();
        }
    });
}

/// Writes `buf` to the current process's file descriptor `fd`,
/// returning the number of bytes written, or a negative value if `fd`
/// is not open.
///
pub fn write_fd(fd: usize, buf: &[u8]) -> isize {
    without_interrupts(|| {
        let table = PROCESS_TABLE.lock();
        let process = match table[current_slot()].as_ref() {
            Some(process) => process,
            None => return -1,
        };
        match process.files.get(fd).and_then(|slot| *slot) {
            Some(node) => node.write(buf),
            None => -1,
        }
    })
}

/// Reads into `buf` from the current process's file descriptor `fd`,
/// returning the number of bytes read, or a negative value if `fd` is
/// not open.
///
pub fn read_fd(fd: usize, buf: &mut [u8]) -> isize {
    without_interrupts(|| {
        let table = PROCESS_TABLE.lock();
        let process = match table[current_slot()].as_ref() {
            Some(process) => process,
            None => return -1,
        };
        match process.files.get(fd).and_then(|slot| *slot) {
            Some(node) => node.read(buf),
            None => -1,
        }
    })
}

/// Creates a new kernel-mode process, ready to run the next time the
/// scheduler dispatches to it.
///
/// The new process inherits a snapshot of the calling process's open
/// files, and shares the kernel's own page directory rather than
/// owning one.
///
pub fn create_kernel_process(entry_point: extern "C" fn() -> !) -> Result<Pid, Error> {
    without_interrupts(|| {
        let mut table = PROCESS_TABLE.lock();
        let slot = allocate_slot(&table).ok_or(Error::ProcessTableFull)?;
        let current = table[current_slot()]
            .as_ref()
            .expect("current process slot is empty");
        let files = current.files;
        let parent = current.pid;

        let stack_top = allocate_kernel_stack()?;
        let frame = InterruptFrame {
            edi: 0,
            esi: 0,
            ebp: 0,
            esp_unused: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            ds: segmentation::KERNEL_DATA_SELECTOR as u32,
            es: segmentation::KERNEL_DATA_SELECTOR as u32,
            fs: segmentation::KERNEL_DATA_SELECTOR as u32,
            gs: segmentation::KERNEL_DATA_SELECTOR as u32,
            interrupt_number: 0,
            error_code: 0,
            eip: entry_point as usize as u32,
            cs: segmentation::KERNEL_CODE_SELECTOR as u32,
            eflags: INITIAL_EFLAGS,
            useresp: 0,
            ss: 0,
        };
        let stack_pointer = unsafe { write_frame(stack_top, frame) };

        let pid = Pid::next();
        table[slot] = Some(Process {
            pid,
            parent,
            kind: ProcessKind::Kernel,
            state: ProcessState::FirstRun,
            kernel_stack_top: stack_top,
            stack_pointer: stack_pointer.as_u32(),
            address_space: None,
            files,
        });

        Ok(pid)
    })
}

/// Creates a new user-mode process: a fresh address space, a mapped
/// code page with `code` copied in, and a mapped stack page, ready to
/// run the next time the scheduler dispatches to it.
///
/// `code` must fit within `config::USER_CODE_FRAMES` pages.
///
pub fn create_user_process(code: &[u8]) -> Result<Pid, Error> {
    without_interrupts(|| {
        let mut table = PROCESS_TABLE.lock();
        let slot = allocate_slot(&table).ok_or(Error::ProcessTableFull)?;
        let current = table[current_slot()]
            .as_ref()
            .expect("current process slot is empty");
        let files = current.files;
        let parent = current.pid;

        let space = virtmem::create_user_directory().map_err(Error::Mapping)?;

        let code_frame = map_user_region(
            &space,
            memlayout::USER_CODE,
            config::USER_CODE_FRAMES,
        )?;
        map_user_region(&space, memlayout::USER_STACK, config::USER_STACK_FRAMES)?;

        assert!(
            code.len() <= (config::USER_CODE_FRAMES * addr::PAGE_SIZE) as usize,
            "user code image does not fit in the mapped code region"
        );
        unsafe {
            let dest = core::slice::from_raw_parts_mut(code_frame.as_u32() as *mut u8, code.len());
            dest.copy_from_slice(code);
        }

        let stack_top = allocate_kernel_stack()?;
        let user_stack_top = memlayout::USER_STACK + addr::PAGE_SIZE;
        let frame = InterruptFrame {
            edi: 0,
            esi: 0,
            ebp: 0,
            esp_unused: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            ds: segmentation::USER_DATA_SELECTOR as u32,
            es: segmentation::USER_DATA_SELECTOR as u32,
            fs: segmentation::USER_DATA_SELECTOR as u32,
            gs: segmentation::USER_DATA_SELECTOR as u32,
            interrupt_number: 0,
            error_code: 0,
            eip: memlayout::USER_CODE.as_u32(),
            cs: segmentation::USER_CODE_SELECTOR as u32,
            eflags: INITIAL_EFLAGS,
            useresp: user_stack_top.as_u32(),
            ss: segmentation::USER_DATA_SELECTOR as u32,
        };
        let stack_pointer = unsafe { write_frame(stack_top, frame) };

        let pid = Pid::next();
        table[slot] = Some(Process {
            pid,
            parent,
            kind: ProcessKind::User,
            state: ProcessState::FirstRun,
            kernel_stack_top: stack_top,
            stack_pointer: stack_pointer.as_u32(),
            address_space: Some(space),
            files,
        });

        Ok(pid)
    })
}

/// Maps `frame_count` consecutive writable, user-accessible pages
/// starting at `base` in `space`, returning the physical address of
/// the first frame (identity-mapped, so the caller can write through
/// it directly while the kernel's own directory is still active).
///
fn map_user_region(space: &AddressSpace, base: VirtAddr, frame_count: u32) -> Result<PhysAddr, Error> {
    let mut first_frame = None;
    for index in 0..frame_count {
        let frame = physmem::alloc().ok_or(Error::OutOfMemory)?;
        if first_frame.is_none() {
            first_frame = Some(frame);
        }
        let virt = base + index * addr::PAGE_SIZE;
        virtmem::map_in(
            space,
            virt,
            frame,
            PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
        )
        .map_err(Error::Mapping)?;
    }
    Ok(first_frame.expect("frame_count must be at least 1"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_state_runnable_set_is_exact() {
        assert!(ProcessState::Running.is_runnable());
        assert!(ProcessState::FirstRun.is_runnable());
        assert!(!ProcessState::Stopped.is_runnable());
        assert!(!ProcessState::Paused.is_runnable());
        assert!(!ProcessState::Killed.is_runnable());
        assert!(!ProcessState::Exited.is_runnable());
    }

    #[test]
    fn pid_allocation_is_monotonic_and_skips_idle() {
        let first = Pid::next();
        let second = Pid::next();
        assert_ne!(first, Pid::IDLE);
        assert!(second.as_u32() > first.as_u32());
    }
}
