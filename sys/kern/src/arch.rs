// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Collaborators the kernel runs on top of.
//!
//! The kernel core never touches page tables, physical memory, or devices
//! directly. Everything below the core is expressed as a trait here, and a
//! platform provides a single type implementing all of them (`Machine`).
//!
//! The only in-tree platform is `sim`, which keeps "physical memory" and page
//! tables in ordinary heap structures.

use core::fmt;

use abi::{PagePerm, TrapFrame};

/// Asserts a kernel invariant.
macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
    ($cond:expr, $($arg:tt)+) => {
        assert!($cond, $($arg)+)
    };
}

/// Writes a line to the operator console.
///
/// `$con` is any place holding a `Console`, typically `self.machine`.
macro_rules! kprintln {
    ($con:expr, $($arg:tt)*) => {{
        use core::fmt::Write as _;
        let _ = writeln!($crate::arch::ConsoleWriter(&mut $con), $($arg)*);
    }};
}

pub mod sim;

/// Handle on a physical page.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PageRef(pub u32);

/// The allocator or page-table code ran out of physical pages.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OutOfMemory;

impl From<OutOfMemory> for abi::Error {
    fn from(_: OutOfMemory) -> Self {
        abi::Error::NoMem
    }
}

/// Physical page allocator, with reference counting.
pub trait FrameAllocator {
    /// Allocates a zero-filled page. The caller holds its only reference and
    /// must drop it with `decref` once it has been mapped (or not).
    fn alloc_zeroed(&mut self) -> Result<PageRef, OutOfMemory>;
    fn incref(&mut self, page: PageRef);
    /// Drops a reference, returning the page to the free pool at zero.
    fn decref(&mut self, page: PageRef);
    /// Contents of a page, `PGSIZE` bytes.
    fn page(&self, page: PageRef) -> &[u8];
    fn page_mut(&mut self, page: PageRef) -> &mut [u8];
}

/// Page-table manipulation.
///
/// Mapping a page takes a reference on it and unmapping drops one, so the
/// page-table code needs the allocator.
pub trait PageTables: FrameAllocator {
    /// Handle on the root of one address space.
    type Space: Copy + Eq + fmt::Debug;

    fn create_space(&mut self) -> Result<Self::Space, OutOfMemory>;

    /// Releases an address space's own structure. Callers remove every user
    /// mapping first.
    fn destroy_space(&mut self, space: Self::Space);

    /// Maps `page` at `va` with `perm | PRESENT`, replacing whatever was
    /// mapped there before.
    fn map(
        &mut self,
        space: Self::Space,
        page: PageRef,
        va: u32,
        perm: PagePerm,
    ) -> Result<(), OutOfMemory>;

    /// Removes the mapping at `va`, if any.
    fn unmap(&mut self, space: Self::Space, va: u32);

    fn lookup(&self, space: Self::Space, va: u32)
        -> Option<(PageRef, PagePerm)>;

    /// Finds the lowest mapped page address in `[from, limit)`.
    fn next_mapped(
        &self,
        space: Self::Space,
        from: u32,
        limit: u32,
    ) -> Option<u32>;

    /// Checks whether the page table behind directory slot `pdx` exists.
    fn table_present(&self, space: Self::Space, pdx: usize) -> bool;
}

/// Processor state the trap path needs to read.
pub trait Cpu {
    /// Faulting address of the most recent page fault (`cr2`).
    fn fault_address(&self) -> u32;
    fn interrupts_enabled(&self) -> bool;
}

pub trait Console {
    fn write(&mut self, bytes: &[u8]);
    /// Returns a pending input byte, if there is one.
    fn getc(&mut self) -> Option<u8>;
}

/// Adapter from `Console` to `core::fmt::Write`.
pub struct ConsoleWriter<'a, C: ?Sized>(pub &'a mut C);

impl<C: Console + ?Sized> fmt::Write for ConsoleWriter<'_, C> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write(s.as_bytes());
        Ok(())
    }
}

/// Reasons the NIC refuses an operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NicError {
    /// No free slot in the ring.
    RingFull,
    /// Nothing has been received.
    RingEmpty,
}

impl From<NicError> for abi::Error {
    fn from(e: NicError) -> Self {
        match e {
            NicError::RingFull => abi::Error::RingFull,
            NicError::RingEmpty => abi::Error::RingEmpty,
        }
    }
}

pub trait Nic {
    fn transmit(&mut self, frame: &[u8]) -> Result<(), NicError>;
    /// Copies the oldest received frame into `buf`, returning its length.
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, NicError>;
}

/// Interactive debug monitor.
pub trait Monitor {
    /// Enters the monitor. Returns when the operator lets execution
    /// continue.
    fn monitor(&mut self, tf: Option<&TrapFrame>);
}

/// Everything the kernel needs from the platform.
pub trait Machine: PageTables + Cpu + Console + Nic + Monitor {}

impl<T> Machine for T where T: PageTables + Cpu + Console + Nic + Monitor {}
