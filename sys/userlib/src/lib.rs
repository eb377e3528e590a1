// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User environment support library.
//!
//! This contains syscall stubs and the user-level halves of the kernel's
//! mechanisms: the page-fault upcall, copy-on-write `fork`, retrying IPC, and
//! the network helper loops. It re-exports the contents of the `abi` crate
//! that gets shared with the kernel.
//!
//! # Runtimes
//!
//! Nothing in here executes a trap instruction directly. Everything that
//! touches the machine goes through the [`Runtime`] trait: issuing a syscall,
//! reading and writing user memory, and peeking at the read-only page table
//! and environment views the kernel exposes. A runtime on real hardware does
//! these with `int $0x30` and plain loads and stores; the hosted simulator
//! does them against an in-memory kernel. Either way, memory accesses may
//! page-fault, and a fault is handled (or kills the environment) before
//! `load` or `store` returns.
//!
//! # Syscall stubs
//!
//! Each `sys_foo` function marshals its arguments into the five argument
//! words, issues syscall `foo`, and decodes the result word, turning negative
//! results into `Error`.

#![cfg_attr(not(test), no_std)]

#[macro_use]
pub mod macros;

pub use abi::*;

pub mod console;
pub mod fork;
pub mod ipc;
pub mod net;
pub mod pgfault;

/// Address of the assembly page-fault entry point that user environments
/// register with `sys_env_set_pgfault_upcall`. It sits in the first page of
/// program text, just past the `_start` stub.
pub const PGFAULT_UPCALL_ENTRY: u32 = UTEXT + 0x20;

/// Page-fault handler, called on the exception stack with the fault record.
pub type PgfaultHandler<R> = fn(&mut R, &UTrapframe);

/// Everything the library needs from the machine underneath it.
pub trait Runtime: Sized {
    /// Issues syscall `nr` with `args` in the five argument registers and
    /// returns the result register.
    fn syscall(&mut self, nr: Sysnum, args: [u32; 5]) -> u32;

    /// Is page table `pdx` present? Reads the page directory through the
    /// user-visible page table mapping.
    fn vpd(&self, pdx: usize) -> bool;

    /// Permissions of the page mapped at `va`, or `None` if nothing is.
    fn vpt(&self, va: u32) -> Option<PagePerm>;

    /// Read-only view of environment slot `index`.
    fn env_info(&self, index: usize) -> EnvInfo;

    /// Reads user memory at `va` into `buf`, faulting as needed.
    fn load(&mut self, va: u32, buf: &mut [u8]);

    /// Writes `bytes` to user memory at `va`, faulting as needed.
    fn store(&mut self, va: u32, bytes: &[u8]);

    /// Cached id of the running environment.
    fn thisenv(&self) -> EnvId;
    fn set_thisenv(&mut self, id: EnvId);

    /// The page-fault handler slot read by the assembly upcall.
    fn pgfault_handler(&self) -> Option<PgfaultHandler<Self>>;
    fn set_pgfault_handler_slot(&mut self, handler: Option<PgfaultHandler<Self>>);
}

#[inline(always)]
fn syscall<R: Runtime>(
    rt: &mut R,
    nr: Sysnum,
    args: [u32; 5],
) -> Result<u32, Error> {
    Error::check(rt.syscall(nr, args))
}

/// Prints `len` bytes at `va` on the console.
pub fn sys_cputs<R: Runtime>(rt: &mut R, va: u32, len: u32) -> Result<(), Error> {
    syscall(rt, Sysnum::Cputs, [va, len, 0, 0, 0]).map(drop)
}

/// Reads a console character without blocking.
pub fn sys_cgetc<R: Runtime>(rt: &mut R) -> Option<u8> {
    match rt.syscall(Sysnum::Cgetc, [0; 5]) {
        0 => None,
        c => Some(c as u8),
    }
}

pub fn sys_getenvid<R: Runtime>(rt: &mut R) -> EnvId {
    EnvId(rt.syscall(Sysnum::GetEnvId, [0; 5]))
}

/// Destroys `id`, which must be the caller or one of its descendants.
/// `EnvId::SELF` destroys the caller, in which case this does not return.
pub fn sys_env_destroy<R: Runtime>(rt: &mut R, id: EnvId) -> Result<(), Error> {
    syscall(rt, Sysnum::EnvDestroy, [id.0, 0, 0, 0, 0]).map(drop)
}

/// Maps a fresh zeroed page at `va` in `id`'s address space.
pub fn sys_page_alloc<R: Runtime>(
    rt: &mut R,
    id: EnvId,
    va: u32,
    perm: PagePerm,
) -> Result<(), Error> {
    syscall(rt, Sysnum::PageAlloc, [id.0, va, perm.bits(), 0, 0]).map(drop)
}

/// Maps the page at `srcva` in `src` at `dstva` in `dst`, sharing it.
pub fn sys_page_map<R: Runtime>(
    rt: &mut R,
    src: EnvId,
    srcva: u32,
    dst: EnvId,
    dstva: u32,
    perm: PagePerm,
) -> Result<(), Error> {
    syscall(
        rt,
        Sysnum::PageMap,
        [src.0, srcva, dst.0, dstva, perm.bits()],
    )
    .map(drop)
}

pub fn sys_page_unmap<R: Runtime>(
    rt: &mut R,
    id: EnvId,
    va: u32,
) -> Result<(), Error> {
    syscall(rt, Sysnum::PageUnmap, [id.0, va, 0, 0, 0]).map(drop)
}

/// Creates a child with a copy of the caller's registers and an empty
/// address space. Returns the child's id in the parent and `EnvId::SELF`
/// in the child.
pub fn sys_exofork<R: Runtime>(rt: &mut R) -> Result<EnvId, Error> {
    syscall(rt, Sysnum::Exofork, [0; 5]).map(EnvId)
}

pub fn sys_env_set_status<R: Runtime>(
    rt: &mut R,
    id: EnvId,
    status: EnvStatus,
) -> Result<(), Error> {
    syscall(rt, Sysnum::EnvSetStatus, [id.0, status as u32, 0, 0, 0])
        .map(drop)
}

/// Replaces `id`'s saved registers with the `TrapFrame` at `va`.
pub fn sys_env_set_trapframe<R: Runtime>(
    rt: &mut R,
    id: EnvId,
    va: u32,
) -> Result<(), Error> {
    syscall(rt, Sysnum::EnvSetTrapframe, [id.0, va, 0, 0, 0]).map(drop)
}

/// Sets `id`'s page-fault upcall entry point; 0 removes it.
pub fn sys_env_set_pgfault_upcall<R: Runtime>(
    rt: &mut R,
    id: EnvId,
    entry: u32,
) -> Result<(), Error> {
    syscall(rt, Sysnum::EnvSetPgfaultUpcall, [id.0, entry, 0, 0, 0])
        .map(drop)
}

pub fn sys_yield<R: Runtime>(rt: &mut R) {
    rt.syscall(Sysnum::Yield, [0; 5]);
}

/// Offers `value`, and the page at `srcva` if it is below `UTOP`, to `to`.
/// Fails with `IpcNotRecv` unless `to` is waiting in `sys_ipc_recv`.
pub fn sys_ipc_try_send<R: Runtime>(
    rt: &mut R,
    to: EnvId,
    value: u32,
    srcva: u32,
    perm: PagePerm,
) -> Result<(), Error> {
    syscall(rt, Sysnum::IpcTrySend, [to.0, value, srcva, perm.bits(), 0])
        .map(drop)
}

/// Blocks until a message arrives. A page, if sent, lands at `dstva`,
/// provided it is below `UTOP`.
pub fn sys_ipc_recv<R: Runtime>(rt: &mut R, dstva: u32) -> Result<(), Error> {
    syscall(rt, Sysnum::IpcRecv, [dstva, 0, 0, 0, 0]).map(drop)
}

/// Low 32 bits of the kernel tick counter.
pub fn sys_time<R: Runtime>(rt: &mut R) -> u32 {
    rt.syscall(Sysnum::Time, [0; 5])
}

pub fn sys_transmit_frame<R: Runtime>(
    rt: &mut R,
    va: u32,
    len: usize,
) -> Result<(), Error> {
    let len = u32::try_from(len).map_err(|_| Error::Inval)?;
    syscall(rt, Sysnum::TransmitFrame, [va, len, 0, 0, 0]).map(drop)
}

/// Receives one frame into the `ETH_FRAME_LEN` bytes at `va` and returns
/// its length.
pub fn sys_receive_frame<R: Runtime>(
    rt: &mut R,
    va: u32,
) -> Result<usize, Error> {
    syscall(rt, Sysnum::ReceiveFrame, [va, 0, 0, 0, 0]).map(|n| n as usize)
}

/// Destroys the calling environment.
pub fn exit<R: Runtime>(rt: &mut R) -> ! {
    let _ = sys_env_destroy(rt, EnvId::SELF);
    panic!("environment outlived its own destruction");
}

/// Program startup: caches the environment's own id, runs `umain`, and
/// exits when it returns.
pub fn libmain<R: Runtime>(rt: &mut R, umain: impl FnOnce(&mut R)) -> ! {
    let id = sys_getenvid(rt);
    rt.set_thisenv(id);
    umain(rt);
    exit(rt)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::{BTreeMap, VecDeque};

    /// Runtime that records syscalls and answers from a script.
    #[derive(Default)]
    pub(crate) struct Fake {
        pub calls: Vec<(Sysnum, [u32; 5])>,
        /// Result words, in order; 0 once exhausted.
        pub replies: VecDeque<u32>,
        pub memory: BTreeMap<u32, u8>,
        pub pages: BTreeMap<u32, PagePerm>,
        pub info: EnvInfo,
        pub thisenv: EnvId,
        pub handler: Option<PgfaultHandler<Fake>>,
    }

    impl Fake {
        pub fn replying(replies: &[u32]) -> Self {
            Self {
                replies: replies.iter().copied().collect(),
                ..Self::default()
            }
        }

        pub fn numbers(&self) -> Vec<Sysnum> {
            self.calls.iter().map(|&(nr, _)| nr).collect()
        }
    }

    impl Runtime for Fake {
        fn syscall(&mut self, nr: Sysnum, args: [u32; 5]) -> u32 {
            self.calls.push((nr, args));
            self.replies.pop_front().unwrap_or(0)
        }

        fn vpd(&self, pdx: usize) -> bool {
            self.pages.keys().any(|&va| crate::pdx(va) == pdx)
        }

        fn vpt(&self, va: u32) -> Option<PagePerm> {
            self.pages.get(&page_round_down(va)).copied()
        }

        fn env_info(&self, _index: usize) -> EnvInfo {
            self.info
        }

        fn load(&mut self, va: u32, buf: &mut [u8]) {
            for (i, b) in buf.iter_mut().enumerate() {
                *b = self.memory.get(&(va + i as u32)).copied().unwrap_or(0);
            }
        }

        fn store(&mut self, va: u32, bytes: &[u8]) {
            for (i, &b) in bytes.iter().enumerate() {
                self.memory.insert(va + i as u32, b);
            }
        }

        fn thisenv(&self) -> EnvId {
            self.thisenv
        }

        fn set_thisenv(&mut self, id: EnvId) {
            self.thisenv = id;
        }

        fn pgfault_handler(&self) -> Option<PgfaultHandler<Self>> {
            self.handler
        }

        fn set_pgfault_handler_slot(
            &mut self,
            handler: Option<PgfaultHandler<Self>>,
        ) {
            self.handler = handler;
        }
    }

    #[test]
    fn stubs_use_the_register_order() {
        let mut rt = Fake::default();
        let perm = PagePerm::PRESENT | PagePerm::USER;
        sys_page_map(&mut rt, EnvId(1), 0x1000, EnvId(2), 0x2000, perm)
            .unwrap();
        assert_eq!(
            rt.calls,
            vec![(Sysnum::PageMap, [1, 0x1000, 2, 0x2000, perm.bits()])]
        );
    }

    #[test]
    fn negative_results_are_errors() {
        let mut rt = Fake::replying(&[
            Error::NoFreeEnv.to_return(),
            0x1001,
            Error::RingEmpty.to_return(),
        ]);
        assert_eq!(sys_exofork(&mut rt), Err(Error::NoFreeEnv));
        assert_eq!(sys_exofork(&mut rt), Ok(EnvId(0x1001)));
        assert_eq!(sys_receive_frame(&mut rt, 0x1000), Err(Error::RingEmpty));
    }

    #[test]
    fn cgetc_zero_means_nothing() {
        let mut rt = Fake::replying(&[0, b'q' as u32]);
        assert_eq!(sys_cgetc(&mut rt), None);
        assert_eq!(sys_cgetc(&mut rt), Some(b'q'));
    }

    #[test]
    fn libmain_caches_the_id_and_exits() {
        let mut rt = Fake::replying(&[0x2003]);
        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            libmain(&mut rt, |rt| {
                assert_eq!(rt.thisenv(), EnvId(0x2003));
            })
        }));
        // A fake destroy returns, which a real one never does.
        assert!(r.is_err());
        assert_eq!(rt.numbers(), vec![Sysnum::GetEnvId, Sysnum::EnvDestroy]);
        assert_eq!(rt.calls[1].1[0], 0);
    }
}
