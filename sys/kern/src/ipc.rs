// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Blocking single-slot IPC.
//!
//! A receiver parks itself with `IpcRecv`, naming where it wants a page if
//! one comes along. The first `IpcTrySend` aimed at it delivers a word (and
//! maybe a page) and makes it runnable again; every later sender is told
//! `IpcNotRecv` until the receiver asks again. There is no queue, and a
//! sender never blocks in the kernel. Retrying is the user library's job.

use abi::{is_page_aligned, Error, PagePerm, UTOP};

use crate::arch::Machine;
use crate::env::{Access, ArchState, NextEnv};
use crate::err::UserError;
use crate::startup::Kernel;

impl<M: Machine> Kernel<M> {
    /// Implementation of the IPC_TRY_SEND syscall.
    pub(crate) fn sys_ipc_try_send(
        &mut self,
        caller: usize,
    ) -> Result<NextEnv, UserError> {
        let args = self.envs[caller].save().as_send_args();
        let target = self.envs.lookup(args.target, caller, Access::Any)?;

        // "Never asked" and "already served" look the same to senders.
        if !self.envs[target].accepting_delivery() {
            return Err(Error::IpcNotRecv.into());
        }

        let offered = if args.srcva < UTOP {
            if !is_page_aligned(args.srcva) {
                return Err(Error::Inval.into());
            }
            let perm =
                PagePerm::from_syscall(args.perm).ok_or(Error::Inval)?;
            let (page, have) = self
                .machine
                .lookup(self.envs[caller].space(), args.srcva)
                .ok_or(Error::Inval)?;
            if perm.contains(PagePerm::WRITABLE)
                && !have.contains(PagePerm::WRITABLE)
            {
                return Err(Error::Inval.into());
            }
            Some((page, perm))
        } else {
            None
        };

        // A page only moves if the receiver asked for one.
        let perm = match (offered, self.envs[target].receive_dstva()) {
            (Some((page, perm)), Some(dstva)) => {
                let space = self.envs[target].space();
                self.machine.map(space, page, dstva, perm)?;
                perm
            }
            _ => PagePerm::empty(),
        };

        let from = self.envs[caller].id();
        self.envs[target].deliver(from, args.value, perm);
        klog!("ipc {:08x} -> {:08x}", from.0, self.envs[target].id().0);
        self.ret(caller, 0)
    }

    /// Implementation of the IPC_RECV syscall.
    ///
    /// On success the caller blocks. Its result register already holds 0,
    /// which is what it sees once a sender wakes it.
    pub(crate) fn sys_ipc_recv(
        &mut self,
        caller: usize,
    ) -> Result<NextEnv, UserError> {
        let dstva = self.envs[caller].save().arg0();
        if dstva < UTOP && !is_page_aligned(dstva) {
            return Err(Error::Inval.into());
        }
        // Zero, like anything at or above UTOP, asks for no page.
        let dstva = Some(dstva).filter(|&va| va != 0 && va < UTOP);

        self.envs[caller].begin_receive(dstva);
        self.ret(caller, 0)?;
        Ok(NextEnv::Other)
    }
}

#[cfg(test)]
mod tests {
    use abi::{EnvId, EnvStatus, Sysnum, UTEXT};

    use crate::arch::sim::SimMachine;
    use crate::arch::PageTables;
    use crate::syscalls::tests::{call, map_new, poke, running, RO, RW};
    use crate::trap::Resume;

    use super::*;

    const USTACK_BOTTOM: u32 = abi::USTACKTOP - abi::PGSIZE;

    /// Two runnable environments, `a` on the CPU.
    fn pair() -> (Kernel<SimMachine>, EnvId, EnvId) {
        let (mut k, a) = running();
        let b = k.spawn(UTEXT).unwrap();
        k.set_status(b, EnvStatus::Runnable).unwrap();
        (k, a, b)
    }

    /// Has `a` (on the CPU) block in receive, so that `b` runs.
    fn park(k: &mut Kernel<SimMachine>, dstva: u32, next: EnvId) {
        let (resume, r) = call(k, Sysnum::IpcRecv, [dstva, 0, 0, 0, 0]);
        assert_eq!(r, Ok(0));
        assert_eq!(resume, Resume::Env(next));
    }

    #[test]
    fn recv_blocks_and_send_wakes() {
        let (mut k, a, b) = pair();
        park(&mut k, 0, b);
        assert_eq!(k.env(a.index()).status(), EnvStatus::NotRunnable);
        assert!(k.env_info(a.index()).ipc_recving);

        let (resume, r) = call(&mut k, Sysnum::IpcTrySend, [a.0, 42, UTOP, 0, 0]);
        assert_eq!(r, Ok(0));
        assert_eq!(resume, Resume::Env(b));

        let info = k.env_info(a.index());
        assert!(!info.ipc_recving);
        assert_eq!(info.status, EnvStatus::Runnable);
        assert_eq!(info.ipc_value, 42);
        assert_eq!(info.ipc_from, b);
        assert_eq!(info.ipc_perm, PagePerm::empty());
        assert_eq!(k.saved_frame(a.index()).regs.eax, 0);
    }

    #[test]
    fn only_the_first_sender_gets_through() {
        let (mut k, a, b) = pair();
        let c = k.spawn(UTEXT).unwrap();
        k.set_status(c, EnvStatus::Runnable).unwrap();
        park(&mut k, 0, b);

        assert_eq!(call(&mut k, Sysnum::IpcTrySend, [a.0, 1, UTOP, 0, 0]).1, Ok(0));
        // Let c run and try second.
        assert_eq!(call(&mut k, Sysnum::Yield, [0; 5]).0, Resume::Env(c));
        assert_eq!(
            call(&mut k, Sysnum::IpcTrySend, [a.0, 2, UTOP, 0, 0]).1,
            Err(Error::IpcNotRecv)
        );
        assert_eq!(k.env_info(a.index()).ipc_value, 1);
    }

    #[test]
    fn sending_to_a_runner_fails() {
        let (mut k, _, b) = pair();
        assert_eq!(
            call(&mut k, Sysnum::IpcTrySend, [b.0, 1, UTOP, 0, 0]).1,
            Err(Error::IpcNotRecv)
        );
        assert_eq!(
            call(&mut k, Sysnum::IpcTrySend, [0x7777, 1, UTOP, 0, 0]).1,
            Err(Error::BadEnv)
        );
    }

    #[test]
    fn page_travels_when_asked_for() {
        let (mut k, a, b) = pair();
        park(&mut k, 0x0040_0000, b);
        map_new(&mut k, b, 0x1000, RW);
        poke(&mut k, b, 0x1000, b"payload");

        let r = call(&mut k, Sysnum::IpcTrySend, [a.0, 7, 0x1000, RO.bits(), 0]).1;
        assert_eq!(r, Ok(0));
        assert_eq!(k.env_info(a.index()).ipc_perm, RO);

        let pb = k.machine().lookup(k.env(b.index()).space(), 0x1000).unwrap().0;
        let (pa, perm) = k
            .machine()
            .lookup(k.env(a.index()).space(), 0x0040_0000)
            .unwrap();
        assert_eq!(pa, pb);
        assert_eq!(perm, RO);
    }

    #[test]
    fn page_stays_put_when_not_asked_for() {
        let (mut k, a, b) = pair();
        park(&mut k, UTOP, b);
        map_new(&mut k, b, 0x1000, RW);

        let r = call(&mut k, Sysnum::IpcTrySend, [a.0, 7, 0x1000, RW.bits(), 0]).1;
        assert_eq!(r, Ok(0));
        assert_eq!(k.env_info(a.index()).ipc_perm, PagePerm::empty());
        let space = k.env(a.index()).space();
        assert_eq!(k.machine().next_mapped(space, 0, USTACK_BOTTOM), None);
    }

    #[test]
    fn bad_page_offers_are_rejected_without_delivery() {
        let (mut k, a, b) = pair();
        park(&mut k, 0x0040_0000, b);
        map_new(&mut k, b, 0x1000, RO);
        let a0 = a.0;

        assert_eq!(call(&mut k, Sysnum::IpcTrySend, [a0, 1, 0x1004, RO.bits(), 0]).1, Err(Error::Inval));
        assert_eq!(call(&mut k, Sysnum::IpcTrySend, [a0, 1, 0x1000, 0x8, 0]).1, Err(Error::Inval));
        assert_eq!(call(&mut k, Sysnum::IpcTrySend, [a0, 1, 0x2000, RO.bits(), 0]).1, Err(Error::Inval));
        assert_eq!(call(&mut k, Sysnum::IpcTrySend, [a0, 1, 0x1000, RW.bits(), 0]).1, Err(Error::Inval));
        assert!(k.env_info(a.index()).ipc_recving, "still waiting");
    }

    #[test]
    fn misaligned_receive_address_does_not_block() {
        let (mut k, a) = running();
        let (resume, r) = call(&mut k, Sysnum::IpcRecv, [0x1234, 0, 0, 0, 0]);
        assert_eq!(r, Err(Error::Inval));
        assert_eq!(resume, Resume::Env(a));
        assert!(!k.env_info(a.index()).ipc_recving);
    }

    #[test]
    fn destroyed_receiver_is_gone() {
        let (mut k, a, b) = pair();
        park(&mut k, 0, b);
        k.env_destroy(a.index());
        assert_eq!(
            call(&mut k, Sysnum::IpcTrySend, [a.0, 1, UTOP, 0, 0]).1,
            Err(Error::BadEnv)
        );
    }
}
