// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall implementation.
//!
//! # Syscall implementations
//!
//! Syscalls are implemented by methods on `Kernel` with the signature:
//!
//! ```ignore
//! fn sys_foo(&mut self, caller: usize) -> Result<NextEnv, UserError>;
//! ```
//!
//! `caller` is the slot of the environment that trapped. On return, a
//! `NextEnv` indicates success with a possible scheduling hint, while a
//! `UserError` indicates a condition that needs to either be returned as an
//! error code or recorded as a fault. `Kernel::discharge` takes care of the
//! final side effects, reducing code in each syscall.
//!
//! Successful calls write their own result with `ret0`, since some of them
//! (destroy, exofork, set-trapframe) need to control when that happens
//! relative to their other effects.
//!
//! Arguments to syscalls are read from the caller's saved frame. Syscalls
//! with several arguments have an *argument proxy* type, e.g.
//! `env.save().as_page_map_args()`. See `env::ArchState` for details.
//!
//! No syscall faults its caller for a bad argument; bad pointers come back
//! as `Error::Fault`.

use abi::{
    EnvId, EnvStatus, Error, PagePerm, Sysnum, TrapFrame, ETH_FRAME_LEN,
    FL_IF, GD_UD, GD_UT, UTOP,
};

use crate::arch::Machine;
use crate::env::{Access, ArchState, NextEnv};
use crate::err::UserError;
use crate::startup::Kernel;
use crate::umem::{
    check_user, copy_from_user, copy_to_user, read_from_user, USlice,
};

/// Bytes moved per step when echoing user text to the console.
const CPUTS_CHUNK: usize = 128;

/// Checks a user address argument: below `UTOP` and page-aligned.
fn user_page_va(va: u32) -> Result<u32, Error> {
    if va < UTOP && abi::is_page_aligned(va) {
        Ok(va)
    } else {
        Err(Error::Inval)
    }
}

impl<M: Machine> Kernel<M> {
    /// Runs the syscall the environment at `caller` just made.
    pub(crate) fn syscall(&mut self, caller: usize) -> NextEnv {
        let nr = self.envs[caller].save().syscall_descriptor();
        let res = match Sysnum::try_from(nr) {
            Ok(Sysnum::Cputs) => self.sys_cputs(caller),
            Ok(Sysnum::Cgetc) => self.sys_cgetc(caller),
            Ok(Sysnum::GetEnvId) => self.sys_getenvid(caller),
            Ok(Sysnum::EnvDestroy) => self.sys_env_destroy(caller),
            Ok(Sysnum::PageAlloc) => self.sys_page_alloc(caller),
            Ok(Sysnum::PageMap) => self.sys_page_map(caller),
            Ok(Sysnum::PageUnmap) => self.sys_page_unmap(caller),
            Ok(Sysnum::Exofork) => self.sys_exofork(caller),
            Ok(Sysnum::EnvSetStatus) => self.sys_env_set_status(caller),
            Ok(Sysnum::EnvSetTrapframe) => self.sys_env_set_trapframe(caller),
            Ok(Sysnum::EnvSetPgfaultUpcall) => {
                self.sys_env_set_pgfault_upcall(caller)
            }
            Ok(Sysnum::Yield) => self.sys_yield(caller),
            Ok(Sysnum::IpcTrySend) => self.sys_ipc_try_send(caller),
            Ok(Sysnum::IpcRecv) => self.sys_ipc_recv(caller),
            Ok(Sysnum::Time) => self.sys_time(caller),
            Ok(Sysnum::TransmitFrame) => self.sys_transmit_frame(caller),
            Ok(Sysnum::ReceiveFrame) => self.sys_receive_frame(caller),
            // Unknown numbers are an argument error, not a fault.
            Err(()) => Err(Error::Inval.into()),
        };
        self.discharge(caller, res)
    }

    /// Resolves an id argument that the caller must own.
    fn owned(&self, caller: usize, id: u32) -> Result<usize, Error> {
        self.envs.lookup(EnvId(id), caller, Access::Owned)
    }

    /// Writes a successful result for the caller.
    pub(crate) fn ret(
        &mut self,
        caller: usize,
        value: u32,
    ) -> Result<NextEnv, UserError> {
        self.envs[caller].save_mut().ret0(value);
        Ok(NextEnv::Same)
    }

    fn sys_cputs(&mut self, caller: usize) -> Result<NextEnv, UserError> {
        let save = self.envs[caller].save();
        let (base, len) = (save.arg0(), save.arg1());
        let space = self.envs[caller].space();

        USlice::<u8>::from_raw(base, len).map_err(UserError::protection)?;
        check_user(&self.machine, space, base, len, PagePerm::empty())
            .map_err(UserError::protection)?;

        let mut buf = [0u8; CPUTS_CHUNK];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(CPUTS_CHUNK as u32);
            let chunk = USlice::from_raw(base + done, n)
                .map_err(UserError::protection)?;
            let out = &mut buf[..n as usize];
            copy_from_user(&self.machine, space, &chunk, out)
                .map_err(UserError::protection)?;
            self.machine.write(out);
            done += n;
        }
        self.ret(caller, 0)
    }

    fn sys_cgetc(&mut self, caller: usize) -> Result<NextEnv, UserError> {
        let c = self.machine.getc().map_or(0, u32::from);
        self.ret(caller, c)
    }

    fn sys_getenvid(&mut self, caller: usize) -> Result<NextEnv, UserError> {
        let id = self.envs[caller].id();
        self.ret(caller, id.0)
    }

    fn sys_env_destroy(&mut self, caller: usize) -> Result<NextEnv, UserError> {
        let target = self.owned(caller, self.envs[caller].save().arg0())?;
        // The result goes in first; if the caller destroyed itself nobody
        // will read it.
        self.ret(caller, 0)?;
        Ok(self.env_destroy(target))
    }

    fn sys_page_alloc(&mut self, caller: usize) -> Result<NextEnv, UserError> {
        let args = self.envs[caller].save().as_page_alloc_args();
        let va = user_page_va(args.va)?;
        let perm = PagePerm::from_syscall(args.perm).ok_or(Error::Inval)?;
        let target = self.envs.lookup(args.env, caller, Access::Owned)?;

        let space = self.envs[target].space();
        self.map_fresh_page(space, va, perm)?;
        self.ret(caller, 0)
    }

    fn sys_page_map(&mut self, caller: usize) -> Result<NextEnv, UserError> {
        let args = self.envs[caller].save().as_page_map_args();
        let src_va = user_page_va(args.src_va)?;
        let dst_va = user_page_va(args.dst_va)?;
        let perm = PagePerm::from_syscall(args.perm).ok_or(Error::Inval)?;
        let src = self.envs.lookup(args.src_env, caller, Access::Owned)?;
        let dst = self.envs.lookup(args.dst_env, caller, Access::Owned)?;

        let (page, have) = self
            .machine
            .lookup(self.envs[src].space(), src_va)
            .ok_or(Error::Inval)?;
        if perm.contains(PagePerm::WRITABLE)
            && !have.contains(PagePerm::WRITABLE)
        {
            return Err(Error::Inval.into());
        }

        self.machine.map(self.envs[dst].space(), page, dst_va, perm)?;
        self.ret(caller, 0)
    }

    fn sys_page_unmap(&mut self, caller: usize) -> Result<NextEnv, UserError> {
        let save = self.envs[caller].save();
        let (id, va) = (save.arg0(), save.arg1());
        let va = user_page_va(va)?;
        let target = self.owned(caller, id)?;

        self.machine.unmap(self.envs[target].space(), va);
        self.ret(caller, 0)
    }

    fn sys_exofork(&mut self, caller: usize) -> Result<NextEnv, UserError> {
        let parent = self.envs[caller].id();
        let child = self.env_alloc(parent)?;

        let mut frame = *self.envs[caller].save();
        // The child sees exofork return 0.
        frame.ret0(0);
        *self.envs[child].save_mut() = frame;

        let child_id = self.envs[child].id();
        self.ret(caller, child_id.0)
    }

    fn sys_env_set_status(
        &mut self,
        caller: usize,
    ) -> Result<NextEnv, UserError> {
        let save = self.envs[caller].save();
        let (id, status) = (save.arg0(), save.arg1());
        let status = match EnvStatus::try_from(status) {
            Ok(s @ (EnvStatus::Runnable | EnvStatus::NotRunnable)) => s,
            _ => return Err(Error::Inval.into()),
        };
        let target = self.owned(caller, id)?;

        self.envs[target].set_status(status);
        self.ret(caller, 0)
    }

    fn sys_env_set_trapframe(
        &mut self,
        caller: usize,
    ) -> Result<NextEnv, UserError> {
        let save = self.envs[caller].save();
        let (id, ptr) = (save.arg0(), save.arg1());
        let target = self.owned(caller, id)?;

        let src = USlice::<TrapFrame>::from_raw(ptr, 1)
            .map_err(UserError::protection)?;
        let mut tf: TrapFrame =
            read_from_user(&self.machine, self.envs[caller].space(), &src)
                .map_err(UserError::protection)?;

        // Whatever was asked for, the environment runs in user mode with
        // interrupts on.
        tf.cs = GD_UT | 3;
        tf.ds = GD_UD | 3;
        tf.es = GD_UD | 3;
        tf.ss = GD_UD | 3;
        tf.eflags |= FL_IF;
        *self.envs[target].save_mut() = tf;

        self.ret(caller, 0)
    }

    fn sys_env_set_pgfault_upcall(
        &mut self,
        caller: usize,
    ) -> Result<NextEnv, UserError> {
        let save = self.envs[caller].save();
        let (id, entry) = (save.arg0(), save.arg1());
        let target = self.owned(caller, id)?;

        self.envs[target].set_pgfault_upcall(Some(entry).filter(|&e| e != 0));
        self.ret(caller, 0)
    }

    fn sys_yield(&mut self, caller: usize) -> Result<NextEnv, UserError> {
        self.ret(caller, 0)?;
        Ok(NextEnv::Other)
    }

    fn sys_time(&mut self, caller: usize) -> Result<NextEnv, UserError> {
        let now = self.ticks.low_word();
        self.ret(caller, now)
    }

    fn sys_transmit_frame(
        &mut self,
        caller: usize,
    ) -> Result<NextEnv, UserError> {
        let save = self.envs[caller].save();
        let (base, len) = (save.arg0(), save.arg1());
        if len as usize > ETH_FRAME_LEN {
            return Err(Error::Inval.into());
        }
        let src = USlice::<u8>::from_raw(base, len)
            .map_err(UserError::protection)?;

        let mut frame = [0u8; ETH_FRAME_LEN];
        let frame = &mut frame[..len as usize];
        copy_from_user(&self.machine, self.envs[caller].space(), &src, frame)
            .map_err(UserError::protection)?;
        self.machine.transmit(frame)?;
        self.ret(caller, 0)
    }

    fn sys_receive_frame(
        &mut self,
        caller: usize,
    ) -> Result<NextEnv, UserError> {
        let base = self.envs[caller].save().arg0();
        let space = self.envs[caller].space();
        check_user(
            &self.machine,
            space,
            base,
            ETH_FRAME_LEN as u32,
            PagePerm::WRITABLE,
        )
        .map_err(UserError::protection)?;

        let mut frame = [0u8; ETH_FRAME_LEN];
        let n = self.machine.receive(&mut frame)?;
        copy_to_user(&mut self.machine, space, base, &frame[..n])
            .map_err(UserError::protection)?;
        self.ret(caller, n as u32)
    }
}
