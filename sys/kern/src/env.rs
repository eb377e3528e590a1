// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of environments and the environment table.

use alloc::vec::Vec;

use abi::{
    EnvId, EnvInfo, EnvStatus, Error, PagePerm, TrapFrame, NENV,
};

/// Internal representation of an environment.
///
/// The fields of this struct are private to this module so that we can
/// maintain some invariants: a free slot has no address space, an allocated
/// one always has one, and the IPC fields are only changed through the
/// receive/deliver pair below.
#[derive(Debug)]
pub struct Env<S> {
    /// Saved machine state. Authoritative whenever this environment is not on
    /// the CPU.
    save: TrapFrame,
    id: EnvId,
    parent: EnvId,
    status: EnvStatus,
    runs: u32,
    space: Option<S>,
    pgfault_upcall: Option<u32>,
    ipc: IpcState,
    /// Next slot on the free list, while this one is free.
    next_free: Option<usize>,
}

/// Single-slot rendezvous state.
#[derive(Copy, Clone, Debug, Default)]
struct IpcState {
    recving: bool,
    /// Where an incoming page should be mapped, if the receiver wants one.
    dstva: Option<u32>,
    from: EnvId,
    value: u32,
    perm: PagePerm,
}

impl<S: Copy> Env<S> {
    fn vacant() -> Self {
        Self {
            save: TrapFrame::default(),
            id: EnvId(0),
            parent: EnvId(0),
            status: EnvStatus::Free,
            runs: 0,
            space: None,
            pgfault_upcall: None,
            ipc: IpcState::default(),
            next_free: None,
        }
    }

    pub fn id(&self) -> EnvId {
        self.id
    }

    pub fn parent(&self) -> EnvId {
        self.parent
    }

    pub fn status(&self) -> EnvStatus {
        self.status
    }

    pub fn is_runnable(&self) -> bool {
        self.status == EnvStatus::Runnable
    }

    pub fn is_free(&self) -> bool {
        self.status == EnvStatus::Free
    }

    pub fn set_status(&mut self, status: EnvStatus) {
        uassert!(!self.is_free());
        self.status = status;
    }

    pub fn save(&self) -> &TrapFrame {
        &self.save
    }

    pub fn save_mut(&mut self) -> &mut TrapFrame {
        &mut self.save
    }

    /// Address space of a live environment.
    ///
    /// # Panics
    ///
    /// If the slot is free.
    pub fn space(&self) -> S {
        match self.space {
            Some(s) => s,
            None => panic!("free env slot has no address space"),
        }
    }

    pub fn pgfault_upcall(&self) -> Option<u32> {
        self.pgfault_upcall
    }

    pub fn set_pgfault_upcall(&mut self, entry: Option<u32>) {
        self.pgfault_upcall = entry;
    }

    pub(crate) fn note_dispatched(&mut self) {
        self.runs = self.runs.wrapping_add(1);
    }

    /// Enters the receiving state and blocks.
    pub fn begin_receive(&mut self, dstva: Option<u32>) {
        self.ipc = IpcState {
            recving: true,
            dstva,
            ..IpcState::default()
        };
        self.status = EnvStatus::NotRunnable;
    }

    /// Checks whether a sender may deliver to this environment right now.
    ///
    /// "Not receiving" and "already delivered to" are deliberately the same
    /// answer.
    pub fn accepting_delivery(&self) -> bool {
        self.ipc.recving && self.ipc.from == EnvId(0)
    }

    /// Page mapping address requested by the pending receive.
    pub fn receive_dstva(&self) -> Option<u32> {
        self.ipc.dstva
    }

    /// Completes a pending receive and makes the environment runnable, with
    /// its receive call returning 0.
    pub fn deliver(&mut self, from: EnvId, value: u32, perm: PagePerm) {
        uassert!(self.accepting_delivery());
        self.ipc.recving = false;
        self.ipc.from = from;
        self.ipc.value = value;
        self.ipc.perm = perm;
        self.save.ret0(0);
        self.status = EnvStatus::Runnable;
    }

    pub fn info(&self) -> EnvInfo {
        EnvInfo {
            id: self.id,
            parent: self.parent,
            status: self.status,
            runs: self.runs,
            ipc_recving: self.ipc.recving,
            ipc_from: self.ipc.from,
            ipc_value: self.ipc.value,
            ipc_perm: self.ipc.perm,
        }
    }
}

/// Result of an operation that may require a context switch.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NextEnv {
    /// It's fine to keep running whatever environment we were just running,
    /// if it is still runnable.
    Same,
    /// We need to switch environments; the scheduler picks which.
    Other,
}

/// Whose ids an operation may name.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    /// Any live environment.
    Any,
    /// Only the caller itself or one of its descendants.
    Owned,
}

/// Fixed-capacity arena of environments, indexed by slot.
pub struct EnvTable<S> {
    envs: Vec<Env<S>>,
    free_head: Option<usize>,
}

impl<S: Copy> EnvTable<S> {
    /// Creates a table of `capacity` free slots. The free list is in slot
    /// order, so the first allocation gets slot 0.
    pub fn new(capacity: usize) -> Self {
        uassert!(capacity > 0 && capacity <= NENV);
        let mut envs = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let mut e = Env::vacant();
            e.next_free = if i + 1 < capacity { Some(i + 1) } else { None };
            envs.push(e);
        }
        Self {
            envs,
            free_head: Some(0),
        }
    }

    pub fn len(&self) -> usize {
        self.envs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envs.is_empty()
    }

    pub fn as_slice(&self) -> &[Env<S>] {
        &self.envs
    }

    /// Slot that the next `claim` will use.
    pub fn peek_free(&self) -> Result<usize, Error> {
        self.free_head.ok_or(Error::NoFreeEnv)
    }

    /// Takes the slot at the head of the free list for a new environment.
    ///
    /// The new environment is NOT_RUNNABLE, with a fresh generation, an
    /// initial user frame, no upcall and idle IPC state.
    pub fn claim(&mut self, parent: EnvId, space: S) -> Result<usize, Error> {
        let index = self.peek_free()?;
        let env = &mut self.envs[index];
        uassert!(env.is_free());

        self.free_head = env.next_free.take();
        let gen = env.id.generation().next();
        *env = Env {
            save: TrapFrame::user(0),
            id: EnvId::for_index_and_gen(index, gen),
            parent,
            status: EnvStatus::NotRunnable,
            space: Some(space),
            ..Env::vacant()
        };
        Ok(index)
    }

    /// Returns a slot to the free list, handing back its address space.
    ///
    /// The id (and so the generation) is kept, so the next claim moves the
    /// generation forward from it.
    pub fn release(&mut self, index: usize) -> Option<S> {
        let env = &mut self.envs[index];
        let space = env.space.take();
        env.status = EnvStatus::Free;
        env.pgfault_upcall = None;
        env.ipc = IpcState::default();
        env.next_free = self.free_head;
        self.free_head = Some(index);
        space
    }

    /// Resolves an id against the table, the kernel's way: no permission
    /// check, and `EnvId(0)` does not name anybody.
    pub fn resolve(&self, id: EnvId) -> Result<usize, Error> {
        let env = self.envs.get(id.index()).ok_or(Error::BadEnv)?;
        if env.is_free() || env.id != id {
            return Err(Error::BadEnv);
        }
        Ok(id.index())
    }

    /// Resolves an id passed by the environment at `caller`.
    ///
    /// `EnvId(0)` names the caller. A slot whose generation does not match is
    /// rejected, and under `Access::Owned` so is any environment that is not
    /// the caller or a descendant of it.
    pub fn lookup(
        &self,
        id: EnvId,
        caller: usize,
        access: Access,
    ) -> Result<usize, Error> {
        if id.is_self() {
            return Ok(caller);
        }
        let index = self.resolve(id)?;
        if access == Access::Owned
            && index != caller
            && !self.is_descendant(index, caller)
        {
            return Err(Error::BadEnv);
        }
        Ok(index)
    }

    /// Walks parent links up from `index` looking for `ancestor`.
    ///
    /// The walk stops at the first parent that is no longer alive; a dead
    /// parent's id does not vouch for anybody.
    fn is_descendant(&self, index: usize, ancestor: usize) -> bool {
        let target = self.envs[ancestor].id;
        let mut parent = self.envs[index].parent;
        for _ in 0..self.envs.len() {
            if parent == target {
                return true;
            }
            match self.resolve(parent) {
                Ok(i) => parent = self.envs[i].parent,
                Err(_) => return false,
            }
        }
        false
    }
}

impl<S> core::ops::Index<usize> for EnvTable<S> {
    type Output = Env<S>;

    fn index(&self, i: usize) -> &Env<S> {
        &self.envs[i]
    }
}

impl<S> core::ops::IndexMut<usize> for EnvTable<S> {
    fn index_mut(&mut self, i: usize) -> &mut Env<S> {
        &mut self.envs[i]
    }
}

/// Interface that a saved frame exposes to the syscall code.
///
/// The register convention is: syscall number in `eax`, arguments in `edx`,
/// `ecx`, `ebx`, `edi`, `esi`, and the result in `eax`.
pub trait ArchState {
    /// Reads the syscall descriptor (number).
    fn syscall_descriptor(&self) -> u32;

    /// Reads syscall argument register 0.
    fn arg0(&self) -> u32;
    /// Reads syscall argument register 1.
    fn arg1(&self) -> u32;
    /// Reads syscall argument register 2.
    fn arg2(&self) -> u32;
    /// Reads syscall argument register 3.
    fn arg3(&self) -> u32;
    /// Reads syscall argument register 4.
    fn arg4(&self) -> u32;

    /// Writes the syscall result.
    fn ret0(&mut self, _: u32);

    /// Sets a recoverable error code as the syscall result.
    fn set_error_response(&mut self, e: Error) {
        self.ret0(e.to_return());
    }

    fn as_page_alloc_args(&self) -> PageAllocArgs {
        PageAllocArgs {
            env: EnvId(self.arg0()),
            va: self.arg1(),
            perm: self.arg2(),
        }
    }

    fn as_page_map_args(&self) -> PageMapArgs {
        PageMapArgs {
            src_env: EnvId(self.arg0()),
            src_va: self.arg1(),
            dst_env: EnvId(self.arg2()),
            dst_va: self.arg3(),
            perm: self.arg4(),
        }
    }

    fn as_send_args(&self) -> SendArgs {
        SendArgs {
            target: EnvId(self.arg0()),
            value: self.arg1(),
            srcva: self.arg2(),
            perm: self.arg3(),
        }
    }
}

impl ArchState for TrapFrame {
    fn syscall_descriptor(&self) -> u32 {
        self.regs.eax
    }

    fn arg0(&self) -> u32 {
        self.regs.edx
    }
    fn arg1(&self) -> u32 {
        self.regs.ecx
    }
    fn arg2(&self) -> u32 {
        self.regs.ebx
    }
    fn arg3(&self) -> u32 {
        self.regs.edi
    }
    fn arg4(&self) -> u32 {
        self.regs.esi
    }

    fn ret0(&mut self, x: u32) {
        self.regs.eax = x;
    }
}

/// Decoded arguments for PAGE_ALLOC.
#[derive(Clone, Debug)]
pub struct PageAllocArgs {
    pub env: EnvId,
    pub va: u32,
    pub perm: u32,
}

/// Decoded arguments for PAGE_MAP.
#[derive(Clone, Debug)]
pub struct PageMapArgs {
    pub src_env: EnvId,
    pub src_va: u32,
    pub dst_env: EnvId,
    pub dst_va: u32,
    pub perm: u32,
}

/// Decoded arguments for IPC_TRY_SEND.
#[derive(Clone, Debug)]
pub struct SendArgs {
    pub target: EnvId,
    pub value: u32,
    /// Page to transfer, if below `UTOP`.
    pub srcva: u32,
    pub perm: u32,
}
