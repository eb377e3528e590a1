// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup, and the kernel state itself.

use abi::{
    EnvId, EnvInfo, EnvStatus, Error, PagePerm, TrapFrame, PGSIZE, USTACKTOP,
    UTOP,
};

use crate::arch::{Machine, PageTables};
use crate::env::{Env, EnvTable, NextEnv};
use crate::time::Timestamp;
use crate::trap::Resume;

/// Build-time kernel configuration, generated by `build.rs`.
pub mod config {
    include!(concat!(env!("OUT_DIR"), "/kconfig.rs"));
}

/// The kernel: environment table, scheduler state, tick counter, and the
/// machine underneath.
///
/// Everything the kernel does happens inside a method on this type, called
/// with interrupts disabled by whoever owns the CPU. Nothing in here is
/// shared, so there are no locks.
pub struct Kernel<M: PageTables> {
    pub(crate) envs: EnvTable<M::Space>,
    /// Slot of the environment on the CPU, if any.
    pub(crate) current: Option<usize>,
    pub(crate) ticks: Timestamp,
    pub(crate) machine: M,
}

impl<M: Machine> Kernel<M> {
    /// Creates a kernel with the configured number of environment slots.
    pub fn new(machine: M) -> Self {
        Self::with_env_count(machine, config::ENV_COUNT)
    }

    pub fn with_env_count(machine: M, count: usize) -> Self {
        Self {
            envs: EnvTable::new(count),
            current: None,
            ticks: Timestamp::default(),
            machine,
        }
    }

    /// Allocates a new environment with a fresh address space.
    ///
    /// The environment is NOT_RUNNABLE and starts with an initial user frame
    /// whose entry point is 0; the caller fills in the rest.
    pub fn env_alloc(&mut self, parent: EnvId) -> Result<usize, Error> {
        // Make sure there's a slot before spending a page on a directory.
        self.envs.peek_free()?;
        let space = self.machine.create_space()?;
        let index = self.envs.claim(parent, space)?;

        let id = self.envs[index].id();
        klog!("[{:08x}] new env {:08x}", self.current_id().0, id.0);
        Ok(index)
    }

    /// Creates an environment directly, without a parent, to start at
    /// `entry` with one page of stack.
    ///
    /// Slot 0 comes up RUNNABLE. Any other slot comes up NOT_RUNNABLE and
    /// has to be started with `set_status`.
    pub fn spawn(&mut self, entry: u32) -> Result<EnvId, Error> {
        let index = self.env_alloc(EnvId(0))?;
        *self.envs[index].save_mut() = TrapFrame::user(entry);

        let space = self.envs[index].space();
        let stack = PagePerm::PRESENT | PagePerm::USER | PagePerm::WRITABLE;
        if let Err(e) = self.map_fresh_page(space, USTACKTOP - PGSIZE, stack) {
            self.env_free(index);
            return Err(e);
        }

        if index == 0 {
            self.envs[index].set_status(EnvStatus::Runnable);
        }
        Ok(self.envs[index].id())
    }

    /// Sets the status of any environment, with no permission check.
    pub fn set_status(
        &mut self,
        id: EnvId,
        status: EnvStatus,
    ) -> Result<(), Error> {
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(Error::Inval);
        }
        let index = self.envs.resolve(id)?;
        self.envs[index].set_status(status);
        Ok(())
    }

    /// Picks the first environment to run.
    pub fn start(&mut self) -> Resume {
        uassert!(self.current.is_none());
        self.sched_yield()
    }

    /// Allocates a zeroed page and maps it at `va`. The mapping holds the
    /// only reference.
    pub(crate) fn map_fresh_page(
        &mut self,
        space: M::Space,
        va: u32,
        perm: PagePerm,
    ) -> Result<(), Error> {
        let page = self.machine.alloc_zeroed()?;
        let r = self.machine.map(space, page, va, perm);
        self.machine.decref(page);
        r.map_err(Error::from)
    }

    /// Destroys the environment in slot `index`.
    ///
    /// Returns `NextEnv::Other` if that was the current environment, which
    /// then leaves the CPU.
    pub fn env_destroy(&mut self, index: usize) -> NextEnv {
        uassert!(!self.envs[index].is_free());
        self.envs[index].set_status(EnvStatus::Dying);
        self.env_free(index);

        if self.current == Some(index) {
            self.current = None;
            NextEnv::Other
        } else {
            NextEnv::Same
        }
    }

    /// Tears down the address space of the environment in `index` and puts
    /// the slot back on the free list.
    fn env_free(&mut self, index: usize) {
        let id = self.envs[index].id();
        let cur = self.current_id();
        kprintln!(self.machine, "[{:08x}] free env {:08x}", cur.0, id.0);
        klog!("free env {:08x}", id.0);

        let space = self.envs[index].space();
        let mut va = 0;
        while let Some(mapped) = self.machine.next_mapped(space, va, UTOP) {
            self.machine.unmap(space, mapped);
            va = match mapped.checked_add(PGSIZE) {
                Some(v) => v,
                None => break,
            };
        }
        self.machine.destroy_space(space);
        self.envs.release(index);
    }

    /// Id of the current environment, or `EnvId(0)` if none.
    pub fn current_id(&self) -> EnvId {
        self.current.map(|i| self.envs[i].id()).unwrap_or(EnvId(0))
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn env_count(&self) -> usize {
        self.envs.len()
    }

    pub fn env(&self, index: usize) -> &Env<M::Space> {
        &self.envs[index]
    }

    /// Public view of the slot at `index`.
    pub fn env_info(&self, index: usize) -> EnvInfo {
        self.envs[index].info()
    }

    /// Slot holding the live environment `id`, if there is one.
    pub fn index_of(&self, id: EnvId) -> Option<usize> {
        self.envs.resolve(id).ok()
    }

    pub fn is_alive(&self, id: EnvId) -> bool {
        self.index_of(id).is_some()
    }

    /// Where the environment at `index` will resume.
    pub fn saved_frame(&self, index: usize) -> &TrapFrame {
        self.envs[index].save()
    }

    pub fn ticks(&self) -> Timestamp {
        self.ticks
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut M {
        &mut self.machine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimMachine;

    fn kernel() -> Kernel<SimMachine> {
        Kernel::with_env_count(SimMachine::default(), 8)
    }

    #[test]
    fn spawn_gives_a_stack_and_slot_zero_runs() {
        let mut k = kernel();
        let idle = k.spawn(0x0080_0000).unwrap();
        let other = k.spawn(0x0080_0000).unwrap();
        assert_eq!(idle.index(), 0);
        assert_eq!(k.env(0).status(), EnvStatus::Runnable);
        assert_eq!(k.env(1).status(), EnvStatus::NotRunnable);
        assert_eq!(k.env(1).parent(), EnvId(0));

        let space = k.env(other.index()).space();
        let (_, perm) = k.machine().lookup(space, USTACKTOP - 1).unwrap();
        assert!(perm.contains(PagePerm::WRITABLE | PagePerm::USER));
        assert_eq!(k.saved_frame(1).esp, USTACKTOP);
        assert_eq!(k.saved_frame(1).eip, 0x0080_0000);
    }

    #[test]
    fn destroy_returns_every_page() {
        let mut k = kernel();
        let before = k.machine().pages_in_use();
        let id = k.spawn(0).unwrap();
        let space = k.env(id.index()).space();
        k.map_fresh_page(space, 0x1000, PagePerm::PRESENT | PagePerm::USER)
            .unwrap();
        k.map_fresh_page(space, 0x0040_0000, PagePerm::PRESENT | PagePerm::USER)
            .unwrap();
        assert!(k.machine().pages_in_use() > before);

        assert_eq!(k.env_destroy(id.index()), NextEnv::Same);
        assert_eq!(k.machine().pages_in_use(), before);
        assert!(!k.is_alive(id));

        let out = String::from_utf8_lossy(k.machine().console_output());
        assert!(out.contains(&format!("[00000000] free env {:08x}", id.0)));
    }

    #[test]
    fn failed_spawn_leaves_no_trace() {
        let mut k = kernel();
        let used = k.machine().pages_in_use();
        // Room for the directory and the stack page, not its page table.
        k.machine_mut().set_page_limit(used + 2);
        assert_eq!(k.spawn(0), Err(Error::NoMem));
        assert_eq!(k.machine().pages_in_use(), used);
        assert_eq!(k.env(0).status(), EnvStatus::Free);
    }

    #[test]
    fn status_must_be_schedulable() {
        let mut k = kernel();
        let id = k.spawn(0).unwrap();
        assert_eq!(k.set_status(id, EnvStatus::Dying), Err(Error::Inval));
        assert_eq!(k.set_status(id, EnvStatus::Free), Err(Error::Inval));
        assert_eq!(k.set_status(EnvId(0x7000), EnvStatus::Runnable), Err(Error::BadEnv));
        assert_eq!(k.set_status(id, EnvStatus::NotRunnable), Ok(()));
    }

    #[test]
    fn empty_system_halts_in_the_monitor() {
        let mut k = kernel();
        assert_eq!(k.start(), Resume::Halted);
        assert_eq!(k.machine().monitor_log().len(), 1);
        let out = String::from_utf8_lossy(k.machine().console_output());
        assert!(out.contains("Destroyed all environments - nothing more to do!"));
    }

    #[test]
    fn start_runs_idle_and_counts_runs() {
        let mut k = kernel();
        let idle = k.spawn(0).unwrap();
        assert_eq!(k.start(), Resume::Env(idle));
        assert_eq!(k.current(), Some(0));
        assert_eq!(k.env_info(0).runs, 1);
    }
}
