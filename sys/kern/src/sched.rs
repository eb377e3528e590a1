// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Round-robin scheduler.
//!
//! Slot 0 is the idle environment. It is only chosen when a full circular
//! scan turns up nothing else.

use crate::arch::Machine;
use crate::env::Env;
use crate::startup::Kernel;
use crate::trap::Resume;

/// Scans `envs` circularly, starting just after `previous`, for the first slot
/// other than 0 that satisfies `pred`.
///
/// The scan covers every slot once, so `previous` itself is considered last.
pub fn round_robin_scan<S>(
    previous: usize,
    envs: &[Env<S>],
    pred: impl Fn(&Env<S>) -> bool,
) -> Option<usize> {
    let mut pos = previous;
    for _step_no in 0..envs.len() {
        pos = pos.wrapping_add(1);
        if pos >= envs.len() {
            pos = 0;
        }
        if pos == 0 {
            continue;
        }
        if pred(&envs[pos]) {
            return Some(pos);
        }
    }
    None
}

/// Picks the slot to run after `previous` (or after slot 0, if nothing was
/// running). Returns `None` if nothing at all is runnable.
pub fn select<S: Copy>(previous: Option<usize>, envs: &[Env<S>]) -> Option<usize> {
    round_robin_scan(previous.unwrap_or(0), envs, Env::is_runnable).or_else(
        || match envs.first() {
            Some(idle) if idle.is_runnable() => Some(0),
            _ => None,
        },
    )
}

impl<M: Machine> Kernel<M> {
    /// Gives the CPU to the next runnable environment.
    ///
    /// If there is none, reports that to the operator, enters the monitor,
    /// and halts.
    pub fn sched_yield(&mut self) -> Resume {
        match select(self.current, self.envs.as_slice()) {
            Some(next) => self.env_run(next),
            None => {
                kprintln!(
                    self.machine,
                    "Destroyed all environments - nothing more to do!"
                );
                self.machine.monitor(None);
                self.current = None;
                Resume::Halted
            }
        }
    }

    /// Makes the environment in slot `index` current and returns the
    /// instruction to resume it.
    pub fn env_run(&mut self, index: usize) -> Resume {
        uassert!(self.envs[index].is_runnable());
        let env = &mut self.envs[index];
        env.note_dispatched();
        self.current = Some(index);
        Resume::Env(env.id())
    }
}
