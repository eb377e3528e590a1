// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Environment kernel core.
//!
//! This is the protection-domain core of a small exokernel-style operating
//! system: it multiplexes one CPU among isolated user environments, mediates
//! their privileged requests through a closed set of syscalls, delivers page
//! faults back to user code as upcalls, and provides blocking single-slot IPC.
//!
//! The kernel does not own the hardware. Physical pages, page tables, the NIC,
//! the console and the debug monitor are reached through the collaborator
//! traits in `arch`, and the code that owns the CPU drives the kernel by
//! handing it one trap at a time (`Kernel::trap`) and resuming whatever
//! environment it names. `arch::sim` is an in-memory machine that implements
//! every collaborator, used for testing.
//!
//! # Design principles
//!
//! 1. Mechanism, not policy. The kernel validates and performs; meaning (such
//!    as copy-on-write) lives in user code.
//! 2. Syscalls never fault on bad arguments. They validate and return an error
//!    code.
//! 3. A strong preference for safe code. There is no `unsafe` in this crate.
//! 4. A preference for simple and clear algorithms over fast and clever
//!    algorithms.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod klog;
#[macro_use]
pub mod arch;

pub mod env;
pub mod err;
pub mod ipc;
pub mod sched;
pub mod startup;
pub mod syscalls;
pub mod time;
pub mod trap;
pub mod umem;

pub use startup::Kernel;
pub use trap::Resume;
