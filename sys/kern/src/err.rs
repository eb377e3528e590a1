// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Syscall implementations and the fault path return `Result<NextEnv,
//! UserError>`, and a common wrapper (`Kernel::discharge`) takes care of the
//! final side effects: writing an error code back to the caller, or
//! destroying it.

use abi::{Error, FaultInfo};

use crate::arch::{NicError, OutOfMemory};
use crate::env::NextEnv;

/// An error committed by, or on behalf of, user code.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UserError {
    /// A recoverable error, reported to the environment as a negative
    /// syscall result. It may still cause a context switch, as indicated by
    /// the `NextEnv`.
    Recoverable(Error, NextEnv),
    /// An unrecoverable error. The environment is destroyed.
    Unrecoverable(FaultInfo),
}

impl UserError {
    /// Turns a failed user-memory check made while serving a syscall into
    /// the error the caller sees. Syscalls report bad pointers; they never
    /// fault the caller for them.
    pub fn protection(_fault: FaultInfo) -> Self {
        Self::Recoverable(Error::Fault, NextEnv::Same)
    }
}

/// Convenience conversion from `FaultInfo`.
impl From<FaultInfo> for UserError {
    fn from(f: FaultInfo) -> Self {
        Self::Unrecoverable(f)
    }
}

/// Convenience conversion from a plain error code.
impl From<Error> for UserError {
    fn from(e: Error) -> Self {
        Self::Recoverable(e, NextEnv::Same)
    }
}

impl From<OutOfMemory> for UserError {
    fn from(e: OutOfMemory) -> Self {
        Error::from(e).into()
    }
}

impl From<NicError> for UserError {
    fn from(e: NicError) -> Self {
        Error::from(e).into()
    }
}
