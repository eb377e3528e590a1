// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User-level page-fault handling.
//!
//! The kernel pushes a `UTrapframe` on the exception stack and branches to
//! `PGFAULT_UPCALL_ENTRY`. The code there calls the registered handler with
//! the record, then returns to the faulting instruction without re-entering
//! the kernel: it writes the trap-time `eip` just below the trap-time stack
//! pointer, restores the registers, switches to that stack, and `ret`s. The
//! word the kernel leaves free under a nested record is where that `eip`
//! goes when the fault came from the exception stack itself.

use zerocopy::{FromZeros, IntoBytes};

use crate::{
    sys_env_set_pgfault_upcall, sys_page_alloc, EnvId, Error, PagePerm,
    PgfaultHandler, Runtime, UTrapframe, PGFAULT_UPCALL_ENTRY, UXSTACKBASE,
};

/// Installs `handler` as the page-fault handler.
///
/// The first time through, this also allocates the exception stack and
/// registers the upcall with the kernel.
pub fn set_pgfault_handler<R: Runtime>(
    rt: &mut R,
    handler: PgfaultHandler<R>,
) -> Result<(), Error> {
    if rt.pgfault_handler().is_none() {
        sys_page_alloc(
            rt,
            EnvId::SELF,
            UXSTACKBASE,
            PagePerm::PRESENT | PagePerm::USER | PagePerm::WRITABLE,
        )?;
        sys_env_set_pgfault_upcall(rt, EnvId::SELF, PGFAULT_UPCALL_ENTRY)?;
    }
    rt.set_pgfault_handler_slot(Some(handler));
    Ok(())
}

/// What the code at `PGFAULT_UPCALL_ENTRY` does, for the record at
/// `utf_va`.
///
/// Runs the handler, then pushes the trap-time `eip` onto the trap-time
/// stack, where the final `ret` finds it. Returns the record; the caller
/// restores registers from it and resumes at its `eip` with its `esp`.
pub fn upcall<R: Runtime>(rt: &mut R, utf_va: u32) -> UTrapframe {
    let mut utf = UTrapframe::new_zeroed();
    rt.load(utf_va, utf.as_mut_bytes());

    let Some(handler) = rt.pgfault_handler() else {
        panic!("page fault at {:08x} with no handler", utf.fault_va);
    };
    handler(rt, &utf);

    rt.store(utf.esp.wrapping_sub(4), &utf.eip.to_le_bytes());
    utf
}
