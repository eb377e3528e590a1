// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Copy-on-write `fork`, built entirely from user-level mechanism.
//!
//! The parent creates an empty child with `sys_exofork` and walks its own
//! page tables below the exception stack. Writable pages are mapped into the
//! child, then remapped in the parent, read-only with the `COW` bit; other
//! pages are shared read-only as they are. The first write to a `COW` page on
//! either side faults into [`cow_fault`], which swaps in a private copy.
//!
//! The child gets a fresh exception stack of its own, since the handler runs
//! on it before any copy could be made.

use crate::pgfault::set_pgfault_handler;
use crate::{
    page_round_down, pdx, sys_env_set_pgfault_upcall, sys_env_set_status,
    sys_exofork, sys_getenvid, sys_page_alloc, sys_page_map, sys_page_unmap,
    EnvId, EnvStatus, Error, FaultCode, PagePerm, Runtime, UTrapframe,
    PFTEMP, PGFAULT_UPCALL_ENTRY, PGSIZE, PTSIZE, UXSTACKBASE,
};

/// Marks a page that is shared copy-on-write. One of the PTE bits left to
/// software.
pub const COW: PagePerm = PagePerm::AVAIL;

const NPTENTRIES: u32 = PTSIZE / PGSIZE;

/// Forks the calling environment.
///
/// Returns the child's id in the parent, and `EnvId::SELF` in the child.
pub fn fork<R: Runtime>(rt: &mut R) -> Result<EnvId, Error> {
    set_pgfault_handler(rt, cow_fault::<R>)?;

    let child = sys_exofork(rt)?;
    if child.is_self() {
        child_started(rt);
        return Ok(child);
    }

    for pdeno in 0..pdx(UXSTACKBASE) + 1 {
        if !rt.vpd(pdeno) {
            continue;
        }
        for pteno in 0..NPTENTRIES {
            let va = (pdeno as u32) << 22 | pteno << 12;
            if va >= UXSTACKBASE {
                break;
            }
            if let Some(perm) = rt.vpt(va) {
                duppage(rt, child, va, perm)?;
            }
        }
    }

    sys_page_alloc(
        rt,
        child,
        UXSTACKBASE,
        PagePerm::PRESENT | PagePerm::USER | PagePerm::WRITABLE,
    )?;
    sys_env_set_pgfault_upcall(rt, child, PGFAULT_UPCALL_ENTRY)?;
    sys_env_set_status(rt, child, EnvStatus::Runnable)?;
    Ok(child)
}

/// First thing a child does once it runs: its cached id is still the
/// parent's.
pub fn child_started<R: Runtime>(rt: &mut R) {
    let id = sys_getenvid(rt);
    rt.set_thisenv(id);
}

/// Gives `child` the page at `va`.
///
/// The child's mapping goes in first: if the parent's page went `COW` first,
/// a write in between would copy it and the child would map the copy.
fn duppage<R: Runtime>(
    rt: &mut R,
    child: EnvId,
    va: u32,
    perm: PagePerm,
) -> Result<(), Error> {
    if perm.intersects(PagePerm::WRITABLE | COW) {
        let cow = PagePerm::PRESENT | PagePerm::USER | COW;
        sys_page_map(rt, EnvId::SELF, va, child, va, cow)?;
        sys_page_map(rt, EnvId::SELF, va, EnvId::SELF, va, cow)?;
    } else {
        let ro = PagePerm::PRESENT | PagePerm::USER;
        sys_page_map(rt, EnvId::SELF, va, child, va, ro)?;
    }
    Ok(())
}

/// Page-fault handler that resolves writes to `COW` pages.
///
/// Any other fault is a bug in the program, and is fatal.
pub fn cow_fault<R: Runtime>(rt: &mut R, utf: &UTrapframe) {
    let addr = utf.fault_va;
    if !FaultCode::from_bits_truncate(utf.err).contains(FaultCode::WRITE) {
        panic!(
            "fault at {:08x} (ip {:08x}) is not a write",
            addr, utf.eip
        );
    }
    match rt.vpt(addr) {
        Some(perm) if perm.contains(COW) => (),
        _ => panic!(
            "write fault at {:08x} (ip {:08x}) on a page that is not COW",
            addr, utf.eip
        ),
    }

    let page = page_round_down(addr);
    let rw = PagePerm::PRESENT | PagePerm::USER | PagePerm::WRITABLE;
    if let Err(e) = sys_page_alloc(rt, EnvId::SELF, PFTEMP, rw) {
        panic!("cow_fault: sys_page_alloc: {}", e);
    }
    let mut contents = [0u8; PGSIZE as usize];
    rt.load(page, &mut contents);
    rt.store(PFTEMP, &contents);
    if let Err(e) = sys_page_map(rt, EnvId::SELF, PFTEMP, EnvId::SELF, page, rw)
    {
        panic!("cow_fault: sys_page_map: {}", e);
    }
    if let Err(e) = sys_page_unmap(rt, EnvId::SELF, PFTEMP) {
        panic!("cow_fault: sys_page_unmap: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::Fake;
    use crate::{Sysnum, USTACKTOP};

    const RW: PagePerm = PagePerm::PRESENT
        .union(PagePerm::USER)
        .union(PagePerm::WRITABLE);
    const RO: PagePerm = PagePerm::PRESENT.union(PagePerm::USER);

    #[test]
    fn parent_shares_pages_and_starts_the_child() {
        let mut rt = Fake::replying(&[0, 0, 0x1001]);
        rt.pages.insert(0x1000, RW);
        rt.pages.insert(0x2000, RO);
        rt.pages.insert(USTACKTOP - PGSIZE, RW);
        // Exception stack: never shared.
        rt.pages.insert(UXSTACKBASE, RW);

        let child = fork(&mut rt).unwrap();
        assert_eq!(child, EnvId(0x1001));

        let cow = (RO | COW).bits();
        let stack = USTACKTOP - PGSIZE;
        let maps: Vec<[u32; 5]> = rt
            .calls
            .iter()
            .filter(|(nr, _)| *nr == Sysnum::PageMap)
            .map(|&(_, a)| a)
            .collect();
        assert_eq!(
            maps,
            vec![
                [0, 0x1000, 0x1001, 0x1000, cow],
                [0, 0x1000, 0, 0x1000, cow],
                [0, 0x2000, 0x1001, 0x2000, RO.bits()],
                [0, stack, 0x1001, stack, cow],
                [0, stack, 0, stack, cow],
            ]
        );

        let tail: Vec<_> = rt.calls.iter().rev().take(3).rev().collect();
        assert_eq!(*tail[0], (Sysnum::PageAlloc, [0x1001, UXSTACKBASE, RW.bits(), 0, 0]));
        assert_eq!(
            *tail[1],
            (Sysnum::EnvSetPgfaultUpcall, [0x1001, PGFAULT_UPCALL_ENTRY, 0, 0, 0])
        );
        assert_eq!(*tail[2], (Sysnum::EnvSetStatus, [0x1001, 2, 0, 0, 0]));
    }

    #[test]
    fn child_returns_self_and_learns_its_id() {
        // Handler setup, then exofork answers 0, then getenvid.
        let mut rt = Fake::replying(&[0, 0, 0, 0x1002]);
        rt.thisenv = EnvId(0x1001);
        rt.pages.insert(0x1000, RW);

        assert_eq!(fork(&mut rt), Ok(EnvId::SELF));
        assert_eq!(rt.thisenv, EnvId(0x1002));
        assert_eq!(
            rt.numbers(),
            vec![
                Sysnum::PageAlloc,
                Sysnum::EnvSetPgfaultUpcall,
                Sysnum::Exofork,
                Sysnum::GetEnvId,
            ]
        );
    }

    #[test]
    fn exofork_failure_is_reported() {
        let mut rt = Fake::replying(&[0, 0, Error::NoFreeEnv.to_return()]);
        assert_eq!(fork(&mut rt), Err(Error::NoFreeEnv));
        assert!(rt.handler.is_some());
    }

    #[test]
    fn cow_fault_copies_and_remaps() {
        let mut rt = Fake::default();
        rt.pages.insert(0x5000, RO | COW);
        rt.store(0x5010, b"abc");
        let utf = UTrapframe {
            fault_va: 0x5010,
            err: (FaultCode::WRITE | FaultCode::PROTECTION | FaultCode::USER)
                .bits(),
            ..UTrapframe::default()
        };
        cow_fault(&mut rt, &utf);

        assert_eq!(
            rt.calls,
            vec![
                (Sysnum::PageAlloc, [0, PFTEMP, RW.bits(), 0, 0]),
                (Sysnum::PageMap, [0, PFTEMP, 0, 0x5000, RW.bits()]),
                (Sysnum::PageUnmap, [0, PFTEMP, 0, 0, 0]),
            ]
        );
        let mut copy = [0; 3];
        rt.load(PFTEMP + 0x10, &mut copy);
        assert_eq!(&copy, b"abc");
    }

    #[test]
    #[should_panic(expected = "is not a write")]
    fn cow_fault_rejects_reads() {
        let mut rt = Fake::default();
        rt.pages.insert(0x5000, RO | COW);
        let utf = UTrapframe {
            fault_va: 0x5000,
            err: FaultCode::USER.bits(),
            ..UTrapframe::default()
        };
        cow_fault(&mut rt, &utf);
    }

    #[test]
    #[should_panic(expected = "not COW")]
    fn cow_fault_rejects_plain_pages() {
        let mut rt = Fake::default();
        rt.pages.insert(0x5000, RO);
        let utf = UTrapframe {
            fault_va: 0x5000,
            err: FaultCode::WRITE.bits(),
            ..UTrapframe::default()
        };
        cow_fault(&mut rt, &utf);
    }
}
