// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for safely interacting with untrusted/unprivileged/user memory.
//!
//! The kernel never dereferences a user address. It walks the environment's
//! page tables through the `PageTables` collaborator, checks permissions on
//! every page the access touches, and copies through the allocator's view of
//! physical pages.

use core::marker::PhantomData;

use abi::{FaultInfo, FaultSource, PagePerm, PGSIZE, UTOP};
use zerocopy::{FromBytes, IntoBytes, KnownLayout};

use crate::arch::PageTables;

/// A (user, untrusted, unprivileged) slice.
///
/// A `USlice` is passed into the kernel by an environment, and is intended to
/// refer to memory that environment controls. However, the `USlice` type
/// itself simply represents an _allegation_ that a section of address space is
/// suitable; it does _not_ demonstrate that the environment has access to that
/// memory.
///
/// Having a `USlice<T>` tells you the following:
///
/// - Some environment has claimed it has access to a section of address
///   space (delimited by the `USlice`).
/// - The base of the section is correctly aligned for type `T`.
/// - The section does not wrap around the end of the address space.
///
/// To actually access the memory, hand it to `copy_from_user` or
/// `read_from_user`, which check the page tables.
pub struct USlice<T> {
    /// Base address of the slice.
    base_address: u32,
    /// Number of `T` elements in the slice.
    length: u32,
    /// since we don't actually use T...
    _marker: PhantomData<*mut [T]>,
}

impl<T> USlice<T> {
    /// Constructs a `USlice` given a base address and length passed from
    /// untrusted code.
    ///
    /// This will only succeed if such a slice would not wrap around the top
    /// of the address space, and if `base_address` is correctly aligned for
    /// `T`. Zero-sized `T` is rejected.
    pub fn from_raw(base_address: u32, length: u32) -> Result<Self, FaultInfo> {
        uassert!(core::mem::size_of::<T>() != 0);

        let bad = FaultInfo::MemoryAccess {
            address: Some(base_address),
            source: FaultSource::Kernel,
        };
        if base_address as usize % core::mem::align_of::<T>() != 0 {
            return Err(bad);
        }
        let size_in_bytes = length
            .checked_mul(core::mem::size_of::<T>() as u32)
            .ok_or(bad)?;
        if base_address.checked_add(size_in_bytes).is_none() {
            return Err(bad);
        }
        Ok(Self {
            base_address,
            length,
            _marker: PhantomData,
        })
    }

    /// Returns `true` if this slice is zero-length, `false` otherwise.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns the number of `T`s in this slice.
    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn base_addr(&self) -> u32 {
        self.base_address
    }

    /// Size of the slice in bytes. Cannot overflow; checked at
    /// construction.
    pub fn size_in_bytes(&self) -> u32 {
        self.length.wrapping_mul(core::mem::size_of::<T>() as u32)
    }
}

/// Checks that `space` maps every page of `[base, base + len)` below `UTOP`
/// with at least `perm | PRESENT | USER`.
///
/// An empty range always passes.
pub fn check_user<P: PageTables>(
    pt: &P,
    space: P::Space,
    base: u32,
    len: u32,
    perm: PagePerm,
) -> Result<(), FaultInfo> {
    if len == 0 {
        return Ok(());
    }
    let need = perm | PagePerm::PRESENT | PagePerm::USER;
    let end = base.checked_add(len).filter(|&end| end <= UTOP).ok_or(
        FaultInfo::MemoryAccess {
            address: Some(base.max(UTOP)),
            source: FaultSource::Kernel,
        },
    )?;

    let mut va = base;
    while va < end {
        match pt.lookup(space, va) {
            Some((_, have)) if have.contains(need) => (),
            _ => {
                return Err(FaultInfo::MemoryAccess {
                    address: Some(va),
                    source: FaultSource::Kernel,
                })
            }
        }
        // Step to the start of the next page.
        va = match (va & !(PGSIZE - 1)).checked_add(PGSIZE) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(())
}

/// Copies user memory described by `src` into `dst`, which must be the same
/// size. The range must be user-readable.
pub fn copy_from_user<P: PageTables>(
    pt: &P,
    space: P::Space,
    src: &USlice<u8>,
    dst: &mut [u8],
) -> Result<(), FaultInfo> {
    uassert!(dst.len() == src.len());
    check_user(pt, space, src.base_addr(), src.size_in_bytes(), PagePerm::empty())?;

    let mut va = src.base_addr();
    let mut done = 0;
    while done < dst.len() {
        let offset = (va % PGSIZE) as usize;
        let n = usize::min(PGSIZE as usize - offset, dst.len() - done);
        let (page, _) = match pt.lookup(space, va) {
            Some(m) => m,
            None => unreachable!("checked above"),
        };
        dst[done..done + n]
            .copy_from_slice(&pt.page(page)[offset..offset + n]);
        done += n;
        va = va.wrapping_add(n as u32);
    }
    Ok(())
}

/// Copies `src` into user memory at `base`. The range must be
/// user-writable.
pub fn copy_to_user<P: PageTables>(
    pt: &mut P,
    space: P::Space,
    base: u32,
    src: &[u8],
) -> Result<(), FaultInfo> {
    let len = u32::try_from(src.len()).map_err(|_| FaultInfo::MemoryAccess {
        address: Some(base),
        source: FaultSource::Kernel,
    })?;
    check_user(pt, space, base, len, PagePerm::WRITABLE)?;

    let mut va = base;
    let mut done = 0;
    while done < src.len() {
        let offset = (va % PGSIZE) as usize;
        let n = usize::min(PGSIZE as usize - offset, src.len() - done);
        let (page, _) = match pt.lookup(space, va) {
            Some(m) => m,
            None => unreachable!("checked above"),
        };
        pt.page_mut(page)[offset..offset + n]
            .copy_from_slice(&src[done..done + n]);
        done += n;
        va = va.wrapping_add(n as u32);
    }
    Ok(())
}

/// Reads one `T` from a user-readable slice of length 1.
pub fn read_from_user<P, T>(
    pt: &P,
    space: P::Space,
    src: &USlice<T>,
) -> Result<T, FaultInfo>
where
    P: PageTables,
    T: FromBytes + IntoBytes + KnownLayout,
{
    uassert!(src.len() == 1);
    let mut value = T::new_zeroed();
    let bytes = USlice::<u8>::from_raw(src.base_addr(), src.size_in_bytes())?;
    copy_from_user(pt, space, &bytes, value.as_mut_bytes())?;
    Ok(value)
}
