// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between kernel and user library.
//!
//! Everything in here is part of the contract between privileged and
//! unprivileged code: address-space layout, environment ids, the syscall
//! register convention and numbers, error codes, page permission bits, and the
//! layout of the frames the kernel saves and delivers.

#![cfg_attr(not(test), no_std)]

use core::fmt;

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

//
// Address-space layout.
//

/// Bytes in a page.
pub const PGSIZE: u32 = 4096;
/// Bytes mapped by a single page directory entry.
pub const PTSIZE: u32 = 1024 * PGSIZE;

/// Addresses at or above this are not user addresses as far as syscalls are
/// concerned.
pub const UTOP: u32 = 0xEEC0_0000;
/// Top of the one-page exception stack used for page-fault upcalls.
pub const UXSTACKTOP: u32 = UTOP;
/// Bottom of the exception stack.
pub const UXSTACKBASE: u32 = UXSTACKTOP - PGSIZE;
/// Top of the normal user stack. One empty guard page separates it from the
/// exception stack.
pub const USTACKTOP: u32 = UTOP - 2 * PGSIZE;
/// Where user program text begins.
pub const UTEXT: u32 = 2 * PTSIZE;
/// Scratch mapping used by the copy-on-write fault handler.
pub const UTEMP: u32 = PTSIZE;
pub const PFTEMP: u32 = UTEMP + PTSIZE - PGSIZE;

/// Largest Ethernet frame the NIC moves, in bytes.
pub const ETH_FRAME_LEN: usize = 1518;

/// Rounds `va` down to the start of its page.
pub const fn page_round_down(va: u32) -> u32 {
    va & !(PGSIZE - 1)
}

/// Checks whether `va` is the first byte of a page.
pub const fn is_page_aligned(va: u32) -> bool {
    va & (PGSIZE - 1) == 0
}

/// Page-directory index of `va`.
pub const fn pdx(va: u32) -> usize {
    (va >> 22) as usize
}

//
// Environment identity.
//

/// log2 of the largest environment table the id encoding supports.
pub const LOG2NENV: u32 = 10;
/// Largest environment table the id encoding supports.
pub const NENV: usize = 1 << LOG2NENV;

/// Names a particular incarnation of an environment.
///
/// An `EnvId` combines two fields, a slot index in the low `LOG2NENV` bits and
/// a generation in the bits at and above `EnvId::GENERATION_SHIFT`. The
/// generation of a slot changes every time the slot is reallocated, so an id
/// that refers to a destroyed environment stops resolving instead of silently
/// naming whatever lives in the slot now.
///
/// Ids of live environments are always positive when viewed as `i32`. The id
/// `0` never names an environment; in syscall arguments it means "the
/// caller", and it is what a freshly forked child sees `exofork` return.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct EnvId(pub u32);

impl EnvId {
    /// The caller, in syscall arguments.
    pub const SELF: Self = Self(0);

    /// Number of bits in an `EnvId` used to represent the slot index.
    pub const INDEX_BITS: u32 = LOG2NENV;

    /// Derived mask of the index bits portion.
    pub const INDEX_MASK: u32 = (1 << Self::INDEX_BITS) - 1;

    /// Position of the lowest generation bit.
    pub const GENERATION_SHIFT: u32 = 12;

    /// Fabricates an `EnvId` for a known index and generation.
    pub const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        EnvId(gen.0 | (index as u32 & Self::INDEX_MASK))
    }

    /// Extracts the slot index part of this id.
    pub fn index(&self) -> usize {
        (self.0 & Self::INDEX_MASK) as usize
    }

    /// Extracts the generation part of this id.
    pub fn generation(&self) -> Generation {
        Generation(self.0 & !Self::INDEX_MASK)
    }

    pub fn is_self(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::LowerHex for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Generation bits of an `EnvId`, kept in place (not shifted down).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct Generation(u32);

impl Generation {
    /// Generation of a slot that has never been allocated.
    pub const ZERO: Self = Self(0);

    /// Generation handed out when the counter would otherwise go
    /// non-positive.
    pub const FIRST: Self = Self(1 << EnvId::GENERATION_SHIFT);

    /// Produces the generation for the next allocation of a slot.
    ///
    /// This only ever moves forward, except for wrapping back to `FIRST` when
    /// the id would stop being positive.
    pub fn next(self) -> Self {
        let g = (self.0 as i32).wrapping_add(1 << EnvId::GENERATION_SHIFT)
            & !(NENV as i32 - 1);
        if g <= 0 {
            Self::FIRST
        } else {
            Self(g as u32)
        }
    }
}

/// Scheduling status of an environment slot.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize,
)]
#[repr(u32)]
pub enum EnvStatus {
    /// Slot is on the free list.
    #[default]
    Free = 0,
    /// Slot is being torn down.
    Dying = 1,
    /// Eligible to be picked by the scheduler.
    Runnable = 2,
    /// Allocated, but not eligible to run (new, or blocked in receive).
    NotRunnable = 3,
}

impl TryFrom<u32> for EnvStatus {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Free),
            1 => Ok(Self::Dying),
            2 => Ok(Self::Runnable),
            3 => Ok(Self::NotRunnable),
            _ => Err(()),
        }
    }
}

/// Read-only view of an environment slot, as user code is allowed to see it.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct EnvInfo {
    pub id: EnvId,
    pub parent: EnvId,
    pub status: EnvStatus,
    /// Number of times this environment has been dispatched.
    pub runs: u32,
    pub ipc_recving: bool,
    /// Sender of the last delivered message, or `EnvId(0)` if none.
    pub ipc_from: EnvId,
    pub ipc_value: u32,
    /// Permissions of the page transferred with the last message, empty if
    /// no page moved.
    pub ipc_perm: PagePerm,
}

//
// Page permissions.
//

bitflags::bitflags! {
    /// Page table entry permission bits that user code can name.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    #[repr(transparent)]
    pub struct PagePerm: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        /// Available for software use. The kernel attaches no meaning to it;
        /// the user library uses it to tag copy-on-write pages.
        const AVAIL = 1 << 11;
    }
}

impl PagePerm {
    /// Bits a syscall perm argument is allowed to contain.
    pub const SYSCALL: Self = Self::PRESENT
        .union(Self::WRITABLE)
        .union(Self::USER)
        .union(Self::AVAIL);

    /// Bits a syscall perm argument is required to contain.
    pub const REQUIRED: Self = Self::PRESENT.union(Self::USER);

    /// Validates a perm argument passed from user code.
    ///
    /// Returns `None` unless `bits` has both `PRESENT` and `USER` set and
    /// nothing outside `SYSCALL`.
    pub fn from_syscall(bits: u32) -> Option<Self> {
        let perm = Self::from_bits(bits)?;
        if perm.contains(Self::REQUIRED) {
            Some(perm)
        } else {
            None
        }
    }
}

bitflags::bitflags! {
    /// Page-fault error code, as pushed by the hardware.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct FaultCode: u32 {
        /// Protection violation on a present page (clear: page not present).
        const PROTECTION = 1 << 0;
        /// The access was a write.
        const WRITE = 1 << 1;
        /// The access came from user mode.
        const USER = 1 << 2;
    }
}

//
// Errors.
//

/// Error codes returned (negated) from syscalls.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Error {
    Unspecified = 1,
    /// Environment id does not resolve, or the caller may not touch it.
    BadEnv = 2,
    /// Invalid parameter.
    Inval = 3,
    NoMem = 4,
    /// No free environment slot.
    NoFreeEnv = 5,
    /// Caller named memory it cannot access.
    Fault = 6,
    /// Target is not blocked in receive, or was already sent to.
    IpcNotRecv = 7,
    /// NIC ring has no free slot.
    RingFull = 8,
    /// NIC has no received frame waiting.
    RingEmpty = 9,
}

impl Error {
    /// Produces the syscall return word for this error.
    pub fn to_return(self) -> u32 {
        (-(self as i32)) as u32
    }

    /// Interprets a syscall return word: negative values are errors,
    /// everything else is a success payload.
    pub fn check(word: u32) -> Result<u32, Error> {
        let signed = word as i32;
        if signed < 0 {
            Err(Error::try_from(signed.unsigned_abs())
                .unwrap_or(Error::Unspecified))
        } else {
            Ok(word)
        }
    }
}

impl TryFrom<u32> for Error {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::Unspecified),
            2 => Ok(Self::BadEnv),
            3 => Ok(Self::Inval),
            4 => Ok(Self::NoMem),
            5 => Ok(Self::NoFreeEnv),
            6 => Ok(Self::Fault),
            7 => Ok(Self::IpcNotRecv),
            8 => Ok(Self::RingFull),
            9 => Ok(Self::RingEmpty),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unspecified => "unspecified error",
            Self::BadEnv => "bad environment",
            Self::Inval => "invalid parameter",
            Self::NoMem => "out of memory",
            Self::NoFreeEnv => "out of environments",
            Self::Fault => "segmentation fault",
            Self::IpcNotRecv => "env is not recving",
            Self::RingFull => "NIC ring full",
            Self::RingEmpty => "NIC ring empty",
        })
    }
}

/// Origin of a fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FaultSource {
    /// User code did something that was intercepted by the hardware.
    User,
    /// The kernel found the problem while acting on the environment's
    /// behalf.
    Kernel,
}

/// Reasons an environment is destroyed against its will.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FaultInfo {
    /// Page fault with no upcall registered.
    PageFault { address: u32, code: u32, eip: u32 },
    /// The kernel needed to touch environment memory that was not there, or
    /// was not writable; for example, when delivering a fault record.
    MemoryAccess {
        address: Option<u32>,
        source: FaultSource,
    },
    /// A trap the dispatcher has no route for.
    UnexpectedTrap { trapno: u32, eip: u32 },
}

//
// Syscall ABI.
//

/// Enumeration of syscall numbers.
///
/// The number is passed in `eax`; arguments in `edx`, `ecx`, `ebx`, `edi`,
/// `esi`, in that order. The result comes back in `eax`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Sysnum {
    Cputs = 0,
    Cgetc = 1,
    GetEnvId = 2,
    EnvDestroy = 3,
    PageAlloc = 4,
    PageMap = 5,
    PageUnmap = 6,
    Exofork = 7,
    EnvSetStatus = 8,
    EnvSetTrapframe = 9,
    EnvSetPgfaultUpcall = 10,
    Yield = 11,
    IpcTrySend = 12,
    IpcRecv = 13,
    Time = 14,
    TransmitFrame = 15,
    ReceiveFrame = 16,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the kernel doesn't depend on `num-traits`.
impl TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Cputs),
            1 => Ok(Self::Cgetc),
            2 => Ok(Self::GetEnvId),
            3 => Ok(Self::EnvDestroy),
            4 => Ok(Self::PageAlloc),
            5 => Ok(Self::PageMap),
            6 => Ok(Self::PageUnmap),
            7 => Ok(Self::Exofork),
            8 => Ok(Self::EnvSetStatus),
            9 => Ok(Self::EnvSetTrapframe),
            10 => Ok(Self::EnvSetPgfaultUpcall),
            11 => Ok(Self::Yield),
            12 => Ok(Self::IpcTrySend),
            13 => Ok(Self::IpcRecv),
            14 => Ok(Self::Time),
            15 => Ok(Self::TransmitFrame),
            16 => Ok(Self::ReceiveFrame),
            _ => Err(()),
        }
    }
}

//
// Traps and frames.
//

pub const T_DIVIDE: u32 = 0;
pub const T_DEBUG: u32 = 1;
pub const T_NMI: u32 = 2;
pub const T_BRKPT: u32 = 3;
pub const T_OFLOW: u32 = 4;
pub const T_BOUND: u32 = 5;
pub const T_ILLOP: u32 = 6;
pub const T_DEVICE: u32 = 7;
pub const T_DBLFLT: u32 = 8;
pub const T_TSS: u32 = 10;
pub const T_SEGNP: u32 = 11;
pub const T_STACK: u32 = 12;
pub const T_GPFLT: u32 = 13;
pub const T_PGFLT: u32 = 14;
pub const T_FPERR: u32 = 16;
pub const T_ALIGN: u32 = 17;
pub const T_MCHK: u32 = 18;
pub const T_SIMDERR: u32 = 19;
pub const T_SYSCALL: u32 = 48;

/// Hardware IRQ `n` arrives as trap `IRQ_OFFSET + n`.
pub const IRQ_OFFSET: u32 = 32;
pub const IRQ_TIMER: u32 = 0;
pub const IRQ_SPURIOUS: u32 = 7;

/// Kernel code segment selector.
pub const GD_KT: u32 = 0x08;
/// Kernel data segment selector.
pub const GD_KD: u32 = 0x10;
/// User code segment selector (RPL bits not included).
pub const GD_UT: u32 = 0x18;
/// User data segment selector (RPL bits not included).
pub const GD_UD: u32 = 0x20;
/// Interrupt-enable flag in `eflags`.
pub const FL_IF: u32 = 0x200;

/// General-purpose registers, in the order `pusha` stores them.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct PushRegs {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Useless; `popa` skips it.
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

/// Machine state saved at a privilege transition.
///
/// For an environment that is not on the CPU, its `TrapFrame` is the only
/// record of where and how it resumes.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct TrapFrame {
    pub regs: PushRegs,
    pub es: u32,
    pub ds: u32,
    pub trapno: u32,
    /// Hardware error code, or 0 for traps that do not push one.
    pub err: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

impl TrapFrame {
    /// Builds the initial frame of a user environment that starts at
    /// `entry` with its stack pointer at `USTACKTOP`.
    pub fn user(entry: u32) -> Self {
        Self {
            es: GD_UD | 3,
            ds: GD_UD | 3,
            ss: GD_UD | 3,
            cs: GD_UT | 3,
            eflags: FL_IF,
            esp: USTACKTOP,
            eip: entry,
            ..Self::default()
        }
    }

    /// Requested privilege level of the code segment; 3 is user, 0 is
    /// kernel.
    pub fn privilege(&self) -> u32 {
        self.cs & 3
    }

    pub fn from_user(&self) -> bool {
        self.privilege() == 3
    }
}

/// Fault record the kernel pushes on the exception stack before branching to
/// a page-fault upcall.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct UTrapframe {
    pub fault_va: u32,
    pub err: u32,
    pub regs: PushRegs,
    pub eip: u32,
    pub eflags: u32,
    pub esp: u32,
}

const_assert_eq!(core::mem::size_of::<PushRegs>(), 32);
const_assert_eq!(core::mem::size_of::<TrapFrame>(), 68);
const_assert_eq!(core::mem::size_of::<UTrapframe>(), 52);

/// Size of a `UTrapframe` as it sits in user memory.
pub const UTRAPFRAME_SIZE: u32 = core::mem::size_of::<UTrapframe>() as u32;
