// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trap dispatch: the only way from user mode into the kernel.

use abi::{
    EnvId, FaultInfo, FaultSource, PagePerm, TrapFrame, UTrapframe,
    IRQ_OFFSET, IRQ_SPURIOUS, IRQ_TIMER, T_BRKPT, T_PGFLT, T_SYSCALL,
    UTRAPFRAME_SIZE, UXSTACKBASE, UXSTACKTOP,
};
use zerocopy::IntoBytes;

use crate::arch::{Console, Machine};
use crate::env::{ArchState, NextEnv};
use crate::err::UserError;
use crate::startup::Kernel;
use crate::umem::{check_user, copy_to_user};

/// What the CPU should do when the kernel is done with a trap.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Resume {
    /// Restore this environment's saved frame and return to user mode.
    Env(EnvId),
    /// Nothing is left to run; the monitor has been entered.
    Halted,
}

/// Trap classes the dispatcher routes on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TrapKind {
    PageFault,
    Breakpoint,
    Syscall,
    Timer,
    Spurious,
    /// Anything else; fatal to whoever caused it.
    Other(u32),
}

impl From<u32> for TrapKind {
    fn from(trapno: u32) -> Self {
        match trapno {
            T_PGFLT => Self::PageFault,
            T_BRKPT => Self::Breakpoint,
            T_SYSCALL => Self::Syscall,
            n if n == IRQ_OFFSET + IRQ_TIMER => Self::Timer,
            n if n == IRQ_OFFSET + IRQ_SPURIOUS => Self::Spurious,
            n => Self::Other(n),
        }
    }
}

/// Human-readable name of a trap number.
pub fn trapname(trapno: u32) -> &'static str {
    const EXCNAMES: [&str; 20] = [
        "Divide error",
        "Debug",
        "Non-Maskable Interrupt",
        "Breakpoint",
        "Overflow",
        "BOUND Range Exceeded",
        "Invalid Opcode",
        "Device Not Available",
        "Double Fault",
        "Coprocessor Segment Overrun",
        "Invalid TSS",
        "Segment Not Present",
        "Stack Fault",
        "General Protection",
        "Page Fault",
        "(unknown trap)",
        "x87 FPU Floating-Point Error",
        "Alignment Check",
        "Machine-Check",
        "SIMD Floating-Point Exception",
    ];
    match trapno {
        n if (n as usize) < EXCNAMES.len() => EXCNAMES[n as usize],
        T_SYSCALL => "System call",
        n if (IRQ_OFFSET..IRQ_OFFSET + 16).contains(&n) => "Hardware Interrupt",
        _ => "(unknown trap)",
    }
}

/// Dumps a trap frame to the console.
pub fn print_trapframe(con: &mut impl Console, tf: &TrapFrame) {
    let r = &tf.regs;
    kprintln!(*con, "TRAP frame");
    kprintln!(*con, "  edi  0x{:08x}", r.edi);
    kprintln!(*con, "  esi  0x{:08x}", r.esi);
    kprintln!(*con, "  ebp  0x{:08x}", r.ebp);
    kprintln!(*con, "  oesp 0x{:08x}", r.oesp);
    kprintln!(*con, "  ebx  0x{:08x}", r.ebx);
    kprintln!(*con, "  edx  0x{:08x}", r.edx);
    kprintln!(*con, "  ecx  0x{:08x}", r.ecx);
    kprintln!(*con, "  eax  0x{:08x}", r.eax);
    kprintln!(*con, "  es   0x----{:04x}", tf.es);
    kprintln!(*con, "  ds   0x----{:04x}", tf.ds);
    kprintln!(*con, "  trap 0x{:08x} {}", tf.trapno, trapname(tf.trapno));
    kprintln!(*con, "  err  0x{:08x}", tf.err);
    kprintln!(*con, "  eip  0x{:08x}", tf.eip);
    kprintln!(*con, "  cs   0x----{:04x}", tf.cs);
    kprintln!(*con, "  flag 0x{:08x}", tf.eflags);
    kprintln!(*con, "  esp  0x{:08x}", tf.esp);
    kprintln!(*con, "  ss   0x----{:04x}", tf.ss);
}

/// Works out where a fault record goes on the exception stack, given the
/// stack pointer at the time of the fault.
///
/// A fault taken while already on the exception stack pushes the new record
/// below the old one, leaving one word of scratch space in between for the
/// return path to use. Returns `None` if the record would not fit.
pub fn exception_frame_address(esp: u32) -> Option<u32> {
    let top = if (UXSTACKBASE..=UXSTACKTOP).contains(&esp) {
        esp.checked_sub(4)?
    } else {
        UXSTACKTOP
    };
    top.checked_sub(UTRAPFRAME_SIZE)
        .filter(|&utf| utf >= UXSTACKBASE)
}

impl<M: Machine> Kernel<M> {
    /// Handles one trap and decides which environment runs next.
    ///
    /// `tf` is the machine state the trap captured. If it came from user
    /// mode it becomes the current environment's saved frame, and from then
    /// on that saved frame is what every handler reads and writes.
    pub fn trap(&mut self, tf: &TrapFrame) -> Resume {
        uassert!(!self.machine.interrupts_enabled());

        if tf.from_user() {
            let current = match self.current {
                Some(c) => c,
                None => panic!("trap from user mode with no current env"),
            };
            *self.envs[current].save_mut() = *tf;
        }

        let next = self.dispatch(tf);

        // Nobody else was chosen, so go back to the current environment if
        // it can still run.
        match (next, self.current) {
            (NextEnv::Same, Some(c)) if self.envs[c].is_runnable() => {
                self.env_run(c)
            }
            _ => self.sched_yield(),
        }
    }

    fn dispatch(&mut self, tf: &TrapFrame) -> NextEnv {
        let from_user = tf.from_user();
        match TrapKind::from(tf.trapno) {
            TrapKind::PageFault => self.page_fault(tf),
            TrapKind::Breakpoint => {
                self.machine.monitor(Some(tf));
                NextEnv::Same
            }
            TrapKind::Syscall => {
                uassert!(from_user, "syscall from kernel mode");
                self.syscall(self.current_index())
            }
            TrapKind::Timer => {
                self.ticks.tick();
                NextEnv::Other
            }
            TrapKind::Spurious => {
                kprintln!(self.machine, "spurious interrupt on irq 7");
                print_trapframe(&mut self.machine, tf);
                NextEnv::Same
            }
            TrapKind::Other(trapno) => {
                klog!("unexpected trap {} ({})", trapno, trapname(trapno));
                if !from_user {
                    print_trapframe(&mut self.machine, tf);
                    panic!("unhandled trap in kernel");
                }
                let current = self.current_index();
                self.discharge(
                    current,
                    Err(UserError::Unrecoverable(FaultInfo::UnexpectedTrap {
                        trapno,
                        eip: tf.eip,
                    })),
                )
            }
        }
    }

    /// Slot of the environment that trapped from user mode.
    fn current_index(&self) -> usize {
        match self.current {
            Some(c) => c,
            None => panic!("no current env"),
        }
    }

    fn page_fault(&mut self, tf: &TrapFrame) -> NextEnv {
        let fault_va = self.machine.fault_address();
        if !tf.from_user() {
            print_trapframe(&mut self.machine, tf);
            panic!("page fault in kernel mode at va {:08x}", fault_va);
        }
        let current = self.current_index();
        let r = self.deliver_page_fault(current, fault_va);
        self.discharge(current, r)
    }

    /// Pushes a fault record on the exception stack of the environment at
    /// `index` and redirects it to its upcall.
    fn deliver_page_fault(
        &mut self,
        index: usize,
        fault_va: u32,
    ) -> Result<NextEnv, UserError> {
        let env = &self.envs[index];
        let save = *env.save();
        let space = env.space();

        let upcall = env.pgfault_upcall().ok_or(FaultInfo::PageFault {
            address: fault_va,
            code: save.err,
            eip: save.eip,
        })?;

        let bad_stack = FaultInfo::MemoryAccess {
            address: Some(UXSTACKBASE),
            source: FaultSource::User,
        };
        let utf_va = exception_frame_address(save.esp).ok_or(bad_stack)?;
        check_user(
            &self.machine,
            space,
            utf_va,
            UTRAPFRAME_SIZE,
            PagePerm::WRITABLE,
        )?;

        let utf = UTrapframe {
            fault_va,
            err: save.err,
            regs: save.regs,
            eip: save.eip,
            eflags: save.eflags,
            esp: save.esp,
        };
        copy_to_user(&mut self.machine, space, utf_va, utf.as_bytes())?;

        let save = self.envs[index].save_mut();
        save.esp = utf_va;
        save.eip = upcall;
        Ok(NextEnv::Same)
    }

    /// Applies the outcome of something done on behalf of the environment at
    /// `index`: a recoverable error becomes its syscall result, and an
    /// unrecoverable one destroys it.
    pub(crate) fn discharge(
        &mut self,
        index: usize,
        r: Result<NextEnv, UserError>,
    ) -> NextEnv {
        match r {
            Ok(next) => next,
            Err(UserError::Recoverable(code, hint)) => {
                self.envs[index].save_mut().set_error_response(code);
                hint
            }
            Err(UserError::Unrecoverable(fault)) => {
                self.force_fault(index, fault)
            }
        }
    }

    /// Reports `fault` to the operator and destroys the environment at
    /// `index`.
    fn force_fault(&mut self, index: usize, fault: FaultInfo) -> NextEnv {
        let id = self.envs[index].id();
        match fault {
            FaultInfo::PageFault { address, eip, .. } => {
                kprintln!(
                    self.machine,
                    "[{:08x}] user fault va {:08x} ip {:08x}",
                    id.0,
                    address,
                    eip
                );
                print_trapframe(&mut self.machine, self.envs[index].save());
            }
            FaultInfo::MemoryAccess { address, .. } => {
                kprintln!(
                    self.machine,
                    "[{:08x}] user_mem_check assertion failure for va {:08x}",
                    id.0,
                    address.unwrap_or(0)
                );
            }
            FaultInfo::UnexpectedTrap { .. } => {
                print_trapframe(&mut self.machine, self.envs[index].save());
            }
        }
        klog!("env {:08x} faulted: {:?}", id.0, fault);
        self.env_destroy(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimMachine;
    use crate::arch::{FrameAllocator, PageTables};
    use crate::syscalls::tests::{running, RW};
    use crate::umem::{read_from_user, USlice};
    use abi::{EnvStatus, FaultCode, Sysnum, GD_KT, T_DIVIDE, USTACKTOP, UTEXT};

    const UPCALL: u32 = 0x0080_0020;

    fn user_frame(k: &Kernel<SimMachine>, trapno: u32) -> TrapFrame {
        let mut tf = *k.saved_frame(k.current().unwrap());
        tf.trapno = trapno;
        tf
    }

    fn console(k: &Kernel<SimMachine>) -> String {
        String::from_utf8_lossy(k.machine().console_output()).into_owned()
    }

    fn give_exception_stack(k: &mut Kernel<SimMachine>, id: EnvId) {
        let space = k.env(id.index()).space();
        let m = k.machine_mut();
        let p = m.alloc_zeroed().unwrap();
        m.map(space, p, UXSTACKBASE, RW).unwrap();
        m.decref(p);
    }

    #[test]
    fn exception_frame_placement() {
        assert_eq!(
            exception_frame_address(USTACKTOP - 16),
            Some(UXSTACKTOP - 52)
        );
        // Already on the exception stack: one scratch word, then the record.
        assert_eq!(
            exception_frame_address(UXSTACKTOP - 52),
            Some(UXSTACKTOP - 52 - 4 - 52)
        );
        // Exactly at the top still counts: the scratch word is kept.
        assert_eq!(
            exception_frame_address(UXSTACKTOP),
            Some(UXSTACKTOP - 4 - 52)
        );
        // No room left.
        assert_eq!(exception_frame_address(UXSTACKBASE + 40), None);
        assert_eq!(exception_frame_address(UXSTACKBASE + 56), Some(UXSTACKBASE));
    }

    #[test]
    fn classification() {
        assert_eq!(TrapKind::from(14), TrapKind::PageFault);
        assert_eq!(TrapKind::from(3), TrapKind::Breakpoint);
        assert_eq!(TrapKind::from(48), TrapKind::Syscall);
        assert_eq!(TrapKind::from(32), TrapKind::Timer);
        assert_eq!(TrapKind::from(39), TrapKind::Spurious);
        assert_eq!(TrapKind::from(13), TrapKind::Other(13));
        assert_eq!(trapname(13), "General Protection");
        assert_eq!(trapname(33), "Hardware Interrupt");
        assert_eq!(trapname(200), "(unknown trap)");
    }

    #[test]
    fn timer_ticks_and_rotates() {
        let (mut k, a) = running();
        let b = k.spawn(UTEXT).unwrap();
        k.set_status(b, EnvStatus::Runnable).unwrap();

        let tf = user_frame(&k, IRQ_OFFSET + IRQ_TIMER);
        assert_eq!(k.trap(&tf), Resume::Env(b));
        assert_eq!(k.ticks().low_word(), 1);
        let tf = user_frame(&k, IRQ_OFFSET + IRQ_TIMER);
        assert_eq!(k.trap(&tf), Resume::Env(a));
    }

    #[test]
    fn user_state_is_saved_on_entry() {
        let (mut k, a) = running();
        let mut tf = user_frame(&k, IRQ_OFFSET + IRQ_TIMER);
        tf.regs.ebx = 0x1234_5678;
        tf.eip = UTEXT + 0x40;
        assert_eq!(k.trap(&tf), Resume::Env(a), "only env besides idle");
        assert_eq!(k.saved_frame(a.index()).regs.ebx, 0x1234_5678);
        assert_eq!(k.saved_frame(a.index()).eip, UTEXT + 0x40);
    }

    #[test]
    fn breakpoint_enters_monitor_and_resumes() {
        let (mut k, a) = running();
        let tf = user_frame(&k, T_BRKPT);
        assert_eq!(k.trap(&tf), Resume::Env(a));
        assert_eq!(k.machine().monitor_log(), &[Some(tf)]);
    }

    #[test]
    fn spurious_interrupt_is_reported_and_ignored() {
        let (mut k, a) = running();
        let tf = user_frame(&k, IRQ_OFFSET + IRQ_SPURIOUS);
        assert_eq!(k.trap(&tf), Resume::Env(a));
        assert!(console(&k).contains("spurious interrupt on irq 7"));
    }

    #[test]
    fn unknown_user_trap_destroys_only_the_env() {
        let (mut k, a) = running();
        let tf = user_frame(&k, T_DIVIDE);
        // The idle environment picks up the CPU.
        assert_eq!(k.trap(&tf), Resume::Env(k.env(0).id()));
        assert!(!k.is_alive(a));
        assert!(console(&k).contains("Divide error"));
    }

    #[test]
    #[should_panic(expected = "unhandled trap in kernel")]
    fn unknown_kernel_trap_is_fatal() {
        let (mut k, _) = running();
        let mut tf = user_frame(&k, T_DIVIDE);
        tf.cs = GD_KT;
        k.trap(&tf);
    }

    #[test]
    #[should_panic(expected = "page fault in kernel mode")]
    fn kernel_page_fault_is_fatal() {
        let (mut k, _) = running();
        let mut tf = user_frame(&k, T_PGFLT);
        tf.cs = GD_KT;
        k.trap(&tf);
    }

    #[test]
    fn kernel_mode_timer_needs_no_env() {
        let mut k = Kernel::with_env_count(SimMachine::default(), 4);
        let idle = k.spawn(UTEXT).unwrap();
        let tf = TrapFrame {
            trapno: IRQ_OFFSET + IRQ_TIMER,
            cs: GD_KT,
            ..TrapFrame::default()
        };
        assert_eq!(k.trap(&tf), Resume::Env(idle));
    }

    #[test]
    fn fault_without_upcall_destroys() {
        let (mut k, a) = running();
        k.machine_mut().set_fault_address(0xdead_b000);
        let mut tf = user_frame(&k, T_PGFLT);
        tf.err = (FaultCode::USER | FaultCode::WRITE).bits();
        tf.eip = UTEXT + 8;
        k.trap(&tf);
        assert!(!k.is_alive(a));
        assert!(console(&k).contains(&format!(
            "[{:08x}] user fault va deadb000 ip {:08x}",
            a.0,
            UTEXT + 8
        )));
    }

    #[test]
    fn fault_with_upcall_pushes_a_record() {
        let (mut k, a) = running();
        give_exception_stack(&mut k, a);
        let i = a.index();
        k.envs[i].set_pgfault_upcall(Some(UPCALL));
        k.machine_mut().set_fault_address(0x0040_1234);

        let mut tf = user_frame(&k, T_PGFLT);
        tf.err = (FaultCode::USER | FaultCode::WRITE | FaultCode::PROTECTION).bits();
        tf.esp = USTACKTOP - 64;
        tf.regs.esi = 77;
        assert_eq!(k.trap(&tf), Resume::Env(a));

        let save = *k.saved_frame(i);
        assert_eq!(save.eip, UPCALL);
        assert_eq!(save.esp, UXSTACKTOP - UTRAPFRAME_SIZE);

        let space = k.env(i).space();
        let src = USlice::<UTrapframe>::from_raw(save.esp, 1).unwrap();
        let utf: UTrapframe = read_from_user(k.machine(), space, &src).unwrap();
        assert_eq!(utf.fault_va, 0x0040_1234);
        assert_eq!(utf.err, tf.err);
        assert_eq!(utf.esp, USTACKTOP - 64);
        assert_eq!(utf.eip, tf.eip);
        assert_eq!(utf.regs.esi, 77);

        // A second fault inside the handler stacks below the first.
        let tf2 = user_frame(&k, T_PGFLT);
        assert_eq!(k.trap(&tf2), Resume::Env(a));
        assert_eq!(
            k.saved_frame(i).esp,
            UXSTACKTOP - UTRAPFRAME_SIZE - 4 - UTRAPFRAME_SIZE
        );
    }

    #[test]
    fn fault_at_the_top_of_the_exception_stack_keeps_the_scratch_word() {
        let (mut k, a) = running();
        give_exception_stack(&mut k, a);
        let i = a.index();
        k.envs[i].set_pgfault_upcall(Some(UPCALL));
        k.machine_mut().set_fault_address(0x0040_2000);

        let mut tf = user_frame(&k, T_PGFLT);
        tf.err = (FaultCode::USER | FaultCode::WRITE).bits();
        tf.esp = UXSTACKTOP;
        tf.eip = 0x0080_1234;
        assert_eq!(k.trap(&tf), Resume::Env(a));

        let save = *k.saved_frame(i);
        assert_eq!(save.esp, UXSTACKTOP - 4 - UTRAPFRAME_SIZE);

        // The return path writes eip just below the trap-time esp; that
        // must not land on the record.
        let space = k.env(i).space();
        copy_to_user(k.machine_mut(), space, UXSTACKTOP - 4, &tf.eip.to_le_bytes())
            .unwrap();
        let src = USlice::<UTrapframe>::from_raw(save.esp, 1).unwrap();
        let utf: UTrapframe = read_from_user(k.machine(), space, &src).unwrap();
        assert_eq!(utf.esp, UXSTACKTOP);
        assert_eq!(utf.eip, 0x0080_1234);
    }

    #[test]
    fn fault_with_missing_exception_stack_destroys() {
        let (mut k, a) = running();
        k.envs[a.index()].set_pgfault_upcall(Some(UPCALL));
        let tf = user_frame(&k, T_PGFLT);
        k.trap(&tf);
        assert!(!k.is_alive(a));
        assert!(console(&k).contains("user_mem_check assertion failure"));
    }

    #[test]
    fn exception_stack_overflow_destroys() {
        let (mut k, a) = running();
        give_exception_stack(&mut k, a);
        k.envs[a.index()].set_pgfault_upcall(Some(UPCALL));
        let mut tf = user_frame(&k, T_PGFLT);
        tf.esp = UXSTACKBASE + 8;
        k.trap(&tf);
        assert!(!k.is_alive(a));
    }

    #[test]
    fn syscall_result_lands_in_eax() {
        let (mut k, a) = running();
        let mut tf = user_frame(&k, T_SYSCALL);
        tf.regs.eax = Sysnum::GetEnvId as u32;
        assert_eq!(k.trap(&tf), Resume::Env(a));
        assert_eq!(k.saved_frame(a.index()).regs.eax, a.0);
    }
}
