// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted simulator: runs user programs, written against `userlib`, on top
//! of the kernel core and its in-memory machine.
//!
//! Each environment's program runs on a host thread of its own, but only the
//! thread of the environment the kernel last resumed is allowed to execute;
//! every other thread waits on a condition variable. Handing the CPU over is
//! therefore exactly as cooperative as the kernel makes it: a thread gives it
//! up only by trapping.
//!
//! A program is straight-line Rust, so it has no instruction pointer for the
//! kernel to redirect. The simulator bridges the gap at the two places the
//! kernel changes control flow:
//!
//! - When a load or store faults and the kernel redirects the environment to
//!   `PGFAULT_UPCALL_ENTRY`, the simulator runs `userlib::pgfault::upcall`
//!   on the spot, restores the registers it returns, and retries the access.
//! - When `sys_exofork` creates a child, the program that asked for the fork
//!   supplies a closure for the child to run (see [`Process::fork`]). It
//!   starts, on a new thread, the first time the kernel resumes the child.
//!
//! An environment that is destroyed while its thread is in the kernel never
//! gets the CPU back; its thread unwinds and exits.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use abi::{
    page_round_down, EnvId, EnvInfo, EnvStatus, Error, FaultCode, PagePerm,
    Sysnum, TrapFrame, PGSIZE, T_PGFLT, T_SYSCALL, UTEXT,
};
use kern::arch::sim::SimMachine;
use kern::arch::{FrameAllocator, PageRef, PageTables};
use kern::{Kernel, Resume};
use userlib::{PgfaultHandler, Runtime, PGFAULT_UPCALL_ENTRY};

/// Environment slots in a default simulator.
pub const DEFAULT_ENV_COUNT: usize = 16;

/// How long `Sim::run` waits for the system to halt.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A user program.
pub type Program = Box<dyn FnOnce(&mut Process) + Send + 'static>;

#[derive(Debug, Eq, PartialEq)]
pub enum SimError {
    Kernel(Error),
    /// The system did not halt in time.
    Stalled,
}

impl From<Error> for SimError {
    fn from(e: Error) -> Self {
        Self::Kernel(e)
    }
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel(e) => write!(f, "kernel: {}", e),
            Self::Stalled => f.write_str("system did not halt"),
        }
    }
}

impl std::error::Error for SimError {}

/// Unwind payload for a thread whose environment is gone.
struct Destroyed;

struct State {
    kernel: Kernel<SimMachine>,
    /// The environment whose thread holds the CPU.
    running: Option<EnvId>,
    started: bool,
    halted: bool,
    panics: Vec<(EnvId, String)>,
    /// Page faults taken, by environment and page.
    faults: HashMap<(EnvId, u32), u32>,
}

impl State {
    fn dispatch(&mut self, resume: Resume) {
        match resume {
            Resume::Env(id) => self.running = Some(id),
            Resume::Halted => {
                self.running = None;
                self.halted = true;
            }
        }
    }
}

struct Shared {
    state: Mutex<State>,
    cpu: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn halt(&self) {
        self.lock().halted = true;
        self.cpu.notify_all();
    }
}

enum Entry {
    Main(Program),
    Child(Program),
}

fn start_thread(mut process: Process, entry: Entry) {
    let shared = Arc::clone(&process.shared);
    let handle = thread::spawn(move || process.main(entry));
    shared
        .threads
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(handle);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// A simulated machine running the kernel.
pub struct Sim {
    shared: Arc<Shared>,
}

impl Sim {
    /// A simulator with the default machine and `DEFAULT_ENV_COUNT` slots.
    pub fn new() -> Self {
        Self::with_machine(SimMachine::default(), DEFAULT_ENV_COUNT)
    }

    /// A simulator on `machine` with `env_count` slots.
    ///
    /// Slot 0 gets the idle environment. The scheduler only picks it when
    /// nothing else can run, which in a closed simulation means nothing else
    /// ever will, so it exits as soon as it is scheduled.
    pub fn with_machine(machine: SimMachine, env_count: usize) -> Self {
        let sim = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    kernel: Kernel::with_env_count(machine, env_count),
                    running: None,
                    started: false,
                    halted: false,
                    panics: Vec::new(),
                    faults: HashMap::new(),
                }),
                cpu: Condvar::new(),
                threads: Mutex::new(Vec::new()),
            }),
        };
        // An empty table has a free slot 0, so this only fails on memory.
        if let Err(e) = sim.spawn(|_| ()) {
            panic!("no room for the idle environment: {}", e);
        }
        sim
    }

    /// Creates a runnable environment that will run `program`.
    pub fn spawn(
        &self,
        program: impl FnOnce(&mut Process) + Send + 'static,
    ) -> Result<EnvId, SimError> {
        let id = {
            let mut st = self.shared.lock();
            let id = st.kernel.spawn(UTEXT)?;
            st.kernel.set_status(id, EnvStatus::Runnable)?;
            id
        };
        start_thread(
            Process::new(Arc::clone(&self.shared), id),
            Entry::Main(Box::new(program)),
        );
        Ok(id)
    }

    /// Runs until the kernel halts, for at most `DEFAULT_TIMEOUT`.
    pub fn run(&self) -> Result<(), SimError> {
        self.run_for(DEFAULT_TIMEOUT)
    }

    pub fn run_for(&self, timeout: Duration) -> Result<(), SimError> {
        {
            let mut st = self.shared.lock();
            if !st.started {
                st.started = true;
                let resume = st.kernel.start();
                st.dispatch(resume);
            }
        }
        self.shared.cpu.notify_all();

        let deadline = Instant::now() + timeout;
        let mut st = self.shared.lock();
        while !st.halted {
            let now = Instant::now();
            if now >= deadline {
                drop(st);
                self.shared.halt();
                return Err(SimError::Stalled);
            }
            st = self
                .shared
                .cpu
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        drop(st);

        let threads = std::mem::take(
            &mut *self
                .shared
                .threads
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for t in threads {
            let _ = t.join();
        }
        Ok(())
    }

    /// Everything written to the console so far.
    pub fn console(&self) -> String {
        let st = self.shared.lock();
        String::from_utf8_lossy(st.kernel.machine().console_output()).into_owned()
    }

    /// Panics raised by user programs, in order. A panic destroys the
    /// environment that raised it.
    pub fn panics(&self) -> Vec<(EnvId, String)> {
        self.shared.lock().panics.clone()
    }

    /// Number of page faults `id` has taken on the page containing `va`.
    pub fn faults(&self, id: EnvId, va: u32) -> u32 {
        let key = (id, page_round_down(va));
        self.shared.lock().faults.get(&key).copied().unwrap_or(0)
    }

    pub fn is_alive(&self, id: EnvId) -> bool {
        self.shared.lock().kernel.is_alive(id)
    }

    /// Puts a frame on the NIC's receive ring. Returns `false` if the ring
    /// is full.
    pub fn inject_frame(&self, frame: &[u8]) -> bool {
        self.shared.lock().kernel.machine_mut().nic_mut().inject(frame)
    }

    /// Takes every frame transmitted so far.
    pub fn transmitted(&self) -> Vec<Vec<u8>> {
        self.shared
            .lock()
            .kernel
            .machine_mut()
            .nic_mut()
            .drain_transmitted()
    }

    /// Runs `f` with the kernel, for inspection.
    pub fn with_kernel<T>(
        &self,
        f: impl FnOnce(&mut Kernel<SimMachine>) -> T,
    ) -> T {
        f(&mut self.shared.lock().kernel)
    }
}

impl Default for Sim {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Sim {
    fn drop(&mut self) {
        // Threads still waiting for the CPU give up once halted is set.
        self.shared.halt();
    }
}

/// One environment, as seen from its own program: the `userlib` runtime.
pub struct Process {
    shared: Arc<Shared>,
    id: EnvId,
    /// The environment's registers while it is on the CPU.
    regs: TrapFrame,
    thisenv: EnvId,
    handler: Option<PgfaultHandler<Process>>,
    /// What the next child created by `sys_exofork` runs.
    pending_child: Option<Program>,
}

impl Process {
    fn new(shared: Arc<Shared>, id: EnvId) -> Self {
        Self {
            shared,
            id,
            regs: TrapFrame::default(),
            thisenv: EnvId::SELF,
            handler: None,
            pending_child: None,
        }
    }

    pub fn id(&self) -> EnvId {
        self.id
    }

    pub fn regs(&self) -> &TrapFrame {
        &self.regs
    }

    /// `userlib::fork::fork`, with `child` standing in for the code the
    /// child resumes at.
    pub fn fork(
        &mut self,
        child: impl FnOnce(&mut Process) + Send + 'static,
    ) -> Result<EnvId, Error> {
        self.pending_child = Some(Box::new(child));
        let r = userlib::fork::fork(self);
        self.pending_child = None;
        r
    }

    /// Number of page faults this environment has taken on the page
    /// containing `va`.
    pub fn faults_at(&self, va: u32) -> u32 {
        let key = (self.id, page_round_down(va));
        self.shared.lock().faults.get(&key).copied().unwrap_or(0)
    }

    /// Executes an instruction that raises trap `trapno`.
    pub fn raise(&mut self, trapno: u32) {
        let mut tf = self.regs;
        tf.trapno = trapno;
        tf.err = 0;
        self.trap(tf);
    }

    fn main(mut self, entry: Entry) {
        if !self.wait_for_cpu() {
            return;
        }
        let result = panic::catch_unwind(AssertUnwindSafe(|| match entry {
            Entry::Main(program) => userlib::libmain(&mut self, program),
            Entry::Child(program) => {
                userlib::fork::child_started(&mut self);
                program(&mut self);
                userlib::exit(&mut self)
            }
        }));
        let Err(payload) = result else {
            return;
        };
        if payload.is::<Destroyed>() {
            return;
        }

        let message = panic_message(&*payload);
        self.shared.lock().panics.push((self.id, message));
        if self.shared.state.is_poisoned() {
            // The kernel itself panicked; nothing can run after that.
            self.shared.halt();
            return;
        }
        // A panic is fatal to the environment that raised it.
        let _ = panic::catch_unwind(AssertUnwindSafe(|| {
            userlib::exit(&mut self)
        }));
    }

    /// Blocks until the kernel resumes this environment, then loads its
    /// registers. Returns `false` if it never will.
    fn wait_for_cpu(&mut self) -> bool {
        let shared = Arc::clone(&self.shared);
        let mut st = shared.lock();
        loop {
            if st.halted || !st.kernel.is_alive(self.id) {
                return false;
            }
            if st.running == Some(self.id) {
                self.regs = *st.kernel.saved_frame(self.id.index());
                return true;
            }
            st = shared
                .cpu
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Enters the kernel with `tf` and returns once this environment is
    /// resumed. Unwinds if it is not.
    fn trap(&mut self, tf: TrapFrame) {
        {
            let mut st = self.shared.lock();
            let resume = st.kernel.trap(&tf);
            st.dispatch(resume);
        }
        self.shared.cpu.notify_all();
        if !self.wait_for_cpu() {
            panic::resume_unwind(Box::new(Destroyed));
        }
    }

    /// Starts the thread for a child `sys_exofork` just created.
    fn exoforked(&mut self, ret: u32) {
        let program = self.pending_child.take();
        let child = match Error::check(ret) {
            Ok(raw) if raw != 0 => EnvId(raw),
            _ => return,
        };
        // The child's memory is a copy of ours, handler slot included.
        let mut process = Process::new(Arc::clone(&self.shared), child);
        process.thisenv = self.thisenv;
        process.handler = self.handler;
        start_thread(
            process,
            Entry::Child(program.unwrap_or_else(|| Box::new(|_| ()))),
        );
    }

    /// Returns the page backing `va`, taking page faults until the access
    /// is allowed.
    fn resolve(&mut self, va: u32, write: bool) -> PageRef {
        loop {
            let code = {
                let mut st = self.shared.lock();
                let space = st.kernel.env(self.id.index()).space();
                let mut code = FaultCode::USER;
                if write {
                    code |= FaultCode::WRITE;
                }
                match st.kernel.machine().lookup(space, va) {
                    Some((page, perm))
                        if perm.contains(PagePerm::REQUIRED)
                            && (!write || perm.contains(PagePerm::WRITABLE)) =>
                    {
                        return page;
                    }
                    Some(_) => code |= FaultCode::PROTECTION,
                    None => (),
                }
                st.kernel.machine_mut().set_fault_address(va);
                *st.faults.entry((self.id, page_round_down(va))).or_default() +=
                    1;
                code
            };

            let mut tf = self.regs;
            tf.trapno = T_PGFLT;
            tf.err = code.bits();
            self.trap(tf);

            if self.regs.eip == PGFAULT_UPCALL_ENTRY {
                let utf_va = self.regs.esp;
                let utf = userlib::pgfault::upcall(self, utf_va);
                self.regs.regs = utf.regs;
                self.regs.eflags = utf.eflags;
                self.regs.eip = utf.eip;
                self.regs.esp = utf.esp;
            }
        }
    }

    /// Splits `[va, va + len)` at page boundaries.
    fn pieces(va: u32, len: usize) -> impl Iterator<Item = (u32, usize, usize)> {
        let mut done = 0;
        std::iter::from_fn(move || {
            if done == len {
                return None;
            }
            let at = va.wrapping_add(done as u32);
            let offset = (at % PGSIZE) as usize;
            let n = (PGSIZE as usize - offset).min(len - done);
            let piece = (at, done, n);
            done += n;
            Some(piece)
        })
    }
}

impl Runtime for Process {
    fn syscall(&mut self, nr: Sysnum, args: [u32; 5]) -> u32 {
        let mut tf = self.regs;
        tf.trapno = T_SYSCALL;
        tf.err = 0;
        tf.regs.eax = nr as u32;
        tf.regs.edx = args[0];
        tf.regs.ecx = args[1];
        tf.regs.ebx = args[2];
        tf.regs.edi = args[3];
        tf.regs.esi = args[4];
        self.trap(tf);

        let ret = self.regs.regs.eax;
        if nr == Sysnum::Exofork {
            self.exoforked(ret);
        }
        ret
    }

    fn vpd(&self, pdx: usize) -> bool {
        let st = self.shared.lock();
        let space = st.kernel.env(self.id.index()).space();
        st.kernel.machine().table_present(space, pdx)
    }

    fn vpt(&self, va: u32) -> Option<PagePerm> {
        let st = self.shared.lock();
        let space = st.kernel.env(self.id.index()).space();
        st.kernel.machine().lookup(space, va).map(|(_, perm)| perm)
    }

    fn env_info(&self, index: usize) -> EnvInfo {
        self.shared.lock().kernel.env_info(index)
    }

    fn load(&mut self, va: u32, buf: &mut [u8]) {
        for (at, done, n) in Self::pieces(va, buf.len()) {
            let page = self.resolve(at, false);
            let offset = (at % PGSIZE) as usize;
            let st = self.shared.lock();
            buf[done..done + n].copy_from_slice(
                &st.kernel.machine().page(page)[offset..offset + n],
            );
        }
    }

    fn store(&mut self, va: u32, bytes: &[u8]) {
        for (at, done, n) in Self::pieces(va, bytes.len()) {
            let page = self.resolve(at, true);
            let offset = (at % PGSIZE) as usize;
            let mut st = self.shared.lock();
            st.kernel.machine_mut().page_mut(page)[offset..offset + n]
                .copy_from_slice(&bytes[done..done + n]);
        }
    }

    fn thisenv(&self) -> EnvId {
        self.thisenv
    }

    fn set_thisenv(&mut self, id: EnvId) {
        self.thisenv = id;
    }

    fn pgfault_handler(&self) -> Option<PgfaultHandler<Self>> {
        self.handler
    }

    fn set_pgfault_handler_slot(&mut self, handler: Option<PgfaultHandler<Self>>) {
        self.handler = handler;
    }
}
