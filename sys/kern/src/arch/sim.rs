// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory machine.
//!
//! Physical memory is a bounded pool of heap-allocated pages; each address
//! space is a pair of ordered maps standing in for the page directory and its
//! page tables. Page tables and page directories consume pages from the same
//! pool, so running out of memory behaves the way it does on hardware.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec;
use alloc::vec::Vec;

use abi::{pdx, PagePerm, TrapFrame, PGSIZE, PTSIZE};

use super::{
    Console, Cpu, FrameAllocator, Monitor, Nic, NicError, OutOfMemory,
    PageRef, PageTables,
};

/// Default number of physical pages.
pub const DEFAULT_PAGES: usize = 1024;
/// Slots in each NIC ring.
pub const NIC_RING_SIZE: usize = 10;

struct Frame {
    data: Box<[u8]>,
    refs: u32,
}

/// Handle on a simulated address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SpaceId(u32);

struct Space {
    /// Page backing the page directory.
    root: PageRef,
    /// Page backing each page table, by directory slot.
    tables: BTreeMap<usize, PageRef>,
    ptes: BTreeMap<u32, (PageRef, PagePerm)>,
}

pub struct SimMachine {
    frames: Vec<Option<Frame>>,
    free_slots: Vec<u32>,
    live: usize,
    page_limit: usize,
    spaces: Vec<Option<Space>>,
    fault_va: u32,
    nic: SimNic,
    console_out: Vec<u8>,
    console_in: VecDeque<u8>,
    monitor_log: Vec<Option<TrapFrame>>,
}

impl Default for SimMachine {
    fn default() -> Self {
        Self::with_pages(DEFAULT_PAGES)
    }
}

impl SimMachine {
    /// Creates a machine with `pages` pages of physical memory.
    pub fn with_pages(pages: usize) -> Self {
        Self {
            frames: Vec::new(),
            free_slots: Vec::new(),
            live: 0,
            page_limit: pages,
            spaces: Vec::new(),
            fault_va: 0,
            nic: SimNic::default(),
            console_out: Vec::new(),
            console_in: VecDeque::new(),
            monitor_log: Vec::new(),
        }
    }

    /// Number of pages currently allocated.
    pub fn pages_in_use(&self) -> usize {
        self.live
    }

    /// Changes the amount of physical memory. Pages already handed out stay
    /// allocated.
    pub fn set_page_limit(&mut self, pages: usize) {
        self.page_limit = pages;
    }

    /// Reference count of a page, or 0 if it is free.
    pub fn refcount(&self, page: PageRef) -> u32 {
        self.frames
            .get(page.0 as usize)
            .and_then(Option::as_ref)
            .map_or(0, |f| f.refs)
    }

    /// Latches the address the next page fault reports.
    pub fn set_fault_address(&mut self, va: u32) {
        self.fault_va = va;
    }

    pub fn console_output(&self) -> &[u8] {
        &self.console_out
    }

    pub fn push_console_input(&mut self, bytes: &[u8]) {
        self.console_in.extend(bytes.iter().copied());
    }

    /// Frames handed to the monitor, in order. `None` entries are entries
    /// with nothing left to run.
    pub fn monitor_log(&self) -> &[Option<TrapFrame>] {
        &self.monitor_log
    }

    pub fn nic(&self) -> &SimNic {
        &self.nic
    }

    pub fn nic_mut(&mut self) -> &mut SimNic {
        &mut self.nic
    }

    fn frame(&self, page: PageRef) -> &Frame {
        match self.frames.get(page.0 as usize) {
            Some(Some(f)) => f,
            _ => panic!("use of free page {:?}", page),
        }
    }

    fn frame_mut(&mut self, page: PageRef) -> &mut Frame {
        match self.frames.get_mut(page.0 as usize) {
            Some(Some(f)) => f,
            _ => panic!("use of free page {:?}", page),
        }
    }

    fn space(&self, id: SpaceId) -> &Space {
        match self.spaces.get(id.0 as usize) {
            Some(Some(s)) => s,
            _ => panic!("use of destroyed address space {:?}", id),
        }
    }

    fn space_mut(&mut self, id: SpaceId) -> &mut Space {
        match self.spaces.get_mut(id.0 as usize) {
            Some(Some(s)) => s,
            _ => panic!("use of destroyed address space {:?}", id),
        }
    }
}

impl FrameAllocator for SimMachine {
    fn alloc_zeroed(&mut self) -> Result<PageRef, OutOfMemory> {
        if self.live >= self.page_limit {
            return Err(OutOfMemory);
        }
        let frame = Frame {
            data: vec![0; PGSIZE as usize].into_boxed_slice(),
            refs: 1,
        };
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.frames[slot as usize] = Some(frame);
                slot
            }
            None => {
                self.frames.push(Some(frame));
                (self.frames.len() - 1) as u32
            }
        };
        self.live += 1;
        Ok(PageRef(slot))
    }

    fn incref(&mut self, page: PageRef) {
        self.frame_mut(page).refs += 1;
    }

    fn decref(&mut self, page: PageRef) {
        let frame = self.frame_mut(page);
        uassert!(frame.refs > 0);
        frame.refs -= 1;
        if frame.refs == 0 {
            self.frames[page.0 as usize] = None;
            self.free_slots.push(page.0);
            self.live -= 1;
        }
    }

    fn page(&self, page: PageRef) -> &[u8] {
        &self.frame(page).data
    }

    fn page_mut(&mut self, page: PageRef) -> &mut [u8] {
        &mut self.frame_mut(page).data
    }
}

impl PageTables for SimMachine {
    type Space = SpaceId;

    fn create_space(&mut self) -> Result<SpaceId, OutOfMemory> {
        let root = self.alloc_zeroed()?;
        let space = Space {
            root,
            tables: BTreeMap::new(),
            ptes: BTreeMap::new(),
        };
        let id = match self.spaces.iter().position(Option::is_none) {
            Some(i) => {
                self.spaces[i] = Some(space);
                i
            }
            None => {
                self.spaces.push(Some(space));
                self.spaces.len() - 1
            }
        };
        Ok(SpaceId(id as u32))
    }

    fn destroy_space(&mut self, id: SpaceId) {
        let space = match self.spaces.get_mut(id.0 as usize).and_then(Option::take)
        {
            Some(s) => s,
            None => panic!("double destroy of address space {:?}", id),
        };
        for (page, _) in space.ptes.into_values() {
            self.decref(page);
        }
        for table in space.tables.into_values() {
            self.decref(table);
        }
        self.decref(space.root);
    }

    fn map(
        &mut self,
        id: SpaceId,
        page: PageRef,
        va: u32,
        perm: PagePerm,
    ) -> Result<(), OutOfMemory> {
        let slot = pdx(va);
        if !self.space(id).tables.contains_key(&slot) {
            let table = self.alloc_zeroed()?;
            self.space_mut(id).tables.insert(slot, table);
        }
        // Take the new reference before dropping the old one, in case they
        // are the same page.
        self.incref(page);
        let old = self
            .space_mut(id)
            .ptes
            .insert(va & !(PGSIZE - 1), (page, perm | PagePerm::PRESENT));
        if let Some((old_page, _)) = old {
            self.decref(old_page);
        }
        Ok(())
    }

    fn unmap(&mut self, id: SpaceId, va: u32) {
        if let Some((page, _)) =
            self.space_mut(id).ptes.remove(&(va & !(PGSIZE - 1)))
        {
            self.decref(page);
        }
    }

    fn lookup(&self, id: SpaceId, va: u32) -> Option<(PageRef, PagePerm)> {
        self.space(id).ptes.get(&(va & !(PGSIZE - 1))).copied()
    }

    fn next_mapped(&self, id: SpaceId, from: u32, limit: u32) -> Option<u32> {
        self.space(id)
            .ptes
            .range(from..limit)
            .next()
            .map(|(&va, _)| va)
    }

    fn table_present(&self, id: SpaceId, slot: usize) -> bool {
        let space = self.space(id);
        let base = (slot as u32).wrapping_mul(PTSIZE);
        // A table may outlive its last mapping; report it present only while
        // it still maps something, as a real walk of the directory would
        // after tables are reclaimed.
        space.tables.contains_key(&slot)
            && space.ptes.range(base..).next().is_some_and(|(&va, _)| {
                pdx(va) == slot
            })
    }
}

impl Cpu for SimMachine {
    fn fault_address(&self) -> u32 {
        self.fault_va
    }

    fn interrupts_enabled(&self) -> bool {
        // The simulated CPU only enters the kernel through `Kernel::trap`,
        // which is never interrupted.
        false
    }
}

impl Console for SimMachine {
    fn write(&mut self, bytes: &[u8]) {
        self.console_out.extend_from_slice(bytes);
    }

    fn getc(&mut self) -> Option<u8> {
        self.console_in.pop_front()
    }
}

impl Nic for SimMachine {
    fn transmit(&mut self, frame: &[u8]) -> Result<(), NicError> {
        self.nic.transmit(frame)
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, NicError> {
        self.nic.receive(buf)
    }
}

impl Monitor for SimMachine {
    fn monitor(&mut self, tf: Option<&TrapFrame>) {
        self.monitor_log.push(tf.copied());
    }
}

/// Simulated network card with bounded transmit and receive rings.
pub struct SimNic {
    tx: VecDeque<Vec<u8>>,
    rx: VecDeque<Vec<u8>>,
    ring_size: usize,
    rx_overrun: bool,
}

impl Default for SimNic {
    fn default() -> Self {
        Self {
            tx: VecDeque::new(),
            rx: VecDeque::new(),
            ring_size: NIC_RING_SIZE,
            rx_overrun: false,
        }
    }
}

impl SimNic {
    /// Plays the wire: queues a frame for the driver to receive. Returns
    /// `false`, and remembers the overrun, if the receive ring is full.
    pub fn inject(&mut self, frame: &[u8]) -> bool {
        if self.rx.len() >= self.ring_size {
            self.rx_overrun = true;
            return false;
        }
        self.rx.push_back(frame.to_vec());
        true
    }

    /// Plays the device: takes every frame queued for transmission.
    pub fn drain_transmitted(&mut self) -> Vec<Vec<u8>> {
        self.tx.drain(..).collect()
    }

    pub fn pending_transmit(&self) -> usize {
        self.tx.len()
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<(), NicError> {
        if self.tx.len() >= self.ring_size {
            return Err(NicError::RingFull);
        }
        self.tx.push_back(frame.to_vec());
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, NicError> {
        // An overrun is reported once, ahead of the frames that did make it.
        if self.rx_overrun {
            self.rx_overrun = false;
            return Err(NicError::RingFull);
        }
        let frame = self.rx.pop_front().ok_or(NicError::RingEmpty)?;
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        Ok(n)
    }
}
