// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helper environments that move Ethernet frames between the NIC and the
//! network server.
//!
//! Frames travel between environments one page at a time. The page holds a
//! packet record: a little-endian `i32` length followed by the frame bytes.

use byteorder::{ByteOrder, LittleEndian};

use crate::ipc::{ipc_recv, ipc_send};
use crate::{
    sys_page_alloc, sys_receive_frame, sys_transmit_frame, sys_yield, EnvId,
    Error, PagePerm, Runtime, ETH_FRAME_LEN,
};

/// IPC value for "here is a received frame", sent to the server.
pub const NSREQ_INPUT: u32 = 1;
/// IPC value for "transmit this frame", sent by the server.
pub const NSREQ_OUTPUT: u32 = 2;

/// Page where the helpers keep the packet record in flight.
pub const NSIPC_BUF: u32 = 0x0FFF_F000;

/// Offset of the frame bytes within a packet record.
pub const PKT_DATA_OFFSET: u32 = 4;

fn packet_perm() -> PagePerm {
    PagePerm::PRESENT | PagePerm::USER | PagePerm::WRITABLE
}

/// Waits for the next frame off the wire and hands it to `ns`.
///
/// Each frame goes out in a page of its own; once sent, the page belongs to
/// the server and the next frame gets a new one.
pub fn input_once<R: Runtime>(rt: &mut R, ns: EnvId) -> Result<(), Error> {
    sys_page_alloc(rt, EnvId::SELF, NSIPC_BUF, packet_perm())?;

    let len = loop {
        match sys_receive_frame(rt, NSIPC_BUF + PKT_DATA_OFFSET) {
            Ok(len) => break len,
            Err(Error::RingEmpty | Error::RingFull) => sys_yield(rt),
            Err(e) => return Err(e),
        }
    };

    let mut header = [0u8; PKT_DATA_OFFSET as usize];
    LittleEndian::write_i32(&mut header, len as i32);
    rt.store(NSIPC_BUF, &header);

    ipc_send(rt, ns, NSREQ_INPUT, Some(NSIPC_BUF), packet_perm());
    Ok(())
}

/// The input helper's main loop.
pub fn input<R: Runtime>(rt: &mut R, ns: EnvId) -> ! {
    loop {
        if let Err(e) = input_once(rt, ns) {
            panic!("input: {}", e);
        }
    }
}

/// Waits for one request and, if it is an output request from `ns`,
/// transmits the frame it carries. Returns whether a frame went out.
pub fn output_once<R: Runtime>(rt: &mut R, ns: EnvId) -> Result<bool, Error> {
    let msg = ipc_recv(rt, Some(NSIPC_BUF))?;
    if msg.value != NSREQ_OUTPUT
        || msg.from != ns
        || !msg.perm.contains(PagePerm::PRESENT)
    {
        return Ok(false);
    }

    let mut header = [0u8; PKT_DATA_OFFSET as usize];
    rt.load(NSIPC_BUF, &mut header);
    let len = usize::try_from(LittleEndian::read_i32(&header))
        .ok()
        .filter(|&len| len <= ETH_FRAME_LEN)
        .ok_or(Error::Inval)?;

    loop {
        match sys_transmit_frame(rt, NSIPC_BUF + PKT_DATA_OFFSET, len) {
            Ok(()) => return Ok(true),
            Err(Error::RingFull) => sys_yield(rt),
            Err(e) => return Err(e),
        }
    }
}

/// The output helper's main loop. Requests that are not well-formed output
/// requests are dropped.
pub fn output<R: Runtime>(rt: &mut R, ns: EnvId) -> ! {
    loop {
        match output_once(rt, ns) {
            Ok(_) | Err(Error::Inval) => (),
            Err(e) => panic!("output: {}", e),
        }
    }
}
