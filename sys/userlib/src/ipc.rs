// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Convenience wrappers over the IPC syscalls.

use crate::{
    sys_ipc_recv, sys_ipc_try_send, sys_yield, EnvId, Error, PagePerm,
    Runtime, UTOP,
};

/// A delivered message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Message {
    pub value: u32,
    pub from: EnvId,
    /// Permissions of the page that came with the message; empty if none
    /// did.
    pub perm: PagePerm,
}

/// Waits for a message. If `pg` is given, a page sent along with the
/// message is mapped there.
pub fn ipc_recv<R: Runtime>(
    rt: &mut R,
    pg: Option<u32>,
) -> Result<Message, Error> {
    sys_ipc_recv(rt, pg.unwrap_or(UTOP))?;

    let me = rt.env_info(rt.thisenv().index());
    Ok(Message {
        value: me.ipc_value,
        from: me.ipc_from,
        perm: me.ipc_perm,
    })
}

/// Sends `value`, and the page at `pg` with `perm` if given, to `to`.
///
/// Yields and retries until `to` is receiving. Any error other than "not
/// receiving" is fatal.
pub fn ipc_send<R: Runtime>(
    rt: &mut R,
    to: EnvId,
    value: u32,
    pg: Option<u32>,
    perm: PagePerm,
) {
    let srcva = pg.unwrap_or(UTOP);
    loop {
        match sys_ipc_try_send(rt, to, value, srcva, perm) {
            Ok(()) => return,
            Err(Error::IpcNotRecv) => sys_yield(rt),
            Err(e) => panic!("ipc_send to {:08x}: {}", to.0, e),
        }
    }
}
