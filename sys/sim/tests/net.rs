// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::mpsc;

use abi::{EnvId, PagePerm, ETH_FRAME_LEN};
use byteorder::{ByteOrder, LittleEndian};
use sim::{Process, Sim};
use userlib::ipc::{ipc_recv, ipc_send};
use userlib::net::{
    input_once, output_once, NSREQ_INPUT, NSREQ_OUTPUT, PKT_DATA_OFFSET,
};
use userlib::{sys_page_alloc, sys_yield, Runtime};

const PKT: u32 = 0x0050_0000;
const RW: PagePerm = PagePerm::PRESENT
    .union(PagePerm::USER)
    .union(PagePerm::WRITABLE);

fn frame(tag: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| tag.wrapping_add(i as u8)).collect()
}

/// Reads the packet record at `va`.
fn read_packet(p: &mut Process, va: u32) -> Vec<u8> {
    let mut header = [0; 4];
    p.load(va, &mut header);
    let mut data = vec![0; LittleEndian::read_i32(&header) as usize];
    p.load(va + PKT_DATA_OFFSET, &mut data);
    data
}

fn write_packet(p: &mut Process, va: u32, data: &[u8]) {
    let mut header = [0; 4];
    LittleEndian::write_i32(&mut header, data.len() as i32);
    p.store(va, &header);
    p.store(va + PKT_DATA_OFFSET, data);
}

#[test]
fn input_forwards_frames_in_order() {
    let sim = Sim::new();
    let (tx, rx) = mpsc::channel();
    let ns = sim
        .spawn(move |p| {
            for _ in 0..3 {
                let msg = ipc_recv(p, Some(PKT)).unwrap();
                assert_eq!(msg.value, NSREQ_INPUT);
                assert!(msg.perm.contains(PagePerm::WRITABLE));
                tx.send(read_packet(p, PKT)).unwrap();
            }
        })
        .unwrap();
    sim.spawn(move |p| {
        for _ in 0..3 {
            input_once(p, ns).unwrap();
        }
    })
    .unwrap();

    let frames = [frame(1, 60), frame(2, ETH_FRAME_LEN), frame(3, 1)];
    for f in &frames {
        assert!(sim.inject_frame(f));
    }
    sim.run().unwrap();
    assert_eq!(sim.panics(), vec![]);
    assert_eq!(rx.try_iter().collect::<Vec<_>>(), frames.to_vec());
}

#[test]
fn input_waits_for_traffic() {
    let sim = Sim::new();
    let (tx, rx) = mpsc::channel();
    let ns = sim
        .spawn(move |p| {
            let msg = ipc_recv(p, Some(PKT)).unwrap();
            assert_eq!(msg.value, NSREQ_INPUT);
            tx.send(read_packet(p, PKT)).unwrap();
        })
        .unwrap();
    // Lets the input helper find the ring empty a few times before asking
    // the host to put a frame on the wire.
    let (wire_tx, wire_rx) = mpsc::channel::<()>();
    sim.spawn(move |p| {
        for _ in 0..3 {
            sys_yield(p);
        }
        wire_tx.send(()).unwrap();
    })
    .unwrap();
    sim.spawn(move |p| input_once(p, ns).unwrap()).unwrap();

    let wire = &sim;
    std::thread::scope(|s| {
        s.spawn(move || {
            if wire_rx.recv().is_ok() {
                assert!(wire.inject_frame(&frame(9, 100)));
            }
        });
        sim.run().unwrap();
    });
    assert_eq!(sim.panics(), vec![]);
    assert_eq!(rx.recv().unwrap(), frame(9, 100));
}

#[test]
fn output_transmits_server_requests() {
    let sim = Sim::new();
    let (tx, rx) = mpsc::channel();
    sim.spawn(move |p| {
        let me = p.thisenv();
        let helper = p
            .fork(move |p| {
                let ns = p.env_info(p.thisenv().index()).parent;
                assert_eq!(ns, me);
                for _ in 0..3 {
                    tx.send(output_once(p, ns)).unwrap();
                }
            })
            .unwrap();

        sys_page_alloc(p, EnvId::SELF, PKT, RW).unwrap();
        write_packet(p, PKT, &frame(7, 64));
        ipc_send(p, helper, NSREQ_OUTPUT, Some(PKT), RW);
        // Not an output request: dropped.
        ipc_send(p, helper, 77, Some(PKT), RW);
        write_packet(p, PKT, &frame(8, ETH_FRAME_LEN));
        ipc_send(p, helper, NSREQ_OUTPUT, Some(PKT), RW);
    })
    .unwrap();

    sim.run().unwrap();
    assert_eq!(sim.panics(), vec![]);
    assert_eq!(
        rx.try_iter().collect::<Vec<_>>(),
        vec![Ok(true), Ok(false), Ok(true)]
    );
    assert_eq!(sim.transmitted(), vec![frame(7, 64), frame(8, ETH_FRAME_LEN)]);
}

#[test]
fn output_ignores_strangers() {
    let sim = Sim::new();
    let (tx, rx) = mpsc::channel();
    sim.spawn(move |p| {
        let helper = p
            .fork(move |p| {
                tx.send(output_once(p, EnvId(0x7777))).unwrap();
            })
            .unwrap();
        sys_page_alloc(p, EnvId::SELF, PKT, RW).unwrap();
        write_packet(p, PKT, &frame(1, 10));
        ipc_send(p, helper, NSREQ_OUTPUT, Some(PKT), RW);
    })
    .unwrap();

    sim.run().unwrap();
    assert_eq!(rx.recv().unwrap(), Ok(false));
    assert_eq!(sim.transmitted(), Vec::<Vec<u8>>::new());
}
