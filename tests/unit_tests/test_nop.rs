// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use iscsi_target_rs::{
    models::{nop::response::NopInResponse, opcode::Opcode},
    target::aen,
};

use crate::unit_tests::support::{nop_out_bhs, rx, setup, tx_all, tx_one};

const RESERVED: u32 = 0xffff_ffff;

#[tokio::test]
async fn ping_is_echoed_with_payload() {
    let h = setup(1);

    rx(&h, nop_out_bhs(0x99, RESERVED, 1, 4, false), b"ping").await;

    let rsps = tx_all(&h);
    assert_eq!(rsps.len(), 1);
    assert_eq!(rsps[0].0, Opcode::NopIn);

    let inner = rsps[0].1.inner();
    let hdr: &NopInResponse = inner.pdu.view().unwrap();
    assert_eq!(inner.pdu.itt(), 0x99);
    assert_eq!(hdr.target_task_tag.get(), RESERVED);
    assert_eq!(&inner.resp_data[..], b"ping");
}

#[tokio::test]
async fn keepalive_round_trip() {
    let h = setup(5);

    aen::send_nop_in(&h.conn);

    let rsp = tx_one(&h).expect("keepalive NOP-In queued");
    let ttt = {
        let inner = rsp.inner();
        assert_eq!(inner.pdu.opcode(), Some(Opcode::NopIn));
        assert_eq!(inner.pdu.itt(), RESERVED);
        inner.pdu.ttt()
    };
    assert_ne!(ttt, RESERVED);

    // The initiator answers with a NOP-Out carrying our TTT; no reply
    // is generated for it.
    rx(&h, nop_out_bhs(RESERVED, ttt, 5, 0, true), &[]).await;
    assert_eq!(h.conn.queued_rsps(), 0);
}

#[tokio::test]
async fn keepalive_stat_sn_is_not_consumed() {
    let h = setup(5);

    aen::send_nop_in(&h.conn);
    let rsp = tx_one(&h).expect("keepalive NOP-In queued");
    assert_eq!(rsp.inner().pdu.sn(), 0);

    // A real status afterwards still gets StatSN 0.
    use crate::unit_tests::support::nodata_cmd_bhs;
    rx(&h, nodata_cmd_bhs(1, 5, false), &[]).await;
    let rsps = tx_all(&h);
    assert_eq!(rsps[0].1.inner().pdu.sn(), 0);
}

#[tokio::test]
async fn aen_rides_async_message() {
    let h = setup(1);

    let sense = iscsi_target_rs::models::data::sense_data::SenseData::current(
        0x06, 0x2a, 0x01,
    );
    let delivered = aen::report_aen(
        &h.sess,
        iscsi_target_rs::target::backend::ScsiAen {
            lun: 0,
            sense: bytes::Bytes::copy_from_slice(&sense.to_fixed_bytes()),
        },
    );
    assert!(delivered);

    let rsps = tx_all(&h);
    assert_eq!(rsps.len(), 1);
    assert_eq!(rsps[0].0, Opcode::AsyncMsg);
    {
        let inner = rsps[0].1.inner();
        // SenseLength prefix, then fixed sense with the UNIT ATTENTION key.
        assert_eq!(inner.resp_data[0..2], 18u16.to_be_bytes());
        assert_eq!(inner.resp_data[2] & 0x7f, 0x70);
        assert_eq!(inner.resp_data[2 + 2] & 0x0f, 0x06);
    }

    // Releasing the transmitted response hands the event back.
    drop(rsps);
    assert_eq!(h.backend.aens_done.lock().unwrap().len(), 1);
}
