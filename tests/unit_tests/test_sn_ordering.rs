// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use iscsi_target_rs::models::opcode::Opcode;

use crate::unit_tests::support::{nodata_cmd_bhs, rx, setup, tx_all};

#[tokio::test]
async fn out_of_order_cmds_execute_in_cmd_sn_order() {
    let h = setup(7);

    rx(&h, nodata_cmd_bhs(1, 7, false), &[]).await;
    rx(&h, nodata_cmd_bhs(3, 9, false), &[]).await;
    assert_eq!(*h.backend.rx_order.lock().unwrap(), vec![7]);

    // 8 arrives last and unblocks the queued 9.
    rx(&h, nodata_cmd_bhs(2, 8, false), &[]).await;
    assert_eq!(*h.backend.rx_order.lock().unwrap(), vec![7, 8, 9]);
    assert_eq!(h.sess.exp_cmd_sn(), 10);

    let rsps = tx_all(&h);
    assert_eq!(rsps.len(), 3);
    assert!(rsps.iter().all(|(op, _)| *op == Opcode::ScsiCommandResp));
}

#[tokio::test]
async fn immediate_cmd_bypasses_reordering() {
    let h = setup(10);

    rx(&h, nodata_cmd_bhs(1, 15, true), &[]).await;

    assert_eq!(*h.backend.rx_order.lock().unwrap(), vec![15]);
    assert_eq!(h.sess.exp_cmd_sn(), 10, "immediate PDU must not advance ExpCmdSN");
}

#[tokio::test]
async fn stale_cmd_sn_is_silently_dropped() {
    let h = setup(10);

    rx(&h, nodata_cmd_bhs(1, 5, false), &[]).await;

    assert!(h.backend.rx_order.lock().unwrap().is_empty());
    assert_eq!(h.conn.queued_rsps(), 0, "no response may leave for a stale CmdSN");
    assert_eq!(h.sess.exp_cmd_sn(), 10);
}

#[tokio::test]
async fn stat_sn_strictly_increases_per_connection() {
    let h = setup(0);

    for sn in 0..4 {
        rx(&h, nodata_cmd_bhs(sn, sn, false), &[]).await;
    }

    let rsps = tx_all(&h);
    let stat_sns: Vec<u32> = rsps.iter().map(|(_, r)| r.inner().pdu.sn()).collect();
    assert_eq!(stat_sns, vec![0, 1, 2, 3]);
    assert!(rsps.iter().all(|(_, r)| r.net_refs() == 0));
}

#[tokio::test]
async fn max_cmd_sn_tracks_queue_depth() {
    let h = setup(0);
    let queued = h.sess.cfg().target.session.queued_cmnds;

    rx(&h, nodata_cmd_bhs(1, 0, false), &[]).await;
    let rsps = tx_all(&h);
    let (_, rsp) = &rsps[0];

    // By stamping time the command finished, so the full window is open.
    let inner = rsp.inner();
    assert_eq!(inner.pdu.exp_sn(), 1);
    let max_sn = u32::from_be_bytes(inner.pdu.bhs[32..36].try_into().unwrap());
    assert_eq!(max_sn, 1 + (queued - 1));
}
