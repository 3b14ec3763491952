// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;
use iscsi_target_rs::target::rx::rx_pdu;

use crate::unit_tests::support::{data_out_bhs, rx, scsi_cmd_bhs, setup};

/// An open-ended write: unsolicited data still expected.
fn open_write(itt: u32, cmd_sn: u32, xfer_len: u32) -> [u8; 48] {
    scsi_cmd_bhs(itt, cmd_sn, 0, xfer_len, 0, true, false, false, false)
}

#[tokio::test]
async fn duplicate_itt_closes_the_connection() {
    let h = setup(1);

    rx(&h, open_write(0x77, 1, 4096), &[]).await;
    assert_eq!(h.sess.data_wait_entries(), 1);
    assert!(!h.conn.is_closing());

    // A second task with the same ITT could misroute Data-Out payloads;
    // the connection must not survive it.
    let res = rx_pdu(
        &h.conn,
        open_write(0x77, 2, 4096),
        Bytes::new(),
        Bytes::new(),
    )
    .await;

    assert!(res.is_err());
    assert!(h.conn.is_closing());
}

#[tokio::test]
async fn reserved_itt_write_closes_the_connection() {
    let h = setup(1);

    let res = rx_pdu(
        &h.conn,
        open_write(0xffff_ffff, 1, 4096),
        Bytes::new(),
        Bytes::new(),
    )
    .await;

    assert!(res.is_err());
    assert!(h.conn.is_closing());
}

#[tokio::test]
async fn hash_entry_is_gone_after_transfer_completes() {
    let h = setup(1);

    rx(&h, open_write(0x78, 1, 1024), &[]).await;
    assert_eq!(h.sess.data_wait_entries(), 1);

    let payload = vec![0x11u8; 1024];
    rx(
        &h,
        data_out_bhs(0x78, 0xffff_ffff, 0, 1024, 0, true),
        &payload,
    )
    .await;

    assert_eq!(h.sess.data_wait_entries(), 0);
    assert_eq!(*h.backend.rx_order.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn unknown_itt_data_out_is_quietly_discarded() {
    let h = setup(1);

    let payload = vec![0x22u8; 512];
    rx(
        &h,
        data_out_bhs(0xdead, 0xffff_ffff, 0, 512, 0, true),
        &payload,
    )
    .await;

    assert!(!h.conn.is_closing());
    assert_eq!(h.conn.queued_rsps(), 0);
    assert!(h.backend.rx_order.lock().unwrap().is_empty());
}
