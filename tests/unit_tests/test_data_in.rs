// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;
use iscsi_target_rs::{
    cfg::config::Config,
    models::{
        command::common::ScsiStatus, data::response::ScsiDataIn, opcode::Opcode,
    },
};

use crate::unit_tests::support::{scsi_cmd_bhs, rx, setup, setup_with, tx_all};

fn read_cmd(itt: u32, cmd_sn: u32, xfer_len: u32) -> [u8; 48] {
    scsi_cmd_bhs(itt, cmd_sn, 0, xfer_len, 0, false, true, true, false)
}

#[tokio::test]
async fn read_payload_slices_into_max_xmit_pdus() {
    const L: u32 = 8192;
    const K: u32 = 3;
    const R: u32 = 100;
    const TOTAL: u32 = K * L + R;

    let mut cfg = Config::default();
    cfg.target.session.max_xmit_data_segment_length = L;
    let h = setup_with(cfg, 1);

    *h.backend.read_payload.lock().unwrap() =
        Bytes::from((0..TOTAL).map(|i| (i % 256) as u8).collect::<Vec<u8>>());

    rx(&h, read_cmd(0x42, 1, TOTAL), &[]).await;

    let rsps = tx_all(&h);
    assert_eq!(rsps.len(), (K + 1) as usize);
    assert!(rsps.iter().all(|(op, _)| *op == Opcode::ScsiDataIn));

    for (i, (_, rsp)) in rsps.iter().enumerate() {
        let inner = rsp.inner();
        let hdr: &ScsiDataIn = inner.pdu.view().unwrap();
        assert_eq!(hdr.data_sn.get(), i as u32);
        assert_eq!(hdr.buffer_offset.get(), i as u32 * L);

        if i < K as usize {
            assert_eq!(inner.pdu.datasize, L);
            assert!(!hdr.flags.fin());
            assert!(!hdr.flags.s());
        } else {
            assert_eq!(inner.pdu.datasize, R);
            assert!(hdr.flags.fin());
            assert!(hdr.flags.s());
            assert_eq!(hdr.scsi_status(), Some(ScsiStatus::Good));
            assert!(!hdr.flags.u() && !hdr.flags.o());
            assert_eq!(hdr.residual_count.get(), 0);
        }
    }

    // Only the status-bearing final PDU consumed a StatSN.
    let stat_sns: Vec<u32> = rsps.iter().map(|(_, r)| r.inner().pdu.sn()).collect();
    assert_eq!(stat_sns, vec![0, 0, 0, 0]);
    let final_hdr = rsps[3].1.inner();
    assert_eq!(final_hdr.pdu.sn(), 0);
}

#[tokio::test]
async fn short_read_reports_residual_underflow() {
    let h = setup(1);

    // 512 expected, device returns 500: underflow of 12 riding on the
    // status-bearing final Data-In.
    *h.backend.read_payload.lock().unwrap() = Bytes::from(vec![0u8; 500]);
    *h.backend.status.lock().unwrap() = 0x02; // CHECK CONDITION, no sense

    rx(&h, read_cmd(0x43, 1, 512), &[]).await;

    let rsps = tx_all(&h);
    assert_eq!(rsps.len(), 1);
    let inner = rsps[0].1.inner();
    let hdr: &ScsiDataIn = inner.pdu.view().unwrap();

    assert!(hdr.flags.fin());
    assert!(hdr.flags.s());
    assert_eq!(hdr.scsi_status(), Some(ScsiStatus::CheckCondition));
    assert!(hdr.flags.u());
    assert_eq!(hdr.residual_count.get(), 12);
    assert_eq!(inner.pdu.datasize, 500);
}

#[tokio::test]
async fn long_read_reports_residual_overflow() {
    let h = setup(1);

    *h.backend.read_payload.lock().unwrap() = Bytes::from(vec![0u8; 700]);

    rx(&h, read_cmd(0x44, 1, 512), &[]).await;

    let rsps = tx_all(&h);
    assert_eq!(rsps.len(), 1);
    let inner = rsps[0].1.inner();
    let hdr: &ScsiDataIn = inner.pdu.view().unwrap();

    // Only the expected 512 bytes travel; 188 are overflow.
    assert_eq!(inner.pdu.datasize, 512);
    assert!(hdr.flags.o());
    assert_eq!(hdr.residual_count.get(), 188);
}

#[tokio::test]
async fn sense_bearing_error_uses_standalone_response() {
    let h = setup(1);
    h.backend.defer_exec.store(true, std::sync::atomic::Ordering::Release);

    rx(&h, read_cmd(0x45, 1, 512), &[]).await;

    // The mid-layer fails the command with sense attached.
    let cmd = h.backend.deferred.lock().unwrap().pop().unwrap();
    cmd.set_error((0x05, 0x20, 0x00));
    iscsi_target_rs::target::backend::xmit_response(&cmd);

    let rsps = tx_all(&h);
    assert_eq!(rsps.len(), 1);
    assert_eq!(rsps[0].0, Opcode::ScsiCommandResp);

    let inner = rsps[0].1.inner();
    // Sense data rides length-prefixed in the data segment.
    assert_eq!(inner.resp_data[2] & 0x7f, 0x70);
    assert_eq!(inner.resp_data[2 + 12], 0x20);
}

#[tokio::test]
async fn bidi_read_leg_travels_before_standalone_status() {
    use iscsi_target_rs::models::{
        ahs::encode_bidi_read_length, command::response::ScsiCommandResponse,
    };

    use crate::unit_tests::support::rx_with_ahs;

    let h = setup(1);
    *h.backend.read_payload.lock().unwrap() = Bytes::from(vec![0x5au8; 256]);

    // Write leg fully immediate (512 bytes), read leg of 256 announced
    // through the bidi AHS.
    let bhs = scsi_cmd_bhs(0x46, 1, 0, 512, 512, true, true, true, false);
    let ahs = encode_bidi_read_length(256);
    let payload = vec![0x33u8; 512];
    rx_with_ahs(&h, bhs, &ahs, &payload).await;

    let rsps = tx_all(&h);
    assert_eq!(rsps.len(), 2);

    // The read leg first, without piggybacked status.
    assert_eq!(rsps[0].0, Opcode::ScsiDataIn);
    {
        let inner = rsps[0].1.inner();
        let hdr: &ScsiDataIn = inner.pdu.view().unwrap();
        assert!(hdr.flags.fin());
        assert!(!hdr.flags.s());
        assert_eq!(inner.pdu.datasize, 256);
    }

    // Then the SCSI Response; both directions transferred fully.
    assert_eq!(rsps[1].0, Opcode::ScsiCommandResp);
    {
        let inner = rsps[1].1.inner();
        let hdr: &ScsiCommandResponse = inner.pdu.view().unwrap();
        assert_eq!(hdr.residual_count.get(), 0);
        assert_eq!(hdr.bidirectional_read_residual_count.get(), 0);
    }

    assert_eq!(h.backend.restarted.lock().unwrap()[0].write_data().len(), 512);
}
