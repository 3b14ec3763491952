// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use iscsi_target_rs::{
    cfg::{config::Config, enums::YesNo},
    models::{opcode::Opcode, ready_2_transfer::response::ReadyToTransfer},
};

use crate::unit_tests::support::{
    Harness, data_out_bhs, rx, scsi_cmd_bhs, setup_with, tx_all,
};

fn r2t_harness() -> Harness {
    let mut cfg = Config::default();
    cfg.target.session.max_burst_length = 8192;
    cfg.target.session.first_burst_length = 8192;
    cfg.target.session.max_outstanding_r2t = 2;
    cfg.target.session.initial_r2t = YesNo::Yes;
    setup_with(cfg, 1)
}

fn collect_r2ts(h: &Harness) -> Vec<(u32, u32, u32, u32)> {
    tx_all(h)
        .into_iter()
        .filter(|(op, _)| *op == Opcode::ReadyToTransfer)
        .map(|(_, rsp)| {
            let inner = rsp.inner();
            let hdr: &ReadyToTransfer = inner.pdu.view().unwrap();
            (
                hdr.buffer_offset.get(),
                hdr.desired_data_transfer_length.get(),
                hdr.r2t_sn.get(),
                hdr.target_transfer_tag.get(),
            )
        })
        .collect()
}

#[tokio::test]
async fn burst_slicing_respects_window_and_order() {
    let h = r2t_harness();
    const LEN: u32 = 65536;
    const BURST: u32 = 8192;

    rx(
        &h,
        scsi_cmd_bhs(0x10, 1, 0, LEN, 0, true, false, true, false),
        &[],
    )
    .await;

    // InitialR2T=Yes: the whole transfer is solicited, two slots open.
    let first = collect_r2ts(&h);
    assert_eq!(
        first,
        vec![(0, BURST, 0, first[0].3), (BURST, BURST, 1, first[0].3)]
    );
    let ttt = first[0].3;

    let mut all = first;
    let payload: Vec<u8> = (0..BURST).map(|i| (i % 251) as u8).collect();

    // Answer the oldest un-answered R2T; each FINAL frees one slot and
    // solicits exactly one more burst until all eight are out.
    let mut next_burst = 0u32;
    while all.len() < (LEN / BURST) as usize {
        rx(
            &h,
            data_out_bhs(0x10, ttt, next_burst * BURST, BURST, 0, true),
            &payload,
        )
        .await;
        next_burst += 1;

        let fresh = collect_r2ts(&h);
        assert_eq!(fresh.len(), 1, "one slot frees per FINAL Data-Out");
        all.extend(fresh);
    }

    // Eight R2Ts total, strictly increasing R2TSN and offsets.
    assert_eq!(all.len(), 8);
    for (i, (offset, len, r2t_sn, _)) in all.iter().enumerate() {
        assert_eq!(*r2t_sn, i as u32);
        assert_eq!(*offset, i as u32 * BURST);
        assert_eq!(*len, BURST);
    }

    // Finish the still-outstanding bursts.
    for i in next_burst..(LEN / BURST) {
        rx(
            &h,
            data_out_bhs(0x10, ttt, i * BURST, BURST, 0, true),
            &payload,
        )
        .await;
    }

    assert_eq!(*h.backend.rx_order.lock().unwrap(), vec![1]);
    assert_eq!(h.sess.data_wait_entries(), 0);

    let data = h.backend.restarted.lock().unwrap()[0].write_data();
    assert_eq!(data.len(), LEN as usize);
    assert!(data.chunks(BURST as usize).all(|c| c == &payload[..]));
}

#[tokio::test]
async fn unsolicited_first_burst_reduces_solicitation() {
    let mut cfg = Config::default();
    cfg.target.session.max_burst_length = 8192;
    cfg.target.session.first_burst_length = 4096;
    cfg.target.session.max_outstanding_r2t = 1;
    let h = setup_with(cfg, 1);

    // 2048 bytes immediate, FINAL clear: 2048 more unsolicited may come.
    let payload = vec![0xabu8; 2048];
    rx(
        &h,
        scsi_cmd_bhs(0x20, 1, 0, 12288, 2048, true, false, false, false),
        &payload,
    )
    .await;

    // Nothing solicited yet: the unsolicited slot is still open.
    assert_eq!(collect_r2ts(&h).len(), 0);

    // The unsolicited remainder arrives with FINAL: now R2Ts may flow
    // for the rest (12288 - 4096 = 8192, one burst).
    let rest = vec![0xcdu8; 2048];
    rx(&h, data_out_bhs(0x20, 0xffff_ffff, 2048, 2048, 0, true), &rest).await;

    let r2ts = collect_r2ts(&h);
    assert_eq!(r2ts.len(), 1);
    assert_eq!((r2ts[0].0, r2ts[0].1, r2ts[0].2), (4096, 8192, 0));
}

#[tokio::test]
async fn write_larger_than_burst_finishes_exactly() {
    let h = r2t_harness();
    const LEN: u32 = 20480; // 2.5 bursts

    rx(
        &h,
        scsi_cmd_bhs(0x30, 1, 0, LEN, 0, true, false, true, false),
        &[],
    )
    .await;

    let mut all = collect_r2ts(&h);
    let ttt = all[0].3;
    let mut cursor = 0usize;
    while cursor < all.len() {
        let (offset, len, _, _) = all[cursor];
        cursor += 1;
        let chunk = vec![0x55u8; len as usize];
        rx(&h, data_out_bhs(0x30, ttt, offset, len, 0, true), &chunk).await;
        all.extend(collect_r2ts(&h));
    }

    let lens: u32 = all.iter().map(|r| r.1).sum();
    assert_eq!(lens, LEN);
    assert_eq!(all.len(), LEN.div_ceil(8192) as usize);
    assert_eq!(*h.backend.rx_order.lock().unwrap(), vec![1]);
}
