// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::atomic::Ordering;

use iscsi_target_rs::models::{
    opcode::Opcode,
    task_mgmt::{
        common::{TmFunction, TmResponseCode},
        response::TaskMgmtResponse,
    },
};

use crate::unit_tests::support::{
    Harness, nodata_cmd_bhs, rx, setup, tm_bhs, tx_all,
};

const RESERVED: u32 = 0xffff_ffff;

fn tm_responses(h: &Harness) -> Vec<(u32, TmResponseCode)> {
    tx_all(h)
        .into_iter()
        .filter(|(op, _)| *op == Opcode::ScsiTaskMgmtResp)
        .map(|(_, rsp)| {
            let inner = rsp.inner();
            let hdr: &TaskMgmtResponse = inner.pdu.view().unwrap();
            (inner.pdu.itt(), hdr.response.decode())
        })
        .collect()
}

#[tokio::test]
async fn abort_task_inside_window_completes() {
    let h = setup(200);

    // RTT unknown, but RefCmdSN=180 is inside [CmdSN-128, CmdSN): the
    // CmdSN was consumed, so the function completes.
    rx(
        &h,
        tm_bhs(TmFunction::AbortTask, 5, 0xdead, 200, 180, 0, false),
        &[],
    )
    .await;

    assert_eq!(h.backend.mgmt_calls.lock().unwrap().len(), 1);
    assert_eq!(
        tm_responses(&h),
        vec![(5, TmResponseCode::FunctionComplete)]
    );
}

#[tokio::test]
async fn abort_task_outside_window_is_unknown() {
    let h = setup(200);

    rx(
        &h,
        tm_bhs(TmFunction::AbortTask, 6, 0xdead, 200, 50, 0, false),
        &[],
    )
    .await;

    assert!(h.backend.mgmt_calls.lock().unwrap().is_empty());
    assert_eq!(tm_responses(&h), vec![(6, TmResponseCode::UnknownTask)]);
}

#[tokio::test]
async fn task_reassign_is_unsupported() {
    let h = setup(1);

    rx(
        &h,
        tm_bhs(TmFunction::TaskReassign, 7, RESERVED, 1, 0, 0, false),
        &[],
    )
    .await;

    assert_eq!(
        tm_responses(&h),
        vec![(7, TmResponseCode::ReassignmentUnsupported)]
    );
}

#[tokio::test]
async fn abort_task_drops_response_of_target_command() {
    let h = setup(10);
    h.backend.defer_exec.store(true, Ordering::Release);

    // A command sits at the mid-layer when the abort arrives.
    rx(&h, nodata_cmd_bhs(1, 10, false), &[]).await;
    assert_eq!(h.backend.deferred.lock().unwrap().len(), 1);

    h.backend.defer_exec.store(false, Ordering::Release);
    rx(&h, tm_bhs(TmFunction::AbortTask, 2, 1, 11, 10, 0, false), &[]).await;

    // The mid-layer finishes the command afterwards; its response is
    // dropped, only the TM response leaves the connection.
    h.backend.flush_deferred();

    let rsps = tx_all(&h);
    assert_eq!(rsps.len(), 1);
    assert_eq!(rsps[0].0, Opcode::ScsiTaskMgmtResp);
    assert_eq!(*h.backend.done_tags.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn tm_response_waits_for_preceding_cmds() {
    let h = setup(50);

    // TM arrives (immediate) before CmdSN 50..54 do.
    rx(
        &h,
        tm_bhs(TmFunction::AbortTaskSet, 100, RESERVED, 55, 0, 0, true),
        &[],
    )
    .await;
    assert!(tm_responses(&h).is_empty(), "TM response must be withheld");

    // 50..53 are sequenced below the TM's CmdSN and get aborted.
    for sn in 50..54 {
        rx(&h, nodata_cmd_bhs(sn, sn, false), &[]).await;
        assert!(
            tm_responses(&h).is_empty(),
            "still gated at ExpCmdSN {}",
            h.sess.exp_cmd_sn()
        );
    }
    assert!(h.backend.rx_order.lock().unwrap().is_empty());

    // 54 completes the gap: ExpCmdSN reaches 55, the response leaves.
    rx(&h, nodata_cmd_bhs(54, 54, false), &[]).await;
    assert_eq!(h.sess.exp_cmd_sn(), 55);

    let rsps = tx_all(&h);
    assert!(
        rsps.iter()
            .any(|(op, _)| *op == Opcode::ScsiTaskMgmtResp)
    );
}

#[tokio::test]
async fn second_tm_replaces_pending_response() {
    let h = setup(50);

    rx(
        &h,
        tm_bhs(TmFunction::AbortTaskSet, 100, RESERVED, 55, 0, 0, true),
        &[],
    )
    .await;
    rx(
        &h,
        tm_bhs(TmFunction::AbortTaskSet, 101, RESERVED, 55, 0, 0, true),
        &[],
    )
    .await;

    for sn in 50..55 {
        rx(&h, nodata_cmd_bhs(sn, sn, false), &[]).await;
    }

    let responses = tm_responses(&h);
    assert_eq!(responses.len(), 1, "the first pending TM response is dropped");
    assert_eq!(responses[0].0, 101);
}
