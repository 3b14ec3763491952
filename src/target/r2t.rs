// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use tracing::trace;
use zerocopy::IntoBytes;

use crate::{
    models::ready_2_transfer::response::ReadyToTransfer,
    target::{
        cmnd::{Cmnd, req_cmnd_release_force},
        timeout::req_add_to_write_timeout_list,
        tx,
    },
};

/// Solicit outstanding write data with R2T PDUs.
///
/// Runs only on the read task, so there is no race with Data-Out
/// handling or connection abort. Emits bursts of `max_burst_length`
/// until either everything is solicited or `max_outstanding_r2t` is
/// reached; the FINAL bit of a Data-Out burst frees a slot and brings
/// us back here.
pub fn send_r2t(req: &Arc<Cmnd>) {
    let sess = req.conn().session();
    let max_outstanding = sess.params.max_outstanding_r2t;
    let burst = sess.params.max_burst_length;

    let mut send = Vec::new();
    {
        let mut inner = req.inner();
        debug_assert!(inner.r2t_len_to_send != 0);
        debug_assert!(inner.outstanding_r2t <= max_outstanding);

        if inner.outstanding_r2t == max_outstanding {
            return;
        }

        let data_length = inner.pdu.data_len_field();
        let lun = inner.pdu.lun();
        let itt = inner.pdu.itt();
        let ttt = inner.target_task_tag;
        let mut offset = data_length - inner.r2t_len_to_send;

        loop {
            let r2t_sn = inner.r2t_sn;
            inner.r2t_sn += 1;

            let desired = inner.r2t_len_to_send.min(burst);
            inner.r2t_len_to_send -= desired;

            let mut hdr = ReadyToTransfer::default_hdr();
            hdr.lun.set(lun);
            hdr.initiator_task_tag = itt;
            hdr.target_transfer_tag.set(ttt);
            hdr.r2t_sn.set(r2t_sn);
            hdr.buffer_offset.set(offset);
            hdr.desired_data_transfer_length.set(desired);

            trace!(
                itt = format_args!("{itt:#x}"),
                offset,
                desired,
                r2t_sn,
                outstanding = inner.outstanding_r2t,
                "issuing R2T"
            );

            offset += desired;
            inner.outstanding_r2t += 1;

            send.push(hdr);

            if inner.outstanding_r2t >= max_outstanding || inner.r2t_len_to_send == 0
            {
                break;
            }
        }
    }

    let mut rsps = Vec::with_capacity(send.len());
    for hdr in send {
        let rsp = Cmnd::alloc_rsp(req);
        {
            let mut inner = rsp.inner();
            inner.pdu.bhs.copy_from_slice(hdr.as_bytes());
            inner.pdu.datasize = 0;
        }
        rsps.push(rsp);
    }
    tx::cmnds_init_write(&rsps, true);
}

/// Pretend a preliminary-completed write still wants its data: park the
/// request on the data-wait hash expecting a token byte so the initiator
/// can finish the transfer into the sink. Corrected on Data-Out receipt.
pub fn set_prelim_r2t_len_to_receive(
    req: &Arc<Cmnd>,
) -> Result<(), crate::target::rx::RxError> {
    if req.inner().pdu.fin() {
        return Ok(());
    }

    req.conn().session().insert_data_wait_hash(req).map_err(|e| {
        // A duplicate ITT here risks misrouting Data-Out payloads into
        // another command; the connection cannot continue.
        crate::target::conn::mark_conn_closed(req.conn());
        e
    })?;

    let mut inner = req.inner();
    if inner.outstanding_r2t == 0 {
        inner.outstanding_r2t = 1;
        drop(inner);
        req_add_to_write_timeout_list(req);
        inner = req.inner();
    }
    inner.r2t_len_to_receive = 1;
    inner.r2t_len_to_send = 0;
    Ok(())
}

/// Give up on a command still waiting for Data-Out: zero the R2T
/// accounting and force-release so the mid-layer is not left waiting for
/// data that will never arrive.
pub fn fail_data_waiting_cmnd(cmnd: &Arc<Cmnd>) {
    tracing::debug!(cmnd = ?cmnd, "failing data-waiting cmnd");

    {
        let mut inner = cmnd.inner();
        inner.r2t_len_to_receive = 0;
        inner.r2t_len_to_send = 0;
    }

    req_cmnd_release_force(cmnd);
}
