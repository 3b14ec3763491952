// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The transmit pipeline: sequence-number stamping, residual
//! accounting, Data-In slicing and the per-connection write task.
//!
//! A whole PDU (header, digests, payload) is assembled into one buffer
//! and flushed with a single write, which batches the way a corked
//! socket would.

use std::sync::{Arc, atomic::Ordering};

use anyhow::{Result, bail};
use bytes::Bytes;
use tokio::{io::AsyncWriteExt, net::tcp::OwnedWriteHalf};
use tracing::{debug, error, trace};

use crate::{
    models::{
        command::{common::RawScsiStatus, response::ScsiCommandResponse},
        data::response::ScsiDataIn,
        data_format::encode_frame,
        opcode::Opcode,
    },
    target::{
        cmnd::{Cmnd, RESERVED_TAG},
        conn::Connection,
    },
};

/// Queue responses for transmission and optionally wake the write task.
pub fn cmnds_init_write(rsps: &[Arc<Cmnd>], wake: bool) {
    if rsps.is_empty() {
        return;
    }
    let conn = Arc::clone(rsps[0].conn());

    {
        let mut write_list = conn.write_list_lock();
        for rsp in rsps {
            debug_assert!(Arc::ptr_eq(rsp.conn(), &conn));
            let mut inner = rsp.inner();
            debug_assert!(!inner.on_write_list);
            inner.on_write_list = true;
            drop(inner);
            write_list.push_back(Arc::clone(rsp));
        }
    }

    // Queued responses must observe TX progress within the response
    // timeout window.
    for rsp in rsps {
        crate::target::timeout::req_add_to_write_timeout_list(rsp);
    }

    if wake {
        conn.wake_wr();
    }
}

/// Queue a single response.
pub fn cmnd_init_write(rsp: &Arc<Cmnd>, wake: bool) {
    cmnds_init_write(std::slice::from_ref(rsp), wake);
}

/// Stamp StatSN/ExpCmdSN/MaxCmdSN into a response header.
///
/// StatSN is consumed (incremented) only for status-bearing PDUs;
/// R2Ts and unsolicited NOP-Ins carry the current value without
/// advancing it.
pub fn cmnd_set_sn(cmnd: &Arc<Cmnd>, set_stat_sn: bool) {
    let conn = Arc::clone(cmnd.conn());
    let sess = conn.session();

    let sn = sess.sn_lock();
    let exp_cmd_sn = sn.exp_cmd_sn;
    let max_cmd_sn = exp_cmd_sn.wrapping_add(sess.allowed_cmds() as u32);

    let mut inner = cmnd.inner();
    if set_stat_sn {
        let stat_sn = conn.stat_sn.fetch_add(1, Ordering::AcqRel);
        inner.pdu.set_sn(stat_sn);
    } else {
        inner.pdu.set_sn(conn.stat_sn.load(Ordering::Acquire));
    }
    inner.pdu.set_exp_sn(exp_cmd_sn);
    inner.pdu.set_max_sn(max_cmd_sn);
    drop(inner);
    drop(sn);
}

/// Compute residual under/overflow for a SCSI Response.
///
/// The primary direction of a bidirectional command is the write; the
/// read side is reported through the bidi residual pair.
fn set_resid(rsp: &Arc<Cmnd>, bufflen_set: bool) {
    let Some(req) = rsp.parent().map(Arc::clone) else {
        return;
    };

    let (flags, data_length, read_size, received, resp_len) = {
        let inner = req.inner();
        let received = inner.pdu.data_len_field() - inner.r2t_len_to_receive.min(inner.pdu.data_len_field());
        (
            inner.pdu.flags_byte(),
            inner.pdu.data_len_field(),
            inner.read_size,
            received,
            if bufflen_set { inner.bufflen } else { 0 },
        )
    };
    let read = flags & 0x40 != 0;
    let write = flags & 0x20 != 0;

    let mut inner = rsp.inner();
    let hdr: &mut ScsiCommandResponse = match inner.pdu.view_mut() {
        Ok(h) => h,
        Err(_) => return,
    };

    if read && write {
        let resid = data_length as i64 - received as i64;
        if resid > 0 {
            hdr.flags.set_u_primary(true);
            hdr.residual_count.set(resid as u32);
        } else if resid < 0 {
            hdr.flags.set_o_primary(true);
            hdr.residual_count.set((-resid) as u32);
        }

        let bi_resid = read_size as i64 - resp_len as i64;
        if bi_resid > 0 {
            hdr.flags.set_u_bidi(true);
            hdr.bidirectional_read_residual_count.set(bi_resid as u32);
        } else if bi_resid < 0 {
            hdr.flags.set_o_bidi(true);
            hdr.bidirectional_read_residual_count.set((-bi_resid) as u32);
        }
    } else {
        let resid = read_size as i64 - resp_len as i64;
        if resid > 0 {
            hdr.flags.set_u_primary(true);
            hdr.residual_count.set(resid as u32);
        } else if resid < 0 {
            hdr.flags.set_o_primary(true);
            hdr.residual_count.set((-resid) as u32);
        }
    }
}

fn init_status_rsp(rsp: &Arc<Cmnd>, status: u8, sense: &[u8], bufflen_set: bool) {
    let itt_raw = {
        let parent = rsp.parent().expect("status rsp without parent");
        parent.inner().pdu.itt_raw()
    };

    {
        let mut inner = rsp.inner();
        let mut hdr = ScsiCommandResponse::default_hdr();
        hdr.status = RawScsiStatus::new_raw(status);
        hdr.initiator_task_tag = itt_raw;
        inner
            .pdu
            .bhs
            .copy_from_slice(zerocopy::IntoBytes::as_bytes(&hdr));

        if !sense.is_empty() {
            let data = Bytes::copy_from_slice(sense);
            inner.pdu.datasize = data.len() as u32;
            inner.bufflen = data.len() as u32;
            inner.resp_data = data;
        }
    }

    set_resid(rsp, bufflen_set);
}

/// Build a standalone SCSI Response for `req`.
pub fn create_status_rsp(
    req: &Arc<Cmnd>,
    status: u8,
    sense: &[u8],
    bufflen_set: bool,
) -> Arc<Cmnd> {
    let rsp = Cmnd::alloc_rsp(req);
    init_status_rsp(&rsp, status, sense, bufflen_set);
    rsp
}

/// Build a SCSI Response transmitted at request-release time, keeping
/// error replies ordered after everything the request produced.
pub fn create_prelim_status_rsp(req: &Arc<Cmnd>, status: u8, sense: &[u8]) -> Arc<Cmnd> {
    let rsp = Cmnd::alloc_main_rsp(req);
    init_status_rsp(&rsp, status, sense, false);
    rsp
}

/// Slice a read payload into Data-In PDUs of `max_xmit_data_length`.
///
/// Only the final PDU carries FINAL; with `send_status` it also carries
/// the STATUS flag and the residual accounting against the expected
/// read size.
pub fn send_data_rsp(req: &Arc<Cmnd>, status: u8, send_status: bool) {
    let sess = req.conn().session();
    let pdusize = sess.params.max_xmit_data_length;

    let (itt_raw, expsize, bufflen, data, req_flags) = {
        let inner = req.inner();
        (
            inner.pdu.itt_raw(),
            inner.read_size,
            inner.bufflen,
            inner.resp_data.clone(),
            inner.pdu.flags_byte(),
        )
    };

    let mut size = expsize.min(bufflen);
    let mut offset = 0u32;
    let mut sn = 0u32;
    let mut send = Vec::new();

    loop {
        let rsp = Cmnd::alloc_rsp(req);
        let last = size <= pdusize;

        {
            let mut inner = rsp.inner();
            let mut hdr = ScsiDataIn::default_hdr();
            hdr.initiator_task_tag = itt_raw;
            hdr.target_transfer_tag.set(RESERVED_TAG);
            hdr.buffer_offset.set(offset);
            hdr.data_sn.set(sn);

            if last {
                hdr.flags.set_fin(true);
                if send_status {
                    debug_assert_eq!(req_flags & 0x20, 0);
                    hdr.flags.set_s(true);
                    hdr.status_or_rsvd = RawScsiStatus::new_raw(status);

                    let scsisize = bufflen;
                    if scsisize < expsize {
                        hdr.flags.set_u(true);
                        hdr.residual_count.set(expsize - scsisize);
                    } else if scsisize > expsize {
                        hdr.flags.set_o(true);
                        hdr.residual_count.set(scsisize - expsize);
                    }
                }
                inner.pdu.datasize = size;
            } else {
                inner.pdu.datasize = pdusize;
            }

            inner
                .pdu
                .bhs
                .copy_from_slice(zerocopy::IntoBytes::as_bytes(&hdr));
            inner.resp_data = data.clone();
            inner.resp_offset = offset;
            inner.bufflen = bufflen;
        }

        send.push(rsp);

        if last {
            break;
        }
        size -= pdusize;
        offset += pdusize;
        sn += 1;
    }

    cmnds_init_write(&send, false);
}

/// Prepare a response for the wire: fix the length field and stamp the
/// sequence numbers appropriate for its opcode.
pub fn cmnd_tx_start(cmnd: &Arc<Cmnd>) {
    let (opcode, itt, s_bit) = {
        let mut inner = cmnd.inner();
        let datasize = inner.pdu.datasize;
        inner.pdu.set_data_len(datasize);
        (
            inner.pdu.opcode(),
            inner.pdu.itt(),
            inner.pdu.flags_byte() & 0x01 != 0,
        )
    };

    match opcode {
        Some(Opcode::NopIn) => {
            // Keepalive pings (reserved ITT) advertise StatSN without
            // consuming it.
            cmnd_set_sn(cmnd, itt != RESERVED_TAG);
        },
        Some(Opcode::ScsiCommandResp)
        | Some(Opcode::ScsiTaskMgmtResp)
        | Some(Opcode::LogoutResp)
        | Some(Opcode::AsyncMsg)
        | Some(Opcode::Reject) => {
            cmnd_set_sn(cmnd, true);
        },
        Some(Opcode::ScsiDataIn) => {
            {
                let inner = cmnd.inner();
                debug_assert!(
                    inner.resp_offset + inner.pdu.datasize
                        <= inner.resp_data.len() as u32
                );
            }
            cmnd_set_sn(cmnd, s_bit);
        },
        Some(Opcode::ReadyToTransfer) => {
            cmnd_set_sn(cmnd, false);
        },
        other => {
            error!(opcode = ?other, "unexpected cmnd op on write list");
        },
    }

    cmnd.net_ref_get();
}

/// Transmission finished: release the transport reference and apply any
/// deferred close requests.
pub fn cmnd_tx_end(cmnd: &Arc<Cmnd>) {
    let conn = Arc::clone(cmnd.conn());
    let (close_conn, close_all) = {
        let mut inner = cmnd.inner();
        inner.on_write_list = false;
        inner.write_processing_started = false;
        (inner.should_close_conn, inner.should_close_all_conn)
    };

    cmnd.net_ref_put();
    crate::target::timeout::req_del_from_write_timeout_list(cmnd);

    if close_conn {
        if close_all {
            error!("closing all connections at initiator's request");
            if let Some(target) = conn.session().target() {
                for sess in target.sessions() {
                    for c in sess.conns() {
                        c.mark_closed();
                    }
                }
            }
        } else {
            tracing::info!(
                initiator = %conn.session().initiator_name,
                "closing connection at initiator's request"
            );
            conn.mark_closed();
        }
    }
}

/// Encode a queued response into its full wire frame.
pub fn frame_cmnd(cmnd: &Arc<Cmnd>) -> Vec<u8> {
    let conn = cmnd.conn();
    let inner = cmnd.inner();
    let datasize = inner.pdu.datasize as usize;
    let start = inner.resp_offset as usize;
    let data = &inner.resp_data[start..start + datasize];
    encode_frame(&inner.pdu.bhs, &inner.pdu.ahs, data, conn.hdigest, conn.ddigest)
}

/// The write task: drain the write list onto the socket.
pub async fn write_loop(conn: &Arc<Connection>, mut w: OwnedWriteHalf) -> Result<()> {
    loop {
        let next = {
            let mut write_list = conn.write_list_lock();
            let head = write_list.pop_front();
            if let Some(rsp) = head.as_ref() {
                rsp.inner().write_processing_started = true;
            }
            head
        };

        let Some(rsp) = next else {
            if conn.is_closing() {
                bail!("connection closing");
            }
            tokio::select! {
                _ = conn.cancelled().cancelled() => bail!("connection closing"),
                _ = conn.wait_wr() => continue,
            }
        };

        cmnd_tx_start(&rsp);
        let frame = frame_cmnd(&rsp);
        trace!(len = frame.len(), rsp = ?rsp, "tx frame");

        let res = tokio::select! {
            _ = conn.cancelled().cancelled() => Err(anyhow::anyhow!("connection closing")),
            r = w.write_all(&frame) => r.map_err(|e| anyhow::anyhow!("socket write failed: {e}")),
        };

        if let Err(e) = res {
            debug!("tx error: {e}");
            rsp.net_ref_put();
            {
                let mut inner = rsp.inner();
                inner.on_write_list = false;
                inner.write_processing_started = false;
            }
            conn.mark_closed();
            return Err(e);
        }

        cmnd_tx_end(&rsp);
        drop(rsp);
    }
}
