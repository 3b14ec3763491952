// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The receive pipeline: frame PDUs off the socket, classify by opcode,
//! sequence commands by CmdSN and hand them to execution.
//!
//! All functions here run on a connection's single read task. That
//! serialization is the core simplifying invariant: SN state, the
//! data-wait hash and per-command RX state have exactly one writer.

use std::sync::Arc;

use anyhow::{Result, bail};
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::{io::AsyncReadExt, net::tcp::OwnedReadHalf};
use tracing::{debug, error, warn};

use crate::{
    models::{
        ahs,
        command::request::ScsiCommandRequest,
        common::HEADER_LEN,
        logout::response::LogoutResponse,
        nop::response::NopInResponse,
        opcode::Opcode,
        reject::response::{RejectPdu, RejectReason},
    },
    target::{
        backend::{PreprocessStatus, ScsiDataDirection, sam_status},
        cmnd::{
            Cmnd, CmndState, PrelimFlags, RESERVED_TAG, req_cmnd_release,
            req_cmnd_release_force,
        },
        conn::{Connection, mark_conn_closed},
        r2t,
        session::sn_before,
        task_mgmt,
        timeout::{req_add_to_write_timeout_list, req_del_from_write_timeout_list},
        tx,
    },
};

/// Negative outcomes of PDU classification. Most become REJECT PDUs;
/// the fatal variants short-circuit to connection close.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RxError {
    #[error("protocol error")]
    ProtocolError,
    #[error("task with this ITT already in progress")]
    TaskInProgress,
    #[error("unsupported command")]
    UnsupportedCommand,
    #[error("out of resources")]
    OutOfResources,
    #[error("data digest mismatch")]
    DataDigestError,
    #[error("connection is unusable")]
    ConnectionFailed,
}

impl RxError {
    pub fn reject_reason(self) -> RejectReason {
        match self {
            RxError::ProtocolError | RxError::ConnectionFailed => {
                RejectReason::ProtocolError
            },
            RxError::TaskInProgress => RejectReason::TaskInProgress,
            RxError::UnsupportedCommand => RejectReason::CommandNotSupported,
            RxError::OutOfResources => RejectReason::LongOpReject,
            RxError::DataDigestError => RejectReason::DataDigestError,
        }
    }
}

async fn read_exact_or_cancel(
    conn: &Arc<Connection>,
    r: &mut OwnedReadHalf,
    buf: &mut [u8],
) -> Result<()> {
    tokio::select! {
        _ = conn.cancelled().cancelled() => bail!("connection closed"),
        res = r.read_exact(buf) => {
            res.map(|_| ()).map_err(|e| anyhow::anyhow!("socket read failed: {e}"))
        },
    }
}

/// The read task: frame and process PDUs until the peer goes away or a
/// protocol violation closes the connection.
pub async fn read_loop(conn: &Arc<Connection>, mut r: OwnedReadHalf) -> Result<()> {
    loop {
        if conn.is_closing() {
            bail!("connection closing");
        }

        let cmnd = Cmnd::alloc(conn, None);

        {
            let mut bhs = [0u8; HEADER_LEN];
            read_exact_or_cancel(conn, &mut r, &mut bhs).await?;
            cmnd.inner().pdu.bhs = bhs;
        }

        let (ahs_len, data_len) = {
            let inner = cmnd.inner();
            (inner.pdu.ahs_len(), inner.pdu.data_len())
        };

        if ahs_len > 0 {
            let mut raw = vec![0u8; (ahs_len + 3) & !3usize];
            read_exact_or_cancel(conn, &mut r, &mut raw).await?;
            raw.truncate(ahs_len);
            cmnd.inner().pdu.ahs = Bytes::from(raw);
        }

        if conn.hdigest {
            let mut wire = [0u8; 4];
            read_exact_or_cancel(conn, &mut r, &mut wire).await?;
            let (bhs, ahs_bytes) = {
                let inner = cmnd.inner();
                (inner.pdu.bhs, inner.pdu.ahs.clone())
            };
            if let Err(e) = crate::digest::digest_rx_header(
                &bhs,
                &ahs_bytes,
                u32::from_be_bytes(wire),
            ) {
                error!("header digest failure: {e}");
                mark_conn_closed(conn);
                bail!("header digest failure");
            }
        }

        cmnd.inner().pdu.datasize = data_len as u32;

        let started = cmnd_rx_start(&cmnd).await;

        let payload = if data_len > 0 {
            let padded = (data_len + 3) & !3usize;
            let mut raw = vec![0u8; padded];
            read_exact_or_cancel(conn, &mut r, &mut raw).await?;
            raw.truncate(data_len);
            Bytes::from(raw)
        } else {
            Bytes::new()
        };

        if conn.ddigest && data_len > 0 {
            let mut wire = [0u8; 4];
            read_exact_or_cancel(conn, &mut r, &mut wire).await?;
            cmnd.inner().wire_ddigest = Some(u32::from_be_bytes(wire));
        }

        match started {
            Ok(()) => {
                deliver_payload(&cmnd, payload)?;
                cmnd_rx_end(cmnd);
            },
            Err(RxError::ConnectionFailed) => {
                // The classifier already closed the connection; the
                // command was never published anywhere.
                req_cmnd_release_force(&cmnd);
                bail!("fatal protocol error");
            },
            Err(reason) => {
                // A REJECT was queued as main_rsp; the payload went to
                // the sink. Finish the PDU normally so ordering holds.
                debug!("PDU rejected: {reason}");
                cmnd_rx_end(cmnd);
            },
        }

        if conn.is_closing() {
            bail!("connection closing");
        }
    }
}

/// Process one already-framed PDU exactly as the read task would.
/// Entry point for in-process transports and test drivers.
pub async fn rx_pdu(
    conn: &Arc<Connection>,
    bhs: [u8; HEADER_LEN],
    ahs: Bytes,
    payload: Bytes,
) -> Result<()> {
    let cmnd = Cmnd::alloc(conn, None);
    {
        let mut inner = cmnd.inner();
        inner.pdu.bhs = bhs;
        inner.pdu.ahs = ahs;
        let datasize = inner.pdu.data_len() as u32;
        inner.pdu.datasize = datasize;
    }

    match cmnd_rx_start(&cmnd).await {
        Ok(()) => {
            deliver_payload(&cmnd, payload)?;
            cmnd_rx_end(cmnd);
            Ok(())
        },
        Err(RxError::ConnectionFailed) => {
            req_cmnd_release_force(&cmnd);
            bail!("fatal protocol error");
        },
        Err(reason) => {
            debug!("PDU rejected: {reason}");
            cmnd_rx_end(cmnd);
            Ok(())
        },
    }
}

/// Classify the PDU, run per-opcode admission checks and prepare the
/// destination of its data segment. Runs before the payload is read.
pub async fn cmnd_rx_start(cmnd: &Arc<Cmnd>) -> Result<(), RxError> {
    check_segment_length(cmnd)?;

    let opcode = cmnd.opcode();
    let res = match opcode {
        Some(Opcode::ScsiCommandReq) => {
            let res = scsi_cmnd_start(cmnd).await;
            if res.is_ok() {
                check_cmd_sn_update_stat_sn(cmnd)
            } else {
                res
            }
        },
        Some(Opcode::ScsiDataOut) => return data_out_start(cmnd),
        Some(Opcode::NopOut) => nop_out_start(cmnd),
        Some(Opcode::ScsiTaskMgmtReq) | Some(Opcode::LogoutReq) => {
            check_cmd_sn_update_stat_sn(cmnd)
        },
        _ => Err(RxError::UnsupportedCommand),
    };

    if let Err(err) = res {
        if err == RxError::ConnectionFailed {
            return Err(err);
        }
        error!(
            opcode = ?opcode,
            itt = format_args!("{:#x}", cmnd.itt()),
            "rx error: {err}"
        );
        create_reject_rsp(cmnd, err.reject_reason());
        return Err(err);
    }

    Ok(())
}

/// Copy the received data segment to wherever classification decided it
/// belongs; everything else is the discard sink (drop).
fn deliver_payload(cmnd: &Arc<Cmnd>, payload: Bytes) -> Result<()> {
    if payload.is_empty() {
        return Ok(());
    }

    let opcode = cmnd.opcode();
    let wire_ddigest = cmnd.inner().wire_ddigest;

    // Data-Out digests are deferred until pre_exec; everything else is
    // verified here, while the offending PDU is still identifiable.
    if opcode != Some(Opcode::ScsiDataOut)
        && let Some(wire) = wire_ddigest
        && let Err(e) = crate::digest::digest_rx_data(&payload, wire)
    {
        warn!("rx data digest failed: {e}");
        if opcode == Some(Opcode::ScsiCommandReq) {
            set_preliminary_status_rsp(
                cmnd,
                crate::models::data::sense_data::target_sense::CRC_ERROR,
            );
        } else {
            create_reject_rsp(cmnd, RejectReason::DataDigestError);
        }
        return Ok(());
    }

    match opcode {
        Some(Opcode::ScsiDataOut) => {
            let (target, offset, keep_copy) = {
                let inner = cmnd.inner();
                let keep = inner.wire_ddigest.is_some();
                (inner.cmd_req.clone(), inner.pdu.buffer_offset(), keep)
            };
            if keep_copy {
                cmnd.inner().buf = BytesMut::from(&payload[..]);
            }
            if let Some(req) = target {
                let prelim = req.inner().prelim != PrelimFlags::empty();
                if !prelim {
                    scatter_into(&req, offset, &payload);
                }
            }
        },
        Some(Opcode::ScsiCommandReq) => {
            let prelim = cmnd.inner().prelim != PrelimFlags::empty();
            if !prelim {
                scatter_into(cmnd, 0, &payload);
            }
        },
        Some(Opcode::NopOut) => {
            if cmnd.itt() != RESERVED_TAG {
                cmnd.inner().buf = BytesMut::from(&payload[..]);
            }
        },
        _ => {},
    }
    Ok(())
}

/// Write `payload` into the request's assembled write buffer at
/// `offset`. Bytes past `bufflen` are residual overflow and land in the
/// sink (dropped after being received).
fn scatter_into(req: &Arc<Cmnd>, offset: u32, payload: &[u8]) {
    let mut inner = req.inner();
    let bufflen = inner.bufflen as usize;
    let offset = offset as usize;

    if offset >= bufflen {
        debug!(offset, bufflen, "residual overflow, discarding payload");
        return;
    }
    let n = payload.len().min(bufflen - offset);
    if inner.buf.len() < bufflen {
        inner.buf.resize(bufflen, 0);
    }
    inner.buf[offset..offset + n].copy_from_slice(&payload[..n]);
    if n < payload.len() {
        debug!(
            dropped = payload.len() - n,
            "payload tail beyond buffer, discarding"
        );
    }
}

/// Finish a received PDU: sequence it for execution or, for Data-Out,
/// account the transfer.
pub fn cmnd_rx_end(cmnd: Arc<Cmnd>) {
    match cmnd.opcode() {
        Some(Opcode::ScsiCommandReq)
        | Some(Opcode::NopOut)
        | Some(Opcode::ScsiTaskMgmtReq)
        | Some(Opcode::LogoutReq) => push_cmnd(cmnd),
        Some(Opcode::ScsiDataOut) => {
            data_out_end(&cmnd);
            req_cmnd_release(&cmnd);
        },
        _ => {
            // Rejected or unknown; the REJECT goes out on release.
            req_cmnd_release(&cmnd);
        },
    }
}

fn check_segment_length(cmnd: &Arc<Cmnd>) -> Result<(), RxError> {
    let conn = cmnd.conn();
    let max = conn.session().params.max_recv_data_length;
    let datasize = cmnd.inner().pdu.datasize;
    if datasize > max {
        error!(
            initiator = %conn.session().initiator_name,
            datasize,
            max_recv_data_length = max,
            "data segment length violates negotiated parameters"
        );
        mark_conn_closed(conn);
        return Err(RxError::ConnectionFailed);
    }
    Ok(())
}

/// ExpStatSN acknowledgment: accept only a forward move that does not
/// pass the StatSN we have produced.
pub(crate) fn update_stat_sn(cmnd: &Arc<Cmnd>) {
    use std::sync::atomic::Ordering;

    let conn = cmnd.conn();
    let exp_stat_sn = cmnd.inner().pdu.exp_sn();
    let _sn = conn.session().sn_lock();
    let cur_exp = conn.exp_stat_sn.load(Ordering::Acquire);
    let stat_sn = conn.stat_sn.load(Ordering::Acquire);
    if sn_before(cur_exp, exp_stat_sn) && !sn_before(stat_sn, exp_stat_sn) {
        conn.exp_stat_sn.store(exp_stat_sn, Ordering::Release);
    }
}

/// CmdSN admission: anything before ExpCmdSN is a sequence error.
fn check_cmd_sn_update_stat_sn(cmnd: &Arc<Cmnd>) -> Result<(), RxError> {
    update_stat_sn(cmnd);
    let sess = cmnd.conn().session();
    let cmd_sn = cmnd.inner().pdu.sn();
    let sn = sess.sn_lock();
    if !sn_before(cmd_sn, sn.exp_cmd_sn) {
        return Ok(());
    }
    error!(cmd_sn, exp_cmd_sn = sn.exp_cmd_sn, "sequence error");
    Err(RxError::ProtocolError)
}

async fn scsi_cmnd_start(req: &Arc<Cmnd>) -> Result<(), RxError> {
    let conn = Arc::clone(req.conn());
    let session = conn.session();

    session.inc_active_cmnds();
    req.inner().dec_active_cmnds = true;

    let (lun, itt, cmd_sn, cdb, flags, data_length, ahs_bytes) = {
        let inner = req.inner();
        let hdr: &ScsiCommandRequest = match inner.pdu.view() {
            Ok(h) => h,
            Err(_) => return Err(RxError::ProtocolError),
        };
        (
            hdr.lun.get(),
            inner.pdu.itt(),
            inner.pdu.sn(),
            hdr.scsi_descriptor_block,
            inner.pdu.flags_byte(),
            hdr.expected_data_transfer_length.get(),
            inner.pdu.ahs.clone(),
        )
    };

    let Some(scsi_cmd) = session.backend().rx_cmd(lun, &cdb, itt) else {
        // Out of resources; BUSY tells the initiator to retry. The
        // write data, if any, still has to be drained into the sink.
        create_preliminary_status_rsp(req, sam_status::BUSY, None);
        return Ok(());
    };

    scsi_cmd.bind(req);
    scsi_cmd.set_tgt_sn(cmd_sn);
    req.inner().scsi_cmd = Some(Arc::clone(&scsi_cmd));

    let read = flags & 0x40 != 0;
    let write = flags & 0x20 != 0;
    if read && write {
        match ahs::bidi_read_length(&ahs_bytes) {
            Some(sz) => {
                req.inner().read_size = sz;
                session.backend().cmd_set_expected(
                    &scsi_cmd,
                    ScsiDataDirection::Bidi,
                    data_length,
                    sz,
                );
            },
            None => {
                error!(
                    "bidirectional transfer without Bidirectional Read Expected \
                     Data Transfer Length AHS"
                );
                set_preliminary_status_rsp(
                    req,
                    crate::models::data::sense_data::target_sense::PARAMETER_VALUE_INVALID,
                );
            },
        }
    } else if read {
        req.inner().read_size = data_length;
        session
            .backend()
            .cmd_set_expected(&scsi_cmd, ScsiDataDirection::Read, data_length, 0);
    } else if write {
        session
            .backend()
            .cmd_set_expected(&scsi_cmd, ScsiDataDirection::Write, data_length, 0);
    } else {
        session
            .backend()
            .cmd_set_expected(&scsi_cmd, ScsiDataDirection::None, 0, 0);
    }

    {
        use crate::models::command::common::RawTaskAttribute;
        *scsi_cmd.queue_type.lock().expect("queue_type lock poisoned") =
            RawTaskAttribute::new(flags & 0x07).decode();
    }

    if let Some(ext) = ahs::extended_cdb(&ahs_bytes) {
        *scsi_cmd.ext_cdb.lock().expect("ext_cdb lock poisoned") = Some(ext);
    }

    req.inner().state = CmndState::RxCmd;
    session.backend().preprocess(&scsi_cmd);

    // Preprocessing may finish on a mid-layer thread; the data segment
    // cannot be scattered until it does.
    while req.inner().state == CmndState::RxCmd {
        if conn.is_closing() {
            return Err(RxError::ConnectionFailed);
        }
        tokio::select! {
            _ = conn.cancelled().cancelled() => return Err(RxError::ConnectionFailed),
            _ = conn.wait_rd_active() => {},
        }
    }

    cmnd_rx_continue(req)
}

/// Continue SCSI command admission once preprocessing finished: wire the
/// buffers, enforce the unsolicited-data rules and start R2T bookkeeping.
fn cmnd_rx_continue(req: &Arc<Cmnd>) -> Result<(), RxError> {
    let conn = Arc::clone(req.conn());
    let session = conn.session();
    let params = &session.params;

    let (dir, datasize, fin, data_length) = {
        let inner = req.inner();
        let dir = inner
            .scsi_cmd
            .as_ref()
            .map(|c| c.expected().dir)
            .unwrap_or_default();
        (dir, inner.pdu.datasize, inner.pdu.fin(), inner.pdu.data_len_field())
    };

    if req.inner().prelim != PrelimFlags::empty() {
        // Check here to save R2Ts for already-failed commands.
        return preliminary_complete(req, req, true);
    }

    match dir {
        ScsiDataDirection::Write | ScsiDataDirection::Bidi => {
            let unsolicited_data_expected = !fin;

            if params.initial_r2t && unsolicited_data_expected {
                error!(
                    initiator = %session.initiator_name,
                    "initial R2T is required but command carries unsolicited data"
                );
                mark_conn_closed(&conn);
                return Err(RxError::ConnectionFailed);
            }

            if !params.immediate_data && datasize != 0 {
                error!(
                    initiator = %session.initiator_name,
                    "forbidden immediate data sent"
                );
                mark_conn_closed(&conn);
                return Err(RxError::ConnectionFailed);
            }

            if params.first_burst_length < datasize {
                error!(
                    initiator = %session.initiator_name,
                    datasize,
                    first_burst_length = params.first_burst_length,
                    "immediate data exceeds first burst length"
                );
                mark_conn_closed(&conn);
                return Err(RxError::ConnectionFailed);
            }

            {
                let mut inner = req.inner();
                inner.bufflen = data_length;
                inner.r2t_len_to_receive = data_length.saturating_sub(datasize);
            }

            if session.insert_data_wait_hash(req).is_err() {
                // Receiving data for this request under a duplicated ITT
                // would corrupt another command's buffer.
                mark_conn_closed(&conn);
                return Err(RxError::ConnectionFailed);
            }

            {
                let mut inner = req.inner();
                if unsolicited_data_expected {
                    inner.outstanding_r2t = 1;
                    let first_burst_left =
                        params.first_burst_length - datasize;
                    inner.r2t_len_to_send = inner
                        .r2t_len_to_receive
                        .saturating_sub(first_burst_left.min(inner.r2t_len_to_receive));
                } else {
                    inner.r2t_len_to_send = inner.r2t_len_to_receive;
                }
            }

            req_add_to_write_timeout_list(req);

            // For performance better to solicit the rest right away;
            // without immediate data this happens after sequencing.
            if datasize != 0 && req.inner().r2t_len_to_send != 0 {
                r2t::send_r2t(req);
            }
        },
        ScsiDataDirection::Read | ScsiDataDirection::None => {
            if !fin || datasize != 0 {
                error!(
                    itt = format_args!("{:#x}", req.itt()),
                    "unexpected unsolicited data"
                );
                set_preliminary_status_rsp(
                    req,
                    crate::models::data::sense_data::target_sense::UNEXPECTED_UNSOLICITED_DATA,
                );
            }
        },
    }

    Ok(())
}

fn nop_out_start(cmnd: &Arc<Cmnd>) -> Result<(), RxError> {
    let (fin, itt, immediate) = {
        let inner = cmnd.inner();
        (inner.pdu.fin(), inner.pdu.itt(), inner.pdu.is_immediate())
    };

    if !fin {
        error!("initiator sent Nop-Out spanning several PDUs");
        return Err(RxError::ProtocolError);
    }

    if itt == RESERVED_TAG && !immediate {
        error!("initiator sent RESERVED tag for non-immediate Nop-Out command");
    }

    check_cmd_sn_update_stat_sn(cmnd)
}

fn data_out_start(cmnd: &Arc<Cmnd>) -> Result<(), RxError> {
    let conn = Arc::clone(cmnd.conn());

    update_stat_sn(cmnd);

    let (itt, fin, datasize) = {
        let inner = cmnd.inner();
        (inner.pdu.itt(), inner.pdu.fin(), inner.pdu.datasize)
    };

    let Some(orig_req) = conn.session().find_data_wait_hash(itt) else {
        // No request should be aborted before all of its Data-Out PDUs
        // arrived or timed out; a stray one is quietly drained.
        debug!(itt = format_args!("{itt:#x}"), "unable to find SCSI task");
        cmnd.inner().cmd_req = None;
        return Ok(());
    };
    cmnd.inner().cmd_req = Some(Arc::clone(&orig_req));

    let (r2t_len_to_receive, orig_prelim) = {
        let inner = orig_req.inner();
        (inner.r2t_len_to_receive, inner.prelim)
    };

    if r2t_len_to_receive < datasize && orig_prelim == PrelimFlags::empty() {
        error!(
            datasize,
            r2t_len_to_receive, "data size exceeds R2T length to receive"
        );
        set_preliminary_status_rsp(
            &orig_req,
            crate::models::data::sense_data::target_sense::INCORRECT_AMOUNT_OF_DATA,
        );
    }

    // The LUN field of Data-Out PDUs is deliberately not validated:
    // some initiators do not bother setting it correctly.

    if fin {
        let mut inner = orig_req.inner();
        inner.outstanding_r2t = inner.outstanding_r2t.saturating_sub(1);
    }

    Ok(())
}

fn data_out_end(cmnd: &Arc<Cmnd>) {
    let Some(req) = cmnd.inner().cmd_req.clone() else {
        return;
    };

    let (fin, datasize, keep_for_ddigest) = {
        let inner = cmnd.inner();
        (inner.pdu.fin(), inner.pdu.datasize, inner.wire_ddigest.is_some())
    };

    if keep_for_ddigest {
        req.inner().rx_ddigest_cmd_list.push(Arc::clone(cmnd));
    }

    // Adjusting r2t_len_to_receive only now keeps the data-receive error
    // recovery (fail_data_waiting_cmnd) working for partial transfers.
    let (to_receive, to_send, pending) = {
        let mut inner = req.inner();
        inner.r2t_len_to_receive = inner.r2t_len_to_receive.saturating_sub(datasize);
        if inner.prelim != PrelimFlags::empty() {
            // One or more PDUs may still be outstanding; pretend a byte
            // per outstanding R2T so the accounting converges.
            inner.r2t_len_to_receive = inner.outstanding_r2t;
            inner.r2t_len_to_send = 0;
        }
        (inner.r2t_len_to_receive, inner.r2t_len_to_send, inner.pending)
    };

    if !fin {
        return;
    }

    if to_receive == 0 {
        if !pending {
            restart_cmnd(&req);
        }
    } else if to_send != 0 {
        r2t::send_r2t(&req);
    }
}

/// Sequence a fully-received request: immediate PDUs bypass the CmdSN
/// order, everything else executes at ExpCmdSN and drains the reorder
/// queue behind it.
pub fn push_cmnd(cmnd: Arc<Cmnd>) {
    let sess = Arc::clone(cmnd.conn().session());

    debug_assert!(cmnd.is_request());

    if cmnd.is_immediate() {
        debug!(cmd_sn = cmnd.inner().pdu.sn(), "immediate cmd");
        cmnd_exec(cmnd);
        return;
    }

    let cmd_sn_in = cmnd.inner().pdu.sn();
    let mut sn = sess.sn_lock();

    if cmd_sn_in == sn.exp_cmd_sn {
        let mut cur = cmnd;
        let mut cmd_sn = cmd_sn_in;
        loop {
            cmd_sn = cmd_sn.wrapping_add(1);
            sn.exp_cmd_sn = cmd_sn;

            let mut delayed_tm = None;
            if sn.tm_active > 0 {
                if sn_before(cmd_sn, sn.tm_sn) {
                    drop(sn);
                    task_mgmt::mark_cmnd_aborted(&cur);
                    sn = sess.sn_lock();
                }
                delayed_tm = task_mgmt::take_ready_tm_rsp(&mut sn);
            }

            drop(sn);

            if let Some(tm_rsp) = delayed_tm {
                tx::cmnd_init_write(&tm_rsp, true);
            }

            cmnd_exec(cur);

            sn = sess.sn_lock();
            let head_matches = sn
                .pending_list
                .front()
                .is_some_and(|head| head.inner().pdu.sn() == cmd_sn);
            if !head_matches {
                break;
            }
            match sn.pending_list.pop_front() {
                Some(head) => {
                    head.inner().pending = false;
                    debug!(cmd_sn, "processing pending cmd");
                    cur = head;
                },
                None => break,
            }
        }
        drop(sn);
    } else {
        // The MaxCmdSN ceiling is deliberately not enforced here: it is
        // advertised from the write path, so an initiator can legally
        // race past it; the worst case is an extra QUEUE FULL.
        let stale = sn_before(cmd_sn_in, sn.exp_cmd_sn);
        if stale {
            drop(sn);
            error!(cmd_sn = cmd_sn_in, "unexpected stale CmdSN, dropping");
            req_cmnd_release_force(&cmnd);
            return;
        }

        debug!(
            cmd_sn = cmd_sn_in,
            exp_cmd_sn = sn.exp_cmd_sn,
            "queueing out-of-order cmd"
        );

        let pos = sn
            .pending_list
            .iter()
            .position(|c| sn_before(cmd_sn_in, c.inner().pdu.sn()))
            .unwrap_or(sn.pending_list.len());
        cmnd.inner().pending = true;
        sn.pending_list.insert(pos, cmnd);
        drop(sn);
    }
}

/// Execute a sequenced request.
pub fn cmnd_exec(cmnd: Arc<Cmnd>) {
    let opcode = cmnd.opcode();
    debug!(opcode = ?opcode, sn = cmnd.inner().pdu.sn(), "exec");

    if opcode == Some(Opcode::ScsiCommandReq) {
        let (to_receive, to_send) = {
            let inner = cmnd.inner();
            (inner.r2t_len_to_receive, inner.r2t_len_to_send)
        };
        if to_receive == 0 {
            restart_cmnd(&cmnd);
        } else if to_send != 0 {
            r2t::send_r2t(&cmnd);
        }
        return;
    }

    if cmnd.inner().prelim != PrelimFlags::empty() {
        debug!(cmnd = ?cmnd, "terminating prelim completed non-SCSI cmnd");
        req_cmnd_release(&cmnd);
        return;
    }

    match opcode {
        Some(Opcode::NopOut) => nop_out_exec(&cmnd),
        Some(Opcode::ScsiTaskMgmtReq) => task_mgmt::execute_task_management(&cmnd),
        Some(Opcode::LogoutReq) => logout_exec(&cmnd),
        other => {
            error!(opcode = ?other, "unexpected cmnd op");
            req_cmnd_release(&cmnd);
        },
    }
}

/// Hand a write (or no-data) command over for execution once all its
/// data arrived.
pub fn restart_cmnd(cmnd: &Arc<Cmnd>) {
    {
        let inner = cmnd.inner();
        debug_assert_eq!(inner.r2t_len_to_receive, 0);
        debug_assert_eq!(inner.r2t_len_to_send, 0);
    }

    req_del_from_write_timeout_list(cmnd);

    // Unhash early to keep the hash small; release would do it anyway.
    if cmnd.inner().hashed {
        cmnd.conn().session().remove_data_wait_hash(cmnd);
    }

    if cmnd.conn().is_reinstating() {
        debug!(cmnd = ?cmnd, "parking cmnd of reinstated connection");
        cmnd.inner().state = CmndState::ReinstPending;
        return;
    }

    let prelim = cmnd.inner().prelim;
    let status = if prelim != PrelimFlags::empty() {
        if prelim.contains(PrelimFlags::ABORTED) {
            debug!(cmnd = ?cmnd, "aborted before execution");
            req_cmnd_release_force(cmnd);
            return;
        }
        if cmnd.inner().scsi_cmd.is_none() {
            debug!(cmnd = ?cmnd, "finishing preliminary completed cmd without mid-layer cmd");
            req_cmnd_release(cmnd);
            return;
        }
        PreprocessStatus::ErrorSenseSet
    } else {
        crate::target::backend::pre_exec(cmnd)
    };

    let scsi_cmd = {
        let mut inner = cmnd.inner();
        inner.state = CmndState::Restarted;
        let data = Bytes::copy_from_slice(&inner.buf);
        let cmd = inner.scsi_cmd.clone();
        if let Some(c) = cmd.as_ref() {
            c.set_write_data(data);
        }
        cmd
    };

    match scsi_cmd {
        Some(cmd) => cmnd.conn().session().backend().restart_cmd(&cmd, status),
        None => req_cmnd_release(cmnd),
    }
}

fn nop_out_exec(req: &Arc<Cmnd>) {
    if req.itt() != RESERVED_TAG {
        let (itt_raw, lun, ping) = {
            let mut inner = req.inner();
            let ping = std::mem::take(&mut inner.buf).freeze();
            (inner.pdu.itt_raw(), inner.pdu.lun(), ping)
        };

        let rsp = Cmnd::alloc_main_rsp(req);
        {
            let mut inner = rsp.inner();
            let mut hdr = NopInResponse::default_hdr();
            hdr.initiator_task_tag = itt_raw;
            hdr.target_task_tag.set(RESERVED_TAG);
            hdr.lun.set(lun);
            inner.pdu.bhs.copy_from_slice(zerocopy::IntoBytes::as_bytes(&hdr));
            inner.pdu.datasize = ping.len() as u32;
            inner.bufflen = ping.len() as u32;
            inner.resp_data = ping;
        }
    } else {
        let ttt = req.inner().pdu.ttt();
        debug!(ttt = format_args!("{ttt:#x}"), "receive Nop-In response");

        let found = {
            let mut list = req
                .conn()
                .nop_req_list
                .lock()
                .expect("nop_req_list lock poisoned");
            match list.iter().position(|r| r.inner().pdu.ttt() == ttt) {
                Some(pos) => Some(list.remove(pos)),
                None => None,
            }
        };
        if found.is_none() {
            warn!("got Nop-Out response without corresponding Nop-In request");
        }
    }

    req_cmnd_release(req);
}

fn logout_exec(req: &Arc<Cmnd>) {
    tracing::info!(
        initiator = %req.conn().session().initiator_name,
        "logout received"
    );

    let itt_raw = req.inner().pdu.itt_raw();
    let rsp = Cmnd::alloc_main_rsp(req);
    {
        let mut inner = rsp.inner();
        let mut hdr = LogoutResponse::default_hdr();
        hdr.initiator_task_tag = itt_raw;
        inner.pdu.bhs.copy_from_slice(zerocopy::IntoBytes::as_bytes(&hdr));
        inner.should_close_conn = true;
    }

    req_cmnd_release(req);
}

/// Latch a command as finished before execution. The write-direction
/// R2T dance still runs into the sink so the initiator can complete its
/// transfer; the queued `main_rsp` leaves on request release.
pub fn preliminary_complete(
    req: &Arc<Cmnd>,
    orig_req: &Arc<Cmnd>,
    _get_data: bool,
) -> Result<(), RxError> {
    let set_r2t_len = {
        let orig = orig_req.inner();
        let already = orig.prelim.contains(PrelimFlags::PRELIM_COMPLETED);
        let is_scsi = orig.pdu.opcode() == Some(Opcode::ScsiCommandReq);
        !orig.hashed && is_scsi && !already
    };
    orig_req.inner().prelim.insert(PrelimFlags::PRELIM_COMPLETED);

    // The payload of `req` is received into the sink by the read loop.

    if set_r2t_len {
        r2t::set_prelim_r2t_len_to_receive(orig_req)?;
    }
    Ok(())
}

/// Fail a command before the mid-layer saw it (BUSY, protocol error).
pub fn create_preliminary_status_rsp(
    req: &Arc<Cmnd>,
    status: u8,
    sense: Option<(u8, u8, u8)>,
) {
    if req.inner().prelim != PrelimFlags::empty() {
        debug!(req = ?req, "already prelim completed");
        return;
    }

    req.inner().state = CmndState::PrelimDone;

    {
        let mut inner = req.inner();
        let flags = inner.pdu.flags_byte();
        let read = flags & 0x40 != 0;
        let write = flags & 0x20 != 0;
        if read && write {
            if let Some(sz) = ahs::bidi_read_length(&inner.pdu.ahs) {
                inner.read_size = sz;
            }
        } else if read {
            inner.read_size = inner.pdu.data_len_field();
        }
    }

    let sense_bytes = sense
        .map(|(k, a, q)| {
            crate::models::data::sense_data::SenseData::current(k, a, q).to_iscsi_bytes()
        })
        .unwrap_or_default();
    let rsp = tx::create_prelim_status_rsp(req, status, &sense_bytes);
    drop(rsp);

    let _ = preliminary_complete(req, req, true);
}

/// Fail a command the mid-layer already owns: record sense there, then
/// latch preliminary completion.
pub fn set_preliminary_status_rsp(req: &Arc<Cmnd>, sense: (u8, u8, u8)) {
    if let Some(scsi_cmd) = req.inner().scsi_cmd.clone() {
        scsi_cmd.set_error(sense);
    }
    let _ = preliminary_complete(req, req, true);
}

/// Queue a REJECT for a broken PDU. SCSI commands additionally get
/// invalid-message sense so the mid-layer path stays consistent.
pub fn create_reject_rsp(req: &Arc<Cmnd>, reason: RejectReason) {
    debug!(req = ?req, reason = ?reason, "reject");

    if req.opcode() == Some(Opcode::ScsiCommandReq) {
        if req.inner().scsi_cmd.is_none() {
            // BUSY already queued; the initiator will retry and the next
            // attempt will hopefully get a mid-layer command, then the
            // REJECT can be delivered properly.
            if req.inner().main_rsp.is_some() {
                return;
            }
        } else {
            set_preliminary_status_rsp(
                req,
                crate::models::data::sense_data::target_sense::INVALID_MESSAGE,
            );
        }
    }

    let bhs_echo = Bytes::copy_from_slice(&req.inner().pdu.bhs);

    let rsp = Cmnd::alloc_main_rsp(req);
    {
        let mut inner = rsp.inner();
        let mut hdr = RejectPdu::default_hdr();
        hdr.reason.encode(reason);
        inner.pdu.bhs.copy_from_slice(zerocopy::IntoBytes::as_bytes(&hdr));
        inner.pdu.bhs[16..20].copy_from_slice(&RESERVED_TAG.to_be_bytes());
        inner.pdu.bhs[20..24].copy_from_slice(&RESERVED_TAG.to_be_bytes());
        // A REJECT carries the offending BHS as its data segment.
        inner.pdu.datasize = bhs_echo.len() as u32;
        inner.bufflen = bhs_echo.len() as u32;
        inner.resp_data = bhs_echo;
    }

    let _ = preliminary_complete(req, req, true);
}
