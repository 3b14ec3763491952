// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Task management: the abort/reset family, aborted-command latching
//! and the delayed TM response gate.
//!
//! A TM response may not overtake the commands it affects. It is held
//! back until `ExpCmdSN` has advanced past the TM's own CmdSN, which
//! guarantees every earlier command was sequenced (and marked aborted
//! where applicable) first.

use std::sync::{Arc, atomic::Ordering};

use tracing::{debug, error, info};

use crate::{
    models::{
        task_mgmt::{
            common::{TmFunction, TmResponseCode},
            request::TaskMgmtRequest,
            response::TaskMgmtResponse,
        },
    },
    target::{
        backend::{MgmtCmd, MgmtFn, MgmtParams},
        cmnd::{Cmnd, PrelimFlags, RESERVED_TAG, req_cmnd_release, rsp_cmnd_release},
        session::{SnState, sn_before, sn_between},
        timeout::arm_tm_timer,
        tx,
    },
};

/// Latch a command as aborted and tighten this connection's response
/// timer to the TM data-wait window.
pub fn mark_cmnd_aborted(cmnd: &Arc<Cmnd>) {
    let conn = cmnd.conn();

    {
        let mut inner = cmnd.inner();
        debug!(
            itt = format_args!("{:#x}", inner.pdu.itt()),
            sn = inner.pdu.sn(),
            r2t_len_to_receive = inner.r2t_len_to_receive,
            r2t_len_to_send = inner.r2t_len_to_send,
            outstanding_r2t = inner.outstanding_r2t,
            "aborting cmd"
        );
        inner.prelim.insert(PrelimFlags::ABORTED);
    }

    conn.conn_tm_active.store(true, Ordering::Release);
    arm_tm_timer(conn);
}

fn tm_view(req: &Arc<Cmnd>) -> (Option<TmFunction>, u32, u32, u32, u64) {
    let inner = req.inner();
    let hdr: &TaskMgmtRequest = match inner.pdu.view() {
        Ok(h) => h,
        Err(_) => return (None, 0, 0, 0, 0),
    };
    (
        hdr.function.function(),
        hdr.referenced_task_tag.get(),
        inner.pdu.sn(),
        hdr.ref_cmd_sn.get(),
        hdr.lun.get(),
    )
}

/// ABORT TASK: locate the referenced task and mark it aborted.
///
/// `Ok` means the function is forwarded to the mid-layer and the TM
/// response arrives through `task_mgmt_fn_done`; `Err` carries an
/// immediate response code.
fn cmnd_abort(req: &Arc<Cmnd>) -> Result<(), TmResponseCode> {
    let (_, rtt, cmd_sn, ref_cmd_sn, tm_lun) = tm_view(req);

    if !sn_before(ref_cmd_sn, cmd_sn) {
        info!(ref_cmd_sn, cmd_sn, "ABORT TASK: RefCmdSN not before CmdSN");
        return Err(TmResponseCode::UnknownTask);
    }

    if let Some(cmnd) = req.conn().find_cmnd_by_itt(rtt) {
        let (cmnd_lun, cmnd_sn, immediate) = {
            let inner = cmnd.inner();
            (inner.pdu.lun(), inner.pdu.sn(), inner.pdu.is_immediate())
        };

        if tm_lun != cmnd_lun {
            error!(
                rtt = format_args!("{rtt:#x}"),
                tm_lun, cmnd_lun, "ABORT TASK: LUN mismatch"
            );
            return Err(TmResponseCode::FunctionRejected);
        }

        if immediate {
            if ref_cmd_sn != cmd_sn {
                error!(
                    ref_cmd_sn, cmd_sn,
                    "ABORT TASK: RefCmdSN != TM CmdSN for immediate command"
                );
                return Err(TmResponseCode::FunctionRejected);
            }
        } else if ref_cmd_sn != cmnd_sn {
            error!(ref_cmd_sn, cmnd_sn, "ABORT TASK: RefCmdSN != CmdSN");
            return Err(TmResponseCode::FunctionRejected);
        }

        if !sn_before(cmnd_sn, cmd_sn) {
            error!(
                tm_sn = cmd_sn,
                cmnd_sn,
                rtt = format_args!("{rtt:#x}"),
                "ABORT TASK: SN mismatch"
            );
            return Err(TmResponseCode::FunctionRejected);
        }

        mark_cmnd_aborted(&cmnd);
        Ok(())
    } else {
        debug!(rtt = format_args!("{rtt:#x}"), "cmd not found");
        // The task may already be finished. If RefCmdSN sits inside the
        // valid command window the CmdSN was consumed and the answer is
        // "function complete"; outside of it the task never existed.
        // 128 is a good window.
        if sn_between(ref_cmd_sn, cmd_sn.wrapping_sub(128), cmd_sn) {
            Ok(())
        } else {
            Err(TmResponseCode::UnknownTask)
        }
    }
}

/// ABORT TASK SET / CLEAR TASK SET: abort every command of the session
/// on the TM's LUN that was sequenced before the TM itself.
fn task_set_abort(req: &Arc<Cmnd>) {
    let (_, _, tm_cmd_sn, _, tm_lun) = tm_view(req);
    let session = req.conn().session();

    for conn in session.conns() {
        let cmds = conn
            .cmd_list
            .lock()
            .expect("cmd_list lock poisoned")
            .clone();
        for cmnd in cmds {
            if Arc::ptr_eq(&cmnd, req) {
                continue;
            }
            let (lun, sn) = {
                let inner = cmnd.inner();
                (inner.pdu.lun(), inner.pdu.sn())
            };
            if lun != tm_lun {
                continue;
            }
            if !sn_before(sn, tm_cmd_sn) {
                continue;
            }
            mark_cmnd_aborted(&cmnd);
        }
    }
}

/// Reset-scoped abort: every command of every session of the target
/// (`all`), or only those addressing the TM's LUN.
fn target_abort(req: &Arc<Cmnd>, all: bool) {
    let (_, _, _, _, tm_lun) = tm_view(req);
    let Some(target) = req.conn().session().target() else {
        return;
    };

    for session in target.sessions() {
        for conn in session.conns() {
            let cmds = conn
                .cmd_list
                .lock()
                .expect("cmd_list lock poisoned")
                .clone();
            for cmnd in cmds {
                if Arc::ptr_eq(&cmnd, req) {
                    continue;
                }
                if all || cmnd.inner().pdu.lun() == tm_lun {
                    mark_cmnd_aborted(&cmnd);
                }
            }
        }
    }
}

/// Entry point for a sequenced Task Management Request.
pub fn execute_task_management(req: &Arc<Cmnd>) {
    let conn = Arc::clone(req.conn());
    let sess = conn.session();
    let (function, rtt, cmd_sn, _, tm_lun) = tm_view(req);

    info!(function = ?function, rtt = format_args!("{rtt:#x}"), cmd_sn, "iSCSI TM");

    // A newer TM replaces any response still gated on the SN engine.
    let dropped_rsp = {
        let mut sn = sess.sn_lock();
        sn.tm_active += 1;
        sn.tm_sn = cmd_sn;
        let dropped = sn.tm_rsp.take();
        if dropped.is_some() {
            sn.tm_active -= 1;
        }
        dropped
    };
    if let Some(tm_rsp) = dropped_rsp {
        debug!("dropping delayed TM rsp");
        rsp_cmnd_release(tm_rsp);
    }

    if function != Some(TmFunction::AbortTask) && rtt != RESERVED_TAG {
        error!(rtt = format_args!("{rtt:#x}"), "invalid RTT for TM function");
        send_task_mgmt_resp(req, TmResponseCode::FunctionRejected);
        return;
    }

    let forwarded: Result<MgmtParams, TmResponseCode> = match function {
        Some(TmFunction::AbortTask) => cmnd_abort(req).map(|()| MgmtParams {
            func: MgmtFn::AbortTask,
            tag: Some(rtt),
            lun: Some(tm_lun),
            cmd_sn: Some(cmd_sn),
        }),
        Some(TmFunction::AbortTaskSet) => {
            task_set_abort(req);
            Ok(MgmtParams {
                func: MgmtFn::AbortTaskSet,
                tag: None,
                lun: Some(tm_lun),
                cmd_sn: Some(cmd_sn),
            })
        },
        Some(TmFunction::ClearTaskSet) => {
            task_set_abort(req);
            Ok(MgmtParams {
                func: MgmtFn::ClearTaskSet,
                tag: None,
                lun: Some(tm_lun),
                cmd_sn: Some(cmd_sn),
            })
        },
        Some(TmFunction::ClearAca) => Ok(MgmtParams {
            func: MgmtFn::ClearAca,
            tag: None,
            lun: Some(tm_lun),
            cmd_sn: Some(cmd_sn),
        }),
        Some(TmFunction::TargetColdReset) | Some(TmFunction::TargetWarmReset) => {
            target_abort(req, true);
            Ok(MgmtParams {
                func: MgmtFn::TargetReset,
                tag: None,
                lun: None,
                cmd_sn: Some(cmd_sn),
            })
        },
        Some(TmFunction::LogicalUnitReset) => {
            target_abort(req, false);
            Ok(MgmtParams {
                func: MgmtFn::LunReset,
                tag: None,
                lun: Some(tm_lun),
                cmd_sn: Some(cmd_sn),
            })
        },
        Some(TmFunction::TaskReassign) => {
            Err(TmResponseCode::ReassignmentUnsupported)
        },
        None => {
            error!("unknown TM function");
            Err(TmResponseCode::FunctionRejected)
        },
    };

    match forwarded {
        Ok(params) => {
            let mcmd = MgmtCmd::new(params, Some(req));
            sess.backend().rx_mgmt_fn(&mcmd);
        },
        Err(status) => send_task_mgmt_resp(req, status),
    }
}

/// Is the response still gated on commands preceding the TM?
/// Holds for immediate TM requests as well.
fn is_delay_tm_resp(sn: &SnState, rsp: &Arc<Cmnd>) -> bool {
    let Some(req) = rsp.parent() else {
        return false;
    };
    let tm_cmd_sn = req.inner().pdu.sn();
    sn_before(sn.exp_cmd_sn, tm_cmd_sn)
}

/// Take the delayed TM response if its gate opened. Caller submits it
/// to the write pipeline outside the SN lock.
pub(crate) fn take_ready_tm_rsp(sn: &mut SnState) -> Option<Arc<Cmnd>> {
    let rsp = sn.tm_rsp.as_ref()?;
    if is_delay_tm_resp(sn, rsp) {
        return None;
    }
    debug!("releasing delayed TM rsp");
    sn.tm_active -= 1;
    debug_assert!(sn.tm_active >= 0);
    sn.tm_rsp.take()
}

/// Build the TM response and either send it or park it behind the
/// ExpCmdSN gate. At most one response may be pending per session.
pub fn send_task_mgmt_resp(req: &Arc<Cmnd>, status: TmResponseCode) {
    let sess = Arc::clone(req.conn().session());
    let (function, _, cmd_sn, _, _) = tm_view(req);
    let itt_raw = req.inner().pdu.itt_raw();

    info!(function = ?function, status = ?status, "TM function finished");

    let rsp = Cmnd::alloc_rsp(req);
    {
        let mut inner = rsp.inner();
        let mut hdr = TaskMgmtResponse::default_hdr();
        hdr.response.encode(status);
        hdr.initiator_task_tag = itt_raw;
        inner
            .pdu
            .bhs
            .copy_from_slice(zerocopy::IntoBytes::as_bytes(&hdr));

        if function == Some(TmFunction::TargetColdReset) {
            inner.should_close_conn = true;
            inner.should_close_all_conn = true;
        }
    }

    let send_now = {
        let mut sn = sess.sn_lock();
        debug_assert!(sn.tm_rsp.is_none());
        if is_delay_tm_resp(&sn, &rsp) {
            debug!(
                tm_cmd_sn = cmd_sn,
                exp_cmd_sn = sn.exp_cmd_sn,
                "delaying TM response until all affected commands received"
            );
            sn.tm_rsp = Some(Arc::clone(&rsp));
            false
        } else {
            sn.tm_active -= 1;
            debug_assert!(sn.tm_active >= 0);
            true
        }
    };

    if send_now {
        tx::cmnd_init_write(&rsp, true);
    }

    req_cmnd_release(req);
}
