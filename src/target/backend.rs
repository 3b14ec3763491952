// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Bridge between the protocol engine and the SCSI mid-layer.
//!
//! The mid-layer itself (device dispatch, LUN logic, sense generation) is
//! pluggable behind [`ScsiBackend`]. The engine hands commands over with
//! `rx_cmd`/`restart_cmd` and the backend answers through the free
//! functions at the bottom of this module (`xmit_response`,
//! `preprocessing_done`, `task_mgmt_fn_done`).

use std::sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicU32, Ordering},
};

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::{
    models::{command::common::TaskAttribute, data::sense_data::SenseData},
    target::{
        cmnd::{Cmnd, CmndState, PrelimFlags, req_cmnd_release, req_cmnd_release_force},
        task_mgmt,
        tx,
    },
};

/// SAM status codes the engine stamps itself.
pub mod sam_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const BUSY: u8 = 0x08;
    pub const TASK_SET_FULL: u8 = 0x28;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ScsiDataDirection {
    #[default]
    None,
    Read,
    Write,
    Bidi,
}

/// Outcome of engine-side preprocessing, passed to `restart_cmd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreprocessStatus {
    Success,
    ErrorSenseSet,
    ErrorFatal,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    #[default]
    Ok,
    Aborted,
}

#[derive(Debug, Default, Clone)]
pub struct ExpectedXfer {
    pub dir: ScsiDataDirection,
    pub len: u32,
    pub in_len: u32,
}

#[derive(Debug, Default, Clone)]
pub struct ScsiCmdResult {
    pub status: u8,
    pub sense: Bytes,
    pub resp_data: Bytes,
    pub is_send_status: bool,
    pub aborted: bool,
    pub prelim_completed: bool,
    pub delivery_status: DeliveryStatus,
}

/// A mid-layer command handle.
///
/// The engine owns parsing and data movement; the backend owns execution.
/// Everything the two sides exchange lives here.
pub struct ScsiCmd {
    pub tag: u32,
    pub lun: u64,
    pub cdb: [u8; 16],
    pub ext_cdb: Mutex<Option<Bytes>>,
    pub queue_type: Mutex<TaskAttribute>,
    /// CmdSN of the carrying PDU.
    tgt_sn: AtomicU32,
    expected: Mutex<ExpectedXfer>,
    result: Mutex<ScsiCmdResult>,
    /// Write payload collected by the engine, handed over at restart.
    write_data: Mutex<Bytes>,
    tgt_priv: Mutex<Option<Weak<Cmnd>>>,
}

impl ScsiCmd {
    pub fn new(lun: u64, cdb: [u8; 16], tag: u32) -> Arc<ScsiCmd> {
        Arc::new(ScsiCmd {
            tag,
            lun,
            cdb,
            ext_cdb: Mutex::new(None),
            queue_type: Mutex::new(TaskAttribute::Simple),
            tgt_sn: AtomicU32::new(0),
            expected: Mutex::new(ExpectedXfer::default()),
            result: Mutex::new(ScsiCmdResult::default()),
            write_data: Mutex::new(Bytes::new()),
            tgt_priv: Mutex::new(None),
        })
    }

    #[inline]
    pub fn set_tgt_sn(&self, sn: u32) {
        self.tgt_sn.store(sn, Ordering::Release);
    }

    #[inline]
    pub fn tgt_sn(&self) -> u32 {
        self.tgt_sn.load(Ordering::Acquire)
    }

    pub fn set_expected(&self, dir: ScsiDataDirection, len: u32, in_len: u32) {
        *self.expected.lock().expect("expected lock poisoned") = ExpectedXfer {
            dir,
            len,
            in_len,
        };
    }

    pub fn expected(&self) -> ExpectedXfer {
        self.expected.lock().expect("expected lock poisoned").clone()
    }

    pub fn result(&self) -> ScsiCmdResult {
        self.result.lock().expect("result lock poisoned").clone()
    }

    /// Record a CHECK CONDITION with fixed sense.
    pub fn set_error(&self, (key, asc, ascq): (u8, u8, u8)) {
        let mut result = self.result.lock().expect("result lock poisoned");
        result.status = sam_status::CHECK_CONDITION;
        result.sense = SenseData::current(key, asc, ascq).to_iscsi_bytes();
        result.is_send_status = true;
    }

    /// Record the execution outcome (backend side).
    pub fn set_result(&self, status: u8, resp_data: Bytes) {
        let mut result = self.result.lock().expect("result lock poisoned");
        result.status = status;
        result.resp_data = resp_data;
        result.is_send_status = true;
    }

    pub fn set_aborted(&self) {
        self.result.lock().expect("result lock poisoned").aborted = true;
    }

    pub fn set_delivery_status(&self, st: DeliveryStatus) {
        self.result.lock().expect("result lock poisoned").delivery_status = st;
    }

    pub fn set_write_data(&self, data: Bytes) {
        *self.write_data.lock().expect("write_data lock poisoned") = data;
    }

    pub fn write_data(&self) -> Bytes {
        self.write_data.lock().expect("write_data lock poisoned").clone()
    }

    pub(crate) fn bind(&self, cmnd: &Arc<Cmnd>) {
        *self.tgt_priv.lock().expect("tgt_priv lock poisoned") =
            Some(Arc::downgrade(cmnd));
    }

    fn take_priv(&self) -> Option<Arc<Cmnd>> {
        self.tgt_priv
            .lock()
            .expect("tgt_priv lock poisoned")
            .take()
            .and_then(|w| w.upgrade())
    }
}

impl std::fmt::Debug for ScsiCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScsiCmd")
            .field("tag", &format_args!("{:#x}", self.tag))
            .field("lun", &self.lun)
            .field("op", &format_args!("{:#04x}", self.cdb[0]))
            .finish()
    }
}

/// Task-management scopes forwarded to the mid-layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmtFn {
    AbortTask,
    AbortTaskSet,
    ClearTaskSet,
    ClearAca,
    LunReset,
    TargetReset,
    /// Internal: connection drain after an unrecoverable TX error.
    AbortAllTasksSess,
    /// Internal: session teardown.
    NexusLossSess,
}

#[derive(Debug, Clone)]
pub struct MgmtParams {
    pub func: MgmtFn,
    pub tag: Option<u32>,
    pub lun: Option<u64>,
    pub cmd_sn: Option<u32>,
}

/// Mid-layer status for a finished TM function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmtStatus {
    Success,
    TaskNotExist,
    LunNotExist,
    FnNotSupported,
    Rejected,
    Failed,
}

/// A TM function in flight at the mid-layer, carrying the request that
/// must receive the TM response.
pub struct MgmtCmd {
    pub params: MgmtParams,
    req: Mutex<Option<Arc<Cmnd>>>,
}

impl MgmtCmd {
    pub fn new(params: MgmtParams, req: Option<&Arc<Cmnd>>) -> Arc<MgmtCmd> {
        Arc::new(MgmtCmd {
            params,
            req: Mutex::new(req.map(Arc::clone)),
        })
    }

    fn take_req(&self) -> Option<Arc<Cmnd>> {
        self.req.lock().expect("mgmt req lock poisoned").take()
    }
}

/// An async event raised by the mid-layer (SCSI sense payload).
#[derive(Debug, Clone)]
pub struct ScsiAen {
    pub lun: u64,
    pub sense: Bytes,
}

/// The SCSI mid-layer as the engine sees it.
///
/// `rx_cmd` may defer preprocessing; the implementation must invoke
/// [`preprocessing_done`] (synchronously or later) after `preprocess`,
/// and [`xmit_response`] after `restart_cmd`.
pub trait ScsiBackend: Send + Sync + 'static {
    /// Parse LUN + CDB into a mid-layer command. `None` means the
    /// mid-layer is out of resources; the engine answers BUSY.
    fn rx_cmd(&self, lun: u64, cdb: &[u8; 16], tag: u32) -> Option<Arc<ScsiCmd>>;

    /// Tell the mid-layer which transfer shape the PDU header announced.
    fn cmd_set_expected(
        &self,
        cmd: &Arc<ScsiCmd>,
        dir: ScsiDataDirection,
        len: u32,
        in_len: u32,
    ) {
        cmd.set_expected(dir, len, in_len);
    }

    /// Stage-1 preprocessing (buffer allocation hints live here).
    fn preprocess(&self, cmd: &Arc<ScsiCmd>);

    /// Execute the command; ends with a call to [`xmit_response`].
    fn restart_cmd(&self, cmd: &Arc<ScsiCmd>, status: PreprocessStatus);

    /// Run a task-management function; ends with [`task_mgmt_fn_done`].
    fn rx_mgmt_fn(&self, mcmd: &Arc<MgmtCmd>);

    /// The response for `cmd` left the engine (delivered or dropped).
    fn tgt_cmd_done(&self, cmd: &Arc<ScsiCmd>);

    /// The async event notification was transmitted.
    fn aen_done(&self, aen: &ScsiAen);

    /// All tasks of the session must be aborted (connection drain).
    fn abort_all_tasks_sess(&self) {}
}

/// Mid-layer finished executing `scsi_cmd`: build and queue the response
/// PDUs, then release the request.
pub fn xmit_response(scsi_cmd: &Arc<ScsiCmd>) {
    let Some(req) = scsi_cmd.take_priv() else {
        warn!(cmd = ?scsi_cmd, "xmit_response for a dead request");
        return;
    };
    let conn = Arc::clone(req.conn());
    let result = scsi_cmd.result();

    {
        let mut inner = req.inner();
        debug_assert_eq!(inner.state, CmndState::Restarted);

        if result.aborted {
            inner.prelim.insert(PrelimFlags::ABORTED);
        }

        if inner.prelim.contains(PrelimFlags::ABORTED) {
            debug!(req = ?req, "dropping response of aborted request");
            inner.state = CmndState::Processed;
            drop(inner);
            scsi_cmd.set_delivery_status(DeliveryStatus::Aborted);
            req_cmnd_release_force(&req);
            conn.wake_wr();
            return;
        }

        if inner.prelim.contains(PrelimFlags::PRELIM_COMPLETED) {
            // The write buffer length must not leak into the response
            // accounting of a command that never produced read data.
            inner.bufflen = inner.resp_data.len() as u32;
        } else {
            inner.resp_data = result.resp_data.clone();
            inner.bufflen = result.resp_data.len() as u32;
        }
        inner.state = CmndState::Processed;
    }

    let bufflen = req.inner().bufflen;
    let is_bidi = {
        let flags = req.inner().pdu.flags_byte();
        (flags & 0x40 != 0) && (flags & 0x20 != 0)
    };

    if bufflen != 0 && !result.is_send_status {
        error!("sending data without status is unsupported");
        scsi_cmd.set_error(
            crate::models::data::sense_data::target_sense::HARDWARE_ERROR,
        );
    }

    if bufflen != 0 {
        // Sense cannot ride a Data-In PDU, so a sense-bearing status
        // (and either leg of a bidi pair) gets a standalone response.
        if result.sense.is_empty() && !is_bidi {
            tx::send_data_rsp(&req, result.status, result.is_send_status);
        } else {
            tx::send_data_rsp(&req, 0, false);
            if result.is_send_status {
                let rsp =
                    tx::create_status_rsp(&req, result.status, &result.sense, true);
                tx::cmnd_init_write(&rsp, false);
            }
        }
    } else if result.is_send_status {
        let rsp = tx::create_status_rsp(&req, result.status, &result.sense, false);
        tx::cmnd_init_write(&rsp, false);
    }

    req_cmnd_release(&req);
    conn.wake_wr();
}

/// Mid-layer finished stage-1 preprocessing; let the read task continue
/// with the command's buffers in place.
pub fn preprocessing_done(scsi_cmd: &Arc<ScsiCmd>) {
    let guard = scsi_cmd.tgt_priv.lock().expect("tgt_priv lock poisoned");
    let Some(req) = guard.as_ref().and_then(|w| w.upgrade()) else {
        warn!("preprocessing_done for a dead request");
        return;
    };
    drop(guard);

    req.inner().state = CmndState::AfterPreproc;
    req.conn().make_rd_active();
}

/// Verify the deferred data digests of every Data-Out PDU that fed this
/// request. Called right before execution.
pub fn pre_exec(req: &Arc<Cmnd>) -> PreprocessStatus {
    let helpers = std::mem::take(&mut req.inner().rx_ddigest_cmd_list);
    for helper in &helpers {
        let (data, wire) = {
            let inner = helper.inner();
            (Bytes::copy_from_slice(&inner.buf), inner.wire_ddigest)
        };
        if let Some(wire) = wire
            && let Err(e) = crate::digest::digest_rx_data(&data, wire)
        {
            warn!(req = ?req, "rx data digest failed: {e}");
            if let Some(scsi_cmd) = req.inner().scsi_cmd.as_ref() {
                scsi_cmd.set_error(
                    crate::models::data::sense_data::target_sense::CRC_ERROR,
                );
            }
            return PreprocessStatus::ErrorSenseSet;
        }
    }
    PreprocessStatus::Success
}

/// Mid-layer finished a TM function: translate its status and send the
/// TM response (unless the function was engine-internal).
pub fn task_mgmt_fn_done(mcmd: &Arc<MgmtCmd>, status: MgmtStatus) {
    let mut code = match status {
        MgmtStatus::Success => {
            crate::models::task_mgmt::common::TmResponseCode::FunctionComplete
        },
        MgmtStatus::TaskNotExist => {
            crate::models::task_mgmt::common::TmResponseCode::UnknownTask
        },
        MgmtStatus::LunNotExist => {
            crate::models::task_mgmt::common::TmResponseCode::UnknownLun
        },
        MgmtStatus::FnNotSupported => {
            crate::models::task_mgmt::common::TmResponseCode::FunctionUnsupported
        },
        MgmtStatus::Rejected | MgmtStatus::Failed => {
            crate::models::task_mgmt::common::TmResponseCode::FunctionRejected
        },
    };

    if code == crate::models::task_mgmt::common::TmResponseCode::UnknownTask
        && mcmd.params.func == MgmtFn::AbortTask
    {
        // The engine only forwards ABORT TASK after locating the task, so
        // a not-found answer from the mid-layer still means success.
        code = crate::models::task_mgmt::common::TmResponseCode::FunctionComplete;
    }

    match mcmd.params.func {
        MgmtFn::AbortAllTasksSess | MgmtFn::NexusLossSess => {},
        _ => {
            if let Some(req) = mcmd.take_req() {
                task_mgmt::send_task_mgmt_resp(&req, code);
            }
        },
    }
}
