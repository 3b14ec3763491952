// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! In-process harness: a recording mid-layer backend plus helpers to
//! feed PDUs into a connection and drain its write list the way the
//! write task would.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use iscsi_target_rs::{
    cfg::config::Config,
    models::{
        command::request::ScsiCommandRequest,
        common::BasicHeaderSegment,
        data::request::ScsiDataOut,
        nop::request::NopOutRequest,
        opcode::Opcode,
        task_mgmt::{common::TmFunction, request::TaskMgmtRequest},
    },
    target::{
        backend::{
            self, MgmtCmd, MgmtFn, MgmtStatus, PreprocessStatus, ScsiAen, ScsiBackend,
            ScsiCmd, ScsiDataDirection,
        },
        cmnd::Cmnd,
        conn::Connection,
        rx,
        session::{Session, Target},
        tx,
    },
};
use zerocopy::IntoBytes;

#[derive(Default)]
pub struct MockBackend {
    /// CmdSN of every command at the moment it was restarted, i.e. the
    /// order the mid-layer executes in.
    pub rx_order: Mutex<Vec<u32>>,
    pub restarted: Mutex<Vec<Arc<ScsiCmd>>>,
    pub done_tags: Mutex<Vec<u32>>,
    pub mgmt_calls: Mutex<Vec<MgmtFn>>,
    pub aens_done: Mutex<Vec<ScsiAen>>,

    /// Refuse `rx_cmd` (drives the BUSY preliminary path).
    pub busy: AtomicBool,
    /// Park restarted commands instead of completing them inline.
    pub defer_exec: AtomicBool,
    pub deferred: Mutex<Vec<Arc<ScsiCmd>>>,

    /// Payload returned for read commands.
    pub read_payload: Mutex<Bytes>,
    /// SAM status returned on successful completion.
    pub status: Mutex<u8>,
}

impl MockBackend {
    pub fn new() -> Arc<MockBackend> {
        Arc::new(MockBackend::default())
    }

    pub fn complete(&self, cmd: &Arc<ScsiCmd>, status: PreprocessStatus) {
        if status == PreprocessStatus::Success {
            let dir = cmd.expected().dir;
            let data = match dir {
                ScsiDataDirection::Read | ScsiDataDirection::Bidi => {
                    self.read_payload.lock().unwrap().clone()
                },
                _ => Bytes::new(),
            };
            cmd.set_result(*self.status.lock().unwrap(), data);
        }
        backend::xmit_response(cmd);
    }

    /// Complete every deferred command in the order it arrived.
    pub fn flush_deferred(&self) {
        let deferred: Vec<Arc<ScsiCmd>> =
            std::mem::take(&mut *self.deferred.lock().unwrap());
        for cmd in deferred {
            self.complete(&cmd, PreprocessStatus::Success);
        }
    }
}

impl ScsiBackend for MockBackend {
    fn rx_cmd(&self, lun: u64, cdb: &[u8; 16], tag: u32) -> Option<Arc<ScsiCmd>> {
        if self.busy.load(Ordering::Acquire) {
            return None;
        }
        Some(ScsiCmd::new(lun, *cdb, tag))
    }

    fn preprocess(&self, cmd: &Arc<ScsiCmd>) {
        backend::preprocessing_done(cmd);
    }

    fn restart_cmd(&self, cmd: &Arc<ScsiCmd>, status: PreprocessStatus) {
        if status == PreprocessStatus::ErrorFatal {
            // Teardown of a command the engine gave up on; it never
            // counts as executed.
            return;
        }
        self.rx_order.lock().unwrap().push(cmd.tgt_sn());
        self.restarted.lock().unwrap().push(Arc::clone(cmd));
        if self.defer_exec.load(Ordering::Acquire) {
            self.deferred.lock().unwrap().push(Arc::clone(cmd));
            return;
        }
        self.complete(cmd, status);
    }

    fn rx_mgmt_fn(&self, mcmd: &Arc<MgmtCmd>) {
        self.mgmt_calls.lock().unwrap().push(mcmd.params.func);
        let status = match mcmd.params.func {
            MgmtFn::AbortTask => MgmtStatus::TaskNotExist,
            _ => MgmtStatus::Success,
        };
        backend::task_mgmt_fn_done(mcmd, status);
    }

    fn tgt_cmd_done(&self, cmd: &Arc<ScsiCmd>) {
        self.done_tags.lock().unwrap().push(cmd.tag);
    }

    fn aen_done(&self, aen: &ScsiAen) {
        self.aens_done.lock().unwrap().push(aen.clone());
    }
}

pub struct Harness {
    pub target: Arc<Target>,
    pub sess: Arc<Session>,
    pub conn: Arc<Connection>,
    pub backend: Arc<MockBackend>,
}

pub fn setup(exp_cmd_sn: u32) -> Harness {
    setup_with(Config::default(), exp_cmd_sn)
}

pub fn setup_with(cfg: Config, exp_cmd_sn: u32) -> Harness {
    let backend = MockBackend::new();
    let target = Target::new();
    let sess = Session::new(
        &target,
        Arc::new(cfg.clone()),
        backend.clone(),
        "iqn.1994-05.com.test:initiator",
        exp_cmd_sn,
    );
    let conn = Connection::new(&sess, 0, &cfg);
    Harness {
        target,
        sess,
        conn,
        backend,
    }
}

/// Feed one PDU into the connection's RX path.
pub async fn rx(h: &Harness, bhs: [u8; 48], payload: &[u8]) {
    rx::rx_pdu(
        &h.conn,
        bhs,
        Bytes::new(),
        Bytes::copy_from_slice(payload),
    )
    .await
    .expect("rx_pdu failed");
}

pub async fn rx_with_ahs(h: &Harness, bhs: [u8; 48], ahs: &[u8], payload: &[u8]) {
    rx::rx_pdu(
        &h.conn,
        bhs,
        Bytes::copy_from_slice(ahs),
        Bytes::copy_from_slice(payload),
    )
    .await
    .expect("rx_pdu failed");
}

/// Pop the next queued response and run it through the TX pipeline
/// (lengths fixed, sequence numbers stamped) without a socket.
pub fn tx_one(h: &Harness) -> Option<Arc<Cmnd>> {
    let rsp = h.conn.pop_queued_rsp()?;
    tx::cmnd_tx_start(&rsp);
    let _frame = tx::frame_cmnd(&rsp);
    tx::cmnd_tx_end(&rsp);
    Some(rsp)
}

/// Drain the write list, returning `(opcode, response)` pairs in
/// transmission order.
pub fn tx_all(h: &Harness) -> Vec<(Opcode, Arc<Cmnd>)> {
    let mut out = Vec::new();
    while let Some(rsp) = tx_one(h) {
        let opcode = rsp.inner().pdu.opcode().expect("response without opcode");
        out.push((opcode, rsp));
    }
    out
}

/// A 48-byte SCSI command BHS. `data_len` is the immediate data-segment
/// length carried by this PDU; `xfer_len` the Expected Data Transfer
/// Length of the whole command.
#[allow(clippy::too_many_arguments)]
pub fn scsi_cmd_bhs(
    itt: u32,
    cmd_sn: u32,
    lun: u64,
    xfer_len: u32,
    data_len: u32,
    write: bool,
    read: bool,
    fin: bool,
    immediate: bool,
) -> [u8; 48] {
    let mut h = ScsiCommandRequest::default_hdr();
    h.lun.set(lun);
    h.initiator_task_tag = itt;
    h.cmd_sn.set(cmd_sn);
    h.expected_data_transfer_length.set(xfer_len);
    h.flags.set_write(write);
    h.flags.set_read(read);
    h.flags.set_fin(fin);
    if immediate {
        h.opcode.set_i();
    }
    h.set_data_length_bytes(data_len);

    let mut bhs = [0u8; 48];
    bhs.copy_from_slice(h.as_bytes());
    bhs
}

/// A no-data SCSI command (TEST UNIT READY shape).
pub fn nodata_cmd_bhs(itt: u32, cmd_sn: u32, immediate: bool) -> [u8; 48] {
    scsi_cmd_bhs(itt, cmd_sn, 0, 0, 0, false, false, true, immediate)
}

/// A Data-Out PDU carrying `data_len` bytes at `offset`.
pub fn data_out_bhs(
    itt: u32,
    ttt: u32,
    offset: u32,
    data_len: u32,
    data_sn: u32,
    fin: bool,
) -> [u8; 48] {
    let mut h = ScsiDataOut::default_hdr();
    h.initiator_task_tag = itt;
    h.target_transfer_tag.set(ttt);
    h.buffer_offset.set(offset);
    h.data_sn.set(data_sn);
    h.flags.set_fin(fin);
    h.set_data_length_bytes(data_len);

    let mut bhs = [0u8; 48];
    bhs.copy_from_slice(h.as_bytes());
    bhs
}

/// A Task Management Request BHS.
#[allow(clippy::too_many_arguments)]
pub fn tm_bhs(
    func: TmFunction,
    itt: u32,
    rtt: u32,
    cmd_sn: u32,
    ref_cmd_sn: u32,
    lun: u64,
    immediate: bool,
) -> [u8; 48] {
    let mut h = TaskMgmtRequest::default_hdr();
    h.function.set_function(func);
    h.lun.set(lun);
    h.initiator_task_tag = itt;
    h.referenced_task_tag.set(rtt);
    h.cmd_sn.set(cmd_sn);
    h.ref_cmd_sn.set(ref_cmd_sn);
    if immediate {
        h.opcode.set_i();
    }

    let mut bhs = [0u8; 48];
    bhs.copy_from_slice(h.as_bytes());
    bhs
}

/// A NOP-Out BHS. The F bit is always set: a NOP-Out never spans PDUs.
pub fn nop_out_bhs(
    itt: u32,
    ttt: u32,
    cmd_sn: u32,
    data_len: u32,
    immediate: bool,
) -> [u8; 48] {
    let mut h = NopOutRequest::default_hdr();
    h.initiator_task_tag = itt;
    h.target_task_tag.set(ttt);
    h.cmd_sn.set(cmd_sn);
    if immediate {
        h.opcode.set_i();
    }
    h.set_data_length_bytes(data_len);

    let mut bhs = [0u8; 48];
    bhs.copy_from_slice(h.as_bytes());
    bhs
}
