// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc, Mutex, MutexGuard, Weak,
    atomic::{AtomicU32, Ordering},
};

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::{
    models::{
        common::HEADER_LEN,
        data_format::ZeroCopyType,
        opcode::{BhsOpcode, Opcode},
    },
    target::{
        backend::{ScsiAen, ScsiCmd},
        conn::Connection,
        timeout::req_del_from_write_timeout_list,
        tx,
    },
};

/// Reserved value for ITT/TTT fields (RFC 3720).
pub const RESERVED_TAG: u32 = 0xffff_ffff;

bitflags::bitflags! {
    /// Latches recording that a command was finished before (or instead
    /// of) regular mid-layer execution.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct PrelimFlags: u8 {
        const PRELIM_COMPLETED = 1 << 0;
        const ABORTED = 1 << 1;
    }
}

/// Lifecycle of a request with respect to the SCSI mid-layer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CmndState {
    #[default]
    New,
    /// Handed to the mid-layer, preprocessing not finished yet.
    RxCmd,
    /// Preprocessing finished, RX may continue with buffers in place.
    AfterPreproc,
    /// Restarted for execution in the mid-layer.
    Restarted,
    /// Mid-layer produced the response; `tgt_cmd_done` is owed on free.
    Processed,
    /// Synthetic request carrying an async event notification.
    Aen,
    /// Parked because the connection is being reinstated.
    ReinstPending,
    /// Finished outside the mid-layer (preliminary completion).
    PrelimDone,
}

/// The raw PDU attached to a command: fixed BHS plus the variable tail
/// sizes. Typed access goes through zerocopy views over `bhs`.
#[derive(Debug, Clone)]
pub struct PduBuf {
    pub bhs: [u8; HEADER_LEN],
    pub ahs: Bytes,
    /// DataSegmentLength as claimed by the header (excludes padding).
    pub datasize: u32,
}

impl Default for PduBuf {
    fn default() -> Self {
        Self {
            bhs: [0u8; HEADER_LEN],
            ahs: Bytes::default(),
            datasize: 0,
        }
    }
}

impl PduBuf {
    #[inline]
    pub fn opcode(&self) -> Option<Opcode> {
        BhsOpcode::try_from(self.bhs[0]).ok().map(|b| b.opcode)
    }

    #[inline]
    pub fn is_immediate(&self) -> bool {
        self.bhs[0] & 0x40 != 0
    }

    #[inline]
    pub fn flags_byte(&self) -> u8 {
        self.bhs[1]
    }

    #[inline]
    pub fn fin(&self) -> bool {
        self.bhs[1] & 0x80 != 0
    }

    #[inline]
    fn be32(&self, off: usize) -> u32 {
        u32::from_be_bytes([
            self.bhs[off],
            self.bhs[off + 1],
            self.bhs[off + 2],
            self.bhs[off + 3],
        ])
    }

    #[inline]
    fn set_be32(&mut self, off: usize, v: u32) {
        self.bhs[off..off + 4].copy_from_slice(&v.to_be_bytes());
    }

    #[inline]
    pub fn lun(&self) -> u64 {
        u64::from_be_bytes(self.bhs[8..16].try_into().unwrap_or_default())
    }

    /// ITT is kept in initiator byte order on the wire and compared as an
    /// opaque value, so no conversion here.
    #[inline]
    pub fn itt(&self) -> u32 {
        self.be32(16)
    }

    /// ITT bytes as the native-endian value the zerocopy models store,
    /// for echoing into response headers verbatim.
    #[inline]
    pub fn itt_raw(&self) -> u32 {
        u32::from_ne_bytes([self.bhs[16], self.bhs[17], self.bhs[18], self.bhs[19]])
    }

    #[inline]
    pub fn ttt(&self) -> u32 {
        self.be32(20)
    }

    /// CmdSN of requests, StatSN slot of responses (bytes 24..28).
    #[inline]
    pub fn sn(&self) -> u32 {
        self.be32(24)
    }

    #[inline]
    pub fn set_sn(&mut self, v: u32) {
        self.set_be32(24, v);
    }

    /// ExpStatSN of requests, ExpCmdSN slot of responses (bytes 28..32).
    #[inline]
    pub fn exp_sn(&self) -> u32 {
        self.be32(28)
    }

    #[inline]
    pub fn set_exp_sn(&mut self, v: u32) {
        self.set_be32(28, v);
    }

    #[inline]
    pub fn set_max_sn(&mut self, v: u32) {
        self.set_be32(32, v);
    }

    /// Expected Data Transfer Length field of a SCSI command BHS.
    #[inline]
    pub fn data_len_field(&self) -> u32 {
        self.be32(20)
    }

    /// BufferOffset field of a Data-Out/Data-In BHS.
    #[inline]
    pub fn buffer_offset(&self) -> u32 {
        self.be32(40)
    }

    #[inline]
    pub fn ahs_len(&self) -> usize {
        (self.bhs[4] as usize) * 4
    }

    #[inline]
    pub fn data_len(&self) -> usize {
        u32::from_be_bytes([0, self.bhs[5], self.bhs[6], self.bhs[7]]) as usize
    }

    #[inline]
    pub fn set_data_len(&mut self, len: u32) {
        let be = len.to_be_bytes();
        self.bhs[5] = be[1];
        self.bhs[6] = be[2];
        self.bhs[7] = be[3];
    }

    /// Typed immutable view over the BHS.
    #[inline]
    pub fn view<T>(&self) -> anyhow::Result<&T>
    where T: ZeroCopyType {
        T::ref_from_bytes(self.bhs.as_slice())
            .map_err(|e| anyhow::anyhow!("{}", e.to_string()))
    }

    /// Typed mutable view over the BHS.
    #[inline]
    pub fn view_mut<T>(&mut self) -> anyhow::Result<&mut T>
    where T: ZeroCopyType {
        T::mut_from_bytes(self.bhs.as_mut_slice())
            .map_err(|e| anyhow::anyhow!("{}", e.to_string()))
    }
}

/// Mutable command state. One lock per command; critical sections are
/// short and never nest with another command's lock except parent-first.
#[derive(Default)]
pub struct CmndInner {
    pub pdu: PduBuf,
    pub state: CmndState,
    pub prelim: PrelimFlags,

    pub scsi_cmd: Option<Arc<ScsiCmd>>,
    pub scsi_aen: Option<ScsiAen>,

    /// Expected read byte count (residual accounting on responses).
    pub read_size: u32,
    /// Assembled write payload of a request.
    pub buf: BytesMut,
    /// Capacity of the response/request data buffer.
    pub bufflen: u32,
    /// Response payload; Data-In responses slice this.
    pub resp_data: Bytes,
    /// Offset of this Data-In slice inside `resp_data`.
    pub resp_offset: u32,

    pub r2t_len_to_receive: u32,
    pub r2t_len_to_send: u32,
    pub outstanding_r2t: u32,
    pub r2t_sn: u32,
    pub target_task_tag: u32,

    /// Parent request of a Data-Out PDU, resolved via the data-wait hash.
    pub cmd_req: Option<Arc<Cmnd>>,
    /// Data digest value received for this PDU, checked in pre_exec.
    pub wire_ddigest: Option<u32>,
    pub rx_ddigest_cmd_list: Vec<Arc<Cmnd>>,

    pub hashed: bool,
    pub pending: bool,
    pub on_write_list: bool,
    pub write_processing_started: bool,
    pub on_write_timeout_list: bool,
    pub dec_active_cmnds: bool,
    pub should_close_conn: bool,
    pub should_close_all_conn: bool,
    pub force_cleanup_done: bool,
    pub release_called: bool,

    pub main_rsp: Option<Arc<Cmnd>>,
    pub rsp_cmd_list: Vec<Weak<Cmnd>>,
}

/// One iSCSI PDU lifecycle: either a request owned by the connection's
/// command list, or a response owned by its parent request.
///
/// `Arc` strong counts are the reference counts: every list membership
/// holds a clone, so a command that reaches zero references is off every
/// list by construction and is freed exactly once by `Drop`.
pub struct Cmnd {
    conn: Arc<Connection>,
    parent: Option<Arc<Cmnd>>,
    inner: Mutex<CmndInner>,
    /// Outstanding transport references to this command's payload.
    net_ref_cnt: AtomicU32,
}

impl Cmnd {
    pub fn alloc(conn: &Arc<Connection>, parent: Option<&Arc<Cmnd>>) -> Arc<Cmnd> {
        let cmnd = Arc::new(Cmnd {
            conn: Arc::clone(conn),
            parent: parent.map(Arc::clone),
            inner: Mutex::new(CmndInner {
                target_task_tag: RESERVED_TAG,
                ..Default::default()
            }),
            net_ref_cnt: AtomicU32::new(0),
        });

        if parent.is_none() {
            conn.cmd_list
                .lock()
                .expect("cmd_list lock poisoned")
                .push(Arc::clone(&cmnd));
        }

        cmnd
    }

    /// Allocate a response and register it with its parent.
    pub fn alloc_rsp(parent: &Arc<Cmnd>) -> Arc<Cmnd> {
        let rsp = Cmnd::alloc(&parent.conn, Some(parent));
        parent.inner().rsp_cmd_list.push(Arc::downgrade(&rsp));
        rsp
    }

    /// Allocate a response that is transmitted at request-release time.
    pub fn alloc_main_rsp(parent: &Arc<Cmnd>) -> Arc<Cmnd> {
        let rsp = Cmnd::alloc_rsp(parent);
        let mut inner = parent.inner();
        debug_assert!(inner.main_rsp.is_none());
        inner.main_rsp = Some(Arc::clone(&rsp));
        rsp
    }

    #[inline]
    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    #[inline]
    pub fn parent(&self) -> Option<&Arc<Cmnd>> {
        self.parent.as_ref()
    }

    #[inline]
    pub fn is_request(&self) -> bool {
        self.parent.is_none()
    }

    #[inline]
    pub fn inner(&self) -> MutexGuard<'_, CmndInner> {
        self.inner.lock().expect("cmnd lock poisoned")
    }

    #[inline]
    pub fn opcode(&self) -> Option<Opcode> {
        self.inner().pdu.opcode()
    }

    #[inline]
    pub fn itt(&self) -> u32 {
        self.inner().pdu.itt()
    }

    #[inline]
    pub fn is_immediate(&self) -> bool {
        self.inner().pdu.is_immediate()
    }

    #[inline]
    pub fn net_ref_get(&self) {
        self.net_ref_cnt.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn net_ref_put(&self) {
        let prev = self.net_ref_cnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    #[inline]
    pub fn net_refs(&self) -> u32 {
        self.net_ref_cnt.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Cmnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner();
        f.debug_struct("Cmnd")
            .field("opcode", &inner.pdu.opcode())
            .field("itt", &format_args!("{:#x}", inner.pdu.itt()))
            .field("request", &self.parent.is_none())
            .field("state", &inner.state)
            .field("prelim", &inner.prelim)
            .finish()
    }
}

/// Release a request after its RX-side processing finished.
///
/// The hash entry must go before the response hits the wire: a delayed
/// unhash can race an initiator reusing the ITT, which would get the new
/// command rejected as a duplicate.
pub fn req_cmnd_release(req: &Arc<Cmnd>) {
    debug_assert!(req.is_request());

    let (hashed, main_rsp, ddigest_helpers, dec_active, aborted) = {
        let mut inner = req.inner();
        debug_assert!(!inner.release_called);
        debug_assert!(!inner.pending);
        inner.release_called = true;

        let dec = inner.dec_active_cmnds;
        inner.dec_active_cmnds = false;
        (
            inner.hashed,
            inner.main_rsp.take(),
            std::mem::take(&mut inner.rx_ddigest_cmd_list),
            dec,
            inner.prelim.contains(PrelimFlags::ABORTED),
        )
    };

    if aborted {
        debug!(itt = format_args!("{:#x}", req.itt()), "releasing aborted request");
    }

    if hashed {
        req.conn().session().remove_data_wait_hash(req);
    }

    if let Some(rsp) = main_rsp {
        tx::cmnd_init_write(&rsp, true);
    }

    drop(ddigest_helpers);

    if dec_active {
        req.conn().session().dec_active_cmnds();
    }

    req_del_from_write_timeout_list(req);
    req.conn().remove_from_cmd_list(req);
}

/// Forced variant used on aborts and connection errors: additionally
/// strips this request's queued responses off the write list so nothing
/// referencing it stays queued for transmission.
pub fn req_cmnd_release_force(req: &Arc<Cmnd>) {
    debug_assert!(req.is_request());

    let stripped = {
        let mut write_list = req.conn().write_list_lock();
        let mut kept = std::collections::VecDeque::with_capacity(write_list.len());
        let mut stripped = Vec::new();
        while let Some(rsp) = write_list.pop_front() {
            let is_ours = rsp
                .parent()
                .is_some_and(|parent| Arc::ptr_eq(parent, req));
            if is_ours && !rsp.inner().write_processing_started {
                rsp.inner().on_write_list = false;
                stripped.push(rsp);
            } else {
                kept.push_back(rsp);
            }
        }
        *write_list = kept;
        stripped
    };
    for rsp in &stripped {
        debug!(rsp = ?rsp, "dropping queued response of aborted request");
        rsp.inner().force_cleanup_done = true;
    }
    drop(stripped);

    {
        let mut inner = req.inner();
        if let Some(main_rsp) = inner.main_rsp.take() {
            drop(inner);
            drop(main_rsp);
        }
    }

    req_cmnd_release(req);
}

/// Release a response that will never be transmitted.
pub fn rsp_cmnd_release(rsp: Arc<Cmnd>) {
    debug_assert!(!rsp.is_request());
    drop(rsp);
}

impl Drop for Cmnd {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().expect("cmnd lock poisoned");

        if self.parent.is_some() {
            // Responses only borrow mid-layer state through the parent.
            return;
        }

        debug_assert!(!inner.hashed);
        debug_assert!(!inner.on_write_list);
        debug_assert_eq!(self.net_ref_cnt.load(Ordering::Acquire), 0);

        let backend = self.conn.session().backend();
        if let Some(scsi_cmd) = inner.scsi_cmd.take() {
            match inner.state {
                CmndState::Processed => {
                    backend.tgt_cmd_done(&scsi_cmd);
                },
                CmndState::AfterPreproc => {
                    // The mid-layer still owns preprocessing state; a
                    // fatal restart returns the command to it.
                    inner.state = CmndState::Restarted;
                    backend.restart_cmd(
                        &scsi_cmd,
                        crate::target::backend::PreprocessStatus::ErrorFatal,
                    );
                },
                CmndState::PrelimDone => {},
                other => {
                    warn!(state = ?other, "request freed in unexpected state");
                },
            }
        } else if let Some(aen) = inner.scsi_aen.take() {
            debug_assert_eq!(inner.state, CmndState::Aen);
            backend.aen_done(&aen);
        }

        if inner.dec_active_cmnds {
            self.conn.session().dec_active_cmnds();
        }
    }
}
