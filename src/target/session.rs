// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicI32, AtomicU32, Ordering},
    },
};

use dashmap::DashMap;
use tracing::{debug, error};

use crate::{
    cfg::config::Config,
    target::{
        backend::ScsiBackend,
        cmnd::{Cmnd, RESERVED_TAG},
        conn::Connection,
        rx::RxError,
    },
};

/// Serial-number arithmetic (RFC 1982): `a` precedes `b`.
#[inline]
pub fn sn_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `v` lies in the window `[lo, hi]` in serial arithmetic.
#[inline]
pub fn sn_between(v: u32, lo: u32, hi: u32) -> bool {
    hi.wrapping_sub(lo) >= v.wrapping_sub(lo)
}

/// Flow-control parameters the session runs with, fixed at login time.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub max_recv_data_length: u32,
    pub max_xmit_data_length: u32,
    pub first_burst_length: u32,
    pub max_burst_length: u32,
    pub max_outstanding_r2t: u32,
    pub initial_r2t: bool,
    pub immediate_data: bool,
    pub queued_cmnds: u32,
}

impl SessionParams {
    pub fn from_config(cfg: &Config) -> Self {
        let s = &cfg.target.session;
        SessionParams {
            max_recv_data_length: s.max_recv_data_segment_length,
            max_xmit_data_length: s.max_xmit_data_segment_length,
            first_burst_length: s.first_burst_length,
            max_burst_length: s.max_burst_length,
            max_outstanding_r2t: s.max_outstanding_r2t,
            initial_r2t: s.initial_r2t.as_bool(),
            immediate_data: s.immediate_data.as_bool(),
            queued_cmnds: s.queued_cmnds,
        }
    }
}

/// Sequence-number state, one lock per session.
///
/// Only the read task advances `exp_cmd_sn`; the write task reads it when
/// stamping responses, which is why these share a lock instead of being
/// independent atomics.
#[derive(Default)]
pub struct SnState {
    pub exp_cmd_sn: u32,
    /// Count of task-management functions whose effects are still settling.
    pub tm_active: i32,
    /// CmdSN of the most recent TM request.
    pub tm_sn: u32,
    /// At most one delayed TM response per session.
    pub tm_rsp: Option<Arc<Cmnd>>,
    /// Commands held for CmdSN reorder, sorted by CmdSN.
    pub pending_list: VecDeque<Arc<Cmnd>>,
}

/// The target-side session: a set of connections (one, without MC/S)
/// sharing sequence-number state and the write data-wait hash.
pub struct Session {
    cfg: Arc<Config>,
    pub params: SessionParams,
    pub initiator_name: String,

    pub(crate) sn: Mutex<SnState>,
    /// ITT -> write request awaiting Data-Out PDUs.
    data_wait_hash: DashMap<u32, Arc<Cmnd>>,
    next_ttt: AtomicU32,
    active_cmds: AtomicI32,

    conns: Mutex<Vec<Arc<Connection>>>,
    target: Weak<Target>,
    backend: Arc<dyn ScsiBackend>,
}

impl Session {
    pub fn new(
        target: &Arc<Target>,
        cfg: Arc<Config>,
        backend: Arc<dyn ScsiBackend>,
        initiator_name: impl Into<String>,
        exp_cmd_sn: u32,
    ) -> Arc<Session> {
        let sess = Arc::new(Session {
            params: SessionParams::from_config(&cfg),
            cfg,
            initiator_name: initiator_name.into(),
            sn: Mutex::new(SnState {
                exp_cmd_sn,
                ..Default::default()
            }),
            data_wait_hash: DashMap::new(),
            next_ttt: AtomicU32::new(1),
            active_cmds: AtomicI32::new(0),
            conns: Mutex::new(Vec::new()),
            target: Arc::downgrade(target),
            backend,
        });
        target
            .sessions
            .lock()
            .expect("sessions lock poisoned")
            .push(Arc::clone(&sess));
        sess
    }

    #[inline]
    pub fn cfg(&self) -> &Arc<Config> {
        &self.cfg
    }

    #[inline]
    pub fn backend(&self) -> &Arc<dyn ScsiBackend> {
        &self.backend
    }

    #[inline]
    pub fn target(&self) -> Option<Arc<Target>> {
        self.target.upgrade()
    }

    #[inline]
    pub(crate) fn sn_lock(&self) -> MutexGuard<'_, SnState> {
        self.sn.lock().expect("sn lock poisoned")
    }

    pub fn exp_cmd_sn(&self) -> u32 {
        self.sn_lock().exp_cmd_sn
    }

    pub(crate) fn add_conn(&self, conn: &Arc<Connection>) {
        self.conns
            .lock()
            .expect("conns lock poisoned")
            .push(Arc::clone(conn));
    }

    pub(crate) fn remove_conn(&self, conn: &Arc<Connection>) {
        let mut conns = self.conns.lock().expect("conns lock poisoned");
        if let Some(pos) = conns.iter().position(|c| Arc::ptr_eq(c, conn)) {
            conns.remove(pos);
        }
    }

    pub fn conns(&self) -> Vec<Arc<Connection>> {
        self.conns.lock().expect("conns lock poisoned").clone()
    }

    /// Advertised command window: `MaxCmdSN = ExpCmdSN + allowed_cmds`.
    /// Can legitimately go to -1 when the queue is saturated.
    pub(crate) fn allowed_cmds(&self) -> i32 {
        let queued = self.params.queued_cmnds as i32;
        let active = self.active_cmds.load(Ordering::Acquire);
        (queued - active - 1).max(-1)
    }

    #[inline]
    pub(crate) fn inc_active_cmnds(&self) {
        self.active_cmds.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn dec_active_cmnds(&self) {
        let prev = self.active_cmds.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            error!("active_cmds went negative ({})", prev - 1);
        }
    }

    #[inline]
    pub fn active_cmds(&self) -> i32 {
        self.active_cmds.load(Ordering::Acquire)
    }

    /// Allocate the next target transfer tag. Not compatible with MC/S.
    pub(crate) fn next_ttt(&self) -> u32 {
        loop {
            let ttt = self.next_ttt.fetch_add(1, Ordering::AcqRel);
            if ttt != RESERVED_TAG {
                return ttt;
            }
        }
    }

    /// Register a write request so Data-Out PDUs can find it by ITT.
    ///
    /// The ITT/buffer-offset pair alone would be sufficient, but R2T PDUs
    /// must carry a TTT and some initiators rely on it, so one is
    /// allocated here.
    pub(crate) fn insert_data_wait_hash(&self, cmnd: &Arc<Cmnd>) -> Result<(), RxError> {
        let itt = {
            let mut inner = cmnd.inner();
            if inner.hashed {
                // Can happen for preliminary completed commands.
                return Ok(());
            }
            inner.target_task_tag = self.next_ttt();
            inner.pdu.itt()
        };

        if itt == RESERVED_TAG {
            error!("ITT is RESERVED_TAG");
            return Err(RxError::ProtocolError);
        }

        match self.data_wait_hash.entry(itt) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                error!(itt = format_args!("{itt:#x}"), "task already in progress");
                Err(RxError::TaskInProgress)
            },
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(itt = format_args!("{itt:#x}"), "adding cmnd to data-wait hash");
                slot.insert(Arc::clone(cmnd));
                cmnd.inner().hashed = true;
                Ok(())
            },
        }
    }

    pub(crate) fn find_data_wait_hash(&self, itt: u32) -> Option<Arc<Cmnd>> {
        self.data_wait_hash.get(&itt).map(|e| Arc::clone(&e))
    }

    pub(crate) fn remove_data_wait_hash(&self, cmnd: &Arc<Cmnd>) {
        let itt = cmnd.inner().pdu.itt();
        let removed = self
            .data_wait_hash
            .remove_if(&itt, |_, v| Arc::ptr_eq(v, cmnd));
        if removed.is_some() {
            cmnd.inner().hashed = false;
        } else {
            error!(itt = format_args!("{itt:#x}"), "cmnd not found in data-wait hash");
        }
    }

    /// Number of data-wait entries; test and diagnostics hook.
    pub fn data_wait_entries(&self) -> usize {
        self.data_wait_hash.len()
    }
}

/// The portal-wide registry of sessions; the enumeration anchor for
/// target- and LU-scoped aborts.
#[derive(Default)]
pub struct Target {
    pub sessions: Mutex<Vec<Arc<Session>>>,
}

impl Target {
    pub fn new() -> Arc<Target> {
        Arc::new(Target::default())
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().expect("sessions lock poisoned").clone()
    }

    pub fn remove_session(&self, sess: &Arc<Session>) {
        let mut sessions = self.sessions.lock().expect("sessions lock poisoned");
        if let Some(pos) = sessions.iter().position(|s| Arc::ptr_eq(s, sess)) {
            sessions.remove(pos);
        }
    }
}
