// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use tokio::{net::TcpStream, sync::Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cfg::{config::Config, enums::Digest},
    target::{
        aen, cmnd::Cmnd, r2t, rx, session::Session, task_mgmt, timeout,
        timeout::WriteTimeoutEntry, tx,
    },
};

/// One TCP connection of a session.
///
/// A connection is driven by three tasks: the read task (sole mutator of
/// RX-side state), the write task (sole consumer of `write_list`) and the
/// response timer. Producers signal the write task through `wr_notify`.
pub struct Connection {
    session: Arc<Session>,
    pub cid: u16,

    /// All live requests of this connection.
    pub(crate) cmd_list: Mutex<Vec<Arc<Cmnd>>>,
    /// Responses queued for transmission.
    write_list: Mutex<VecDeque<Arc<Cmnd>>>,
    /// Requests that must observe TX/data progress before the timer fires.
    pub(crate) write_timeout_list: Mutex<VecDeque<WriteTimeoutEntry>>,
    /// Outstanding keepalive NOP-Ins, matched by TTT.
    pub(crate) nop_req_list: Mutex<Vec<Arc<Cmnd>>>,

    /// Next StatSN to stamp.
    pub(crate) stat_sn: AtomicU32,
    /// Highest StatSN acknowledged by the initiator.
    pub(crate) exp_stat_sn: AtomicU32,
    /// TTT source for keepalive NOP-Ins.
    pub(crate) nop_in_ttt: AtomicU32,

    /// Set while an abort touched a command of this connection.
    pub(crate) conn_tm_active: AtomicBool,
    reinstating: AtomicBool,

    wr_notify: Notify,
    rx_resume: Notify,
    /// Deadline override armed by aborts; consumed by the timer task.
    pub(crate) rsp_timer: Mutex<Option<tokio::time::Instant>>,
    pub(crate) timer_kick: Notify,

    cancel: CancellationToken,

    pub(crate) hdigest: bool,
    pub(crate) ddigest: bool,
}

impl Connection {
    pub fn new(session: &Arc<Session>, cid: u16, cfg: &Config) -> Arc<Connection> {
        let conn = Arc::new(Connection {
            session: Arc::clone(session),
            cid,
            cmd_list: Mutex::new(Vec::new()),
            write_list: Mutex::new(VecDeque::new()),
            write_timeout_list: Mutex::new(VecDeque::new()),
            nop_req_list: Mutex::new(Vec::new()),
            stat_sn: AtomicU32::new(0),
            exp_stat_sn: AtomicU32::new(0),
            nop_in_ttt: AtomicU32::new(0),
            conn_tm_active: AtomicBool::new(false),
            reinstating: AtomicBool::new(false),
            wr_notify: Notify::new(),
            rx_resume: Notify::new(),
            rsp_timer: Mutex::new(None),
            timer_kick: Notify::new(),
            cancel: CancellationToken::new(),
            hdigest: cfg.target.integrity.header_digest == Digest::CRC32C,
            ddigest: cfg.target.integrity.data_digest == Digest::CRC32C,
        });
        session.add_conn(&conn);
        conn
    }

    /// Wire the connection to an accepted socket and start its tasks.
    pub fn spawn(self: &Arc<Self>, stream: TcpStream) -> anyhow::Result<()> {
        stream.set_nodelay(true)?;
        let (r, w) = stream.into_split();

        let rx_conn = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = rx::read_loop(&rx_conn, r).await {
                warn!("read loop exited: {e}");
            }
            rx_conn.teardown();
        });

        let tx_conn = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = tx::write_loop(&tx_conn, w).await {
                warn!("write loop exited: {e}");
            }
        });

        let timer_conn = Arc::clone(self);
        tokio::spawn(async move {
            timeout::rsp_timer_loop(&timer_conn).await;
        });

        let nop_secs = self
            .session
            .cfg()
            .target
            .timeouts
            .nop_in_interval_secs;
        if nop_secs > 0 {
            let nop_conn = Arc::clone(self);
            tokio::spawn(async move {
                aen::nop_in_loop(&nop_conn, nop_secs).await;
            });
        }

        Ok(())
    }

    #[inline]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    #[inline]
    pub fn mark_closed(&self) {
        if !self.cancel.is_cancelled() {
            info!(cid = self.cid, "closing connection");
            self.cancel.cancel();
            self.wr_notify.notify_one();
            self.timer_kick.notify_one();
        }
    }

    #[inline]
    pub fn is_closing(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[inline]
    pub fn cancelled(&self) -> &CancellationToken {
        &self.cancel
    }

    #[inline]
    pub fn is_reinstating(&self) -> bool {
        self.reinstating.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_reinstating(&self, on: bool) {
        self.reinstating.store(on, Ordering::Release);
    }

    #[inline]
    pub fn wake_wr(&self) {
        self.wr_notify.notify_one();
    }

    pub async fn wait_wr(&self) {
        self.wr_notify.notified().await;
    }

    /// Signal the read task that delayed preprocessing finished.
    #[inline]
    pub fn make_rd_active(&self) {
        self.rx_resume.notify_one();
    }

    pub async fn wait_rd_active(&self) {
        self.rx_resume.notified().await;
    }

    #[inline]
    pub(crate) fn write_list_lock(&self) -> MutexGuard<'_, VecDeque<Arc<Cmnd>>> {
        self.write_list.lock().expect("write_list lock poisoned")
    }

    pub(crate) fn remove_from_cmd_list(&self, req: &Arc<Cmnd>) {
        let mut list = self.cmd_list.lock().expect("cmd_list lock poisoned");
        if let Some(pos) = list.iter().position(|c| Arc::ptr_eq(c, req)) {
            list.remove(pos);
        }
    }

    /// Pop the next queued response the way the write task would.
    /// Hook for in-process transports and test drivers.
    pub fn pop_queued_rsp(&self) -> Option<Arc<Cmnd>> {
        let mut list = self.write_list_lock();
        let head = list.pop_front();
        if let Some(rsp) = head.as_ref() {
            rsp.inner().write_processing_started = true;
        }
        head
    }

    /// Number of responses currently queued for transmission.
    pub fn queued_rsps(&self) -> usize {
        self.write_list_lock().len()
    }

    /// Locate a live request by ITT (TM abort path).
    pub fn find_cmnd_by_itt(&self, itt: u32) -> Option<Arc<Cmnd>> {
        let list = self.cmd_list.lock().expect("cmd_list lock poisoned");
        list.iter().find(|c| c.itt() == itt).map(Arc::clone)
    }

    /// Abort everything still alive on this connection.
    ///
    /// Commands waiting for Data-Out that will never arrive are failed
    /// here so the mid-layer does not hang on them.
    pub fn conn_abort(self: &Arc<Self>) {
        let nop_reqs = {
            let mut list = self.nop_req_list.lock().expect("nop_req_list lock poisoned");
            std::mem::take(&mut *list)
        };
        drop(nop_reqs);

        let cmds: Vec<Arc<Cmnd>> = {
            let list = self.cmd_list.lock().expect("cmd_list lock poisoned");
            list.clone()
        };
        for cmnd in cmds {
            task_mgmt::mark_cmnd_aborted(&cmnd);
            let waiting = cmnd.inner().r2t_len_to_receive != 0;
            if waiting {
                r2t::fail_data_waiting_cmnd(&cmnd);
            }
        }
    }

    /// Final drain once the read task stopped: abort in-flight commands,
    /// strip the write list and detach from the session.
    pub fn teardown(self: &Arc<Self>) {
        self.mark_closed();
        self.conn_abort();

        let queued = {
            let mut list = self.write_list_lock();
            let drained: Vec<Arc<Cmnd>> = list.drain(..).collect();
            drained
        };
        for rsp in &queued {
            rsp.inner().on_write_list = false;
        }
        drop(queued);

        self.session.remove_conn(self);
        // A session lives as long as its last connection.
        if self.session.conns().is_empty()
            && let Some(target) = self.session.target()
        {
            target.remove_session(&self.session);
        }
        self.session.backend().abort_all_tasks_sess();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("cid", &self.cid)
            .field("closing", &self.is_closing())
            .field("stat_sn", &self.stat_sn.load(Ordering::Relaxed))
            .finish()
    }
}

/// Close a connection on a fatal protocol violation.
#[inline]
pub fn mark_conn_closed(conn: &Arc<Connection>) {
    conn.mark_closed();
}
