// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Write-progress supervision.
//!
//! A request that solicited data, and every queued response, must make
//! progress within `RspTimeout`; while task management is active on the
//! connection the window tightens to `TmDataWaitTimeout` (plus a small
//! scheduling slack). Expiry closes the connection and lets the
//! connection-lifecycle teardown clean up.

use std::sync::{Arc, Weak, atomic::Ordering};

use tokio::time::{Duration, Instant};
use tracing::error;

use crate::target::{cmnd::Cmnd, conn::Connection};

/// Extra margin on top of the TM data-wait window.
pub const SCHED_SLACK: Duration = Duration::from_secs(1);

pub struct WriteTimeoutEntry {
    pub cmnd: Weak<Cmnd>,
    pub start: Instant,
}

pub fn req_add_to_write_timeout_list(req: &Arc<Cmnd>) {
    let conn = Arc::clone(req.conn());

    {
        let mut inner = req.inner();
        if inner.on_write_timeout_list {
            return;
        }
        inner.on_write_timeout_list = true;
    }

    conn.write_timeout_list
        .lock()
        .expect("write_timeout_list lock poisoned")
        .push_back(WriteTimeoutEntry {
            cmnd: Arc::downgrade(req),
            start: Instant::now(),
        });
    conn.timer_kick.notify_one();
}

pub fn req_del_from_write_timeout_list(req: &Arc<Cmnd>) {
    let conn = Arc::clone(req.conn());

    {
        let inner = req.inner();
        if !inner.on_write_timeout_list {
            return;
        }
    }

    {
        let mut list = conn
            .write_timeout_list
            .lock()
            .expect("write_timeout_list lock poisoned");
        list.retain(|entry| {
            entry
                .cmnd
                .upgrade()
                .is_some_and(|c| !Arc::ptr_eq(&c, req))
        });
    }

    req.inner().on_write_timeout_list = false;
}

/// Pull the response timer in for an abort: it must fire no later than
/// now + TmDataWaitTimeout + slack.
pub fn arm_tm_timer(conn: &Arc<Connection>) {
    let tm_wait = conn.session().cfg().target.timeouts.tm_data_wait_timeout();
    let deadline = Instant::now() + tm_wait + SCHED_SLACK;

    let mut timer = conn.rsp_timer.lock().expect("rsp_timer lock poisoned");
    let rearm = timer.is_none_or(|cur| cur > deadline);
    if rearm {
        *timer = Some(deadline);
    }
    drop(timer);

    if rearm {
        conn.timer_kick.notify_one();
    }
}

fn effective_timeout(conn: &Arc<Connection>) -> Duration {
    let timeouts = &conn.session().cfg().target.timeouts;
    if conn.conn_tm_active.load(Ordering::Acquire) {
        timeouts.tm_data_wait_timeout() + SCHED_SLACK
    } else {
        timeouts.rsp_timeout()
    }
}

fn next_deadline(conn: &Arc<Connection>) -> Option<Instant> {
    let timeout = effective_timeout(conn);

    let head = {
        let mut list = conn
            .write_timeout_list
            .lock()
            .expect("write_timeout_list lock poisoned");
        list.retain(|entry| entry.cmnd.strong_count() > 0);
        list.front().map(|entry| entry.start + timeout)
    };

    let armed = *conn.rsp_timer.lock().expect("rsp_timer lock poisoned");

    match (head, armed) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// The per-connection response timer task.
pub async fn rsp_timer_loop(conn: &Arc<Connection>) {
    loop {
        if conn.is_closing() {
            return;
        }

        let Some(deadline) = next_deadline(conn) else {
            tokio::select! {
                _ = conn.cancelled().cancelled() => return,
                _ = conn.timer_kick.notified() => continue,
            }
        };

        tokio::select! {
            _ = conn.cancelled().cancelled() => return,
            _ = conn.timer_kick.notified() => continue,
            _ = tokio::time::sleep_until(deadline) => {},
        }

        // Consume an armed one-shot deadline once it fired.
        {
            let mut timer = conn.rsp_timer.lock().expect("rsp_timer lock poisoned");
            if timer.is_some_and(|t| t <= Instant::now()) {
                *timer = None;
            }
        }

        let timeout = effective_timeout(conn);
        let overdue = {
            let mut list = conn
                .write_timeout_list
                .lock()
                .expect("write_timeout_list lock poisoned");
            list.retain(|entry| entry.cmnd.strong_count() > 0);
            list.front()
                .is_some_and(|entry| entry.start + timeout <= Instant::now())
        };

        if overdue {
            error!(
                cid = conn.cid,
                "no TX progress within {:?}, closing connection", timeout
            );
            conn.mark_closed();
            return;
        }
    }
}
