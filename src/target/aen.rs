// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Asynchronous event notifications and the keepalive ping.
//!
//! Both ride on synthetic requests: a fake request is allocated, given
//! a `main_rsp` carrying the Async Message or NOP-In, and released,
//! which submits the response through the ordinary write pipeline.

use std::sync::{Arc, atomic::Ordering};

use tracing::{debug, error};

use crate::{
    models::{async_msg::response::AsyncMessage, nop::response::NopInResponse},
    target::{
        backend::ScsiAen,
        cmnd::{Cmnd, CmndState, RESERVED_TAG, req_cmnd_release},
        conn::Connection,
        session::Session,
    },
};

/// Report a SCSI async event to the initiator.
///
/// Returns false when no usable connection exists; the caller keeps
/// ownership of the event in that case.
pub fn report_aen(sess: &Arc<Session>, aen: ScsiAen) -> bool {
    let conns = sess.conns();
    let Some(conn) = conns
        .iter()
        .rev()
        .find(|c| !c.is_closing() && !c.is_reinstating())
    else {
        error!("unable to find alive conn for AEN");
        return false;
    };

    let fake_req = Cmnd::alloc(conn, None);
    let rsp = Cmnd::alloc_main_rsp(&fake_req);

    {
        let mut inner = fake_req.inner();
        inner.state = CmndState::Aen;
        inner.scsi_aen = Some(aen.clone());
    }

    {
        let mut inner = rsp.inner();
        let mut hdr = AsyncMessage::default_hdr();
        hdr.lun.set(aen.lun);
        hdr.all_ones.set(RESERVED_TAG);
        hdr.async_event = AsyncMessage::SCSI_EVENT;
        inner
            .pdu
            .bhs
            .copy_from_slice(zerocopy::IntoBytes::as_bytes(&hdr));

        // Sense travels length-prefixed in the data segment.
        let mut payload = Vec::with_capacity(2 + aen.sense.len());
        payload.extend_from_slice(&(aen.sense.len() as u16).to_be_bytes());
        payload.extend_from_slice(&aen.sense);
        inner.pdu.datasize = payload.len() as u32;
        inner.bufflen = payload.len() as u32;
        inner.resp_data = payload.into();
    }

    req_cmnd_release(&fake_req);
    true
}

/// Send a keepalive NOP-In and park it until the initiator echoes the
/// TTT back in a NOP-Out.
pub fn send_nop_in(conn: &Arc<Connection>) {
    let req = Cmnd::alloc(conn, None);
    let rsp = Cmnd::alloc_main_rsp(&req);

    let ttt = loop {
        let ttt = conn.nop_in_ttt.fetch_add(1, Ordering::AcqRel);
        if ttt != RESERVED_TAG {
            break ttt;
        }
    };

    {
        let mut inner = rsp.inner();
        let mut hdr = NopInResponse::default_hdr();
        hdr.initiator_task_tag = RESERVED_TAG;
        hdr.target_task_tag.set(ttt);
        inner
            .pdu
            .bhs
            .copy_from_slice(zerocopy::IntoBytes::as_bytes(&hdr));
    }

    debug!(ttt = format_args!("{ttt:#x}"), "sending Nop-In request");
    conn.nop_req_list
        .lock()
        .expect("nop_req_list lock poisoned")
        .push(Arc::clone(&rsp));

    req_cmnd_release(&req);
}

/// Periodic keepalive driver for one connection.
pub async fn nop_in_loop(conn: &Arc<Connection>, interval_secs: u64) {
    let mut ticker =
        tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = conn.cancelled().cancelled() => return,
            _ = ticker.tick() => {},
        }
        if conn.is_closing() {
            return;
        }
        send_nop_in(conn);
    }
}
