//! The per-connection iSCSI target protocol engine.
//!
//! Responsibilities are split the way the concurrency model demands:
//! everything mutated during PDU reception (sequence numbers, the
//! data-wait hash, R2T accounting) belongs to the single read task of a
//! connection; the write task only consumes the write list; the SCSI
//! mid-layer calls back through [`backend`].

// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Async event notifications and keepalive NOP-In.
pub mod aen;
/// SCSI mid-layer adapter: the backend trait and core-side callbacks.
pub mod backend;
/// Command objects, ownership graph, release paths.
pub mod cmnd;
/// Connection state, lists, task wiring.
pub mod conn;
/// Ready-To-Transfer flow control for solicited writes.
pub mod r2t;
/// Receive pipeline: PDU classification and dispatch.
pub mod rx;
/// Session state: sequence numbers, data-wait hash, reorder queue.
pub mod session;
/// Task management: aborts, resets, delayed responses.
pub mod task_mgmt;
/// Write-progress and TM data-wait timeouts.
pub mod timeout;
/// Transmit pipeline: SN stamping, framing, slicing.
pub mod tx;
