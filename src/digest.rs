// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! CRC32C digest hooks for the receive and transmit pipelines.
//!
//! Header digests are verified inline by the read loop; data digests of
//! multi-PDU writes are deferred and checked just before the command is
//! handed to the SCSI mid-layer (`pre_exec`), so a late CRC mismatch can
//! still fail the command with sense instead of tearing down the
//! connection.

use anyhow::{Result, bail};

use crate::models::data_format::{compute_data_digest, compute_header_digest};

/// Verify the HeaderDigest of a received BHS+AHS pair.
pub fn digest_rx_header(bhs: &[u8], ahs: &[u8], wire_digest: u32) -> Result<()> {
    let want = compute_header_digest(bhs, ahs);
    if want != wire_digest {
        bail!("HeaderDigest mismatch: got {wire_digest:#010x}, want {want:#010x}");
    }
    Ok(())
}

/// Verify the deferred DataDigest of a received data segment.
pub fn digest_rx_data(data: &[u8], wire_digest: u32) -> Result<()> {
    let want = compute_data_digest(data);
    if want != wire_digest {
        bail!("DataDigest mismatch: got {wire_digest:#010x}, want {want:#010x}");
    }
    Ok(())
}

/// Compute the DataDigest for an outgoing data segment.
pub fn digest_tx_data(data: &[u8]) -> u32 {
    compute_data_digest(data)
}
