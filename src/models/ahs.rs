// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Additional Header Segment (AHS) decoding, RFC 3720 §10.2.2.
//!
//! Each AHS starts with a 3-byte header (`AHSLength` u16 BE, `AHSType` u8)
//! followed by type-specific payload; the whole segment is padded to a
//! 4-byte boundary. Only the two types a SCSI command can carry are
//! understood here:
//!
//! * `0x01` is an extended CDB (CDB bytes past the 16 in the BHS)
//! * `0x02` is the expected bidirectional read data length

use anyhow::{Result, bail};
use bytes::Bytes;

pub const AHS_TYPE_EXTENDED_CDB: u8 = 0x01;
pub const AHS_TYPE_BIDI_READ_LENGTH: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ahs {
    /// CDB continuation: bytes 17.. of a long CDB (the first pad byte of
    /// the AHS payload is reserved and already stripped).
    ExtendedCdb(Bytes),
    /// Expected Read Data Transfer Length for bidirectional commands.
    BidiReadLength(u32),
    /// Unrecognized type, kept for diagnostics.
    Unknown { ahs_type: u8, data: Bytes },
}

/// Decode all AHS entries from the raw AHS area of a PDU.
pub fn decode_ahs(mut buf: &[u8]) -> Result<Vec<Ahs>> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 3 {
            bail!("truncated AHS header: {} bytes left", buf.len());
        }
        let ahs_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        let ahs_type = buf[2];

        // entry size = 3-byte header + payload, padded to 4
        let entry = (3 + ahs_len + 3) & !3usize;
        if buf.len() < entry {
            bail!(
                "truncated AHS entry: type 0x{ahs_type:02x}, need {entry}, have {}",
                buf.len()
            );
        }
        let payload = &buf[3..3 + ahs_len];

        out.push(match ahs_type {
            AHS_TYPE_EXTENDED_CDB => {
                if payload.is_empty() {
                    bail!("extended CDB AHS with empty payload");
                }
                // first payload byte is a reserved pad
                Ahs::ExtendedCdb(Bytes::copy_from_slice(&payload[1..]))
            },
            AHS_TYPE_BIDI_READ_LENGTH => {
                if payload.len() < 5 {
                    bail!("bidi read length AHS too short: {}", payload.len());
                }
                // payload = reserved byte + u32 BE read length
                Ahs::BidiReadLength(u32::from_be_bytes([
                    payload[1], payload[2], payload[3], payload[4],
                ]))
            },
            other => Ahs::Unknown {
                ahs_type: other,
                data: Bytes::copy_from_slice(payload),
            },
        });

        buf = &buf[entry..];
    }
    Ok(out)
}

/// Scan the AHS area for the bidirectional Expected Read Data Length.
pub fn bidi_read_length(ahs: &[u8]) -> Option<u32> {
    decode_ahs(ahs).ok()?.into_iter().find_map(|a| match a {
        Ahs::BidiReadLength(len) => Some(len),
        _ => None,
    })
}

/// Scan the AHS area for an extended CDB continuation.
pub fn extended_cdb(ahs: &[u8]) -> Option<Bytes> {
    decode_ahs(ahs).ok()?.into_iter().find_map(|a| match a {
        Ahs::ExtendedCdb(cdb) => Some(cdb),
        _ => None,
    })
}

/// Encode a bidi Expected Read Data Length AHS (used by tests and
/// initiator-side tooling).
pub fn encode_bidi_read_length(len: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&5u16.to_be_bytes()); // AHSLength
    out.push(AHS_TYPE_BIDI_READ_LENGTH);
    out.push(0); // reserved
    out.extend_from_slice(&len.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bidi_read_length_roundtrip() {
        let raw = encode_bidi_read_length(0x12345678);
        assert_eq!(raw.len() % 4, 0);
        assert_eq!(bidi_read_length(&raw), Some(0x12345678));
    }

    #[test]
    fn rejects_truncated_entry() {
        let mut raw = encode_bidi_read_length(16);
        raw.truncate(5);
        assert!(decode_ahs(&raw).is_err());
    }
}
