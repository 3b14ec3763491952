// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire framing: padding math, CRC32C digest computation and the
//! one-shot frame assembler used by the transmit path.

use zerocopy::{FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout};

use crate::models::common::HEADER_LEN;

/// Marker for the 48-byte BHS structs that may be viewed in place.
pub trait ZeroCopyType: KnownLayout + Immutable + IntoBytes + ZFromBytes {}

#[inline]
pub(crate) fn pad_len(n: usize) -> usize {
    (4 - (n % 4)) % 4
}

#[inline]
fn crc32c_of_parts(parts: &[&[u8]]) -> u32 {
    let mut acc = 0u32;
    for p in parts {
        if !p.is_empty() {
            acc = crc32c::crc32c_append(acc, p);
        }
    }
    acc
}

#[inline]
fn crc32c_with_padding(parts: &[&[u8]], pad: usize) -> u32 {
    let mut acc = crc32c_of_parts(parts);
    if pad != 0 {
        let zeros = [0u8; 3];
        acc = crc32c::crc32c_append(acc, &zeros[..pad]);
    }
    acc
}

/// HeaderDigest covers the BHS and the padded AHS.
#[inline]
pub(crate) fn compute_header_digest(bhs: &[u8], ahs: &[u8]) -> u32 {
    crc32c_with_padding(&[bhs, ahs], pad_len(ahs.len()))
}

/// DataDigest covers the padded data segment.
#[inline]
pub(crate) fn compute_data_digest(data: &[u8]) -> u32 {
    crc32c_with_padding(&[data], pad_len(data.len()))
}

/// Assemble a full wire frame (BHS + AHS + pad + HeaderDigest? + Data +
/// pad + DataDigest?) into one contiguous buffer so the transmit side can
/// push an entire PDU with a single write.
pub fn encode_frame(
    bhs: &[u8; HEADER_LEN],
    ahs: &[u8],
    data: &[u8],
    enable_header_digest: bool,
    enable_data_digest: bool,
) -> Vec<u8> {
    let ahs_pad = pad_len(ahs.len());
    let data_pad = pad_len(data.len());
    let hd_len = 4 * enable_header_digest as usize;
    let dd_len = 4 * (enable_data_digest && !data.is_empty()) as usize;

    let mut frame = Vec::with_capacity(
        HEADER_LEN + ahs.len() + ahs_pad + hd_len + data.len() + data_pad + dd_len,
    );
    frame.extend_from_slice(bhs);
    frame.extend_from_slice(ahs);
    frame.extend(std::iter::repeat_n(0u8, ahs_pad));
    if hd_len != 0 {
        let hd = compute_header_digest(bhs, ahs);
        frame.extend_from_slice(&hd.to_be_bytes());
    }
    frame.extend_from_slice(data);
    frame.extend(std::iter::repeat_n(0u8, data_pad));
    if dd_len != 0 {
        let dd = compute_data_digest(data);
        frame.extend_from_slice(&dd.to_be_bytes());
    }
    frame
}
