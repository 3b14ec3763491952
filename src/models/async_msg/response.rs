// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16, U32,
    U64,
};

use crate::models::{
    common::bhs_header,
    opcode::{Opcode, RawBhsOpcode},
};

/// BHS of an **Asynchronous Message** (opcode 0x32).
///
/// Target-originated; for `async_event == SCSI_EVENT` the data segment
/// carries length-prefixed SCSI sense.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct AsyncMessage {
    pub opcode: RawBhsOpcode,         // 0
    pub flags: u8,                    // 1 (F bit)
    reserved1: [u8; 2],               // 2..4
    pub total_ahs_length: u8,         // 4
    pub data_segment_length: [u8; 3], // 5..8
    pub lun: U64<BigEndian>,          // 8..16
    pub all_ones: U32<BigEndian>,     // 16..20 (no ITT, 0xffffffff)
    reserved2: [u8; 4],               // 20..24
    pub stat_sn: U32<BigEndian>,      // 24..28
    pub exp_cmd_sn: U32<BigEndian>,   // 28..32
    pub max_cmd_sn: U32<BigEndian>,   // 32..36
    pub async_event: u8,              // 36
    pub async_vcode: u8,              // 37
    pub parameter1: U16<BigEndian>,   // 38..40
    pub parameter2: U16<BigEndian>,   // 40..42
    pub parameter3: U16<BigEndian>,   // 42..44
    reserved3: [u8; 4],               // 44..48
}

bhs_header!(AsyncMessage, Opcode::AsyncMsg, flags = 0x80);

impl AsyncMessage {
    /// AsyncEvent code for "a SCSI async event was reported by a LU".
    pub const SCSI_EVENT: u8 = 0;
}
