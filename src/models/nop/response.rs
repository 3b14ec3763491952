// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32, U64,
};

use crate::models::{
    common::bhs_header,
    opcode::{Opcode, RawBhsOpcode},
};

/// BHS of a **NOP-In** (opcode 0x20).
///
/// Either the echo of an initiator ping (real ITT, reserved TTT, the
/// ping payload mirrored back) or a target keepalive (reserved ITT and
/// a fresh TTT the initiator must return).
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct NopInResponse {
    pub opcode: RawBhsOpcode,            // 0
    reserved1: [u8; 3],                  // 1..4 (F always set on byte 1)
    pub total_ahs_length: u8,            // 4
    pub data_segment_length: [u8; 3],    // 5..8
    pub lun: U64<BigEndian>,             // 8..16
    pub initiator_task_tag: u32,         // 16..20
    pub target_task_tag: U32<BigEndian>, // 20..24
    pub stat_sn: U32<BigEndian>,         // 24..28
    pub exp_cmd_sn: U32<BigEndian>,      // 28..32
    pub max_cmd_sn: U32<BigEndian>,      // 32..36
    reserved2: [u8; 12],                 // 36..48
}

bhs_header!(NopInResponse, Opcode::NopIn, flags = 0x80);
