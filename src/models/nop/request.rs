// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32, U64,
};

use crate::models::{
    common::bhs_header,
    opcode::{Opcode, RawBhsOpcode},
};

/// BHS of a **NOP-Out** (opcode 0x00).
///
/// Two roles, told apart by the tags: a ping carrying a real ITT that
/// the target must echo back, or (with the reserved ITT) the answer to
/// one of the target's own keepalive NOP-Ins, matched by TTT.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct NopOutRequest {
    pub opcode: RawBhsOpcode,            // 0
    reserved1: [u8; 3],                  // 1..4 (F always set on byte 1)
    pub total_ahs_length: u8,            // 4
    pub data_segment_length: [u8; 3],    // 5..8
    pub lun: U64<BigEndian>,             // 8..16
    pub initiator_task_tag: u32,         // 16..20
    pub target_task_tag: U32<BigEndian>, // 20..24
    pub cmd_sn: U32<BigEndian>,          // 24..28
    pub exp_stat_sn: U32<BigEndian>,     // 28..32
    reserved2: [u8; 16],                 // 32..48
}

bhs_header!(NopOutRequest, Opcode::NopOut, flags = 0x80);

impl NopOutRequest {
    pub const DEFAULT_TAG: u32 = 0xffff_ffff;
}
