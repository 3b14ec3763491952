// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32,
};

use crate::models::{
    common::bhs_header,
    opcode::{Opcode, RawBhsOpcode},
    task_mgmt::common::RawTmResponseCode,
};

/// BHS of a **Task Management Function Response** (opcode 0x22).
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct TaskMgmtResponse {
    pub opcode: RawBhsOpcode,        // 0
    pub flags: u8,                   // 1 (F bit)
    pub response: RawTmResponseCode, // 2
    reserved1: u8,                   // 3
    pub total_ahs_length: u8,        // 4
    pub data_segment_length: [u8; 3], // 5..8
    reserved2: [u8; 8],              // 8..16
    pub initiator_task_tag: u32,     // 16..20
    reserved3: [u8; 4],              // 20..24
    pub stat_sn: U32<BigEndian>,     // 24..28
    pub exp_cmd_sn: U32<BigEndian>,  // 28..32
    pub max_cmd_sn: U32<BigEndian>,  // 32..36
    reserved4: [u8; 12],             // 36..48
}

bhs_header!(TaskMgmtResponse, Opcode::ScsiTaskMgmtResp, flags = 0x80);
