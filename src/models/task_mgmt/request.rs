// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32, U64,
};

use crate::models::{
    common::bhs_header,
    opcode::{Opcode, RawBhsOpcode},
    task_mgmt::common::RawTmFunction,
};

/// BHS of a **Task Management Function Request** (opcode 0x02).
///
/// `referenced_task_tag` and `ref_cmd_sn` only matter for ABORT TASK;
/// every other function must carry the reserved RTT.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct TaskMgmtRequest {
    pub opcode: RawBhsOpcode,                // 0
    pub function: RawTmFunction,             // 1 (F + function code)
    reserved1: [u8; 2],                      // 2..4
    pub total_ahs_length: u8,                // 4
    pub data_segment_length: [u8; 3],        // 5..8
    pub lun: U64<BigEndian>,                 // 8..16
    pub initiator_task_tag: u32,             // 16..20
    pub referenced_task_tag: U32<BigEndian>, // 20..24
    pub cmd_sn: U32<BigEndian>,              // 24..28
    pub exp_stat_sn: U32<BigEndian>,         // 28..32
    pub ref_cmd_sn: U32<BigEndian>,          // 32..36
    pub exp_data_sn: U32<BigEndian>,         // 36..40
    reserved2: [u8; 8],                      // 40..48
}

bhs_header!(TaskMgmtRequest, Opcode::ScsiTaskMgmtReq);
