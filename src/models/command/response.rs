// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32,
};

use crate::models::{
    command::common::{RawResponseCode, RawScsiCmdRespFlags, RawScsiStatus},
    common::bhs_header,
    opcode::{Opcode, RawBhsOpcode},
};

/// BHS of a **SCSI Response** (opcode 0x21).
///
/// Built by the transmit pipeline; the residual counters and their
/// flag bits are filled from the command's transfer accounting right
/// before the header is queued.
#[repr(C)]
#[derive(Debug, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ScsiCommandResponse {
    pub opcode: RawBhsOpcode,                              // 0
    pub flags: RawScsiCmdRespFlags,                        // 1
    pub response: RawResponseCode,                         // 2
    pub status: RawScsiStatus,                             // 3
    pub total_ahs_length: u8,                              // 4
    pub data_segment_length: [u8; 3],                      // 5..8
    reserved: [u8; 8],                                     // 8..16
    pub initiator_task_tag: u32,                           // 16..20
    pub snack_tag: U32<BigEndian>,                         // 20..24
    pub stat_sn: U32<BigEndian>,                           // 24..28
    pub exp_cmd_sn: U32<BigEndian>,                        // 28..32
    pub max_cmd_sn: U32<BigEndian>,                        // 32..36
    pub exp_data_sn: U32<BigEndian>,                       // 36..40
    pub bidirectional_read_residual_count: U32<BigEndian>, // 40..44
    pub residual_count: U32<BigEndian>,                    // 44..48
}

bhs_header!(ScsiCommandResponse, Opcode::ScsiCommandResp, flags = 0x80);
