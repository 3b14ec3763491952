// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32, U64,
};

use crate::models::{
    common::bhs_header,
    data::common::RawDataOutFlags,
    opcode::{Opcode, RawBhsOpcode},
};

/// BHS of a **SCSI Data-Out** PDU (opcode 0x05).
///
/// The receive pipeline routes it to its write command by ITT through
/// the data-wait hash; `buffer_offset` places the payload inside that
/// command's buffer, and the F bit closes one solicited burst.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ScsiDataOut {
    pub opcode: RawBhsOpcode,                // 0
    pub flags: RawDataOutFlags,              // 1
    reserved1: [u8; 2],                      // 2..4
    pub total_ahs_length: u8,                // 4
    pub data_segment_length: [u8; 3],        // 5..8
    pub lun: U64<BigEndian>,                 // 8..16
    pub initiator_task_tag: u32,             // 16..20
    pub target_transfer_tag: U32<BigEndian>, // 20..24
    reserved2: [u8; 4],                      // 24..28
    pub exp_stat_sn: U32<BigEndian>,         // 28..32
    reserved3: [u8; 4],                      // 32..36
    pub data_sn: U32<BigEndian>,             // 36..40
    pub buffer_offset: U32<BigEndian>,       // 40..44
    reserved4: [u8; 4],                      // 44..48
}

bhs_header!(ScsiDataOut, Opcode::ScsiDataOut);

impl ScsiDataOut {
    /// TTT of unsolicited / first-burst Data-Out PDUs.
    pub const DEFAULT_TTT: u32 = 0xffff_ffff;
}
