// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32, U64,
};

use crate::models::{
    command::common::{RawScsiStatus, ScsiStatus},
    common::bhs_header,
    data::common::RawDataInFlags,
    opcode::{Opcode, RawBhsOpcode},
};

/// BHS of a **SCSI Data-In** PDU (opcode 0x25).
///
/// The transmit pipeline slices one read payload into a chain of
/// these; only the final PDU of the chain may carry S (status) and the
/// residual accounting, in which case `stat_sn_or_rsvd` and
/// `residual_count` become meaningful.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ScsiDataIn {
    pub opcode: RawBhsOpcode,                // 0
    pub flags: RawDataInFlags,               // 1
    reserved1: u8,                           // 2
    pub status_or_rsvd: RawScsiStatus,       // 3 (valid when S=1)
    pub total_ahs_length: u8,                // 4
    pub data_segment_length: [u8; 3],        // 5..8
    pub lun: U64<BigEndian>,                 // 8..16 (required when A=1)
    pub initiator_task_tag: u32,             // 16..20
    pub target_transfer_tag: U32<BigEndian>, // 20..24
    pub stat_sn_or_rsvd: U32<BigEndian>,     // 24..28 (valid when S=1)
    pub exp_cmd_sn: U32<BigEndian>,          // 28..32
    pub max_cmd_sn: U32<BigEndian>,          // 32..36
    pub data_sn: U32<BigEndian>,             // 36..40
    pub buffer_offset: U32<BigEndian>,       // 40..44
    pub residual_count: U32<BigEndian>,      // 44..48 (valid when S=1)
}

bhs_header!(ScsiDataIn, Opcode::ScsiDataIn);

impl ScsiDataIn {
    /// Decoded SAM status when the S bit is set.
    #[inline]
    pub fn scsi_status(&self) -> Option<ScsiStatus> {
        if self.flags.s() {
            self.status_or_rsvd.decode().ok()
        } else {
            None
        }
    }

    /// Piggyback (or clear) a status; S forces F, clearing S zeroes the
    /// fields that are only valid alongside it.
    #[inline]
    pub fn set_scsi_status(&mut self, st: Option<ScsiStatus>) {
        match st {
            Some(s) => {
                self.flags.set_s(true);
                self.status_or_rsvd.encode(s);
            },
            None => {
                self.flags.set_s(false);
                self.status_or_rsvd = RawScsiStatus::default();
                self.stat_sn_or_rsvd.set(0);
                self.residual_count.set(0);
            },
        }
    }
}
