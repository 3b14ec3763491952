// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32, U64,
};

use crate::models::{
    common::bhs_header,
    opcode::{Opcode, RawBhsOpcode},
};

/// Reject reason codes (RFC 3720 §10.17.1), restricted to the ones a
/// target raises plus a catch-all for everything it may have to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// 0x02, data digest mismatch; the PDU may be resent.
    DataDigestError,
    /// 0x04, protocol error; cannot be resent.
    ProtocolError,
    /// 0x05, command not supported.
    CommandNotSupported,
    /// 0x06, too many immediate commands; may be resent.
    ImmediateCmdReject,
    /// 0x07, a task with this ITT is already in progress.
    TaskInProgress,
    /// 0x09, invalid field in the PDU.
    InvalidPduField,
    /// 0x0A, out of resources for a long operation; may be resent.
    LongOpReject,
    /// 0x0C, logout in progress, new work refused.
    WaitingForLogout,
    /// Anything else on the wire.
    Other(u8),
}

impl RejectReason {
    #[inline]
    pub fn from_u8(b: u8) -> Self {
        match b {
            0x02 => RejectReason::DataDigestError,
            0x04 => RejectReason::ProtocolError,
            0x05 => RejectReason::CommandNotSupported,
            0x06 => RejectReason::ImmediateCmdReject,
            0x07 => RejectReason::TaskInProgress,
            0x09 => RejectReason::InvalidPduField,
            0x0A => RejectReason::LongOpReject,
            0x0C => RejectReason::WaitingForLogout,
            other => RejectReason::Other(other),
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        match self {
            RejectReason::DataDigestError => 0x02,
            RejectReason::ProtocolError => 0x04,
            RejectReason::CommandNotSupported => 0x05,
            RejectReason::ImmediateCmdReject => 0x06,
            RejectReason::TaskInProgress => 0x07,
            RejectReason::InvalidPduField => 0x09,
            RejectReason::LongOpReject => 0x0A,
            RejectReason::WaitingForLogout => 0x0C,
            RejectReason::Other(code) => code,
        }
    }
}

/// Wire view of the reason byte.
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawRejectReason(u8);

impl RawRejectReason {
    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub fn decode(&self) -> RejectReason {
        RejectReason::from_u8(self.0)
    }

    #[inline]
    pub fn encode(&mut self, r: RejectReason) {
        self.0 = r.as_u8();
    }
}

impl fmt::Debug for RawRejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawRejectReason {{ {:?} }}", self.decode())
    }
}

/// BHS of a **Reject** PDU (opcode 0x3f).
///
/// Both task tags carry the reserved value; the offending BHS travels
/// as the data segment so the initiator can identify the victim.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RejectPdu {
    pub opcode: RawBhsOpcode,             // 0
    pub flags: u8,                        // 1 (F bit)
    pub reason: RawRejectReason,          // 2
    reserved1: u8,                        // 3
    pub total_ahs_length: u8,             // 4
    pub data_segment_length: [u8; 3],     // 5..8
    reserved2: [u8; 8],                   // 8..16
    pub initiator_task_tag: u32,          // 16..20 (0xffffffff)
    reserved3: [u8; 4],                   // 20..24
    pub stat_sn: U32<BigEndian>,          // 24..28
    pub exp_cmd_sn: U32<BigEndian>,       // 28..32
    pub max_cmd_sn: U32<BigEndian>,       // 32..36
    pub data_sn_or_r2t_sn: U32<BigEndian>, // 36..40
    reserved4: U64<BigEndian>,            // 40..48
}

bhs_header!(RejectPdu, Opcode::Reject, flags = 0x80);
