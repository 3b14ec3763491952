// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16, U32,
};

use crate::models::{
    common::bhs_header,
    opcode::{Opcode, RawBhsOpcode},
};

/// How the target answered the logout (byte 2 of the response).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LogoutResponseCode {
    #[default]
    Success,
    CidNotFound,
    RecoveryNotSupported,
    CleanupFailed,
}

impl LogoutResponseCode {
    #[inline]
    pub fn as_u8(self) -> u8 {
        match self {
            LogoutResponseCode::Success => 0x00,
            LogoutResponseCode::CidNotFound => 0x01,
            LogoutResponseCode::RecoveryNotSupported => 0x02,
            LogoutResponseCode::CleanupFailed => 0x03,
        }
    }
}

/// Wire view of the response code.
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawLogoutResponseCode(u8);

impl RawLogoutResponseCode {
    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub fn decode(&self) -> LogoutResponseCode {
        match self.0 {
            0x01 => LogoutResponseCode::CidNotFound,
            0x02 => LogoutResponseCode::RecoveryNotSupported,
            0x03 => LogoutResponseCode::CleanupFailed,
            _ => LogoutResponseCode::Success,
        }
    }

    #[inline]
    pub fn encode(&mut self, rc: LogoutResponseCode) {
        self.0 = rc.as_u8();
    }
}

impl fmt::Debug for RawLogoutResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawLogoutResponseCode {{ {:?} }}", self.decode())
    }
}

/// BHS of a **Logout Response** (opcode 0x26).
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LogoutResponse {
    pub opcode: RawBhsOpcode,            // 0
    pub flags: u8,                       // 1 (F bit)
    pub response: RawLogoutResponseCode, // 2
    reserved1: u8,                       // 3
    pub total_ahs_length: u8,            // 4
    pub data_segment_length: [u8; 3],    // 5..8
    reserved2: [u8; 8],                  // 8..16
    pub initiator_task_tag: u32,         // 16..20
    reserved3: [u8; 4],                  // 20..24
    pub stat_sn: U32<BigEndian>,         // 24..28
    pub exp_cmd_sn: U32<BigEndian>,      // 28..32
    pub max_cmd_sn: U32<BigEndian>,      // 32..36
    reserved4: [u8; 4],                  // 36..40
    pub time2wait: U16<BigEndian>,       // 40..42
    pub time2retain: U16<BigEndian>,     // 42..44
    reserved5: [u8; 4],                  // 44..48
}

bhs_header!(LogoutResponse, Opcode::LogoutResp, flags = 0x80);
