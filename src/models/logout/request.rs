// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use anyhow::{Result, bail};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16, U32,
};

use crate::models::{
    common::bhs_header,
    opcode::{Opcode, RawBhsOpcode},
};

/// Why the initiator is logging out (low 7 bits of byte 1).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    #[default]
    CloseSession,
    CloseConnection,
    RemoveConnectionForRecovery,
}

impl LogoutReason {
    #[inline]
    pub fn as_u8(self) -> u8 {
        match self {
            LogoutReason::CloseSession => 0x00,
            LogoutReason::CloseConnection => 0x01,
            LogoutReason::RemoveConnectionForRecovery => 0x02,
        }
    }
}

impl TryFrom<u8> for LogoutReason {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0x00 => LogoutReason::CloseSession,
            0x01 => LogoutReason::CloseConnection,
            0x02 => LogoutReason::RemoveConnectionForRecovery,
            other => bail!("unexpected logout reason {other}"),
        })
    }
}

/// Wire view of the reason byte; the F bit shares it.
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawLogoutReason(u8);

impl RawLogoutReason {
    const REASON_MASK: u8 = 0x7f;

    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub fn decode(&self) -> Result<LogoutReason> {
        LogoutReason::try_from(self.0 & Self::REASON_MASK)
    }

    #[inline]
    pub fn encode(&mut self, r: LogoutReason) {
        self.0 = 0x80 | r.as_u8();
    }
}

impl fmt::Debug for RawLogoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Ok(r) => write!(f, "RawLogoutReason {{ {r:?} }}"),
            Err(_) => write!(f, "RawLogoutReason {{ raw=0x{:02x} }}", self.0),
        }
    }
}

/// BHS of a **Logout Request** (opcode 0x06).
///
/// Whatever the reason, the target answers with a Logout Response and
/// closes the connection once that response left the wire.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LogoutRequest {
    pub opcode: RawBhsOpcode,         // 0
    pub reason: RawLogoutReason,      // 1 (F bit + reason code)
    reserved1: [u8; 2],               // 2..4
    pub total_ahs_length: u8,         // 4
    pub data_segment_length: [u8; 3], // 5..8
    reserved2: [u8; 8],               // 8..16
    pub initiator_task_tag: u32,      // 16..20
    pub cid: U16<BigEndian>,          // 20..22
    reserved3: [u8; 2],               // 22..24
    pub cmd_sn: U32<BigEndian>,       // 24..28
    pub exp_stat_sn: U32<BigEndian>,  // 28..32
    reserved4: [u8; 16],              // 32..48
}

bhs_header!(LogoutRequest, Opcode::LogoutReq);
