// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The first octet of every Basic Header Segment: a 6-bit opcode plus
//! the Immediate flag (RFC 3720 §10.2.1).
//!
//! ```text
//!  7   6   5   4   3   2   1   0      bit position
//! +---+---+---------------------------+
//! | . | I |        OPCODE (6 bits)    |
//! +---+---+---------------------------+
//! ```

use core::fmt;

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

const OPCODE_MASK: u8 = 0b0011_1111;
const I_MASK: u8 = 0b0100_0000;

/// Every opcode a target can face or emit. Login, Text and SNACK are
/// decoded only so the engine can refuse them with a precise reason.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    #[default]
    NopOut = 0x00,
    ScsiCommandReq = 0x01,
    ScsiTaskMgmtReq = 0x02,
    LoginReq = 0x03,
    TextReq = 0x04,
    ScsiDataOut = 0x05,
    LogoutReq = 0x06,
    SnackReq = 0x10,
    NopIn = 0x20,
    ScsiCommandResp = 0x21,
    ScsiTaskMgmtResp = 0x22,
    LoginResp = 0x23,
    TextResp = 0x24,
    ScsiDataIn = 0x25,
    LogoutResp = 0x26,
    ReadyToTransfer = 0x31,
    AsyncMsg = 0x32,
    Reject = 0x3F,
}

impl Opcode {
    const ALL: [Opcode; 18] = [
        Self::NopOut,
        Self::ScsiCommandReq,
        Self::ScsiTaskMgmtReq,
        Self::LoginReq,
        Self::TextReq,
        Self::ScsiDataOut,
        Self::LogoutReq,
        Self::SnackReq,
        Self::NopIn,
        Self::ScsiCommandResp,
        Self::ScsiTaskMgmtResp,
        Self::LoginResp,
        Self::TextResp,
        Self::ScsiDataIn,
        Self::LogoutResp,
        Self::ReadyToTransfer,
        Self::AsyncMsg,
        Self::Reject,
    ];

    #[inline]
    pub fn from_u6(v: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|op| *op as u8 == v)
    }
}

/// Returned when the lower six bits contain an undefined opcode.
#[derive(Debug, Error)]
#[error("invalid opcode: 0x{0:02x}")]
pub struct UnknownOpcode(pub u8);

/// Decoded first BHS byte: the Immediate flag plus the opcode.
#[derive(Debug, PartialEq, Eq, Default, Clone, Copy)]
pub struct BhsOpcode {
    pub flags: bool,
    pub opcode: Opcode,
}

impl TryFrom<u8> for BhsOpcode {
    type Error = anyhow::Error;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        let code = byte & OPCODE_MASK;
        Ok(Self {
            flags: byte & I_MASK != 0,
            opcode: Opcode::from_u6(code).ok_or(UnknownOpcode(code))?,
        })
    }
}

/// Wire-safe first BHS octet, transparent over `u8` so it can live
/// inside a zerocopy BHS struct.
#[repr(transparent)]
#[derive(Clone, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawBhsOpcode(u8);

impl RawBhsOpcode {
    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    /// The Immediate flag.
    #[inline]
    pub const fn i(&self) -> bool {
        self.0 & I_MASK != 0
    }

    #[inline]
    pub fn set_i(&mut self) {
        self.0 |= I_MASK;
    }

    #[inline]
    pub fn opcode_known(&self) -> Option<Opcode> {
        Opcode::from_u6(self.0 & OPCODE_MASK)
    }
}

impl fmt::Debug for RawBhsOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tmp = f.debug_struct("RawBhsOpcode");
        if self.i() {
            tmp.field("I", &true);
        }
        match self.opcode_known() {
            Some(op) => tmp.field("opcode", &op).finish(),
            None => tmp
                .field(
                    "opcode_raw",
                    &format_args!("0x{:02X}", self.0 & OPCODE_MASK),
                )
                .finish(),
        }
    }
}
