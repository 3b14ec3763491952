// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Task Management function codes (RFC 3720 §10.5.1), carried in the low
/// seven bits of byte 1; bit 7 is always set on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmFunction {
    AbortTask = 1,
    AbortTaskSet = 2,
    ClearAca = 3,
    ClearTaskSet = 4,
    LogicalUnitReset = 5,
    TargetWarmReset = 6,
    TargetColdReset = 7,
    TaskReassign = 8,
}

impl TmFunction {
    #[inline]
    pub fn from_u7(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::AbortTask,
            2 => Self::AbortTaskSet,
            3 => Self::ClearAca,
            4 => Self::ClearTaskSet,
            5 => Self::LogicalUnitReset,
            6 => Self::TargetWarmReset,
            7 => Self::TargetColdReset,
            8 => Self::TaskReassign,
            _ => return None,
        })
    }
}

/// Wire view for byte 1 of a Task Management Request: F-bit plus the
/// 7-bit function code.
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawTmFunction(u8);

impl RawTmFunction {
    pub const FINAL: u8 = 0x80;
    pub const FUNCTION_MASK: u8 = 0x7F;

    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn new_raw(v: u8) -> Self {
        Self(v)
    }

    #[inline]
    pub const fn function_raw(&self) -> u8 {
        self.0 & Self::FUNCTION_MASK
    }

    #[inline]
    pub fn function(&self) -> Option<TmFunction> {
        TmFunction::from_u7(self.function_raw())
    }

    #[inline]
    pub fn set_function(&mut self, f: TmFunction) {
        self.0 = Self::FINAL | (f as u8);
    }
}

impl fmt::Debug for RawTmFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.function() {
            Some(func) => write!(f, "RawTmFunction {{ {func:?} }}"),
            None => write!(f, "RawTmFunction {{ raw=0x{:02x} }}", self.0),
        }
    }
}

/// Task Management Response codes (RFC 3720 §10.6.1).
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TmResponseCode {
    #[default]
    FunctionComplete = 0,
    UnknownTask = 1,
    UnknownLun = 2,
    TaskAllegiant = 3,
    ReassignmentUnsupported = 4,
    FunctionUnsupported = 5,
    NoAuthorization = 6,
    FunctionRejected = 255,
}

impl TmResponseCode {
    #[inline]
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::FunctionComplete,
            1 => Self::UnknownTask,
            2 => Self::UnknownLun,
            3 => Self::TaskAllegiant,
            4 => Self::ReassignmentUnsupported,
            5 => Self::FunctionUnsupported,
            6 => Self::NoAuthorization,
            _ => Self::FunctionRejected,
        }
    }
}

/// Wire view for the 1-byte Response field of a Task Management Response.
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawTmResponseCode(u8);

impl RawTmResponseCode {
    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub fn decode(&self) -> TmResponseCode {
        TmResponseCode::from_u8(self.0)
    }

    #[inline]
    pub fn encode(&mut self, rc: TmResponseCode) {
        self.0 = rc as u8;
    }
}

impl fmt::Debug for RawTmResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawTmResponseCode {{ {:?} }}", self.decode())
    }
}
