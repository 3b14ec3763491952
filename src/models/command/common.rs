// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Field types of the SCSI Command / SCSI Response PDU pair: task
//! attributes, the two flag bytes, the response code and the SAM
//! status, each with a transparent wire-safe wrapper so the BHS structs
//! stay plain zerocopy views.

use core::fmt;

use anyhow::{Result, bail};
use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::models::common::flag_bits;

/// SAM task attribute (SPC/SAM), 3 bits of the request flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAttribute {
    Untagged,
    Simple,
    Ordered,
    HeadOfQueue,
    ACA,
    Reserved(u8),
}

/// Wire view of the task-attribute bits.
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawTaskAttribute(u8);

impl RawTaskAttribute {
    const MASK: u8 = 0b0000_0111;

    #[inline]
    pub const fn new(bits3: u8) -> Self {
        Self(bits3 & Self::MASK)
    }

    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0 & Self::MASK
    }

    #[inline]
    pub fn decode(&self) -> TaskAttribute {
        match self.raw() {
            0 => TaskAttribute::Untagged,
            1 => TaskAttribute::Simple,
            2 => TaskAttribute::Ordered,
            3 => TaskAttribute::HeadOfQueue,
            4 => TaskAttribute::ACA,
            r => TaskAttribute::Reserved(r),
        }
    }

    #[inline]
    pub fn encode(&mut self, attr: TaskAttribute) {
        self.0 = match attr {
            TaskAttribute::Untagged => 0,
            TaskAttribute::Simple => 1,
            TaskAttribute::Ordered => 2,
            TaskAttribute::HeadOfQueue => 3,
            TaskAttribute::ACA => 4,
            TaskAttribute::Reserved(v) => v & Self::MASK,
        };
    }
}

impl fmt::Debug for RawTaskAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawTaskAttribute {{ {:?} }}", self.decode())
    }
}

/// Flag byte of a SCSI Command request: F, R (read), W (write) and the
/// task attribute in the low bits.
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawScsiCmdReqFlags(u8);

impl RawScsiCmdReqFlags {
    pub const ATTR: u8 = 0x07;
    pub const FINAL: u8 = 0x80;
    pub const READ: u8 = 0x40;
    pub const WRITE: u8 = 0x20;

    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    flag_bits!(
        (fin, set_fin, Self::FINAL),
        (read, set_read, Self::READ),
        (write, set_write, Self::WRITE),
    );

    #[inline]
    pub fn task_attr(&self) -> TaskAttribute {
        RawTaskAttribute::new(self.0 & Self::ATTR).decode()
    }

    #[inline]
    pub fn set_task_attr(&mut self, attr: TaskAttribute) {
        let mut ra = RawTaskAttribute::default();
        ra.encode(attr);
        self.0 = (self.0 & !Self::ATTR) | ra.raw();
    }
}

impl fmt::Debug for RawScsiCmdReqFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawScsiCmdReqFlags {{ ")?;
        if self.fin() {
            write!(f, "FIN|")?;
        }
        if self.read() {
            write!(f, "READ|")?;
        }
        if self.write() {
            write!(f, "WRITE|")?;
        }
        write!(f, "ATTR={:?} }}", self.task_attr())
    }
}

/// Flag byte of a SCSI Response: F plus the two residual pairs. The
/// primary pair (o/u) covers the command's main direction, the bidi
/// pair (O/U) the read leg of a bidirectional command.
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawScsiCmdRespFlags(u8);

impl RawScsiCmdRespFlags {
    pub const FINAL: u8 = 0x80;
    pub const O_BIDI: u8 = 0x10;
    pub const O_PRIMARY: u8 = 0x04;
    pub const U_BIDI: u8 = 0x08;
    pub const U_PRIMARY: u8 = 0x02;

    #[inline]
    pub const fn new_raw(v: u8) -> Self {
        Self(v)
    }

    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    flag_bits!(
        get
        (fin, Self::FINAL),
        (u_primary, Self::U_PRIMARY),
        (o_primary, Self::O_PRIMARY),
        (u_bidi, Self::U_BIDI),
        (o_bidi, Self::O_BIDI),
    );

    /// Under/overflow of a pair exclude each other; setting one side
    /// clears the other.
    #[inline]
    pub fn set_u_primary(&mut self, on: bool) {
        set_pair(&mut self.0, Self::U_PRIMARY, Self::O_PRIMARY, on);
    }

    #[inline]
    pub fn set_o_primary(&mut self, on: bool) {
        set_pair(&mut self.0, Self::O_PRIMARY, Self::U_PRIMARY, on);
    }

    #[inline]
    pub fn set_u_bidi(&mut self, on: bool) {
        set_pair(&mut self.0, Self::U_BIDI, Self::O_BIDI, on);
    }

    #[inline]
    pub fn set_o_bidi(&mut self, on: bool) {
        set_pair(&mut self.0, Self::O_BIDI, Self::U_BIDI, on);
    }

    pub fn validate(&self) -> Result<()> {
        if (self.u_primary() && self.o_primary()) || (self.u_bidi() && self.o_bidi()) {
            bail!("protocol error: both Underflow and Overflow bits set");
        }
        Ok(())
    }
}

impl fmt::Debug for RawScsiCmdRespFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawScsiCmdRespFlags {{ ")?;
        if self.fin() {
            write!(f, "FIN|")?;
        }
        if self.u_primary() {
            write!(f, "u|")?;
        }
        if self.o_primary() {
            write!(f, "o|")?;
        }
        if self.u_bidi() {
            write!(f, "U|")?;
        }
        if self.o_bidi() {
            write!(f, "O|")?;
        }
        write!(f, "valid={} }}", self.validate().is_ok())
    }
}

/// The 1-byte Response field of a SCSI Response PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    CommandCompleted,
    TargetFailure,
    VendorSpecific(u8),
    Reserved(u8),
}

/// Wire view of the Response field.
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawResponseCode(u8);

impl RawResponseCode {
    #[inline]
    pub const fn new_raw(v: u8) -> Self {
        Self(v)
    }

    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub fn decode(&self) -> ResponseCode {
        match self.0 {
            0x00 => ResponseCode::CommandCompleted,
            0x01 => ResponseCode::TargetFailure,
            v @ 0x80..=0xFF => ResponseCode::VendorSpecific(v),
            v => ResponseCode::Reserved(v),
        }
    }

    #[inline]
    pub fn encode(&mut self, rc: ResponseCode) {
        self.0 = match rc {
            ResponseCode::CommandCompleted => 0x00,
            ResponseCode::TargetFailure => 0x01,
            ResponseCode::VendorSpecific(v) | ResponseCode::Reserved(v) => v,
        };
    }
}

impl fmt::Debug for RawResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawResponseCode {{ {:?} }}", self.decode())
    }
}

/// The 1-byte SAM Status field, valid when the response code says the
/// command completed at the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiStatus {
    Good,
    CheckCondition,
    Busy,
    ReservationConflict,
    TaskSetFull,
    AcaActive,
    TaskAborted,
    Other(u8),
}

#[derive(Debug, Error)]
#[error("invalid SCSI status: 0x{0:02x}")]
pub struct UnknownScsiStatus(pub u8);

/// Wire view of the Status field.
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawScsiStatus(u8);

impl RawScsiStatus {
    #[inline]
    pub const fn new_raw(v: u8) -> Self {
        Self(v)
    }

    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub fn decode(&self) -> Result<ScsiStatus, UnknownScsiStatus> {
        Ok(match self.0 {
            0x00 => ScsiStatus::Good,
            0x02 => ScsiStatus::CheckCondition,
            0x08 => ScsiStatus::Busy,
            0x18 => ScsiStatus::ReservationConflict,
            0x28 => ScsiStatus::TaskSetFull,
            0x30 => ScsiStatus::AcaActive,
            0x40 => ScsiStatus::TaskAborted,
            other => ScsiStatus::Other(other),
        })
    }

    #[inline]
    pub fn encode(&mut self, st: ScsiStatus) {
        self.0 = match st {
            ScsiStatus::Good => 0x00,
            ScsiStatus::CheckCondition => 0x02,
            ScsiStatus::Busy => 0x08,
            ScsiStatus::ReservationConflict => 0x18,
            ScsiStatus::TaskSetFull => 0x28,
            ScsiStatus::AcaActive => 0x30,
            ScsiStatus::TaskAborted => 0x40,
            ScsiStatus::Other(v) => v,
        };
    }
}

impl fmt::Debug for RawScsiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Ok(st) => write!(f, "RawScsiStatus {{ {st:?} }}"),
            Err(_) => write!(f, "RawScsiStatus {{ invalid(0x{:02X}) }}", self.0),
        }
    }
}

#[inline]
fn set_pair(v: &mut u8, set: u8, clear: u8, on: bool) {
    if on {
        *v |= set;
        *v &= !clear;
    } else {
        *v &= !set;
    }
}
