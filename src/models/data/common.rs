// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Flag bytes of the Data-Out / Data-In PDU pair.

use core::fmt;

use anyhow::{Result, bail};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::models::common::flag_bits;

/// Data-Out carries only the F bit: set on the last PDU of a burst.
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawDataOutFlags(u8);

impl RawDataOutFlags {
    pub const FINAL: u8 = 0x80;

    flag_bits!((fin, set_fin, Self::FINAL));

    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }
}

impl fmt::Debug for RawDataOutFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RawDataOutFlags {{ {} }}",
            if self.fin() { "FIN" } else { "" }
        )
    }
}

/// Data-In flags: F, A (DataACK request, ERL>0 only), the residual
/// pair O/U and S (status present, which forces F).
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawDataInFlags(u8);

impl RawDataInFlags {
    pub const A: u8 = 0x40;
    pub const FINAL: u8 = 0x80;
    pub const O: u8 = 0x04;
    const RESERVED_MASK: u8 = 0x38;
    pub const S: u8 = 0x01;
    pub const U: u8 = 0x02;

    flag_bits!(
        (fin, set_fin, Self::FINAL),
        (ack, set_ack, Self::A),
    );

    flag_bits!(get (o, Self::O), (u, Self::U), (s, Self::S));

    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    /// O and U exclude each other; setting one side clears the other.
    #[inline]
    pub fn set_o(&mut self, on: bool) {
        if on {
            self.0 = (self.0 & !Self::U) | Self::O;
        } else {
            self.0 &= !Self::O;
        }
    }

    #[inline]
    pub fn set_u(&mut self, on: bool) {
        if on {
            self.0 = (self.0 & !Self::O) | Self::U;
        } else {
            self.0 &= !Self::U;
        }
    }

    /// S requires F on the wire.
    #[inline]
    pub fn set_s(&mut self, on: bool) {
        if on {
            self.0 |= Self::S | Self::FINAL;
        } else {
            self.0 &= !Self::S;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.0 & Self::RESERVED_MASK != 0 {
            bail!(
                "protocol error: reserved bits set in DataInFlags: {:#010b}",
                self.0
            );
        }
        if self.u() && self.o() {
            bail!("protocol error: both U and O set");
        }
        if self.s() && !self.fin() {
            bail!("protocol error: S=1 requires F=1");
        }
        Ok(())
    }
}

impl fmt::Debug for RawDataInFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawDataInFlags {{ ")?;
        for (bit, name) in [
            (Self::FINAL, "FIN"),
            (Self::A, "A"),
            (Self::O, "O"),
            (Self::U, "U"),
            (Self::S, "S"),
        ] {
            if self.0 & bit != 0 {
                write!(f, "{name}|")?;
            }
        }
        write!(f, "valid={} }}", self.validate().is_ok())
    }
}
