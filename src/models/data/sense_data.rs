// SPDX-License-Identifier: AGPL-3.0-or-later GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, anyhow};
use bytes::Bytes;

pub const FIXED_MIN_LEN: usize = 18;

/// Fixed-format (0x70) SCSI sense data, both as parsed from a SCSI
/// Response data segment and as built by the target before transmission.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SenseData {
    pub valid: bool,
    pub response_code: u8,
    pub sense_key: u8,
    pub ili: bool,
    pub eom: bool,
    pub filemark: bool,
    pub information: u32,
    pub additional_len: u8,
    pub cmd_specific: u32,
    pub asc: u8,
    pub ascq: u8,
}

impl SenseData {
    /// Build current-error fixed sense for the given key/ASC/ASCQ triple.
    pub fn current(sense_key: u8, asc: u8, ascq: u8) -> Self {
        SenseData {
            valid: false,
            response_code: 0x70,
            sense_key: sense_key & 0x0F,
            additional_len: (FIXED_MIN_LEN - 8) as u8,
            asc,
            ascq,
            ..Default::default()
        }
    }

    /// Serialize to the 18-byte fixed wire form (no length prefix).
    pub fn to_fixed_bytes(&self) -> [u8; FIXED_MIN_LEN] {
        let mut out = [0u8; FIXED_MIN_LEN];
        out[0] = self.response_code | if self.valid { 0x80 } else { 0 };
        out[2] = (self.sense_key & 0x0F)
            | if self.filemark { 0x80 } else { 0 }
            | if self.eom { 0x40 } else { 0 }
            | if self.ili { 0x20 } else { 0 };
        out[3..7].copy_from_slice(&self.information.to_be_bytes());
        out[7] = self.additional_len;
        out[8..12].copy_from_slice(&self.cmd_specific.to_be_bytes());
        out[12] = self.asc;
        out[13] = self.ascq;
        out
    }

    /// Serialize to the iSCSI data-segment form: a 2-byte big-endian
    /// SenseLength followed by the fixed sense bytes.
    pub fn to_iscsi_bytes(&self) -> Bytes {
        let fixed = self.to_fixed_bytes();
        let mut out = Vec::with_capacity(2 + fixed.len());
        out.extend_from_slice(&(fixed.len() as u16).to_be_bytes());
        out.extend_from_slice(&fixed);
        Bytes::from(out)
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < FIXED_MIN_LEN {
            return Err(anyhow!("sense buffer too small: {}", buf.len()));
        }

        let sense = if buf.len() >= 3 {
            let maybe_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
            let rc = buf[2] & 0x7F;
            if maybe_len + 2 == buf.len() && matches!(rc, 0x70..=0x73) {
                &buf[2..]
            } else {
                buf
            }
        } else {
            buf
        };

        if sense.len() < FIXED_MIN_LEN {
            return Err(anyhow!(
                "sense payload too small after prefix stripping: {}",
                sense.len()
            ));
        }

        let response_code = sense[0] & 0x7F;

        match response_code {
            0x70 | 0x71 => Self::parse_fixed(sense),
            0x72 | 0x73 => Err(anyhow!(
                "descriptor-format sense (0x{:02x}) is not supported yet",
                response_code
            )),
            other => Err(anyhow!("unknown sense response code 0x{:02x}", other)),
        }
    }

    fn parse_fixed(sense: &[u8]) -> Result<Self> {
        if sense.len() < FIXED_MIN_LEN {
            return Err(anyhow!("fixed sense too small: {}", sense.len()));
        }

        let additional_len = sense[7];
        if sense.len() < 8 + additional_len as usize {
            return Err(anyhow!(
                "sense length mismatch: have {}, additional_len {}",
                sense.len(),
                additional_len
            ));
        }

        let be32 =
            |r: &[u8]| r.try_into().map(u32::from_be_bytes).map_err(anyhow::Error::from);

        Ok(SenseData {
            valid: sense[0] & 0x80 != 0,
            response_code: sense[0] & 0x7F,
            filemark: sense[2] & 0x80 != 0,
            eom: sense[2] & 0x40 != 0,
            ili: sense[2] & 0x20 != 0,
            sense_key: sense[2] & 0x0F,
            information: be32(&sense[3..7])?,
            additional_len,
            cmd_specific: be32(&sense[8..12])?,
            asc: sense[12],
            ascq: sense[13],
        })
    }
}

/// Sense triples the target core raises on its own behalf.
pub mod target_sense {
    /// ABORTED COMMAND / iSCSI CRC error detected (data digest mismatch).
    pub const CRC_ERROR: (u8, u8, u8) = (0x0B, 0x47, 0x05);
    /// ABORTED COMMAND / incorrect amount of data.
    pub const INCORRECT_AMOUNT_OF_DATA: (u8, u8, u8) = (0x0B, 0x4D, 0x00);
    /// ABORTED COMMAND / unexpected unsolicited data.
    pub const UNEXPECTED_UNSOLICITED_DATA: (u8, u8, u8) = (0x0B, 0x4D, 0x01);
    /// ILLEGAL REQUEST / invalid field in parameter list.
    pub const PARAMETER_VALUE_INVALID: (u8, u8, u8) = (0x05, 0x26, 0x02);
    /// ILLEGAL REQUEST / invalid message error.
    pub const INVALID_MESSAGE: (u8, u8, u8) = (0x05, 0x49, 0x00);
    /// HARDWARE ERROR / internal target failure.
    pub const HARDWARE_ERROR: (u8, u8, u8) = (0x04, 0x44, 0x00);
}
