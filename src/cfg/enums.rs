// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Value enums of the configuration surface, spelled the way the iSCSI
//! operational-parameter text keys spell them.

use serde::{Deserialize, Serialize};

/// Boolean keys (`InitialR2T`, `ImmediateData`) use Yes/No on the wire
/// and in the configuration file.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum YesNo {
    #[serde(rename = "Yes", alias = "yes", alias = "true", alias = "1")]
    Yes,
    #[serde(rename = "No", alias = "no", alias = "false", alias = "0")]
    No,
}

impl YesNo {
    #[inline]
    pub fn as_bool(self) -> bool {
        matches!(self, YesNo::Yes)
    }
}

impl From<bool> for YesNo {
    fn from(b: bool) -> Self {
        if b { YesNo::Yes } else { YesNo::No }
    }
}

/// HeaderDigest/DataDigest selection; CRC32C is the only algorithm the
/// protocol defines besides none.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Digest {
    #[serde(rename = "None", alias = "none")]
    None,
    #[serde(rename = "CRC32C", alias = "crc32c")]
    CRC32C,
}
