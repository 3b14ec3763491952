// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::{Digest, YesNo};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Everything describing the target portal and its sessions.
    pub target: TargetConfig,
    /// Logger setup; defaults to info-level JSON on stdout.
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    Stderr,
    File,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Minutely,
    Hourly,
    Daily,
    Never,
}

/// Logger setup, consumed by [`crate::cfg::logger::init_logger`].
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LoggingConfig {
    /// An env-filter directive set, e.g. `info` or `iscsi_target_rs=debug`.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
    #[serde(default = "LoggingConfig::default_output")]
    pub output: LogOutput,
    /// Log file path; only meaningful for `output: file`.
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default = "LoggingConfig::default_rotation")]
    pub rotation: LogRotation,
    /// Include the emitting module in every line.
    #[serde(default)]
    pub show_target: bool,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_output() -> LogOutput {
        LogOutput::Stdout
    }

    fn default_rotation() -> LogRotation {
        LogRotation::Never
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Self::default_level(),
            output: Self::default_output(),
            file: None,
            rotation: Self::default_rotation(),
            show_target: false,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Target-side settings grouped by logical domains. The session limits
/// mirror the operational keys a login phase would have negotiated; the
/// core consumes them as already-agreed values.
pub struct TargetConfig {
    /// Target identity (IQN, portal address).
    pub identity: Identity,
    /// Per-session flow-control limits.
    pub session: SessionLimits,
    /// Header/Data digest selection.
    pub integrity: Integrity,
    /// Engine timeouts and keepalive cadence.
    pub timeouts: Timeouts,
}

/// Identity parameters of the target portal.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Identity {
    #[serde(rename = "TargetName")]
    /// Target IQN (mandatory).
    pub target_name: String,

    #[serde(default, rename = "TargetAlias")]
    /// Optional human-readable alias for the target.
    pub target_alias: String,

    #[serde(default, rename = "ListenAddress")]
    /// Address the portal binds to (host:port).
    pub listen_address: String,
}

/// Flow-control limits a session runs with.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SessionLimits {
    #[serde(rename = "MaxRecvDataSegmentLength")]
    /// Maximum data segment length accepted from the initiator.
    pub max_recv_data_segment_length: u32,

    #[serde(rename = "MaxXmitDataSegmentLength")]
    /// Maximum data segment length the initiator accepts from us.
    pub max_xmit_data_segment_length: u32,

    #[serde(rename = "MaxBurstLength")]
    /// Maximum solicited (per-R2T) burst size.
    pub max_burst_length: u32,

    #[serde(rename = "FirstBurstLength")]
    /// Unsolicited burst size allowed before the first R2T.
    pub first_burst_length: u32,

    #[serde(rename = "MaxOutstandingR2T")]
    /// Maximum number of simultaneously outstanding R2Ts per command.
    pub max_outstanding_r2t: u32,

    #[serde(rename = "InitialR2T")]
    /// Whether the first write burst must be solicited by an R2T.
    pub initial_r2t: YesNo,

    #[serde(rename = "ImmediateData")]
    /// Whether immediate data on a SCSI write is permitted.
    pub immediate_data: YesNo,

    #[serde(rename = "QueuedCommands")]
    /// Command-queue depth advertised via MaxCmdSN.
    pub queued_cmnds: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Digest selection advertised via HeaderDigest/DataDigest.
pub struct Integrity {
    #[serde(rename = "HeaderDigest")]
    /// Header digest algorithm.
    pub header_digest: Digest,
    #[serde(rename = "DataDigest")]
    /// Data digest algorithm.
    pub data_digest: Digest,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Engine timers, in seconds.
pub struct Timeouts {
    #[serde(rename = "RspTimeout")]
    /// A queued response must make TX progress within this window.
    pub rsp_timeout_secs: u64,
    #[serde(rename = "TmDataWaitTimeout")]
    /// Tightened data-wait window while task management is active.
    pub tm_data_wait_timeout_secs: u64,
    #[serde(rename = "NopInInterval")]
    /// Keepalive NOP-In cadence; 0 disables the ping.
    pub nop_in_interval_secs: u64,
}

impl Timeouts {
    #[inline]
    pub fn rsp_timeout(&self) -> Duration {
        Duration::from_secs(self.rsp_timeout_secs)
    }

    #[inline]
    pub fn tm_data_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.tm_data_wait_timeout_secs)
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(&path).with_context(|| {
            format!("failed to read config file {:?}", path.as_ref())
        })?;
        let cfg: Config = serde_yaml::from_str(&raw).with_context(|| {
            format!("failed to parse config file {:?}", path.as_ref())
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        let s = &self.target.session;
        ensure!(
            s.max_recv_data_segment_length >= 512,
            "MaxRecvDataSegmentLength must be >= 512"
        );
        ensure!(s.max_burst_length >= 512, "MaxBurstLength must be >= 512");
        ensure!(
            s.first_burst_length <= s.max_burst_length,
            "FirstBurstLength must not exceed MaxBurstLength"
        );
        ensure!(s.max_outstanding_r2t >= 1, "MaxOutstandingR2T must be >= 1");
        ensure!(s.queued_cmnds >= 1, "QueuedCommands must be >= 1");
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            target: TargetConfig {
                identity: Identity {
                    target_name: "iqn.2004-10.rs.target:storage".to_string(),
                    target_alias: String::new(),
                    listen_address: "0.0.0.0:3260".to_string(),
                },
                session: SessionLimits {
                    max_recv_data_segment_length: 262_144,
                    max_xmit_data_segment_length: 262_144,
                    max_burst_length: 1 << 20,
                    first_burst_length: 65_536,
                    max_outstanding_r2t: 1,
                    initial_r2t: YesNo::No,
                    immediate_data: YesNo::Yes,
                    queued_cmnds: 32,
                },
                integrity: Integrity {
                    header_digest: Digest::None,
                    data_digest: Digest::None,
                },
                timeouts: Timeouts {
                    rsp_timeout_secs: 30,
                    tm_data_wait_timeout_secs: 10,
                    nop_in_interval_secs: 30,
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc_style_keys() {
        let yaml = r#"
target:
  identity:
    TargetName: iqn.2004-10.rs.target:disk0
    ListenAddress: 0.0.0.0:3260
  session:
    MaxRecvDataSegmentLength: 262144
    MaxXmitDataSegmentLength: 262144
    MaxBurstLength: 1048576
    FirstBurstLength: 65536
    MaxOutstandingR2T: 2
    InitialR2T: "No"
    ImmediateData: "Yes"
    QueuedCommands: 32
  integrity:
    HeaderDigest: CRC32C
    DataDigest: None
  timeouts:
    RspTimeout: 30
    TmDataWaitTimeout: 10
    NopInInterval: 0
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("valid config");
        assert_eq!(cfg.target.session.max_outstanding_r2t, 2);
        assert!(!cfg.target.session.initial_r2t.as_bool());
        assert_eq!(cfg.target.integrity.header_digest, Digest::CRC32C);
        assert_eq!(cfg.target.timeouts.rsp_timeout().as_secs(), 30);
        cfg.validate().expect("limits are consistent");
    }

    #[test]
    fn rejects_first_burst_above_max_burst() {
        let mut cfg = Config::default();
        cfg.target.session.first_burst_length = cfg.target.session.max_burst_length + 1;
        assert!(cfg.validate().is_err());
    }
}
