// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Logger bootstrap: JSON lines through tracing-subscriber, an env
//! filter seeded from the configuration, optional rolling file output
//! and the fastrace compatibility layer.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fastrace::collector::{Config as FastraceConfig, ConsoleReporter};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{self, time::ChronoUtc, writer::BoxMakeWriter},
    layer::SubscriberExt,
};

use crate::cfg::config::{LogOutput, LogRotation, LoggingConfig};

impl LoggingConfig {
    fn writer(&self) -> Result<(BoxMakeWriter, WorkerGuard)> {
        Ok(match self.output {
            LogOutput::Stdout => {
                let (w, g) = tracing_appender::non_blocking(std::io::stdout());
                (BoxMakeWriter::new(w), g)
            },
            LogOutput::Stderr => {
                let (w, g) = tracing_appender::non_blocking(std::io::stderr());
                (BoxMakeWriter::new(w), g)
            },
            LogOutput::File => {
                let path = PathBuf::from(self.file.as_deref().with_context(|| {
                    "logging.file is required for output=file"
                })?);
                let dir = path.parent().unwrap_or_else(|| Path::new(""));
                let appender = RollingFileAppender::new(
                    match self.rotation {
                        LogRotation::Minutely => Rotation::MINUTELY,
                        LogRotation::Hourly => Rotation::HOURLY,
                        LogRotation::Daily => Rotation::DAILY,
                        LogRotation::Never => Rotation::NEVER,
                    },
                    dir,
                    path.file_name().unwrap_or_default(),
                );
                let (w, g) = tracing_appender::non_blocking(appender);
                (BoxMakeWriter::new(w), g)
            },
        })
    }
}

/// Install the global subscriber. The returned guard owns the
/// non-blocking writer; dropping it flushes and stops logging.
pub fn init_logger(cfg: &LoggingConfig) -> Result<WorkerGuard> {
    let (writer, guard) = cfg.writer()?;

    fastrace::set_reporter(ConsoleReporter, FastraceConfig::default());

    let filter = EnvFilter::try_new(&cfg.level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .context("failed to parse log level from config or env")?;

    let subscriber = Registry::default()
        .with(filter)
        .with(fastrace_tracing::FastraceCompatLayer::new())
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(ChronoUtc::rfc_3339())
                .with_target(cfg.show_target)
                .json()
                .with_current_span(false)
                .with_span_list(false),
        );

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global default subscriber")?;

    Ok(guard)
}
