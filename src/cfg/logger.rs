// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, ensure};
use serde::Deserialize;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
};

#[derive(Debug, Deserialize, Clone)]
struct LoggerConfig {
    logger: LogConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
enum Output {
    Stdout,
    Stderr,
    File,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
enum RotationFreq {
    Minutely,
    Hourly,
    Daily,
    Never,
}

impl RotationFreq {
    fn rotation(&self) -> Rotation {
        match self {
            Self::Minutely => Rotation::MINUTELY,
            Self::Hourly => Rotation::HOURLY,
            Self::Daily => Rotation::DAILY,
            Self::Never => Rotation::NEVER,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
struct LogFileConfig {
    path: String,
    #[serde(default)]
    rotation_frequency: Option<RotationFreq>,
}

#[derive(Debug, Deserialize, Clone)]
struct LogConfig {
    /// Base level for everything not named in `directives`.
    level: String,
    /// Per-target overrides, e.g. quiet the dispatch hot path while the
    /// listeners log at debug. Keys are tracing targets, values levels.
    #[serde(default)]
    directives: BTreeMap<String, String>,
    output: Output,
    #[serde(default)]
    json: bool,
    file: Option<LogFileConfig>,
}

/// Install the global tracing subscriber from a YAML logger config.
///
/// The returned guard flushes the non-blocking writer; keep it alive for
/// the life of the process.
pub fn init_logger(config_path: &str) -> Result<WorkerGuard> {
    let config_content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file: {config_path}"))?;
    let config: LoggerConfig = serde_yaml::from_str(&config_content)
        .with_context(|| format!("Failed to parse config file: {config_path}"))?;

    let (writer, guard) = make_writer(&config.logger)?;

    fastrace::set_reporter(
        fastrace::collector::ConsoleReporter,
        fastrace::collector::Config::default(),
    );
    let compat_layer = fastrace_tracing::FastraceCompatLayer::new();

    let env_filter = EnvFilter::try_new(filter_spec(&config.logger))
        .or_else(|_| EnvFilter::try_from_default_env())
        .context("Failed to parse log level from config or env")?;

    let timer = ChronoUtc::rfc_3339();

    if config.logger.json {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_timer(timer)
            .json();
        let subscriber = Registry::default()
            .with(env_filter)
            .with(compat_layer)
            .with(layer);
        tracing::subscriber::set_global_default(subscriber)
            .context("Failed to set global default subscriber")?;
    } else {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_timer(timer);
        let subscriber = Registry::default()
            .with(env_filter)
            .with(compat_layer)
            .with(layer);
        tracing::subscriber::set_global_default(subscriber)
            .context("Failed to set global default subscriber")?;
    }

    Ok(guard)
}

/// Assemble the `EnvFilter` spec: the base level first, then one
/// `target=level` clause per directive. `BTreeMap` keeps the clause order
/// canonical, so the same config always yields the same spec string.
fn filter_spec(cfg: &LogConfig) -> String {
    let mut spec = if cfg.level.trim().is_empty() {
        "info".to_string()
    } else {
        cfg.level.clone()
    };
    for (target, level) in &cfg.directives {
        spec.push(',');
        spec.push_str(target);
        spec.push('=');
        spec.push_str(level);
    }
    spec
}

/// Every output funnels through the same non-blocking writer; only the
/// sink underneath differs.
fn make_writer(cfg: &LogConfig) -> Result<(NonBlocking, WorkerGuard)> {
    Ok(match cfg.output {
        Output::Stdout => tracing_appender::non_blocking(std::io::stdout()),
        Output::Stderr => tracing_appender::non_blocking(std::io::stderr()),
        Output::File => {
            let fcfg = cfg
                .file
                .as_ref()
                .context("logger.file is required for output=file")?;
            tracing_appender::non_blocking(file_appender(fcfg)?)
        },
    })
}

fn file_appender(fcfg: &LogFileConfig) -> Result<RollingFileAppender> {
    ensure!(
        !fcfg.path.trim().is_empty(),
        "logger.file.path must not be empty"
    );
    let path = PathBuf::from(&fcfg.path);
    let file_name = path
        .file_name()
        .context("logger.file.path must name a file")?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let rotation = fcfg
        .rotation_frequency
        .clone()
        .unwrap_or(RotationFreq::Never)
        .rotation();

    Ok(RollingFileAppender::new(rotation, dir, file_name))
}
