// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use subgraph_proxy_config::Config;
use tracing::{
    level_filters::LevelFilter,
    subscriber::{set_global_default, SetGlobalDefaultError},
};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

#[derive(Parser)]
#[command(version)]
pub struct Cli {
    /// Path to the configuration file.
    /// Values missing from it are taken from the defaults and from
    /// `SUBGRAPH_PROXY_` prefixed environment variables.
    #[arg(long, value_name = "FILE", verbatim_doc_comment)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

/// Sets up tracing, allows log level to be set from the environment variables
fn init_tracing(format: LogFormat) -> Result<(), SetGlobalDefaultError> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let subscriber_builder: tracing_subscriber::fmt::SubscriberBuilder<
        tracing_subscriber::fmt::format::DefaultFields,
        tracing_subscriber::fmt::format::Format,
        EnvFilter,
    > = FmtSubscriber::builder().with_env_filter(filter);
    match format {
        LogFormat::Json => set_global_default(subscriber_builder.json().finish()),
        LogFormat::Compact => set_global_default(subscriber_builder.compact().finish()),
        LogFormat::Pretty => set_global_default(subscriber_builder.with_ansi(true).pretty().finish()),
    }
}

pub fn get_config() -> anyhow::Result<Config> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    let config = Config::parse(cli.config.as_ref()).map_err(|e| {
        tracing::error!(
            "Invalid configuration file `{}`: {}, if a value is missing you can also use \
            --config to fill the rest of the values",
            cli.config.unwrap_or_default().display(),
            e
        );
        anyhow::anyhow!(e)
    })?;

    Ok(config)
}
