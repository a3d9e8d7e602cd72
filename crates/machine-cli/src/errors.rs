//! Error types for the CLI runtime.

use std::io;
use std::sync::Arc;

use machine_plugin::PluginError;
use thiserror::Error;

use crate::telemetry::TelemetryError;

#[derive(Debug, Error)]
pub(crate) enum AppError {
    #[error("failed to load configuration: {0}")]
    LoadConfiguration(Arc<ortho_config::OrthoError>),
    #[error("{0}")]
    CliUsage(clap::Error),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error("driver \"{driver}\" is not served by this binary")]
    UnknownCoreDriver { driver: String },
    #[error("failed to announce plugin address: {0}")]
    Announce(io::Error),
    #[error("failed to dial plugin at {address}: {source}")]
    Dial { address: String, source: io::Error },
    #[error("failed to read driver descriptor from {address}: {source}")]
    ReadDescriptor { address: String, source: io::Error },
    #[error("plugin at {address} sent an invalid descriptor: {source}")]
    ParseDescriptor {
        address: String,
        source: serde_json::Error,
    },
    #[error("failed to write output: {0}")]
    Output(io::Error),
}
