//! Handlers for `machine driver` subcommands.

use std::ffi::OsString;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;

use machine_config::Config;
use machine_plugin::{
    BinaryLocator, DriverDescriptor, PluginError, PluginSession, SessionOptions,
};
use tracing::{debug, warn};

use crate::errors::AppError;

const COMMAND_TARGET: &str = "machine_cli::commands";

/// Prints the executable serving `driver`.
pub(crate) fn driver_path<W: Write>(
    locator: &BinaryLocator,
    driver: &str,
    stdout: &mut W,
) -> Result<(), AppError> {
    let path = locator.resolve(driver)?;
    writeln!(stdout, "{}", path.display()).map_err(AppError::Output)
}

/// Launches `driver`, dials its announced address and prints what it says.
///
/// `config_arguments` reach the plugin only when the driver is served by this
/// binary, so the child loads the controller's configuration.
pub(crate) fn driver_probe<W: Write>(
    locator: &BinaryLocator,
    config: &Config,
    config_arguments: Vec<OsString>,
    driver: &str,
    machine_name: Option<String>,
    stdout: &mut W,
) -> Result<(), AppError> {
    let args = if locator.is_core(driver) {
        config_arguments
    } else {
        Vec::new()
    };
    let options = SessionOptions {
        machine_name,
        address_timeout: config.address_timeout(),
        kill_grace: config.kill_grace(),
        args,
        ..SessionOptions::default()
    };
    let session = PluginSession::launch(locator, driver, &options)?;

    let probed = session.address().map_err(AppError::from).and_then(|address| {
        let descriptor = read_descriptor(&address, config)?;
        Ok((address, descriptor))
    });
    let closed = session.join();

    let (address, descriptor) = match (probed, closed) {
        (Ok(found), Ok(())) => found,
        (Ok(found), Err(err)) => {
            warn!(
                target: COMMAND_TARGET,
                driver,
                error = %err,
                "plugin session ended with an error after probing"
            );
            found
        }
        // The session's own failure says why no address arrived.
        (Err(AppError::Plugin(PluginError::AddressUnavailable { .. })), Err(cause)) => {
            return Err(cause.into());
        }
        (Err(err), _) => return Err(err),
    };
    writeln!(stdout, "address: {address}")
        .and_then(|()| writeln!(stdout, "driver: {}", descriptor.driver))
        .and_then(|()| writeln!(stdout, "version: {}", descriptor.version))
        .map_err(AppError::Output)
}

fn read_descriptor(address: &str, config: &Config) -> Result<DriverDescriptor, AppError> {
    let dial_error = |source| AppError::Dial {
        address: address.to_owned(),
        source,
    };
    let stream = TcpStream::connect(address).map_err(dial_error)?;
    stream
        .set_read_timeout(Some(config.address_timeout()))
        .map_err(dial_error)?;
    debug!(target: COMMAND_TARGET, address, "dialled plugin");

    let mut line = String::new();
    BufReader::new(stream)
        .read_line(&mut line)
        .map_err(|source| AppError::ReadDescriptor {
            address: address.to_owned(),
            source,
        })?;
    serde_json::from_str(line.trim()).map_err(|source| AppError::ParseDescriptor {
        address: address.to_owned(),
        source,
    })
}
