//! Serving a core driver when this binary is launched as a plugin.
//!
//! The controller re-invokes its own executable for core drivers with the
//! handshake variables set. In that mode stdout carries only the address
//! line, and the process lives until the controller drops its stdin.

use std::io::{self, Read, Write};

use machine_plugin::{CoreDrivers, GuestEnvironment, GuestListener, announce_address};
use tracing::{info, warn};

use crate::errors::AppError;

const PLUGIN_MODE_TARGET: &str = "machine_cli::plugin_mode";

/// Serves the driver named in `guest` until `stdin` reaches end of file.
pub(crate) fn serve<R: Read, W: Write>(
    guest: &GuestEnvironment,
    core: &CoreDrivers,
    stdin: R,
    stdout: &mut W,
) -> Result<(), AppError> {
    let driver = guest.driver_name()?;
    if !core.contains(driver) {
        return Err(AppError::UnknownCoreDriver {
            driver: driver.to_owned(),
        });
    }

    let listener = GuestListener::bind(driver)?;
    announce_address(stdout, &listener.local_addr()).map_err(AppError::Announce)?;
    info!(target: PLUGIN_MODE_TARGET, driver, "serving core driver until stdin closes");

    if let Err(err) = drain(stdin) {
        warn!(
            target: PLUGIN_MODE_TARGET,
            driver,
            error = %err,
            "stdin failed before end of file; shutting down"
        );
    }
    listener.join()?;
    info!(target: PLUGIN_MODE_TARGET, driver, "controller hung up");
    Ok(())
}

fn drain<R: Read>(mut stdin: R) -> io::Result<u64> {
    io::copy(&mut stdin, &mut io::sink())
}
