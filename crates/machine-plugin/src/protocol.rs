//! Wire-level contract between the controller and a driver plugin binary.
//!
//! The controller launches the plugin with two environment variables set:
//! [`PLUGIN_ENV_KEY`] carrying the shared [`PLUGIN_ENV_VALUE`] token and
//! [`PLUGIN_ENV_DRIVER_NAME`] naming the driver to serve. The plugin's first
//! stdout line is the address it listens on. Every later stdout line is
//! informational log text, and stderr carries debug text.

use serde::{Deserialize, Serialize};

/// Environment variable carrying the handshake token.
pub const PLUGIN_ENV_KEY: &str = "MACHINE_PLUGIN_TOKEN";

/// Shared handshake token value.
pub const PLUGIN_ENV_VALUE: &str = "42";

/// Environment variable naming the driver a plugin process should serve.
pub const PLUGIN_ENV_DRIVER_NAME: &str = "MACHINE_PLUGIN_DRIVER_NAME";

/// Default prefix for external plugin binaries.
pub const DEFAULT_BINARY_PREFIX: &str = "docker-machine-driver-";

/// Strips line terminators from both ends of a streamed line.
#[must_use]
pub fn trim_line_terminators(line: &str) -> &str {
    line.trim_matches(|c| c == '\n' || c == '\r')
}

/// Extracts the announced address from the handshake line.
///
/// Returns `None` when the line holds nothing but whitespace.
#[must_use]
pub fn parse_address_line(line: &str) -> Option<&str> {
    let address = line.trim();
    (!address.is_empty()).then_some(address)
}

/// Self-description returned by a plugin's listener on each connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverDescriptor {
    /// Driver served by the plugin.
    pub driver: String,
    /// Version of the plugin implementation.
    pub version: String,
}

impl DriverDescriptor {
    /// Describes `driver` as served by this crate version.
    #[must_use]
    pub fn for_driver(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}
