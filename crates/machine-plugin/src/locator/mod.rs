//! Resolution of driver names to plugin executables.
//!
//! Core drivers are served by the controller's own executable, which
//! re-invokes itself in plugin-serving mode. Every other driver is an
//! external binary named `<prefix><driver>` found on the search path.

use std::collections::BTreeSet;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::PluginError;
use crate::protocol::DEFAULT_BINARY_PREFIX;

/// Tracing target for binary resolution.
const LOCATOR_TARGET: &str = "machine_plugin::locator";

/// Registry of drivers implemented inside the controller executable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreDrivers {
    names: BTreeSet<String>,
}

impl CoreDrivers {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from driver names, ignoring blanks.
    #[must_use]
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut drivers = Self::new();
        for name in names {
            drivers.insert(name.as_ref());
        }
        drivers
    }

    /// Adds a driver name. Returns `false` when it was already present or
    /// blank.
    pub fn insert(&mut self, name: &str) -> bool {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return false;
        }
        self.names.insert(trimmed.to_owned())
    }

    /// Returns `true` when `name` is served by the controller executable.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Number of registered drivers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns `true` when no drivers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Iterates over registered names in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

/// Maps driver names to the executable that serves them.
#[derive(Debug, Clone)]
pub struct BinaryLocator {
    core: CoreDrivers,
    prefix: String,
    search_path: Option<OsString>,
    own_executable: Option<PathBuf>,
}

impl BinaryLocator {
    /// Creates a locator for the given core registry using the default
    /// binary prefix and the process `PATH`.
    #[must_use]
    pub fn new(core: CoreDrivers) -> Self {
        Self {
            core,
            prefix: DEFAULT_BINARY_PREFIX.to_owned(),
            search_path: None,
            own_executable: None,
        }
    }

    /// Overrides the external binary prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Searches `path` instead of the process `PATH`.
    #[must_use]
    pub fn with_search_path(mut self, path: impl Into<OsString>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    /// Reports `path` as the controller executable instead of querying the
    /// running process.
    #[must_use]
    pub fn with_own_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.own_executable = Some(path.into());
        self
    }

    /// Core driver registry.
    #[must_use]
    pub const fn core_drivers(&self) -> &CoreDrivers {
        &self.core
    }

    /// Returns `true` when `driver` is served by the controller executable.
    #[must_use]
    pub fn is_core(&self, driver: &str) -> bool {
        self.core.contains(driver)
    }

    /// External binary name for `driver`.
    #[must_use]
    pub fn binary_name(&self, driver: &str) -> String {
        format!("{}{driver}", self.prefix)
    }

    /// Resolves `driver` to an executable path.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::BinaryNotFound`] when the driver name is not
    /// usable as a file name, when no matching executable exists on the
    /// search path, or when the controller executable cannot be determined
    /// for a core driver.
    pub fn resolve(&self, driver: &str) -> Result<PathBuf, PluginError> {
        if !is_valid_driver_name(driver) {
            return Err(not_found(driver));
        }

        if self.is_core(driver) {
            let path = self.controller_executable().ok_or_else(|| not_found(driver))?;
            debug!(
                target: LOCATOR_TARGET,
                driver,
                path = %path.display(),
                "resolved core driver to controller executable"
            );
            return Ok(path);
        }

        let binary = self.binary_name(driver);
        let search_path = self
            .search_path
            .clone()
            .or_else(|| env::var_os("PATH"))
            .unwrap_or_default();
        let found = env::split_paths(&search_path)
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(|dir| dir.join(&binary))
            .find(|candidate| is_executable(candidate));

        match found {
            Some(path) => {
                debug!(
                    target: LOCATOR_TARGET,
                    driver,
                    path = %path.display(),
                    "resolved external driver binary"
                );
                Ok(path)
            }
            None => {
                debug!(
                    target: LOCATOR_TARGET,
                    driver,
                    binary = %binary,
                    "driver binary not on search path"
                );
                Err(not_found(driver))
            }
        }
    }

    fn controller_executable(&self) -> Option<PathBuf> {
        self.own_executable
            .clone()
            .or_else(|| env::current_exe().ok())
    }
}

fn not_found(driver: &str) -> PluginError {
    PluginError::BinaryNotFound {
        driver: driver.to_owned(),
    }
}

fn is_valid_driver_name(driver: &str) -> bool {
    !driver.is_empty()
        && driver != "."
        && driver != ".."
        && !driver.contains(['/', '\\'])
        && !driver.contains(char::is_whitespace)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
