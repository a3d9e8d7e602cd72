/// Default log filter expression used by the binaries.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Prefix prepended to a driver name to form its external plugin binary name.
pub const DEFAULT_DRIVER_PREFIX: &str = "docker-machine-driver-";

/// Time allowed for a plugin to announce its listening address.
pub const DEFAULT_ADDRESS_TIMEOUT_MS: u64 = 10_000;

/// Drivers compiled into the controller binary itself.
///
/// Plugins for these names are served by re-invoking the running executable
/// rather than searching `PATH` for a prefixed binary.
pub const BUILTIN_CORE_DRIVERS: &[&str] = &[
    "amazonec2",
    "azure",
    "digitalocean",
    "exoscale",
    "generic",
    "google",
    "hyperv",
    "none",
    "openstack",
    "rackspace",
    "softlayer",
    "virtualbox",
    "vmwarefusion",
    "vmwarevcloudair",
    "vmwarevsphere",
];

/// Default log filter expression used by the binaries.
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format for the binaries.
pub fn default_log_format() -> crate::logging::LogFormat {
    crate::logging::LogFormat::Compact
}

/// Owned driver prefix used by serde defaults.
pub fn default_driver_prefix() -> String {
    DEFAULT_DRIVER_PREFIX.to_owned()
}

/// Address announcement timeout in milliseconds.
pub const fn default_address_timeout_ms() -> u64 {
    DEFAULT_ADDRESS_TIMEOUT_MS
}
