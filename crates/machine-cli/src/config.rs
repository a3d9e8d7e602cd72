//! Configuration loading helpers for the `machine` binary.
//!
//! Leading configuration flags are split off for `ortho_config` so the clap
//! parser only sees the command tokens that follow them.

use std::ffi::{OsStr, OsString};

use machine_config::Config;
use ortho_config::OrthoConfig;
use machine_plugin::{BinaryLocator, CoreDrivers};

use crate::errors::AppError;

/// Flags recognised by the configuration loader. Keep in sync with the
/// fields of [`machine_config::Config`].
const CONFIG_CLI_FLAGS: &[&str] = &[
    "--config-path",
    "--log-filter",
    "--log-format",
    "--driver-prefix",
    "--extra-core-drivers",
    "--address-timeout-ms",
    "--kill-grace-ms",
];

pub(crate) trait ConfigLoader {
    /// Loads configuration from the filtered argument list.
    ///
    /// Configuration flags must precede the subcommand. Flags after it are
    /// left to the command parser.
    fn load(&self, args: &[OsString]) -> Result<Config, AppError>;
}

pub(crate) struct OrthoConfigLoader;

#[derive(Debug, Clone, Copy)]
enum FlagAction {
    Include { needs_value: bool },
    Skip,
}

impl ConfigLoader for OrthoConfigLoader {
    fn load(&self, args: &[OsString]) -> Result<Config, AppError> {
        Config::load_from_iter(args.iter().cloned()).map_err(AppError::LoadConfiguration)
    }
}

impl OrthoConfigLoader {
    fn process_config_flag(argument: &OsStr) -> FlagAction {
        let argument_text = argument.to_string_lossy();
        if !argument_text.starts_with("--") {
            return FlagAction::Skip;
        }

        let (flag, has_inline_value) = match argument_text.split_once('=') {
            Some((flag, _)) => (flag, true),
            None => (argument_text.as_ref(), false),
        };

        if CONFIG_CLI_FLAGS.contains(&flag) {
            return FlagAction::Include {
                needs_value: !has_inline_value,
            };
        }

        FlagAction::Skip
    }
}

pub(crate) struct ConfigArgumentSplit {
    pub(crate) config_arguments: Vec<OsString>,
    pub(crate) command_start: usize,
}

pub(crate) fn split_config_arguments(args: &[OsString]) -> ConfigArgumentSplit {
    let mut remaining = args.iter().enumerate();
    let Some((_, program)) = remaining.next() else {
        return ConfigArgumentSplit {
            config_arguments: Vec::new(),
            command_start: 0,
        };
    };

    let mut filtered = vec![program.clone()];
    let mut command_start = 1usize;
    let mut pending_value = false;

    for (index, argument) in remaining {
        if pending_value {
            filtered.push(argument.clone());
            pending_value = false;
            command_start = index + 1;
            continue;
        }

        match OrthoConfigLoader::process_config_flag(argument.as_os_str()) {
            FlagAction::Include { needs_value } => {
                filtered.push(argument.clone());
                command_start = index + 1;
                pending_value = needs_value;
            }
            FlagAction::Skip => break,
        }
    }

    ConfigArgumentSplit {
        config_arguments: filtered,
        command_start,
    }
}

/// Program name followed by the command tokens.
pub(crate) fn command_arguments(args: &[OsString], split: &ConfigArgumentSplit) -> Vec<OsString> {
    args.first()
        .into_iter()
        .chain(args.iter().skip(split.command_start.max(1)))
        .cloned()
        .collect()
}

/// Configuration flags to hand a self-dispatched core driver so it loads the
/// same configuration as the controller.
pub(crate) fn forwarded_config_arguments(split: &ConfigArgumentSplit) -> Vec<OsString> {
    split.config_arguments.iter().skip(1).cloned().collect()
}

/// Builds the driver locator described by `config`.
pub(crate) fn locator(config: &Config) -> BinaryLocator {
    BinaryLocator::new(CoreDrivers::from_names(config.core_drivers()))
        .with_prefix(config.driver_prefix())
}
