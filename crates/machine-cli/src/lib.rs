//! Command-line runtime for the machine controller.
//!
//! The binary has two personalities. Launched with the plugin handshake
//! variables it serves a core driver over the plugin protocol. Otherwise it
//! loads configuration, parses a `driver` subcommand and runs it. Both paths
//! can be driven from tests with substitute IO streams and config loaders.

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::process::ExitCode;

use clap::Parser;
use machine_config::Config;
use machine_plugin::{CoreDrivers, GuestEnvironment};

mod cli;
mod commands;
mod config;
mod errors;
mod plugin_mode;
pub mod telemetry;

use cli::{Cli, CliCommand, DriverAction};
use config::{
    ConfigArgumentSplit, command_arguments, forwarded_config_arguments, locator,
    split_config_arguments,
};
pub(crate) use config::{ConfigLoader, OrthoConfigLoader};
use errors::AppError;

/// Bundles the IO streams provided to the CLI runtime.
pub(crate) struct IoStreams<'a, R: Read, W: Write, E: Write> {
    pub(crate) stdin: R,
    pub(crate) stdout: &'a mut W,
    pub(crate) stderr: &'a mut E,
}

struct CliRunner<'a, R: Read, W: Write, E: Write, L: ConfigLoader> {
    io: IoStreams<'a, R, W, E>,
    loader: &'a L,
}

impl<'a, R, W, E, L> CliRunner<'a, R, W, E, L>
where
    R: Read,
    W: Write,
    E: Write,
    L: ConfigLoader,
{
    const fn new(io: IoStreams<'a, R, W, E>, loader: &'a L) -> Self {
        Self { io, loader }
    }

    fn run<I>(self, args: I, guest: &GuestEnvironment) -> ExitCode
    where
        I: IntoIterator<Item = OsString>,
    {
        let Self { io, loader } = self;
        let IoStreams {
            stdin,
            stdout,
            stderr,
        } = io;

        let args: Vec<OsString> = args.into_iter().collect();
        let split = split_config_arguments(&args);

        let result = if guest.is_plugin_invocation() {
            loader.load(&split.config_arguments).and_then(|config| {
                telemetry::initialise(&config)?;
                plugin_mode::serve(guest, &core_drivers(&config), stdin, &mut *stdout)
            })
        } else {
            run_command(&args, &split, loader, &mut *stdout)
        };

        match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(AppError::CliUsage(error)) if !error.use_stderr() => {
                let _ = write!(stdout, "{error}");
                ExitCode::SUCCESS
            }
            Err(error) => {
                let _ = writeln!(stderr, "{error}");
                ExitCode::FAILURE
            }
        }
    }
}

fn run_command<L, W>(
    args: &[OsString],
    split: &ConfigArgumentSplit,
    loader: &L,
    stdout: &mut W,
) -> Result<(), AppError>
where
    L: ConfigLoader,
    W: Write,
{
    let cli = Cli::try_parse_from(command_arguments(args, split)).map_err(AppError::CliUsage)?;
    let config = loader.load(&split.config_arguments)?;
    telemetry::initialise(&config)?;

    let CliCommand::Driver { action } = cli.command;
    let driver_locator = locator(&config);
    match action {
        DriverAction::Path { name } => commands::driver_path(&driver_locator, &name, stdout),
        DriverAction::Probe { name, machine_name } => commands::driver_probe(
            &driver_locator,
            &config,
            forwarded_config_arguments(split),
            &name,
            machine_name,
            stdout,
        ),
    }
}

fn core_drivers(config: &Config) -> CoreDrivers {
    CoreDrivers::from_names(config.core_drivers())
}

/// Runs the CLI using the provided arguments and IO handles.
///
/// Plugin mode reads the process's standard input and environment.
#[must_use]
pub fn run<I, W, E>(args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    let io = IoStreams {
        stdin: io::stdin(),
        stdout,
        stderr,
    };
    run_with_loader(args, io, &GuestEnvironment::from_env(), &OrthoConfigLoader)
}

/// Runs the CLI with a custom configuration loader and handshake environment.
pub(crate) fn run_with_loader<I, R, W, E, L>(
    args: I,
    io: IoStreams<'_, R, W, E>,
    guest: &GuestEnvironment,
    loader: &L,
) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    R: Read,
    W: Write,
    E: Write,
    L: ConfigLoader,
{
    CliRunner::new(io, loader).run(args, guest)
}
